// Wrapper components (Stage 6): decorators that compose over any
// `SearchBackend` and add one cross-cutting concern apiece (tracing,
// validation, retries, caching) without the concrete backends (C5/C6/C7)
// needing to know about any of it.

use crate::backend::{
    EmbeddingStats, GlobalCounts, ListFilter, SearchBackend, SearchFilter, SearchHit, SemanticHit, TagCount,
    WantedPage,
};
use crate::entry::{Entry, EntryRef, Link};
use crate::errors::{PyriteError, Result};
use crate::observability::{record_metric, MetricType};
use crate::types::{EntryId, Importance, KbName, Limit, SearchQuery, Tag};
use crate::validation;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Records a `Timer` metric for `$name` around `$call`, forwarding its result.
macro_rules! timed {
    ($name:expr, $call:expr) => {{
        let start = Instant::now();
        let result = $call.await;
        record_metric(MetricType::Timer { name: $name, duration: start.elapsed() });
        result
    }};
}

/// Backend wrapper that logs every call at `info`/`error` and emits a
/// duration metric per operation.
pub struct TracedBackend<B: SearchBackend> {
    inner: B,
}

impl<B: SearchBackend> TracedBackend<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<B: SearchBackend> SearchBackend for TracedBackend<B> {
    async fn ensure_schema(&self) -> Result<()> {
        timed!("backend.ensure_schema", self.inner.ensure_schema())
    }

    async fn close(&self) -> Result<()> {
        timed!("backend.close", self.inner.close())
    }

    async fn upsert_entry(&self, entry: &Entry) -> Result<()> {
        info!(entry_id = %entry.id, kb_name = %entry.kb_name, "upserting entry");
        let result = timed!("backend.upsert_entry", self.inner.upsert_entry(entry));
        if let Err(e) = &result {
            error!(entry_id = %entry.id, error = %e, "upsert_entry failed");
        }
        result
    }

    async fn delete_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        info!(entry_id = %id, %kb_name, "deleting entry");
        timed!("backend.delete_entry", self.inner.delete_entry(id, kb_name))
    }

    async fn get_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<Option<Entry>> {
        timed!("backend.get_entry", self.inner.get_entry(id, kb_name))
    }

    async fn list_entries(&self, filter: &ListFilter) -> Result<Vec<Entry>> {
        timed!("backend.list_entries", self.inner.list_entries(filter))
    }

    async fn count_entries(&self, filter: &ListFilter) -> Result<u64> {
        timed!("backend.count_entries", self.inner.count_entries(filter))
    }

    async fn search(&self, query: &SearchQuery, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        let result = timed!("backend.search", self.inner.search(query, filter));
        if let Ok(hits) = &result {
            info!(query = query.as_str(), result_count = hits.len(), "search completed");
        }
        result
    }

    async fn search_by_tag(&self, tag: &Tag, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        timed!("backend.search_by_tag", self.inner.search_by_tag(tag, kb_name))
    }

    async fn search_by_date_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        kb_name: Option<&KbName>,
    ) -> Result<Vec<Entry>> {
        timed!("backend.search_by_date_range", self.inner.search_by_date_range(from, to, kb_name))
    }

    async fn search_by_tag_prefix(&self, prefix: &str, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        timed!("backend.search_by_tag_prefix", self.inner.search_by_tag_prefix(prefix, kb_name))
    }

    async fn upsert_embedding(&self, id: &EntryId, kb_name: &KbName, vector: &[f32]) -> Result<bool> {
        timed!("backend.upsert_embedding", self.inner.upsert_embedding(id, kb_name, vector))
    }

    async fn search_semantic(
        &self,
        vector: &[f32],
        kb_name: Option<&KbName>,
        limit: usize,
        max_distance: f32,
    ) -> Result<Vec<SemanticHit>> {
        timed!("backend.search_semantic", self.inner.search_semantic(vector, kb_name, limit, max_distance))
    }

    async fn has_embeddings(&self, kb_name: Option<&KbName>) -> Result<bool> {
        timed!("backend.has_embeddings", self.inner.has_embeddings(kb_name))
    }

    async fn embedding_stats(&self, kb_name: Option<&KbName>) -> Result<EmbeddingStats> {
        timed!("backend.embedding_stats", self.inner.embedding_stats(kb_name))
    }

    async fn delete_embedding(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        timed!("backend.delete_embedding", self.inner.delete_embedding(id, kb_name))
    }

    async fn get_backlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        timed!("backend.get_backlinks", self.inner.get_backlinks(id, kb_name))
    }

    async fn get_outlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        timed!("backend.get_outlinks", self.inner.get_outlinks(id, kb_name))
    }

    async fn get_most_linked(&self, kb_name: Option<&KbName>, limit: usize) -> Result<Vec<(Entry, u64)>> {
        timed!("backend.get_most_linked", self.inner.get_most_linked(kb_name, limit))
    }

    async fn get_orphans(&self, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        timed!("backend.get_orphans", self.inner.get_orphans(kb_name))
    }

    async fn get_all_tags(&self, kb_name: Option<&KbName>) -> Result<Vec<TagCount>> {
        timed!("backend.get_all_tags", self.inner.get_all_tags(kb_name))
    }

    async fn get_tags_as_dicts(&self, kb_name: Option<&KbName>, prefix: Option<&str>) -> Result<Vec<TagCount>> {
        timed!("backend.get_tags_as_dicts", self.inner.get_tags_as_dicts(kb_name, prefix))
    }

    async fn get_timeline(
        &self,
        kb_name: Option<&KbName>,
        min_importance: Option<Importance>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        limit: usize,
    ) -> Result<Vec<Entry>> {
        timed!("backend.get_timeline", self.inner.get_timeline(kb_name, min_importance, from, to, limit))
    }

    async fn get_refs_from(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>> {
        timed!("backend.get_refs_from", self.inner.get_refs_from(id, kb_name))
    }

    async fn get_refs_to(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>> {
        timed!("backend.get_refs_to", self.inner.get_refs_to(id, kb_name))
    }

    async fn list_entries_in_folder(&self, folder: &str, kb_name: &KbName) -> Result<Vec<Entry>> {
        timed!("backend.list_entries_in_folder", self.inner.list_entries_in_folder(folder, kb_name))
    }

    async fn count_entries_in_folder(&self, folder: &str, kb_name: &KbName) -> Result<u64> {
        timed!("backend.count_entries_in_folder", self.inner.count_entries_in_folder(folder, kb_name))
    }

    async fn get_all_links(&self, kb_name: Option<&KbName>) -> Result<Vec<Link>> {
        timed!("backend.get_all_links", self.inner.get_all_links(kb_name))
    }

    async fn get_entries_for_indexing(&self, kb_name: &KbName) -> Result<Vec<(EntryId, DateTime<Utc>)>> {
        timed!("backend.get_entries_for_indexing", self.inner.get_entries_for_indexing(kb_name))
    }

    async fn get_embedded_rowids(&self, kb_name: Option<&KbName>) -> Result<Vec<(EntryId, KbName)>> {
        timed!("backend.get_embedded_rowids", self.inner.get_embedded_rowids(kb_name))
    }

    async fn get_entries_for_embedding(&self, kb_name: Option<&KbName>, limit: usize) -> Result<Vec<Entry>> {
        timed!("backend.get_entries_for_embedding", self.inner.get_entries_for_embedding(kb_name, limit))
    }

    async fn get_global_counts(&self) -> Result<GlobalCounts> {
        timed!("backend.get_global_counts", self.inner.get_global_counts())
    }

    async fn get_distinct_types(&self, kb_name: Option<&KbName>) -> Result<Vec<String>> {
        timed!("backend.get_distinct_types", self.inner.get_distinct_types(kb_name))
    }
}

/// Backend wrapper that enforces cross-cutting invariants the underlying
/// store cannot check on its own: bounded `limit` parameters and
/// non-negative vector dimensions.
pub struct ValidatedBackend<B: SearchBackend> {
    inner: B,
}

impl<B: SearchBackend> ValidatedBackend<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }

    fn check_limit(limit: usize) -> Result<()> {
        validation::storage::validate_limit(limit, Limit::MAX).map_err(|e| PyriteError::InvalidEntry(e.to_string()))
    }
}

#[async_trait]
impl<B: SearchBackend> SearchBackend for ValidatedBackend<B> {
    async fn ensure_schema(&self) -> Result<()> {
        self.inner.ensure_schema().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn upsert_entry(&self, entry: &Entry) -> Result<()> {
        self.inner.upsert_entry(entry).await
    }

    async fn delete_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        self.inner.delete_entry(id, kb_name).await
    }

    async fn get_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<Option<Entry>> {
        self.inner.get_entry(id, kb_name).await
    }

    async fn list_entries(&self, filter: &ListFilter) -> Result<Vec<Entry>> {
        if let Some(limit) = filter.limit {
            Self::check_limit(limit.get())?;
        }
        self.inner.list_entries(filter).await
    }

    async fn count_entries(&self, filter: &ListFilter) -> Result<u64> {
        self.inner.count_entries(filter).await
    }

    async fn search(&self, query: &SearchQuery, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        Self::check_limit(filter.limit.get())?;
        self.inner.search(query, filter).await
    }

    async fn search_by_tag(&self, tag: &Tag, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        self.inner.search_by_tag(tag, kb_name).await
    }

    async fn search_by_date_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        kb_name: Option<&KbName>,
    ) -> Result<Vec<Entry>> {
        self.inner.search_by_date_range(from, to, kb_name).await
    }

    async fn search_by_tag_prefix(&self, prefix: &str, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        self.inner.search_by_tag_prefix(prefix, kb_name).await
    }

    async fn upsert_embedding(&self, id: &EntryId, kb_name: &KbName, vector: &[f32]) -> Result<bool> {
        if vector.is_empty() {
            return Err(PyriteError::InvalidEntry("embedding vector cannot be empty".into()));
        }
        self.inner.upsert_embedding(id, kb_name, vector).await
    }

    async fn search_semantic(
        &self,
        vector: &[f32],
        kb_name: Option<&KbName>,
        limit: usize,
        max_distance: f32,
    ) -> Result<Vec<SemanticHit>> {
        Self::check_limit(limit)?;
        self.inner.search_semantic(vector, kb_name, limit, max_distance).await
    }

    async fn has_embeddings(&self, kb_name: Option<&KbName>) -> Result<bool> {
        self.inner.has_embeddings(kb_name).await
    }

    async fn embedding_stats(&self, kb_name: Option<&KbName>) -> Result<EmbeddingStats> {
        self.inner.embedding_stats(kb_name).await
    }

    async fn delete_embedding(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        self.inner.delete_embedding(id, kb_name).await
    }

    async fn get_backlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        self.inner.get_backlinks(id, kb_name).await
    }

    async fn get_outlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        self.inner.get_outlinks(id, kb_name).await
    }

    async fn get_most_linked(&self, kb_name: Option<&KbName>, limit: usize) -> Result<Vec<(Entry, u64)>> {
        Self::check_limit(limit)?;
        self.inner.get_most_linked(kb_name, limit).await
    }

    async fn get_orphans(&self, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        self.inner.get_orphans(kb_name).await
    }

    async fn get_all_tags(&self, kb_name: Option<&KbName>) -> Result<Vec<TagCount>> {
        self.inner.get_all_tags(kb_name).await
    }

    async fn get_tags_as_dicts(&self, kb_name: Option<&KbName>, prefix: Option<&str>) -> Result<Vec<TagCount>> {
        self.inner.get_tags_as_dicts(kb_name, prefix).await
    }

    async fn get_timeline(
        &self,
        kb_name: Option<&KbName>,
        min_importance: Option<Importance>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        limit: usize,
    ) -> Result<Vec<Entry>> {
        Self::check_limit(limit)?;
        self.inner.get_timeline(kb_name, min_importance, from, to, limit).await
    }

    async fn get_refs_from(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>> {
        self.inner.get_refs_from(id, kb_name).await
    }

    async fn get_refs_to(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>> {
        self.inner.get_refs_to(id, kb_name).await
    }

    async fn list_entries_in_folder(&self, folder: &str, kb_name: &KbName) -> Result<Vec<Entry>> {
        self.inner.list_entries_in_folder(folder, kb_name).await
    }

    async fn count_entries_in_folder(&self, folder: &str, kb_name: &KbName) -> Result<u64> {
        self.inner.count_entries_in_folder(folder, kb_name).await
    }

    async fn get_all_links(&self, kb_name: Option<&KbName>) -> Result<Vec<Link>> {
        self.inner.get_all_links(kb_name).await
    }

    async fn get_entries_for_indexing(&self, kb_name: &KbName) -> Result<Vec<(EntryId, DateTime<Utc>)>> {
        self.inner.get_entries_for_indexing(kb_name).await
    }

    async fn get_embedded_rowids(&self, kb_name: Option<&KbName>) -> Result<Vec<(EntryId, KbName)>> {
        self.inner.get_embedded_rowids(kb_name).await
    }

    async fn get_entries_for_embedding(&self, kb_name: Option<&KbName>, limit: usize) -> Result<Vec<Entry>> {
        Self::check_limit(limit)?;
        self.inner.get_entries_for_embedding(kb_name, limit).await
    }

    async fn get_global_counts(&self) -> Result<GlobalCounts> {
        self.inner.get_global_counts().await
    }

    async fn get_distinct_types(&self, kb_name: Option<&KbName>) -> Result<Vec<String>> {
        self.inner.get_distinct_types(kb_name).await
    }
}

/// Backend wrapper that retries a narrow set of write operations on
/// transient `StorageError`s with exponential backoff. Reads are not
/// retried: a read failure on an embedded/server backend is almost always
/// a query bug, not transient contention.
pub struct RetryableBackend<B: SearchBackend> {
    inner: B,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl<B: SearchBackend> RetryableBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }

    pub fn with_retry_config(mut self, max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    async fn retry<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut delay = self.base_delay;
        loop {
            attempt += 1;
            match attempt_fn().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= self.max_retries => {
                    error!(operation, attempt, error = %e, "failed after exhausting retries");
                    return Err(e);
                }
                Err(e) => {
                    warn!(operation, attempt, max_retries = self.max_retries, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.max_delay);
                }
            }
        }
    }
}

#[async_trait]
impl<B: SearchBackend> SearchBackend for RetryableBackend<B> {
    async fn ensure_schema(&self) -> Result<()> {
        self.retry("ensure_schema", || self.inner.ensure_schema()).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn upsert_entry(&self, entry: &Entry) -> Result<()> {
        self.retry("upsert_entry", || self.inner.upsert_entry(entry)).await
    }

    async fn delete_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        self.retry("delete_entry", || self.inner.delete_entry(id, kb_name)).await
    }

    async fn get_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<Option<Entry>> {
        self.inner.get_entry(id, kb_name).await
    }

    async fn list_entries(&self, filter: &ListFilter) -> Result<Vec<Entry>> {
        self.inner.list_entries(filter).await
    }

    async fn count_entries(&self, filter: &ListFilter) -> Result<u64> {
        self.inner.count_entries(filter).await
    }

    async fn search(&self, query: &SearchQuery, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        self.inner.search(query, filter).await
    }

    async fn search_by_tag(&self, tag: &Tag, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        self.inner.search_by_tag(tag, kb_name).await
    }

    async fn search_by_date_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        kb_name: Option<&KbName>,
    ) -> Result<Vec<Entry>> {
        self.inner.search_by_date_range(from, to, kb_name).await
    }

    async fn search_by_tag_prefix(&self, prefix: &str, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        self.inner.search_by_tag_prefix(prefix, kb_name).await
    }

    async fn upsert_embedding(&self, id: &EntryId, kb_name: &KbName, vector: &[f32]) -> Result<bool> {
        self.retry("upsert_embedding", || self.inner.upsert_embedding(id, kb_name, vector)).await
    }

    async fn search_semantic(
        &self,
        vector: &[f32],
        kb_name: Option<&KbName>,
        limit: usize,
        max_distance: f32,
    ) -> Result<Vec<SemanticHit>> {
        self.inner.search_semantic(vector, kb_name, limit, max_distance).await
    }

    async fn has_embeddings(&self, kb_name: Option<&KbName>) -> Result<bool> {
        self.inner.has_embeddings(kb_name).await
    }

    async fn embedding_stats(&self, kb_name: Option<&KbName>) -> Result<EmbeddingStats> {
        self.inner.embedding_stats(kb_name).await
    }

    async fn delete_embedding(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        self.retry("delete_embedding", || self.inner.delete_embedding(id, kb_name)).await
    }

    async fn get_backlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        self.inner.get_backlinks(id, kb_name).await
    }

    async fn get_outlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        self.inner.get_outlinks(id, kb_name).await
    }

    async fn get_most_linked(&self, kb_name: Option<&KbName>, limit: usize) -> Result<Vec<(Entry, u64)>> {
        self.inner.get_most_linked(kb_name, limit).await
    }

    async fn get_orphans(&self, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        self.inner.get_orphans(kb_name).await
    }

    async fn get_all_tags(&self, kb_name: Option<&KbName>) -> Result<Vec<TagCount>> {
        self.inner.get_all_tags(kb_name).await
    }

    async fn get_tags_as_dicts(&self, kb_name: Option<&KbName>, prefix: Option<&str>) -> Result<Vec<TagCount>> {
        self.inner.get_tags_as_dicts(kb_name, prefix).await
    }

    async fn get_timeline(
        &self,
        kb_name: Option<&KbName>,
        min_importance: Option<Importance>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        limit: usize,
    ) -> Result<Vec<Entry>> {
        self.inner.get_timeline(kb_name, min_importance, from, to, limit).await
    }

    async fn get_refs_from(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>> {
        self.inner.get_refs_from(id, kb_name).await
    }

    async fn get_refs_to(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>> {
        self.inner.get_refs_to(id, kb_name).await
    }

    async fn list_entries_in_folder(&self, folder: &str, kb_name: &KbName) -> Result<Vec<Entry>> {
        self.inner.list_entries_in_folder(folder, kb_name).await
    }

    async fn count_entries_in_folder(&self, folder: &str, kb_name: &KbName) -> Result<u64> {
        self.inner.count_entries_in_folder(folder, kb_name).await
    }

    async fn get_all_links(&self, kb_name: Option<&KbName>) -> Result<Vec<Link>> {
        self.inner.get_all_links(kb_name).await
    }

    async fn get_entries_for_indexing(&self, kb_name: &KbName) -> Result<Vec<(EntryId, DateTime<Utc>)>> {
        self.inner.get_entries_for_indexing(kb_name).await
    }

    async fn get_embedded_rowids(&self, kb_name: Option<&KbName>) -> Result<Vec<(EntryId, KbName)>> {
        self.inner.get_embedded_rowids(kb_name).await
    }

    async fn get_entries_for_embedding(&self, kb_name: Option<&KbName>, limit: usize) -> Result<Vec<Entry>> {
        self.inner.get_entries_for_embedding(kb_name, limit).await
    }

    async fn get_global_counts(&self) -> Result<GlobalCounts> {
        self.inner.get_global_counts().await
    }

    async fn get_distinct_types(&self, kb_name: Option<&KbName>) -> Result<Vec<String>> {
        self.inner.get_distinct_types(kb_name).await
    }
}

/// Simple LRU cache, capacity-bounded, linear eviction scan, adequate at
/// the sizes a single-process cache is expected to hold.
struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, V>,
    access_order: Vec<K>,
}

impl<K: Clone + Eq + std::hash::Hash, V> LruCache<K, V> {
    fn new(capacity: usize) -> Self {
        Self { capacity, map: HashMap::with_capacity(capacity), access_order: Vec::with_capacity(capacity) }
    }

    fn get(&mut self, key: &K) -> Option<&V> {
        if self.map.contains_key(key) {
            self.access_order.retain(|k| k != key);
            self.access_order.push(key.clone());
            self.map.get(key)
        } else {
            None
        }
    }

    fn insert(&mut self, key: K, value: V) {
        if self.map.len() >= self.capacity && !self.map.contains_key(&key) {
            if let Some(lru_key) = self.access_order.first().cloned() {
                self.access_order.remove(0);
                self.map.remove(&lru_key);
            }
        }
        self.map.insert(key.clone(), value);
        self.access_order.retain(|k| k != &key);
        self.access_order.push(key);
    }

    fn remove(&mut self, key: &K) {
        self.map.remove(key);
        self.access_order.retain(|k| k != key);
    }
}

/// Backend wrapper that caches `get_entry` lookups by `(id, kb_name)`,
/// invalidating on write. Every other method passes straight through: a
/// cache keyed on full-text/semantic/graph queries would need its own
/// invalidation story this module doesn't need yet.
pub struct CachedBackend<B: SearchBackend> {
    inner: B,
    cache: Mutex<LruCache<(EntryId, KbName), Option<Entry>>>,
    hits: Arc<std::sync::atomic::AtomicU64>,
    misses: Arc<std::sync::atomic::AtomicU64>,
}

impl<B: SearchBackend> CachedBackend<B> {
    pub fn new(inner: B, capacity: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            misses: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        use std::sync::atomic::Ordering;
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl<B: SearchBackend> SearchBackend for CachedBackend<B> {
    async fn ensure_schema(&self) -> Result<()> {
        self.inner.ensure_schema().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn upsert_entry(&self, entry: &Entry) -> Result<()> {
        self.inner.upsert_entry(entry).await?;
        self.cache.lock().await.remove(&(entry.id.clone(), entry.kb_name.clone()));
        Ok(())
    }

    async fn delete_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        let removed = self.inner.delete_entry(id, kb_name).await?;
        self.cache.lock().await.remove(&(id.clone(), kb_name.clone()));
        Ok(removed)
    }

    async fn get_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<Option<Entry>> {
        use std::sync::atomic::Ordering;
        let key = (id.clone(), kb_name.clone());
        {
            let mut cache = self.cache.lock().await;
            if let Some(hit) = cache.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit.clone());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let entry = self.inner.get_entry(id, kb_name).await?;
        self.cache.lock().await.insert(key, entry.clone());
        Ok(entry)
    }

    async fn list_entries(&self, filter: &ListFilter) -> Result<Vec<Entry>> {
        self.inner.list_entries(filter).await
    }

    async fn count_entries(&self, filter: &ListFilter) -> Result<u64> {
        self.inner.count_entries(filter).await
    }

    async fn search(&self, query: &SearchQuery, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        self.inner.search(query, filter).await
    }

    async fn search_by_tag(&self, tag: &Tag, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        self.inner.search_by_tag(tag, kb_name).await
    }

    async fn search_by_date_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        kb_name: Option<&KbName>,
    ) -> Result<Vec<Entry>> {
        self.inner.search_by_date_range(from, to, kb_name).await
    }

    async fn search_by_tag_prefix(&self, prefix: &str, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        self.inner.search_by_tag_prefix(prefix, kb_name).await
    }

    async fn upsert_embedding(&self, id: &EntryId, kb_name: &KbName, vector: &[f32]) -> Result<bool> {
        let result = self.inner.upsert_embedding(id, kb_name, vector).await?;
        self.cache.lock().await.remove(&(id.clone(), kb_name.clone()));
        Ok(result)
    }

    async fn search_semantic(
        &self,
        vector: &[f32],
        kb_name: Option<&KbName>,
        limit: usize,
        max_distance: f32,
    ) -> Result<Vec<SemanticHit>> {
        self.inner.search_semantic(vector, kb_name, limit, max_distance).await
    }

    async fn has_embeddings(&self, kb_name: Option<&KbName>) -> Result<bool> {
        self.inner.has_embeddings(kb_name).await
    }

    async fn embedding_stats(&self, kb_name: Option<&KbName>) -> Result<EmbeddingStats> {
        self.inner.embedding_stats(kb_name).await
    }

    async fn delete_embedding(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        let result = self.inner.delete_embedding(id, kb_name).await?;
        self.cache.lock().await.remove(&(id.clone(), kb_name.clone()));
        Ok(result)
    }

    async fn get_backlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        self.inner.get_backlinks(id, kb_name).await
    }

    async fn get_outlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        self.inner.get_outlinks(id, kb_name).await
    }

    async fn get_most_linked(&self, kb_name: Option<&KbName>, limit: usize) -> Result<Vec<(Entry, u64)>> {
        self.inner.get_most_linked(kb_name, limit).await
    }

    async fn get_orphans(&self, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        self.inner.get_orphans(kb_name).await
    }

    async fn get_all_tags(&self, kb_name: Option<&KbName>) -> Result<Vec<TagCount>> {
        self.inner.get_all_tags(kb_name).await
    }

    async fn get_tags_as_dicts(&self, kb_name: Option<&KbName>, prefix: Option<&str>) -> Result<Vec<TagCount>> {
        self.inner.get_tags_as_dicts(kb_name, prefix).await
    }

    async fn get_timeline(
        &self,
        kb_name: Option<&KbName>,
        min_importance: Option<Importance>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        limit: usize,
    ) -> Result<Vec<Entry>> {
        self.inner.get_timeline(kb_name, min_importance, from, to, limit).await
    }

    async fn get_refs_from(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>> {
        self.inner.get_refs_from(id, kb_name).await
    }

    async fn get_refs_to(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>> {
        self.inner.get_refs_to(id, kb_name).await
    }

    async fn list_entries_in_folder(&self, folder: &str, kb_name: &KbName) -> Result<Vec<Entry>> {
        self.inner.list_entries_in_folder(folder, kb_name).await
    }

    async fn count_entries_in_folder(&self, folder: &str, kb_name: &KbName) -> Result<u64> {
        self.inner.count_entries_in_folder(folder, kb_name).await
    }

    async fn get_all_links(&self, kb_name: Option<&KbName>) -> Result<Vec<Link>> {
        self.inner.get_all_links(kb_name).await
    }

    async fn get_entries_for_indexing(&self, kb_name: &KbName) -> Result<Vec<(EntryId, DateTime<Utc>)>> {
        self.inner.get_entries_for_indexing(kb_name).await
    }

    async fn get_embedded_rowids(&self, kb_name: Option<&KbName>) -> Result<Vec<(EntryId, KbName)>> {
        self.inner.get_embedded_rowids(kb_name).await
    }

    async fn get_entries_for_embedding(&self, kb_name: Option<&KbName>, limit: usize) -> Result<Vec<Entry>> {
        self.inner.get_entries_for_embedding(kb_name, limit).await
    }

    async fn get_global_counts(&self) -> Result<GlobalCounts> {
        self.inner.get_global_counts().await
    }

    async fn get_distinct_types(&self, kb_name: Option<&KbName>) -> Result<Vec<String>> {
        self.inner.get_distinct_types(kb_name).await
    }
}

/// The production decorator stack: cache closest to the real backend, then
/// retries, then validation, then tracing on the outside so every logged
/// call reflects what a caller actually observed.
pub type FullyWrappedBackend<B> = TracedBackend<ValidatedBackend<RetryableBackend<CachedBackend<B>>>>;

pub fn create_wrapped_backend<B: SearchBackend>(inner: B, cache_capacity: usize) -> FullyWrappedBackend<B> {
    let cached = CachedBackend::new(inner, cache_capacity);
    let retryable = RetryableBackend::new(cached);
    let validated = ValidatedBackend::new(retryable);
    TracedBackend::new(validated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::embedded::EmbeddedBackend;
    use crate::entry::EntryKind;
    use crate::types::Title;

    async fn backend() -> EmbeddedBackend {
        let backend = EmbeddedBackend::connect(":memory:").await.unwrap();
        backend.ensure_schema().await.unwrap();
        backend
    }

    fn entry(id: &str) -> Entry {
        Entry::new(
            EntryId::new(id).unwrap(),
            KbName::new("k").unwrap(),
            EntryKind::Note,
            Title::new(id).unwrap(),
            "body".into(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn cached_backend_hits_on_repeated_get() {
        let wrapped = CachedBackend::new(backend().await, 10);
        wrapped.upsert_entry(&entry("e1")).await.unwrap();

        let id = EntryId::new("e1").unwrap();
        let kb = KbName::new("k").unwrap();
        wrapped.get_entry(&id, &kb).await.unwrap();
        wrapped.get_entry(&id, &kb).await.unwrap();

        let (hits, misses) = wrapped.cache_stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
    }

    #[tokio::test]
    async fn cached_backend_invalidates_on_delete() {
        let wrapped = CachedBackend::new(backend().await, 10);
        wrapped.upsert_entry(&entry("e1")).await.unwrap();
        let id = EntryId::new("e1").unwrap();
        let kb = KbName::new("k").unwrap();
        wrapped.get_entry(&id, &kb).await.unwrap();
        wrapped.delete_entry(&id, &kb).await.unwrap();
        assert!(wrapped.get_entry(&id, &kb).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn validated_backend_rejects_oversized_limit() {
        let wrapped = ValidatedBackend::new(backend().await);
        let result = wrapped
            .search_semantic(&[1.0, 0.0], None, Limit::MAX + 1, 1.0)
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn validated_backend_fails_fast_without_polling_the_inner_backend() {
        let wrapped = tokio_test::block_on(async { ValidatedBackend::new(backend().await) });
        let mut task = tokio_test::task::spawn(wrapped.search_semantic(&[1.0, 0.0], None, Limit::MAX + 1, 1.0));
        let result = tokio_test::assert_ready!(task.poll());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fully_wrapped_backend_round_trips_an_entry() {
        let wrapped = create_wrapped_backend(backend().await, 10);
        wrapped.upsert_entry(&entry("e1")).await.unwrap();
        let fetched = wrapped
            .get_entry(&EntryId::new("e1").unwrap(), &KbName::new("k").unwrap())
            .await
            .unwrap();
        assert!(fetched.is_some());
    }
}
