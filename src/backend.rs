// Search Backend Interface (C4): the narrow capability set every backend
// (embedded, server, columnar) must satisfy with identical semantics.
// Hybrid search fusion and graph BFS live above this trait in
// `query_services.rs`, so every backend gets them for free.

use crate::entry::{Entry, EntryRef, Link};
use crate::errors::Result;
use crate::types::{EntryId, Importance, KbName, Limit, SearchQuery, SortField, SortOrder, Tag};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Filters shared by `list_entries` and `count_entries`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub kb_name: Option<KbName>,
    pub entry_type: Option<String>,
    pub tag: Option<Tag>,
    pub sort: Option<SortField>,
    pub order: Option<SortOrder>,
    pub limit: Option<Limit>,
    pub offset: usize,
}

/// Filters for lexical `search`.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub kb_name: Option<KbName>,
    pub entry_type: Option<String>,
    /// Conjunctive: an entry must carry every tag listed here.
    pub tags: Vec<Tag>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub limit: Limit,
    pub offset: usize,
}

/// A lexical (or fused) search result, with a `<mark>`-delimited snippet
/// per the external wire format (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: EntryId,
    pub kb_name: KbName,
    pub entry_type: String,
    pub title: String,
    pub summary: Option<String>,
    pub date: Option<NaiveDate>,
    pub importance: Option<Importance>,
    pub snippet: String,
    pub rank: usize,
}

/// A semantic search result: a hit plus its cosine distance from the
/// query vector (smaller is closer).
#[derive(Debug, Clone)]
pub struct SemanticHit {
    pub hit: SearchHit,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: EntryId,
    pub kb_name: KbName,
    pub title: String,
    pub entry_type: String,
    pub link_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source_id: EntryId,
    pub source_kb: KbName,
    pub target_id: EntryId,
    pub target_kb: KbName,
    pub relation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GraphData {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WantedPage {
    pub target_id: String,
    pub target_kb: String,
    pub ref_count: u64,
    pub referenced_by: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmbeddingStats {
    pub total_entries: u64,
    pub embedded_count: u64,
}

impl EmbeddingStats {
    pub fn coverage(&self) -> f64 {
        if self.total_entries == 0 {
            0.0
        } else {
            self.embedded_count as f64 / self.total_entries as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalCounts {
    pub kb_count: u64,
    pub entry_count: u64,
    pub link_count: u64,
    pub tag_count: u64,
}

/// A backend implementation must expose exactly these semantics; see
/// §4.4 for the per-method contract. All methods are async so the three
/// concrete backends (embedded sqlx/SQLite, server sqlx/Postgres,
/// columnar LanceDB) can each do their own I/O without blocking the
/// caller's executor.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Idempotent schema setup; safe to call on every startup (§4.6).
    async fn ensure_schema(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Atomically replace the entry keyed by `(id, kb_name)` and its
    /// owned tags, links, refs, sources, blocks. Preserves `created_at`
    /// and `created_by` from the prior version if present.
    async fn upsert_entry(&self, entry: &Entry) -> Result<()>;

    /// Cascade-delete. Returns whether a row was removed.
    async fn delete_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<bool>;

    /// Eagerly loads tags, sources, and outgoing links.
    async fn get_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<Option<Entry>>;

    async fn list_entries(&self, filter: &ListFilter) -> Result<Vec<Entry>>;
    async fn count_entries(&self, filter: &ListFilter) -> Result<u64>;

    /// Lexical full-text search with relevance ranking and a highlighted
    /// snippet. Ties broken by `date DESC, title ASC`.
    async fn search(&self, query: &SearchQuery, filter: &SearchFilter) -> Result<Vec<SearchHit>>;

    async fn search_by_tag(&self, tag: &Tag, kb_name: Option<&KbName>) -> Result<Vec<Entry>>;
    async fn search_by_date_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        kb_name: Option<&KbName>,
    ) -> Result<Vec<Entry>>;
    /// Prefix match: `tag` itself and any child under `tag/`.
    async fn search_by_tag_prefix(&self, prefix: &str, kb_name: Option<&KbName>) -> Result<Vec<Entry>>;

    /// Attach a vector to an existing entry. Returns false if no such
    /// entry exists.
    async fn upsert_embedding(&self, id: &EntryId, kb_name: &KbName, vector: &[f32]) -> Result<bool>;
    /// KNN by cosine distance; entries with distance > `max_distance`
    /// are filtered out.
    async fn search_semantic(
        &self,
        vector: &[f32],
        kb_name: Option<&KbName>,
        limit: usize,
        max_distance: f32,
    ) -> Result<Vec<SemanticHit>>;
    async fn has_embeddings(&self, kb_name: Option<&KbName>) -> Result<bool>;
    async fn embedding_stats(&self, kb_name: Option<&KbName>) -> Result<EmbeddingStats>;
    async fn delete_embedding(&self, id: &EntryId, kb_name: &KbName) -> Result<bool>;

    /// Backlinks use the precomputed `inverse_relation`, no recomputation
    /// at query time.
    async fn get_backlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>>;
    async fn get_outlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>>;

    async fn get_most_linked(&self, kb_name: Option<&KbName>, limit: usize) -> Result<Vec<(Entry, u64)>>;
    async fn get_orphans(&self, kb_name: Option<&KbName>) -> Result<Vec<Entry>>;

    async fn get_all_tags(&self, kb_name: Option<&KbName>) -> Result<Vec<TagCount>>;
    async fn get_tags_as_dicts(&self, kb_name: Option<&KbName>, prefix: Option<&str>) -> Result<Vec<TagCount>>;

    /// Entries with a non-null `date` within the window, filtered by
    /// `min_importance`, ordered ascending by date.
    async fn get_timeline(
        &self,
        kb_name: Option<&KbName>,
        min_importance: Option<Importance>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        limit: usize,
    ) -> Result<Vec<Entry>>;

    async fn get_refs_from(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>>;
    async fn get_refs_to(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>>;

    /// Prefix match on `file_path`, excluding `entry_type = collection`.
    async fn list_entries_in_folder(&self, folder: &str, kb_name: &KbName) -> Result<Vec<Entry>>;
    async fn count_entries_in_folder(&self, folder: &str, kb_name: &KbName) -> Result<u64>;

    /// All raw, directed links stored for the KB, used by Query
    /// Services (C9) to drive graph BFS without per-hop backend calls.
    async fn get_all_links(&self, kb_name: Option<&KbName>) -> Result<Vec<Link>>;

    /// `(id, indexed_at)` pairs used by the Index Manager (C8) to decide
    /// which on-disk files have changed since the last sync.
    async fn get_entries_for_indexing(&self, kb_name: &KbName) -> Result<Vec<(EntryId, DateTime<Utc>)>>;
    /// Identity of every entry carrying an embedding, used for coverage
    /// scans.
    async fn get_embedded_rowids(&self, kb_name: Option<&KbName>) -> Result<Vec<(EntryId, KbName)>>;
    /// Entries missing an embedding, for auto-embed backfill.
    async fn get_entries_for_embedding(&self, kb_name: Option<&KbName>, limit: usize) -> Result<Vec<Entry>>;
    async fn get_global_counts(&self) -> Result<GlobalCounts>;
    async fn get_distinct_types(&self, kb_name: Option<&KbName>) -> Result<Vec<String>>;
}
