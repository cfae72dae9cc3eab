// Index Manager (C8): orchestrates reindex, incremental sync, embedding
// coverage, and hook invocation around a Search Backend. Nothing here
// talks to a store directly, every mutation funnels through the
// backend's `upsert_entry`/`delete_entry` so all three concrete backends
// get reindex/sync/hooks/auto-embed for free.
//
// Data flow (§2): an Entry produced by markdown parsing (external,
// `EntryParser` below) is handed to `save_entry`, which derives blocks
// (C2), computes inverse relations (C3), derives entry_refs from typed
// frontmatter fields, runs the hook lifecycle, persists, and attempts
// auto-embed.

use crate::backend::{ListFilter, SearchBackend};
use crate::blocks::extract_blocks;
use crate::embeddings::EmbeddingProvider;
use crate::entry::{Entry, EntryRef};
use crate::errors::{PyriteError, Result};
use crate::kb::KbRegistry;
use crate::relations::RelationRegistry;
use crate::types::{EntryId, KbName, Limit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// External collaborator (§1 "Markdown frontmatter parsing, produces the
/// entry records the core ingests"): turns one on-disk file into an Entry
/// whose tags/sources/links/metadata are already populated from YAML
/// frontmatter. Blocks, inverse relations, and entry_refs remain the
/// Index Manager's job.
pub trait EntryParser: Send + Sync {
    fn parse_file(&self, path: &Path, kb_name: &KbName) -> Result<Entry>;
}

/// Distinguishes a hook's domain abort (`PyriteError`, always propagates)
/// from any other failure, which is logged-and-swallowed in `after_*`
/// hooks and aborts the operation in `before_*` hooks.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error(transparent)]
    Domain(#[from] PyriteError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Plugin lifecycle hooks invoked around every mutation. Default
/// implementations are no-ops so a hook only needs to override the
/// stages it cares about.
#[async_trait]
pub trait IndexHook: Send + Sync {
    async fn before_save(&self, entry: Entry) -> std::result::Result<Entry, HookError> {
        Ok(entry)
    }
    async fn after_save(&self, _entry: &Entry) -> std::result::Result<(), HookError> {
        Ok(())
    }
    async fn before_delete(&self, _id: &EntryId, _kb_name: &KbName) -> std::result::Result<(), HookError> {
        Ok(())
    }
    async fn after_delete(&self, _id: &EntryId, _kb_name: &KbName) -> std::result::Result<(), HookError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReindexReport {
    pub indexed: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
    pub errors: Vec<String>,
}

pub struct IndexManager<'a> {
    backend: &'a dyn SearchBackend,
    registry: KbRegistry,
    relations: Arc<RelationRegistry>,
    hooks: Vec<Arc<dyn IndexHook>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl<'a> IndexManager<'a> {
    pub fn new(backend: &'a dyn SearchBackend, registry: KbRegistry, relations: Arc<RelationRegistry>) -> Self {
        Self {
            backend,
            registry,
            relations,
            hooks: Vec::new(),
            embedder: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn IndexHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(provider);
        self
    }

    /// Runs the full mutation pipeline for one entry: derive → before_save
    /// hooks → persist → after_save hooks → best-effort auto-embed.
    pub async fn save_entry(&self, entry: Entry) -> Result<Entry> {
        let entry = self.prepare_entry(entry);
        let entry = self.run_before_save(entry).await?;
        self.backend.upsert_entry(&entry).await?;
        self.run_after_save(&entry).await?;
        self.auto_embed_if_needed(&entry).await;
        Ok(entry)
    }

    pub async fn delete_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        self.run_before_delete(id, kb_name).await?;
        let removed = self.backend.delete_entry(id, kb_name).await?;
        self.run_after_delete(id, kb_name).await?;
        Ok(removed)
    }

    /// Enumerate every `.md` file under the KB's path, parse, and save
    /// each. Per-file failures are logged and accumulated, not fatal to
    /// the run (§4.8 full reindex).
    pub async fn full_reindex(&self, kb_name: &KbName, parser: &dyn EntryParser) -> Result<ReindexReport> {
        let kb = self.registry.get(kb_name)?;
        let files = walk_markdown_files(Path::new(&kb.path))?;
        let mut report = ReindexReport::default();

        for path in &files {
            match parser.parse_file(path, kb_name) {
                Ok(entry) => match self.save_entry(entry).await {
                    Ok(_) => report.indexed += 1,
                    Err(e) => {
                        tracing::warn!(error = %e, path = %path.display(), "full reindex: failed to save entry");
                        report.errors.push(format!("{}: {e}", path.display()));
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "full reindex: failed to parse file");
                    report.errors.push(format!("{}: {e}", path.display()));
                }
            }
        }

        let count = self.count_in_kb(kb_name).await;
        self.registry.touch_indexed(kb_name, count)?;
        Ok(report)
    }

    /// Compares on-disk mtimes against `indexed_at` per `(id, kb_name)`
    /// and upserts changed/new files, removing entries whose file
    /// vanished (§4.8 incremental sync).
    pub async fn sync_incremental(&self, kb_name: &KbName, parser: &dyn EntryParser) -> Result<SyncReport> {
        let kb = self.registry.get(kb_name)?;
        let files = walk_markdown_files(Path::new(&kb.path))?;
        let indexed: HashMap<EntryId, DateTime<Utc>> =
            self.backend.get_entries_for_indexing(kb_name).await?.into_iter().collect();
        let mut seen: HashSet<EntryId> = HashSet::new();
        let mut report = SyncReport::default();

        for path in &files {
            let entry = match parser.parse_file(path, kb_name) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "incremental sync: failed to parse file");
                    report.errors.push(format!("{}: {e}", path.display()));
                    continue;
                }
            };
            seen.insert(entry.id.clone());

            let is_new = !indexed.contains_key(&entry.id);
            let is_changed = indexed
                .get(&entry.id)
                .map(|indexed_at| file_modified_at(path).map_or(false, |mtime| mtime > *indexed_at))
                .unwrap_or(false);
            if !is_new && !is_changed {
                continue;
            }

            match self.save_entry(entry).await {
                Ok(_) => {
                    if is_new {
                        report.added += 1;
                    } else {
                        report.updated += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "incremental sync: failed to save entry");
                    report.errors.push(format!("{}: {e}", path.display()));
                }
            }
        }

        for id in indexed.keys() {
            if seen.contains(id) {
                continue;
            }
            match self.delete_entry(id, kb_name).await {
                Ok(_) => report.removed += 1,
                Err(e) => {
                    tracing::warn!(error = %e, entry_id = %id, "incremental sync: failed to remove stale entry");
                    report.errors.push(format!("{id}: {e}"));
                }
            }
        }

        let count = self.count_in_kb(kb_name).await;
        self.registry.touch_indexed(kb_name, count)?;
        Ok(report)
    }

    async fn count_in_kb(&self, kb_name: &KbName) -> u64 {
        let filter = ListFilter {
            kb_name: Some(kb_name.clone()),
            ..Default::default()
        };
        self.backend.count_entries(&filter).await.unwrap_or(0)
    }

    fn prepare_entry(&self, mut entry: Entry) -> Entry {
        for link in &mut entry.links {
            link.inverse_relation = self.relations.inverse(&link.relation);
        }
        entry.blocks = extract_blocks(&entry.body);
        entry.entry_refs = derive_entry_refs(&entry);
        entry
    }

    /// Best-effort: computes and stores a vector for `entry` if a
    /// provider is configured and the entry is among the backend's
    /// current embedding-coverage gaps for its KB. Failures are logged
    /// and never propagate (§4.8 auto-embed).
    async fn auto_embed_if_needed(&self, entry: &Entry) {
        let Some(embedder) = &self.embedder else {
            return;
        };
        let candidates = match self
            .backend
            .get_entries_for_embedding(Some(&entry.kb_name), Limit::MAX)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, entry_id = %entry.id, "auto-embed: failed to check coverage");
                return;
            }
        };
        if !candidates.iter().any(|c| c.id == entry.id && c.kb_name == entry.kb_name) {
            return;
        }
        match embedder.embed(&entry.searchable_text()).await {
            Ok(vector) => {
                if let Err(e) = self.backend.upsert_embedding(&entry.id, &entry.kb_name, &vector).await {
                    tracing::warn!(error = %e, entry_id = %entry.id, "auto-embed: failed to store embedding");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, entry_id = %entry.id, "auto-embed: failed to compute embedding");
            }
        }
    }

    async fn run_before_save(&self, mut entry: Entry) -> Result<Entry> {
        for hook in &self.hooks {
            entry = match hook.before_save(entry).await {
                Ok(e) => e,
                Err(HookError::Domain(e)) => return Err(e),
                Err(HookError::Other(e)) => return Err(PyriteError::PluginError(e.to_string())),
            };
        }
        Ok(entry)
    }

    async fn run_after_save(&self, entry: &Entry) -> Result<()> {
        for hook in &self.hooks {
            if let Err(err) = hook.after_save(entry).await {
                match err {
                    HookError::Domain(e) => return Err(e),
                    HookError::Other(e) => {
                        tracing::warn!(error = %e, entry_id = %entry.id, "after_save hook failed");
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_before_delete(&self, id: &EntryId, kb_name: &KbName) -> Result<()> {
        for hook in &self.hooks {
            if let Err(err) = hook.before_delete(id, kb_name).await {
                return Err(match err {
                    HookError::Domain(e) => e,
                    HookError::Other(e) => PyriteError::PluginError(e.to_string()),
                });
            }
        }
        Ok(())
    }

    async fn run_after_delete(&self, id: &EntryId, kb_name: &KbName) -> Result<()> {
        for hook in &self.hooks {
            if let Err(err) = hook.after_delete(id, kb_name).await {
                match err {
                    HookError::Domain(e) => return Err(e),
                    HookError::Other(e) => {
                        tracing::warn!(error = %e, entry_id = %id, "after_delete hook failed");
                    }
                }
            }
        }
        Ok(())
    }
}

/// A typed frontmatter field names another entry when its value is a
/// JSON object carrying `id` and `kb_name` string keys (optionally an
/// array of such objects). This is the convention the upstream parser is
/// expected to follow when it materializes a ref-shaped frontmatter
/// field; anything else stays opaque in `metadata`.
fn derive_entry_refs(entry: &Entry) -> Vec<EntryRef> {
    let mut refs = Vec::new();
    for (field_name, value) in &entry.metadata {
        collect_entry_ref(entry, field_name, value, &mut refs);
    }
    refs.sort_by(|a, b| a.field_name.cmp(&b.field_name).then(a.target_id.cmp(&b.target_id)));
    refs
}

fn collect_entry_ref(entry: &Entry, field_name: &str, value: &Value, out: &mut Vec<EntryRef>) {
    match value {
        Value::Object(map) => {
            if let (Some(Value::String(id)), Some(Value::String(kb))) = (map.get("id"), map.get("kb_name")) {
                if let (Ok(target_id), Ok(target_kb)) = (EntryId::new(id.clone()), KbName::new(kb.clone())) {
                    let target_type = map.get("type").and_then(Value::as_str).unwrap_or("entry").to_string();
                    out.push(EntryRef {
                        source_id: entry.id.clone(),
                        source_kb: entry.kb_name.clone(),
                        target_id,
                        target_kb,
                        field_name: field_name.to_string(),
                        target_type,
                    });
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_entry_ref(entry, field_name, item, out);
            }
        }
        _ => {}
    }
}

fn walk_markdown_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk_dir_into(dir, &mut out)?;
    out.sort();
    Ok(out)
}

fn walk_dir_into(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| PyriteError::storage(format!("reading directory {}: {e}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| PyriteError::storage(e.to_string()))?;
        let path = entry.path();
        if path.is_dir() {
            walk_dir_into(&path, out)?;
        } else if path.extension().and_then(|ext| ext.to_str()) == Some("md") {
            out.push(path);
        }
    }
    Ok(())
}

fn file_modified_at(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path).ok()?.modified().ok().map(DateTime::<Utc>::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;
    use crate::types::{KbName as KbNameTy, Title};
    use std::sync::Mutex;

    fn sample_entry(id: &str, kb: &str) -> Entry {
        Entry::new(
            EntryId::new(id).unwrap(),
            KbNameTy::new(kb).unwrap(),
            EntryKind::Note,
            Title::new("Title").unwrap(),
            "# Heading\n\nBody paragraph.".into(),
        )
        .unwrap()
    }

    #[test]
    fn derive_entry_refs_reads_typed_object_fields() {
        let mut entry = sample_entry("e1", "k");
        entry.metadata.insert(
            "author".into(),
            serde_json::json!({"id": "person-1", "kb_name": "k", "type": "person"}),
        );
        entry.metadata.insert("unrelated".into(), serde_json::json!("plain string"));
        let refs = derive_entry_refs(&entry);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].field_name, "author");
        assert_eq!(refs[0].target_id.as_str(), "person-1");
        assert_eq!(refs[0].target_type, "person");
    }

    #[test]
    fn derive_entry_refs_handles_arrays_of_refs() {
        let mut entry = sample_entry("e1", "k");
        entry.metadata.insert(
            "attendees".into(),
            serde_json::json!([
                {"id": "p1", "kb_name": "k"},
                {"id": "p2", "kb_name": "k"},
            ]),
        );
        let refs = derive_entry_refs(&entry);
        assert_eq!(refs.len(), 2);
    }

    struct AbortingHook;

    #[async_trait]
    impl IndexHook for AbortingHook {
        async fn before_save(&self, _entry: Entry) -> std::result::Result<Entry, HookError> {
            Err(HookError::Domain(PyriteError::PluginError("blocked by policy".into())))
        }
    }

    struct SwallowedFailureHook {
        after_save_calls: Mutex<u32>,
    }

    #[async_trait]
    impl IndexHook for SwallowedFailureHook {
        async fn after_save(&self, _entry: &Entry) -> std::result::Result<(), HookError> {
            *self.after_save_calls.lock().unwrap() += 1;
            Err(HookError::Other(anyhow::anyhow!("transient plugin hiccup")))
        }
    }

    #[tokio::test]
    async fn before_save_domain_error_aborts_without_persisting() {
        let backend = crate::backends::embedded::EmbeddedBackend::connect(":memory:").await.unwrap();
        backend.ensure_schema().await.unwrap();
        let registry = KbRegistry::new();
        let kb_name = KbNameTy::new("k").unwrap();
        registry.register(crate::kb::Kb::new(kb_name.clone(), "generic", "/tmp/k"));
        let relations = Arc::new(RelationRegistry::with_defaults());

        let manager = IndexManager::new(&backend, registry, relations).with_hook(Arc::new(AbortingHook));
        let entry = sample_entry("e1", "k");
        let result = manager.save_entry(entry).await;
        assert!(result.is_err());
        assert!(backend.get_entry(&EntryId::new("e1").unwrap(), &kb_name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn after_save_non_domain_error_is_logged_and_swallowed() {
        let backend = crate::backends::embedded::EmbeddedBackend::connect(":memory:").await.unwrap();
        backend.ensure_schema().await.unwrap();
        let registry = KbRegistry::new();
        let kb_name = KbNameTy::new("k").unwrap();
        registry.register(crate::kb::Kb::new(kb_name.clone(), "generic", "/tmp/k"));
        let relations = Arc::new(RelationRegistry::with_defaults());
        let hook = Arc::new(SwallowedFailureHook {
            after_save_calls: Mutex::new(0),
        });

        let manager = IndexManager::new(&backend, registry, relations).with_hook(hook.clone());
        let entry = sample_entry("e1", "k");
        let saved = manager.save_entry(entry).await.unwrap();
        assert_eq!(saved.id.as_str(), "e1");
        assert_eq!(*hook.after_save_calls.lock().unwrap(), 1);
        assert!(backend.get_entry(&EntryId::new("e1").unwrap(), &kb_name).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn save_entry_derives_blocks_and_inverse_relation() {
        let backend = crate::backends::embedded::EmbeddedBackend::connect(":memory:").await.unwrap();
        backend.ensure_schema().await.unwrap();
        let registry = KbRegistry::new();
        let kb_name = KbNameTy::new("k").unwrap();
        registry.register(crate::kb::Kb::new(kb_name.clone(), "generic", "/tmp/k"));
        let relations = Arc::new(RelationRegistry::with_defaults());

        let manager = IndexManager::new(&backend, registry, relations);
        let mut entry = sample_entry("e1", "k");
        entry.links.push(crate::entry::Link {
            source_id: entry.id.clone(),
            source_kb: entry.kb_name.clone(),
            target_id: EntryId::new("e2").unwrap(),
            target_kb: kb_name.clone(),
            relation: crate::types::RelationName::new("parent_of").unwrap(),
            inverse_relation: crate::types::RelationName::new("parent_of").unwrap(),
            note: None,
        });

        let saved = manager.save_entry(entry).await.unwrap();
        assert!(!saved.blocks.is_empty());
        assert_eq!(saved.links[0].inverse_relation.as_str(), "child_of");
    }

    #[tokio::test]
    async fn delete_entry_runs_hook_lifecycle_and_removes_row() {
        let backend = crate::backends::embedded::EmbeddedBackend::connect(":memory:").await.unwrap();
        backend.ensure_schema().await.unwrap();
        let registry = KbRegistry::new();
        let kb_name = KbNameTy::new("k").unwrap();
        registry.register(crate::kb::Kb::new(kb_name.clone(), "generic", "/tmp/k"));
        let relations = Arc::new(RelationRegistry::with_defaults());

        let manager = IndexManager::new(&backend, registry, relations);
        manager.save_entry(sample_entry("e1", "k")).await.unwrap();
        let removed = manager.delete_entry(&EntryId::new("e1").unwrap(), &kb_name).await.unwrap();
        assert!(removed);
        assert!(backend.get_entry(&EntryId::new("e1").unwrap(), &kb_name).await.unwrap().is_none());
    }

    /// Trivial stand-in for the upstream markdown parser: first line is
    /// the title, the rest is the body, `id` is the filename stem.
    struct PlainTextParser;

    impl EntryParser for PlainTextParser {
        fn parse_file(&self, path: &Path, kb_name: &KbName) -> Result<Entry> {
            let text = std::fs::read_to_string(path).map_err(|e| PyriteError::storage(e.to_string()))?;
            let mut lines = text.lines();
            let title = lines.next().unwrap_or("untitled").to_string();
            let body = lines.collect::<Vec<_>>().join("\n");
            let id = path.file_stem().and_then(|s| s.to_str()).unwrap_or("entry").to_string();
            let mut entry = Entry::new(
                EntryId::new(id).map_err(|e| PyriteError::InvalidEntry(e.to_string()))?,
                kb_name.clone(),
                EntryKind::Note,
                Title::new(title).map_err(|e| PyriteError::InvalidEntry(e.to_string()))?,
                body,
            )?;
            entry.file_path = Some(path.to_string_lossy().to_string());
            Ok(entry)
        }
    }

    #[tokio::test]
    async fn full_reindex_indexes_every_markdown_file_under_the_kb_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.md"), "One\nfirst body").unwrap();
        std::fs::write(dir.path().join("two.md"), "Two\nsecond body").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "not markdown").unwrap();

        let backend = crate::backends::embedded::EmbeddedBackend::connect(":memory:").await.unwrap();
        backend.ensure_schema().await.unwrap();
        let registry = KbRegistry::new();
        let kb_name = KbNameTy::new("k").unwrap();
        registry.register(crate::kb::Kb::new(kb_name.clone(), "generic", dir.path().to_string_lossy().to_string()));
        let relations = Arc::new(RelationRegistry::with_defaults());

        let manager = IndexManager::new(&backend, registry.clone(), relations);
        let report = manager.full_reindex(&kb_name, &PlainTextParser).await.unwrap();
        assert_eq!(report.indexed, 2);
        assert!(report.errors.is_empty());
        assert_eq!(registry.get(&kb_name).unwrap().entry_count, 2);
        assert!(backend.get_entry(&EntryId::new("one").unwrap(), &kb_name).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sync_incremental_reports_added_updated_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let one = dir.path().join("one.md");
        std::fs::write(&one, "One\nfirst body").unwrap();

        let backend = crate::backends::embedded::EmbeddedBackend::connect(":memory:").await.unwrap();
        backend.ensure_schema().await.unwrap();
        let registry = KbRegistry::new();
        let kb_name = KbNameTy::new("k").unwrap();
        registry.register(crate::kb::Kb::new(kb_name.clone(), "generic", dir.path().to_string_lossy().to_string()));
        let relations = Arc::new(RelationRegistry::with_defaults());
        let manager = IndexManager::new(&backend, registry.clone(), relations.clone());

        let first = manager.sync_incremental(&kb_name, &PlainTextParser).await.unwrap();
        assert_eq!(first.added, 1);
        assert_eq!(first.updated, 0);
        assert_eq!(first.removed, 0);

        // Re-running with no filesystem changes adds/updates nothing.
        let second = manager.sync_incremental(&kb_name, &PlainTextParser).await.unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.removed, 0);

        std::fs::remove_file(&one).unwrap();
        let third = manager.sync_incremental(&kb_name, &PlainTextParser).await.unwrap();
        assert_eq!(third.removed, 1);
        assert!(backend.get_entry(&EntryId::new("one").unwrap(), &kb_name).await.unwrap().is_none());
    }
}
