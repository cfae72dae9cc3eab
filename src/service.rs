// Service facade (§6): the Service-level operations a CLI/REST/MCP layer
// calls. No independent business logic lives above this, mutations
// funnel through the Index Manager (C8), reads and hybrid queries
// through the backend and Query Services (C9) directly.

use crate::backend::{GlobalCounts, GraphData, ListFilter, SearchBackend, SearchFilter, SearchHit, SemanticHit, TagCount, WantedPage};
use crate::config::PyriteConfig;
use crate::embeddings::EmbeddingProvider;
use crate::entry::{Entry, EntryRef, Link};
use crate::errors::{PyriteError, Result};
use crate::index_manager::{EntryParser, IndexHook, IndexManager, ReindexReport, SyncReport};
use crate::kb::{Kb, KbRegistry};
use crate::query_services::QueryServices;
use crate::relations::RelationRegistry;
use crate::types::{EntryId, GraphDepth, Importance, KbName, RelationName, SearchQuery};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One node of `get_tag_tree`'s hierarchy, split on `/`. `count` is the
/// tag's own entry count (0 for a path segment that is never used as a
/// tag by itself).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagTreeNode {
    pub name: String,
    pub full_path: String,
    pub count: u64,
    pub children: Vec<TagTreeNode>,
}

pub struct Service<'a> {
    backend: &'a dyn SearchBackend,
    registry: KbRegistry,
    relations: Arc<RelationRegistry>,
    hooks: Vec<Arc<dyn IndexHook>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    rrf_constant: f64,
    hybrid_k: usize,
}

impl<'a> Service<'a> {
    pub fn new(backend: &'a dyn SearchBackend, registry: KbRegistry) -> Self {
        Self {
            backend,
            registry,
            relations: Arc::new(RelationRegistry::with_defaults()),
            hooks: Vec::new(),
            embedder: None,
            rrf_constant: 60.0,
            hybrid_k: 50,
        }
    }

    pub fn with_relations(mut self, relations: Arc<RelationRegistry>) -> Self {
        self.relations = relations;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn IndexHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(provider);
        self
    }

    pub fn with_config(mut self, config: &PyriteConfig) -> Self {
        self.rrf_constant = config.rrf_constant;
        self.hybrid_k = config.hybrid_k;
        self
    }

    fn index_manager(&self) -> IndexManager<'a> {
        let mut manager = IndexManager::new(self.backend, self.registry.clone(), self.relations.clone());
        for hook in &self.hooks {
            manager = manager.with_hook(hook.clone());
        }
        if let Some(embedder) = &self.embedder {
            manager = manager.with_embedding_provider(embedder.clone());
        }
        manager
    }

    fn query_services(&self) -> QueryServices<'a> {
        QueryServices::new(self.backend)
            .with_rrf_constant(self.rrf_constant)
            .with_hybrid_k(self.hybrid_k)
    }

    // --- KB registry -----------------------------------------------

    pub fn list_kbs(&self) -> Vec<Kb> {
        self.registry.list()
    }

    pub fn get_kb(&self, name: &KbName) -> Result<Kb> {
        self.registry.get(name)
    }

    pub fn register_kb(&self, kb: Kb) {
        self.registry.register(kb)
    }

    pub fn unregister_kb(&self, name: &KbName) -> Result<()> {
        self.registry.unregister(name)
    }

    // --- Entry mutation ----------------------------------------------

    pub async fn create_entry(&self, entry: Entry) -> Result<Entry> {
        self.registry.check_writable(&entry.kb_name)?;
        self.index_manager().save_entry(entry).await
    }

    /// Validates identity stability and timestamp ordering against the
    /// stored predecessor (if any) before running the usual save
    /// pipeline.
    pub async fn update_entry(&self, entry: Entry) -> Result<Entry> {
        self.registry.check_writable(&entry.kb_name)?;
        if let Some(existing) = self.backend.get_entry(&entry.id, &entry.kb_name).await? {
            crate::validation::entry::validate_for_update(&entry, &existing)
                .map_err(|e| PyriteError::InvalidEntry(e.to_string()))?;
        }
        self.index_manager().save_entry(entry).await
    }

    pub async fn delete_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        self.registry.check_writable(kb_name)?;
        self.index_manager().delete_entry(id, kb_name).await
    }

    pub async fn get_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<Option<Entry>> {
        self.backend.get_entry(id, kb_name).await
    }

    // --- Search --------------------------------------------------------

    pub async fn search(&self, query: &SearchQuery, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        self.backend.search(query, filter).await
    }

    pub async fn search_semantic(
        &self,
        vector: &[f32],
        kb_name: Option<&KbName>,
        limit: usize,
        max_distance: f32,
    ) -> Result<Vec<SemanticHit>> {
        self.backend.search_semantic(vector, kb_name, limit, max_distance).await
    }

    pub async fn search_hybrid(
        &self,
        query: &SearchQuery,
        vector: Option<&[f32]>,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        self.query_services().search_hybrid(query, vector, filter, limit).await
    }

    pub async fn list_entries(&self, filter: &ListFilter) -> Result<Vec<Entry>> {
        self.backend.list_entries(filter).await
    }

    pub async fn count_entries(&self, filter: &ListFilter) -> Result<u64> {
        self.backend.count_entries(filter).await
    }

    pub async fn get_timeline(
        &self,
        kb_name: Option<&KbName>,
        min_importance: Option<Importance>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        limit: usize,
    ) -> Result<Vec<Entry>> {
        self.backend.get_timeline(kb_name, min_importance, from, to, limit).await
    }

    pub async fn get_tags(&self, kb_name: Option<&KbName>) -> Result<Vec<TagCount>> {
        self.backend.get_all_tags(kb_name).await
    }

    /// Groups flat `get_tags` output into a `/`-delimited hierarchy.
    pub async fn get_tag_tree(&self, kb_name: Option<&KbName>) -> Result<Vec<TagTreeNode>> {
        let tags = self.backend.get_all_tags(kb_name).await?;
        Ok(build_tag_tree(tags))
    }

    pub async fn search_by_tag_prefix(&self, prefix: &str, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        self.backend.search_by_tag_prefix(prefix, kb_name).await
    }

    pub async fn get_backlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        self.backend.get_backlinks(id, kb_name).await
    }

    pub async fn get_outlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        self.backend.get_outlinks(id, kb_name).await
    }

    pub async fn get_graph(
        &self,
        center_id: &EntryId,
        center_kb: &KbName,
        depth: GraphDepth,
        kb_filter: Option<&KbName>,
        entry_type_filter: Option<&str>,
        limit: usize,
    ) -> Result<GraphData> {
        self.query_services()
            .graph_bfs(center_id, center_kb, depth, kb_filter, entry_type_filter, limit)
            .await
    }

    pub async fn get_wanted_pages(&self, kb_name: Option<&KbName>) -> Result<Vec<WantedPage>> {
        self.query_services().wanted_pages(kb_name).await
    }

    /// Appends a typed link to an existing entry and re-saves it; the
    /// inverse relation is recomputed from the Relation Registry
    /// regardless of what the caller supplies.
    pub async fn add_link(
        &self,
        source_id: &EntryId,
        source_kb: &KbName,
        target_id: &EntryId,
        target_kb: &KbName,
        relation: RelationName,
        note: Option<String>,
    ) -> Result<Entry> {
        self.registry.check_writable(source_kb)?;
        let mut entry = self
            .backend
            .get_entry(source_id, source_kb)
            .await?
            .ok_or_else(|| PyriteError::EntryNotFound {
                id: source_id.to_string(),
                kb_name: source_kb.to_string(),
            })?;
        let inverse_relation = self.relations.inverse(&relation);
        entry.links.push(Link {
            source_id: source_id.clone(),
            source_kb: source_kb.clone(),
            target_id: target_id.clone(),
            target_kb: target_kb.clone(),
            relation,
            inverse_relation,
            note,
        });
        self.index_manager().save_entry(entry).await
    }

    pub async fn get_refs_from(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>> {
        self.backend.get_refs_from(id, kb_name).await
    }

    pub async fn get_refs_to(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>> {
        self.backend.get_refs_to(id, kb_name).await
    }

    pub async fn sync_index(&self, kb_name: &KbName, parser: &dyn EntryParser) -> Result<SyncReport> {
        self.index_manager().sync_incremental(kb_name, parser).await
    }

    pub async fn full_reindex(&self, kb_name: &KbName, parser: &dyn EntryParser) -> Result<ReindexReport> {
        self.index_manager().full_reindex(kb_name, parser).await
    }

    pub async fn get_index_stats(&self) -> Result<GlobalCounts> {
        self.backend.get_global_counts().await
    }
}

fn build_tag_tree(tags: Vec<TagCount>) -> Vec<TagTreeNode> {
    #[derive(Default)]
    struct Builder {
        count: u64,
        children: BTreeMap<String, Builder>,
    }

    let mut root = Builder::default();
    for tag in tags {
        let mut node = &mut root;
        for segment in tag.tag.split('/') {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.count = tag.count;
    }

    fn to_nodes(prefix: &str, builder: Builder) -> Vec<TagTreeNode> {
        builder
            .children
            .into_iter()
            .map(|(name, child)| {
                let full_path = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
                let count = child.count;
                let children = to_nodes(&full_path, child);
                TagTreeNode { name, full_path, count, children }
            })
            .collect()
    }

    to_nodes("", root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::embedded::EmbeddedBackend;
    use crate::entry::EntryKind;
    use crate::types::Title;

    async fn seeded() -> (EmbeddedBackend, KbRegistry, KbName) {
        let backend = EmbeddedBackend::connect(":memory:").await.unwrap();
        backend.ensure_schema().await.unwrap();
        let registry = KbRegistry::new();
        let kb_name = KbName::new("k").unwrap();
        registry.register(Kb::new(kb_name.clone(), "generic", "/tmp/k"));
        (backend, registry, kb_name)
    }

    #[tokio::test]
    async fn create_entry_is_rejected_for_read_only_kb() {
        let (backend, registry, kb_name) = seeded().await;
        registry.unregister(&kb_name).unwrap();
        let mut kb = Kb::new(kb_name.clone(), "generic", "/tmp/k");
        kb.read_only = true;
        registry.register(kb);

        let service = Service::new(&backend, registry);
        let entry = Entry::new(
            EntryId::new("e1").unwrap(),
            kb_name,
            EntryKind::Note,
            Title::new("T").unwrap(),
            "body".into(),
        )
        .unwrap();
        assert!(service.create_entry(entry).await.is_err());
    }

    #[tokio::test]
    async fn add_link_recomputes_inverse_relation() {
        let (backend, registry, kb_name) = seeded().await;
        let service = Service::new(&backend, registry);

        let a = Entry::new(
            EntryId::new("a").unwrap(),
            kb_name.clone(),
            EntryKind::Note,
            Title::new("A").unwrap(),
            "body".into(),
        )
        .unwrap();
        let b = Entry::new(
            EntryId::new("b").unwrap(),
            kb_name.clone(),
            EntryKind::Note,
            Title::new("B").unwrap(),
            "body".into(),
        )
        .unwrap();
        service.create_entry(a).await.unwrap();
        service.create_entry(b).await.unwrap();

        let updated = service
            .add_link(
                &EntryId::new("a").unwrap(),
                &kb_name,
                &EntryId::new("b").unwrap(),
                &kb_name,
                RelationName::new("parent_of").unwrap(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.links[0].inverse_relation.as_str(), "child_of");
    }

    #[test]
    fn tag_tree_groups_hierarchical_tags() {
        let tags = vec![
            TagCount { tag: "science".into(), count: 2 },
            TagCount { tag: "science/physics".into(), count: 5 },
            TagCount { tag: "science/biology".into(), count: 1 },
        ];
        let tree = build_tag_tree(tags);
        assert_eq!(tree.len(), 1);
        let science = &tree[0];
        assert_eq!(science.name, "science");
        assert_eq!(science.count, 2);
        assert_eq!(science.children.len(), 2);
        let physics = science.children.iter().find(|c| c.name == "physics").unwrap();
        assert_eq!(physics.full_path, "science/physics");
        assert_eq!(physics.count, 5);
    }
}
