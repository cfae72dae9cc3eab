// Query Services (C9): hybrid search fusion, graph BFS, wanted pages, and
// folder enumeration, all built on top of the narrow `SearchBackend`
// contract (C4) so every concrete backend gets them for free. RRF fusion
// and BFS traversal live here, not in any backend, per §2 "Data flow".

use crate::backend::{GraphData, GraphEdge, GraphNode, SearchBackend, SearchFilter, SearchHit, WantedPage};
use crate::entry::Entry;
use crate::errors::Result;
use crate::types::{EntryId, GraphDepth, KbName, SearchQuery};
use std::collections::{HashMap, HashSet};

pub struct QueryServices<'a> {
    backend: &'a dyn SearchBackend,
    /// Reciprocal Rank Fusion constant (conventionally 60).
    rrf_k: f64,
    /// Per-method result cap fed into fusion before it is narrowed to the
    /// caller's requested `limit`.
    hybrid_k: usize,
}

impl<'a> QueryServices<'a> {
    pub fn new(backend: &'a dyn SearchBackend) -> Self {
        Self {
            backend,
            rrf_k: 60.0,
            hybrid_k: 50,
        }
    }

    pub fn with_rrf_constant(mut self, k: f64) -> Self {
        self.rrf_k = k;
        self
    }

    pub fn with_hybrid_k(mut self, k: usize) -> Self {
        self.hybrid_k = k;
        self
    }

    /// Runs lexical search to obtain up to `hybrid_k` ranked results, runs
    /// semantic search (if `vector` is supplied) to obtain up to
    /// `hybrid_k` distance-ranked results, and fuses both via RRF: for
    /// each entry appearing in either set, `1/(rrf_k+rank_lex) +
    /// 1/(rrf_k+rank_sem)` (a missing rank contributes 0). Returns the
    /// top `limit` by fused score, each hit's `rank` rewritten to its
    /// position in the fused order.
    pub async fn search_hybrid(
        &self,
        query: &SearchQuery,
        vector: Option<&[f32]>,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let mut lexical_filter = filter.clone();
        lexical_filter.limit = crate::types::Limit::new(self.hybrid_k.max(1).min(crate::types::Limit::MAX))
            .unwrap_or_default();
        let lexical = self.backend.search(query, &lexical_filter).await?;

        let semantic = match vector {
            Some(v) => {
                self.backend
                    .search_semantic(v, filter.kb_name.as_ref(), self.hybrid_k, 2.0)
                    .await?
            }
            None => Vec::new(),
        };

        let mut fused: HashMap<(EntryId, KbName), (f64, SearchHit)> = HashMap::new();
        for (index, hit) in lexical.into_iter().enumerate() {
            let key = (hit.id.clone(), hit.kb_name.clone());
            let score = 1.0 / (self.rrf_k + (index + 1) as f64);
            fused
                .entry(key)
                .and_modify(|(s, _)| *s += score)
                .or_insert((score, hit));
        }
        for (index, semantic_hit) in semantic.into_iter().enumerate() {
            let key = (semantic_hit.hit.id.clone(), semantic_hit.hit.kb_name.clone());
            let score = 1.0 / (self.rrf_k + (index + 1) as f64);
            fused
                .entry(key)
                .and_modify(|(s, _)| *s += score)
                .or_insert((score, semantic_hit.hit));
        }

        let mut ranked: Vec<(f64, SearchHit)> = fused.into_values().collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);

        Ok(ranked
            .into_iter()
            .enumerate()
            .map(|(index, (_, mut hit))| {
                hit.rank = index + 1;
                hit
            })
            .collect())
    }

    /// Bounded BFS from `(center_id, center_kb)`, up to `depth` hops
    /// (clamped to 1-3), visiting both outgoing and incoming edges.
    /// Terminates early once `limit` nodes are visited. `kb_filter` and
    /// `entry_type_filter`, when set, are applied at expansion time: a
    /// neighbor outside the filter is neither visited nor expanded
    /// through.
    pub async fn graph_bfs(
        &self,
        center_id: &EntryId,
        center_kb: &KbName,
        depth: GraphDepth,
        kb_filter: Option<&KbName>,
        entry_type_filter: Option<&str>,
        limit: usize,
    ) -> Result<GraphData> {
        let all_links = self.backend.get_all_links(kb_filter).await?;
        let mut adjacency: HashMap<(EntryId, KbName), Vec<((EntryId, KbName), String)>> = HashMap::new();
        for link in &all_links {
            let from = (link.source_id.clone(), link.source_kb.clone());
            let to = (link.target_id.clone(), link.target_kb.clone());
            adjacency
                .entry(from.clone())
                .or_default()
                .push((to.clone(), link.relation.as_str().to_string()));
            adjacency
                .entry(to)
                .or_default()
                .push((from, link.inverse_relation.as_str().to_string()));
        }

        let center = (center_id.clone(), center_kb.clone());
        let mut visited: HashSet<(EntryId, KbName)> = HashSet::new();
        let mut edge_seen: HashSet<(EntryId, KbName, EntryId, KbName)> = HashSet::new();
        let mut edges = Vec::new();
        let mut entry_cache: HashMap<(EntryId, KbName), Option<Entry>> = HashMap::new();

        visited.insert(center.clone());
        let mut frontier = vec![center];

        'bfs: for _ in 0..depth.get() {
            let mut next_frontier = Vec::new();
            for node in &frontier {
                let Some(neighbors) = adjacency.get(node).cloned() else {
                    continue;
                };
                for (neighbor, relation) in neighbors {
                    if visited.len() >= limit && !visited.contains(&neighbor) {
                        break 'bfs;
                    }
                    if let Some(kb) = kb_filter {
                        if neighbor.1 != *kb {
                            continue;
                        }
                    }
                    if let Some(wanted_type) = entry_type_filter {
                        match self.entry_for(&mut entry_cache, &neighbor).await? {
                            Some(entry) if entry.entry_type.as_str() == wanted_type => {}
                            _ => continue,
                        }
                    }

                    let edge_key = (node.0.clone(), node.1.clone(), neighbor.0.clone(), neighbor.1.clone());
                    if edge_seen.insert(edge_key) {
                        edges.push(GraphEdge {
                            source_id: node.0.clone(),
                            source_kb: node.1.clone(),
                            target_id: neighbor.0.clone(),
                            target_kb: neighbor.1.clone(),
                            relation,
                        });
                    }
                    if visited.insert(neighbor.clone()) {
                        next_frontier.push(neighbor);
                    }
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }

        let mut link_counts: HashMap<(EntryId, KbName), u64> = HashMap::new();
        for edge in &edges {
            *link_counts.entry((edge.source_id.clone(), edge.source_kb.clone())).or_insert(0) += 1;
            *link_counts.entry((edge.target_id.clone(), edge.target_kb.clone())).or_insert(0) += 1;
        }

        let mut nodes = Vec::new();
        for node in &visited {
            if let Some(entry) = self.entry_for(&mut entry_cache, node).await? {
                nodes.push(GraphNode {
                    id: entry.id.clone(),
                    kb_name: entry.kb_name.clone(),
                    title: entry.title.as_str().to_string(),
                    entry_type: entry.entry_type.as_str().to_string(),
                    link_count: *link_counts.get(node).unwrap_or(&0),
                });
            }
        }

        Ok(GraphData { nodes, edges })
    }

    async fn entry_for(
        &self,
        cache: &mut HashMap<(EntryId, KbName), Option<Entry>>,
        node: &(EntryId, KbName),
    ) -> Result<Option<Entry>> {
        if let Some(cached) = cache.get(node) {
            return Ok(cached.clone());
        }
        let entry = self.backend.get_entry(&node.0, &node.1).await?;
        cache.insert(node.clone(), entry.clone());
        Ok(entry)
    }

    /// Outgoing links whose target has no corresponding entry, grouped by
    /// `(target_id, target_kb)` with reference counts, most-referenced
    /// first.
    pub async fn wanted_pages(&self, kb_name: Option<&KbName>) -> Result<Vec<WantedPage>> {
        let links = self.backend.get_all_links(kb_name).await?;
        let mut grouped: HashMap<(EntryId, KbName), Vec<String>> = HashMap::new();
        for link in &links {
            grouped
                .entry((link.target_id.clone(), link.target_kb.clone()))
                .or_default()
                .push(format!("{}:{}", link.source_kb.as_str(), link.source_id.as_str()));
        }

        let mut out = Vec::new();
        for ((target_id, target_kb), referenced_by) in grouped {
            if self.backend.get_entry(&target_id, &target_kb).await?.is_some() {
                continue;
            }
            out.push(WantedPage {
                ref_count: referenced_by.len() as u64,
                target_id: target_id.to_string(),
                target_kb: target_kb.to_string(),
                referenced_by,
            });
        }
        out.sort_by(|a, b| b.ref_count.cmp(&a.ref_count).then(a.target_id.cmp(&b.target_id)));
        Ok(out)
    }

    /// Prefix-match `file_path` on `<folder>/`, excluding collections.
    /// Delegates to the backend, which owns the index these queries run
    /// against.
    pub async fn list_folder(&self, folder: &str, kb_name: &KbName) -> Result<Vec<Entry>> {
        self.backend.list_entries_in_folder(folder, kb_name).await
    }

    pub async fn count_folder(&self, folder: &str, kb_name: &KbName) -> Result<u64> {
        self.backend.count_entries_in_folder(folder, kb_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SearchFilter;
    use crate::backends::embedded::EmbeddedBackend;
    use crate::entry::{EntryKind, Link};
    use crate::types::{EntryId as Id, KbName as Kb, RelationName, Title};

    async fn seeded_backend() -> EmbeddedBackend {
        let backend = EmbeddedBackend::connect(":memory:").await.unwrap();
        backend.ensure_schema().await.unwrap();
        backend
    }

    fn entry(id: &str, kb: &str, body: &str) -> Entry {
        Entry::new(
            Id::new(id).unwrap(),
            Kb::new(kb).unwrap(),
            EntryKind::Note,
            Title::new(id).unwrap(),
            body.to_string(),
        )
        .unwrap()
    }

    fn link(from: &str, to: &str, kb: &str, relation: &str, inverse: &str) -> Link {
        Link {
            source_id: Id::new(from).unwrap(),
            source_kb: Kb::new(kb).unwrap(),
            target_id: Id::new(to).unwrap(),
            target_kb: Kb::new(kb).unwrap(),
            relation: RelationName::new(relation).unwrap(),
            inverse_relation: RelationName::new(inverse).unwrap(),
            note: None,
        }
    }

    #[tokio::test]
    async fn hybrid_search_favors_hits_in_both_result_sets() {
        let backend = seeded_backend().await;
        backend.upsert_entry(&entry("a", "k", "apple banana cherry")).await.unwrap();
        backend.upsert_entry(&entry("b", "k", "banana")).await.unwrap();
        backend.upsert_embedding(&Id::new("a").unwrap(), &Kb::new("k").unwrap(), &[1.0, 0.0]).await.unwrap();
        backend.upsert_embedding(&Id::new("b").unwrap(), &Kb::new("k").unwrap(), &[0.0, 1.0]).await.unwrap();

        let services = QueryServices::new(&backend);
        let query = SearchQuery::new("banana").unwrap();
        let filter = SearchFilter::default();
        let hits = services
            .search_hybrid(&query, Some(&[1.0, 0.0]), &filter, 10)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].rank, 1);
    }

    #[tokio::test]
    async fn graph_bfs_respects_depth_and_limit() {
        let backend = seeded_backend().await;
        for id in ["a", "b", "c", "d"] {
            backend.upsert_entry(&entry(id, "k", "body")).await.unwrap();
        }
        backend.upsert_entry(&{
            let mut e = entry("a", "k", "body");
            e.links = vec![link("a", "b", "k", "mentions", "mentioned_by")];
            e
        }).await.unwrap();
        backend.upsert_entry(&{
            let mut e = entry("b", "k", "body");
            e.links = vec![link("b", "c", "k", "mentions", "mentioned_by")];
            e
        }).await.unwrap();
        backend.upsert_entry(&{
            let mut e = entry("c", "k", "body");
            e.links = vec![link("c", "d", "k", "mentions", "mentioned_by")];
            e
        }).await.unwrap();

        let services = QueryServices::new(&backend);
        let data = services
            .graph_bfs(
                &Id::new("a").unwrap(),
                &Kb::new("k").unwrap(),
                GraphDepth::clamped(1),
                None,
                None,
                100,
            )
            .await
            .unwrap();
        let ids: HashSet<String> = data.nodes.iter().map(|n| n.id.to_string()).collect();
        assert!(ids.contains("a"));
        assert!(ids.contains("b"));
        assert!(!ids.contains("c"), "depth 1 should not reach c");
    }

    #[tokio::test]
    async fn graph_bfs_shape_matches_expected_nodes_and_edges() {
        let backend = seeded_backend().await;
        backend.upsert_entry(&entry("a", "k", "body")).await.unwrap();
        backend.upsert_entry(&entry("b", "k", "body")).await.unwrap();
        backend
            .upsert_entry(&{
                let mut e = entry("a", "k", "body");
                e.links = vec![link("a", "b", "k", "mentions", "mentioned_by")];
                e
            })
            .await
            .unwrap();

        let services = QueryServices::new(&backend);
        let mut data = services
            .graph_bfs(&Id::new("a").unwrap(), &Kb::new("k").unwrap(), GraphDepth::clamped(1), None, None, 100)
            .await
            .unwrap();
        data.nodes.sort_by(|a, b| a.id.to_string().cmp(&b.id.to_string()));

        let expected_nodes = vec![
            GraphNode { id: Id::new("a").unwrap(), kb_name: Kb::new("k").unwrap(), title: "a".into(), entry_type: "note".into(), link_count: 1 },
            GraphNode { id: Id::new("b").unwrap(), kb_name: Kb::new("k").unwrap(), title: "b".into(), entry_type: "note".into(), link_count: 0 },
        ];
        let expected_edges = vec![GraphEdge {
            source_id: Id::new("a").unwrap(),
            source_kb: Kb::new("k").unwrap(),
            target_id: Id::new("b").unwrap(),
            target_kb: Kb::new("k").unwrap(),
            relation: "mentions".into(),
        }];

        pretty_assertions::assert_eq!(data.nodes, expected_nodes);
        pretty_assertions::assert_eq!(data.edges, expected_edges);
    }

    #[tokio::test]
    async fn wanted_pages_reports_dangling_targets() {
        let backend = seeded_backend().await;
        let mut a = entry("a", "k", "body");
        a.links = vec![link("a", "ghost", "k", "mentions", "mentioned_by")];
        backend.upsert_entry(&a).await.unwrap();

        let services = QueryServices::new(&backend);
        let wanted = services.wanted_pages(Some(&Kb::new("k").unwrap())).await.unwrap();
        assert_eq!(wanted.len(), 1);
        assert_eq!(wanted[0].target_id, "ghost");
        assert_eq!(wanted[0].ref_count, 1);
    }
}
