// End-to-end coverage of the Service facade over the embedded backend:
// register a KB, create linked entries, search, walk the graph.

#![cfg(feature = "embedded-backend")]

use pyrite::backends::embedded::EmbeddedBackend;
use pyrite::{
    Entry, EntryId, EntryKind, GraphDepth, Kb, KbName, KbRegistry, Limit, RelationName, SearchFilter,
    SearchQuery, Service, Title,
};
use tempfile::tempdir;

async fn service_over_embedded(dir: &std::path::Path) -> (EmbeddedBackend, KbName) {
    let db_path = dir.join("kb.sqlite");
    let backend = EmbeddedBackend::connect(db_path.to_str().unwrap()).await.unwrap();
    backend.ensure_schema().await.unwrap();
    let kb_name = KbName::new("notes").unwrap();
    (backend, kb_name)
}

fn sample_entry(id: &str, kb_name: &KbName, title: &str, body: &str) -> Entry {
    Entry::new(
        EntryId::new(id).unwrap(),
        kb_name.clone(),
        EntryKind::Note,
        Title::new(title).unwrap(),
        body.to_string(),
    )
    .unwrap()
}

#[tokio::test]
async fn registers_indexes_searches_and_links_entries() {
    let dir = tempdir().unwrap();
    let (backend, kb_name) = service_over_embedded(dir.path()).await;
    let registry = KbRegistry::new();
    let service = Service::new(&backend, registry);

    service.register_kb(Kb::new(kb_name.clone(), "generic", dir.path().to_string_lossy().to_string()));

    let quarterly = sample_entry("quarterly-planning", &kb_name, "Quarterly Planning", "Notes about quarterly planning goals.");
    let roadmap = sample_entry("roadmap", &kb_name, "Roadmap", "The roadmap mentions quarterly planning explicitly.");
    service.create_entry(quarterly).await.unwrap();
    service.create_entry(roadmap).await.unwrap();

    let query = SearchQuery::new("quarterly planning").unwrap();
    let filter = SearchFilter { kb_name: Some(kb_name.clone()), limit: Limit::new(10).unwrap(), ..Default::default() };
    let hits = service.search(&query, &filter).await.unwrap();
    assert_eq!(hits.len(), 2);

    let source = EntryId::new("roadmap").unwrap();
    let target = EntryId::new("quarterly-planning").unwrap();
    service
        .add_link(&source, &kb_name, &target, &kb_name, RelationName::new("mentions").unwrap(), None)
        .await
        .unwrap();

    let graph = service.get_graph(&source, &kb_name, GraphDepth::clamped(1), None, None, 50).await.unwrap();
    assert_eq!(graph.nodes.len(), 2);
    assert_eq!(graph.edges.len(), 1);
    assert_eq!(graph.edges[0].relation, "mentions");

    let backlinks = service.get_backlinks(&target, &kb_name).await.unwrap();
    assert_eq!(backlinks.len(), 1);

    let counts = service.get_index_stats().await.unwrap();
    assert_eq!(counts.entry_count, 2);
    assert_eq!(counts.link_count, 1);
}

#[tokio::test]
async fn delete_entry_removes_it_from_search_and_graph() {
    let dir = tempdir().unwrap();
    let (backend, kb_name) = service_over_embedded(dir.path()).await;
    let registry = KbRegistry::new();
    let service = Service::new(&backend, registry);
    service.register_kb(Kb::new(kb_name.clone(), "generic", dir.path().to_string_lossy().to_string()));

    let entry = sample_entry("to-delete", &kb_name, "Ephemeral", "This entry will be deleted.");
    service.create_entry(entry).await.unwrap();

    let id = EntryId::new("to-delete").unwrap();
    assert!(service.get_entry(&id, &kb_name).await.unwrap().is_some());
    assert!(service.delete_entry(&id, &kb_name).await.unwrap());
    assert!(service.get_entry(&id, &kb_name).await.unwrap().is_none());

    let query = SearchQuery::new("Ephemeral").unwrap();
    let filter = SearchFilter { kb_name: Some(kb_name), limit: Limit::new(10).unwrap(), ..Default::default() };
    assert!(service.search(&query, &filter).await.unwrap().is_empty());
}
