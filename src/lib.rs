// Pyrite - a pluggable search backend and index-maintenance core for
// Markdown-with-frontmatter knowledge bases.
//
// The crate has no opinion on where entries come from (see `EntryParser` in
// `index_manager`) or how they're served (CLI, REST, MCP). It owns the
// data model, the backend contract, and the query/index orchestration that
// every concrete backend gets for free.

pub mod backend;
pub mod backends;
pub mod blocks;
pub mod config;
pub mod embeddings;
pub mod entry;
pub mod errors;
pub mod index_manager;
pub mod kb;
pub mod observability;
pub mod query_services;
pub mod relations;
pub mod service;
pub mod types;
pub mod validation;
pub mod vector_codec;
pub mod wrappers;

pub use backend::{
    EmbeddingStats, GlobalCounts, GraphData, GraphEdge, GraphNode, ListFilter, SearchBackend, SearchFilter,
    SearchHit, SemanticHit, TagCount, WantedPage,
};
pub use blocks::{Block, BlockType};
pub use config::{BackendKind, PyriteConfig};
pub use embeddings::{DeterministicTestProvider, EmbeddingProvider, NullEmbeddingProvider};
pub use entry::{Entry, EntryKind, EntryRef, Link, Source};
pub use errors::{PyriteError, Result, StorageError};
pub use index_manager::{EntryParser, HookError, IndexHook, IndexManager, ReindexReport, SyncReport};
pub use kb::{Kb, KbRegistry};
pub use query_services::QueryServices;
pub use relations::RelationRegistry;
pub use service::{Service, TagTreeNode};
pub use types::{
    EntryId, GraphDepth, Importance, KbName, Limit, RelationName, SearchQuery, SortField, SortOrder, Tag, Title,
};
pub use wrappers::{CachedBackend, RetryableBackend, TracedBackend, ValidatedBackend};
