// Error taxonomy for the core. Every fallible operation in this crate
// returns `Result<T>` from this module; transport layers (CLI, REST, MCP)
// map `PyriteError` variants onto their own status codes.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PyriteError>;

#[derive(Debug, Error)]
pub enum PyriteError {
    #[error("knowledge base not found: {0}")]
    KBNotFound(String),

    #[error("knowledge base is read-only: {0}")]
    KBReadOnly(String),

    #[error("entry not found: {id} in {kb_name}")]
    EntryNotFound { id: String, kb_name: String },

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("validation failed: {issues:?}")]
    ValidationError { issues: Vec<String> },

    #[error("storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("plugin hook aborted the operation: {0}")]
    PluginError(String),
}

/// Backend I/O failures, wrapped into `PyriteError::StorageError` so
/// callers never have to match on a specific engine's error type.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "embedded-backend")]
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    #[cfg(feature = "columnar-backend")]
    #[error("lancedb error: {0}")]
    LanceDb(#[from] lancedb::Error),

    #[cfg(feature = "columnar-backend")]
    #[error("tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl PyriteError {
    pub fn validation(issues: Vec<String>) -> Self {
        Self::ValidationError { issues }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError(StorageError::Other(message.into()))
    }
}
