// Runtime configuration, loaded from TOML with environment overrides
// (`PYRITE_*`), mirroring the teacher's layered-config convention.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Which concrete `SearchBackend` to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Embedded,
    Server,
    Columnar,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Embedded
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyriteConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// SQLite file path for the embedded backend.
    #[serde(default = "default_embedded_path")]
    pub embedded_path: String,

    /// Postgres connection string for the server backend.
    #[serde(default)]
    pub postgres_dsn: Option<String>,

    /// LanceDB directory URI for the columnar backend.
    #[serde(default = "default_lancedb_uri")]
    pub lancedb_uri: String,

    /// Fixed embedding dimension; the reference value is 384.
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,

    /// `K`, the per-method result cap fed into RRF fusion.
    #[serde(default = "default_hybrid_k")]
    pub hybrid_k: usize,

    /// The RRF constant (conventionally 60).
    #[serde(default = "default_rrf_constant")]
    pub rrf_constant: f64,
}

fn default_embedded_path() -> String {
    "pyrite.db".to_string()
}

fn default_lancedb_uri() -> String {
    "pyrite.lance".to_string()
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_hybrid_k() -> usize {
    50
}

fn default_rrf_constant() -> f64 {
    60.0
}

impl Default for PyriteConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            embedded_path: default_embedded_path(),
            postgres_dsn: None,
            lancedb_uri: default_lancedb_uri(),
            embedding_dimension: default_embedding_dimension(),
            hybrid_k: default_hybrid_k(),
            rrf_constant: default_rrf_constant(),
        }
    }
}

impl PyriteConfig {
    /// Load from `pyrite.toml` (if present) in `config_dir`, then apply
    /// `PYRITE_*` environment overrides (e.g. `PYRITE_BACKEND=server`).
    pub fn load(config_dir: &str) -> Result<Self> {
        let path = std::path::Path::new(config_dir).join("pyrite.toml");
        let builder = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix("PYRITE").try_parsing(true));

        let settings = builder.build()?;
        Ok(settings.try_deserialize().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = PyriteConfig::default();
        assert_eq!(cfg.backend, BackendKind::Embedded);
        assert_eq!(cfg.embedding_dimension, 384);
        assert_eq!(cfg.rrf_constant, 60.0);
    }

    #[test]
    fn load_falls_back_to_defaults_when_no_file_present() {
        let cfg = PyriteConfig::load("/nonexistent/dir").unwrap();
        assert_eq!(cfg.backend, BackendKind::Embedded);
    }
}
