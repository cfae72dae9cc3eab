// Embedding provider seam (§6 "embedding generation ... upstream of the
// core"). The core never ships a concrete model; Index Manager (C8)
// auto-embed and Query Services (C9) semantic search only depend on this
// trait, so a deployment wires in whatever provider it wants.

use crate::errors::{PyriteError, Result};
use async_trait::async_trait;

/// Generates a fixed-dimension vector for a piece of text. Implementors
/// own their own batching/caching/network concerns; the core calls
/// `embed` one entry at a time from the auto-embed backfill loop.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Dimension of vectors this provider returns; must match the
    /// backend's configured `dimension` or `upsert_embedding` calls will
    /// carry mismatched vectors.
    fn dimension(&self) -> usize;
}

/// Stands in for "no provider configured". Auto-embed treats this as
/// absent rather than calling it, but it is a real implementation so
/// callers that always hold a `dyn EmbeddingProvider` don't need an
/// `Option` at every call site.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEmbeddingProvider;

#[async_trait]
impl EmbeddingProvider for NullEmbeddingProvider {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(PyriteError::storage("no embedding provider configured"))
    }

    fn dimension(&self) -> usize {
        0
    }
}

/// Deterministic provider for tests: hashes the text into a fixed-size
/// vector so the same input always produces the same output without any
/// model weights or network calls.
#[derive(Debug, Clone)]
pub struct DeterministicTestProvider {
    dimension: usize,
}

impl DeterministicTestProvider {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for DeterministicTestProvider {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingProvider for DeterministicTestProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut state: u64 = 1469598103934665603;
        for byte in text.as_bytes() {
            state ^= *byte as u64;
            state = state.wrapping_mul(1099511628211);
        }
        let mut vector = Vec::with_capacity(self.dimension);
        for i in 0..self.dimension {
            state ^= (i as u64).wrapping_add(0x9e3779b97f4a7c15);
            state = state.wrapping_mul(1099511628211);
            let normalized = (state % 2001) as f32 / 1000.0 - 1.0;
            vector.push(normalized);
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_provider_always_errors() {
        let provider = NullEmbeddingProvider;
        assert!(provider.embed("anything").await.is_err());
    }

    #[tokio::test]
    async fn deterministic_provider_is_stable_and_dimensioned() {
        let provider = DeterministicTestProvider::new(16);
        let a = provider.embed("hello world").await.unwrap();
        let b = provider.embed("hello world").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[tokio::test]
    async fn deterministic_provider_distinguishes_inputs() {
        let provider = DeterministicTestProvider::new(16);
        let a = provider.embed("alpha").await.unwrap();
        let b = provider.embed("beta").await.unwrap();
        assert_ne!(a, b);
    }
}
