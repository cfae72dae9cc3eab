// Validated domain types: newtypes that enforce the invariants of the
// data model at construction time, so invalid data cannot flow downstream.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity half of an entry's `(id, kb_name)` key. A URL-safe slug.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId {
    inner: String,
}

impl EntryId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        ensure!(!id.is_empty(), "entry id cannot be empty");
        ensure!(
            !id.chars().any(|c| c.is_whitespace() || c.is_control()),
            "entry id cannot contain whitespace or control characters"
        );
        Ok(Self { inner: id })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// The other half of an entry's identity: the knowledge base it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KbName {
    inner: String,
}

impl KbName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        ensure!(!name.trim().is_empty(), "kb name cannot be empty");
        Ok(Self { inner: name })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for KbName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A non-empty entry title, bounded to a reasonable length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Title {
    inner: String,
}

impl Title {
    const MAX_LENGTH: usize = 1024;

    pub fn new(title: impl Into<String>) -> Result<Self> {
        let title = title.into();
        let trimmed = title.trim();
        ensure!(!trimmed.is_empty(), "title cannot be empty");
        ensure!(
            trimmed.len() <= Self::MAX_LENGTH,
            "title exceeds maximum length of {} characters",
            Self::MAX_LENGTH
        );
        Ok(Self { inner: trimmed.to_string() })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for Title {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A global, hierarchical tag (`science/physics`). Validation is
/// deliberately permissive: non-empty and valid UTF-8 is all the source
/// system enforces; tag taxonomies are a plugin/schema concern upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    inner: String,
}

impl Tag {
    pub fn new(tag: impl Into<String>) -> Result<Self> {
        let tag = tag.into();
        ensure!(!tag.trim().is_empty(), "tag cannot be empty");
        Ok(Self { inner: tag })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Does this tag equal `prefix` or live under `prefix/`?
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.inner == prefix || self.inner.starts_with(&format!("{prefix}/"))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A relation name as it appears on a `Link` (e.g. `mentions`, `parent_of`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationName {
    inner: String,
}

impl RelationName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        ensure!(!name.trim().is_empty(), "relation name cannot be empty");
        Ok(Self { inner: name })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for RelationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A sanitized, bounded full-text search query string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    inner: String,
}

impl SearchQuery {
    const MAX_LENGTH: usize = 1024;

    pub fn new(query: impl Into<String>) -> Result<Self> {
        let query = query.into();
        let trimmed = query.trim();
        ensure!(!trimmed.is_empty(), "search query cannot be empty");
        ensure!(
            trimmed.len() <= Self::MAX_LENGTH,
            "search query too long (max {} characters)",
            Self::MAX_LENGTH
        );
        Ok(Self { inner: trimmed.to_string() })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

/// Importance on the 1-10 scale used by event/timeline entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Importance {
    inner: u8,
}

impl Importance {
    pub fn new(value: i64) -> Result<Self> {
        ensure!((1..=10).contains(&value), "importance must be between 1 and 10");
        Ok(Self { inner: value as u8 })
    }

    pub fn get(&self) -> u8 {
        self.inner
    }
}

/// A page-size limit bounded to protect the backend from unbounded scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    inner: usize,
}

impl Limit {
    pub const MAX: usize = 10_000;
    pub const DEFAULT: usize = 50;

    pub fn new(limit: usize) -> Result<Self> {
        ensure!(limit > 0, "limit must be greater than zero");
        ensure!(limit <= Self::MAX, "limit exceeds maximum of {}", Self::MAX);
        Ok(Self { inner: limit })
    }

    pub fn get(&self) -> usize {
        self.inner
    }
}

impl Default for Limit {
    fn default() -> Self {
        Self { inner: Self::DEFAULT }
    }
}

/// Sort fields accepted by `list_entries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Title,
    UpdatedAt,
    CreatedAt,
    EntryType,
}

/// Sort direction accepted alongside a `SortField`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Graph BFS traversal depth, clamped to the 1-3 range §4.9 mandates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GraphDepth {
    inner: u8,
}

impl GraphDepth {
    pub fn clamped(requested: u8) -> Self {
        Self { inner: requested.clamp(1, 3) }
    }

    pub fn get(&self) -> u8 {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_rejects_empty_and_whitespace() {
        assert!(EntryId::new("e1").is_ok());
        assert!(EntryId::new("").is_err());
        assert!(EntryId::new("has space").is_err());
    }

    #[test]
    fn title_trims_and_bounds_length() {
        assert_eq!(Title::new("  Hello  ").unwrap().as_str(), "Hello");
        assert!(Title::new("").is_err());
        assert!(Title::new("   ").is_err());
        assert!(Title::new("x".repeat(2000)).is_err());
    }

    #[test]
    fn tag_is_permissive_beyond_non_empty() {
        assert!(Tag::new("science/physics").is_ok());
        assert!(Tag::new("has space").is_ok());
        assert!(Tag::new("").is_err());
    }

    #[test]
    fn tag_prefix_matching_includes_exact_and_children() {
        let t = Tag::new("science/physics").unwrap();
        assert!(t.matches_prefix("science"));
        assert!(t.matches_prefix("science/physics"));
        assert!(!t.matches_prefix("science/chem"));
    }

    #[test]
    fn importance_bounds_to_one_through_ten() {
        assert!(Importance::new(1).is_ok());
        assert!(Importance::new(10).is_ok());
        assert!(Importance::new(0).is_err());
        assert!(Importance::new(11).is_err());
    }

    #[test]
    fn graph_depth_clamps_to_one_through_three() {
        assert_eq!(GraphDepth::clamped(0).get(), 1);
        assert_eq!(GraphDepth::clamped(2).get(), 2);
        assert_eq!(GraphDepth::clamped(9).get(), 3);
    }
}
