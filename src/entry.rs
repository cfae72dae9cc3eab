// Entry model (C1): the canonical in-memory record every backend persists
// and every query service returns. An entry answers two questions for its
// type tag ("what am I" and "what do I project to the index schema");
// everything else lives in `metadata` verbatim.

use crate::errors::{PyriteError, Result};
use crate::types::{EntryId, Importance, KbName, RelationName, Tag, Title};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The polymorphic type tag of an entry. Core types are promoted to a
/// named variant so the backend can project their shared fields (date,
/// importance, status, location) to typed columns; anything else falls
/// back to `Generic`, keeping its type name and the rest of its fields in
/// `metadata`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Note,
    Person,
    Organization,
    Event,
    Document,
    Topic,
    Relationship,
    Timeline,
    Collection,
    Generic { entry_type: String },
}

impl Serialize for EntryKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntryKind {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(EntryKind::from_str(&s))
    }
}

impl EntryKind {
    pub fn as_str(&self) -> &str {
        match self {
            EntryKind::Note => "note",
            EntryKind::Person => "person",
            EntryKind::Organization => "organization",
            EntryKind::Event => "event",
            EntryKind::Document => "document",
            EntryKind::Topic => "topic",
            EntryKind::Relationship => "relationship",
            EntryKind::Timeline => "timeline",
            EntryKind::Collection => "collection",
            EntryKind::Generic { entry_type } => entry_type.as_str(),
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "note" => EntryKind::Note,
            "person" => EntryKind::Person,
            "organization" => EntryKind::Organization,
            "event" => EntryKind::Event,
            "document" => EntryKind::Document,
            "topic" => EntryKind::Topic,
            "relationship" => EntryKind::Relationship,
            "timeline" => EntryKind::Timeline,
            "collection" => EntryKind::Collection,
            other => EntryKind::Generic { entry_type: other.to_string() },
        }
    }

    /// Collections live in-place rather than under a dedicated
    /// subdirectory, per the core type table.
    pub fn default_subdirectory(&self) -> Option<&'static str> {
        match self {
            EntryKind::Note => Some("notes"),
            EntryKind::Person => Some("people"),
            EntryKind::Organization => Some("organizations"),
            EntryKind::Event => Some("events"),
            EntryKind::Document => Some("documents"),
            EntryKind::Topic => Some("topics"),
            EntryKind::Relationship => Some("relationships"),
            EntryKind::Timeline => Some("timelines"),
            EntryKind::Collection => None,
            EntryKind::Generic { .. } => None,
        }
    }
}

/// Bibliographic provenance for an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Source {
    pub title: Option<String>,
    pub url: Option<String>,
    pub outlet: Option<String>,
    pub date: Option<String>,
    pub verified: bool,
}

/// A typed directed edge between two entries. `inverse_relation` is never
/// supplied by the caller, it is always derived from the Relation
/// Registry so that backlink lookups never need to recompute it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub source_id: EntryId,
    pub source_kb: KbName,
    pub target_id: EntryId,
    pub target_kb: KbName,
    pub relation: RelationName,
    pub inverse_relation: RelationName,
    pub note: Option<String>,
}

/// A structured object reference from a typed frontmatter field, distinct
/// from a body-level `Link`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRef {
    pub source_id: EntryId,
    pub source_kb: KbName,
    pub target_id: EntryId,
    pub target_kb: KbName,
    pub field_name: String,
    pub target_type: String,
}

/// The canonical entry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub kb_name: KbName,
    pub entry_type: EntryKind,
    pub title: Title,
    pub body: String,
    pub summary: Option<String>,
    pub file_path: Option<String>,
    pub date: Option<NaiveDate>,
    pub importance: Option<Importance>,
    pub status: Option<String>,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub modified_by: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub tags: Vec<Tag>,
    pub sources: Vec<Source>,
    pub links: Vec<Link>,
    /// Derived during indexing (C8) from typed frontmatter fields, not
    /// supplied directly by the caller.
    pub entry_refs: Vec<EntryRef>,
    /// Derived during indexing (C8) by the block extractor (C2).
    pub blocks: Vec<crate::blocks::Block>,
}

impl Entry {
    /// Construct a fresh entry. Fails with `InvalidEntry` if `id` or
    /// `title` cannot be validated; event entries additionally require a
    /// well-formed `date` once one is supplied via `with_date`.
    pub fn new(id: EntryId, kb_name: KbName, entry_type: EntryKind, title: Title, body: String) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            id,
            kb_name,
            entry_type,
            title,
            body,
            summary: None,
            file_path: None,
            date: None,
            importance: None,
            status: None,
            location: None,
            created_at: now,
            updated_at: now,
            indexed_at: now,
            created_by: None,
            modified_by: None,
            metadata: HashMap::new(),
            tags: Vec::new(),
            sources: Vec::new(),
            links: Vec::new(),
            entry_refs: Vec::new(),
            blocks: Vec::new(),
        })
    }

    /// Attach a `YYYY-MM-DD` date, validating the format. Event entries
    /// must supply a well-formed date per §4.1; other entry types may
    /// treat an invalid date as optional upstream, but this constructor
    /// always validates what it is given.
    pub fn with_date(mut self, date: &str) -> Result<Self> {
        let parsed = crate::validation::entry::validate_date(date)
            .map_err(|e| PyriteError::InvalidEntry(e.to_string()))?;
        self.date = Some(parsed);
        Ok(self)
    }

    /// Text the backend indexes for full-text search: title, body,
    /// summary, and location (see §4.5). `metadata` is deliberately
    /// excluded (see SPEC_FULL clarifications).
    pub fn searchable_text(&self) -> String {
        let mut parts = vec![self.title.as_str().to_string(), self.body.clone()];
        if let Some(summary) = &self.summary {
            parts.push(summary.clone());
        }
        if let Some(location) = &self.location {
            parts.push(location.clone());
        }
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (EntryId, KbName) {
        (EntryId::new("e1").unwrap(), KbName::new("k").unwrap())
    }

    #[test]
    fn new_entry_has_equal_timestamps() {
        let (id, kb) = ids();
        let e = Entry::new(id, kb, EntryKind::Note, Title::new("T").unwrap(), "body".into()).unwrap();
        assert_eq!(e.created_at, e.updated_at);
        assert_eq!(e.created_at, e.indexed_at);
    }

    #[test]
    fn with_date_rejects_malformed_dates() {
        let (id, kb) = ids();
        let e = Entry::new(id, kb, EntryKind::Event, Title::new("T").unwrap(), "body".into()).unwrap();
        assert!(e.clone().with_date("2024-06-01").is_ok());
        assert!(e.with_date("not-a-date").is_err());
    }

    #[test]
    fn entry_kind_round_trips_through_as_str() {
        for (s, kind) in [
            ("note", EntryKind::Note),
            ("person", EntryKind::Person),
            ("collection", EntryKind::Collection),
        ] {
            assert_eq!(kind.as_str(), s);
            assert_eq!(EntryKind::from_str(s), kind);
        }
        assert_eq!(EntryKind::from_str("widget").as_str(), "widget");
    }

    #[test]
    fn searchable_text_excludes_metadata() {
        let (id, kb) = ids();
        let mut e = Entry::new(id, kb, EntryKind::Note, Title::new("T").unwrap(), "body".into()).unwrap();
        e.metadata.insert("secret".into(), Value::String("hidden".into()));
        assert!(!e.searchable_text().contains("hidden"));
    }
}
