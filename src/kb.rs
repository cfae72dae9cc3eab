// KB metadata record and in-memory registry. Knowledge bases are
// registered at startup (typically from a workspace config file) and
// looked up by name on every Service call that is scoped to one.

use crate::errors::{PyriteError, Result};
use crate::types::KbName;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kb {
    pub name: KbName,
    pub kb_type: String,
    pub path: String,
    pub repo: Option<String>,
    pub last_indexed: Option<DateTime<Utc>>,
    pub entry_count: u64,
    pub read_only: bool,
}

impl Kb {
    pub fn new(name: KbName, kb_type: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name,
            kb_type: kb_type.into(),
            path: path.into(),
            repo: None,
            last_indexed: None,
            entry_count: 0,
            read_only: false,
        }
    }
}

/// Process-wide registry of known knowledge bases. Cheaply cloneable,
/// every clone shares the same underlying map.
#[derive(Clone, Default)]
pub struct KbRegistry {
    kbs: Arc<DashMap<String, Kb>>,
}

impl KbRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kb: Kb) {
        self.kbs.insert(kb.name.as_str().to_string(), kb);
    }

    pub fn unregister(&self, name: &KbName) -> Result<()> {
        self.kbs
            .remove(name.as_str())
            .map(|_| ())
            .ok_or_else(|| PyriteError::KBNotFound(name.to_string()))
    }

    pub fn get(&self, name: &KbName) -> Result<Kb> {
        self.kbs
            .get(name.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PyriteError::KBNotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<Kb> {
        self.kbs.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Fail fast if `name` is registered read-only; mutating Service
    /// operations call this before touching the backend.
    pub fn check_writable(&self, name: &KbName) -> Result<()> {
        let kb = self.get(name)?;
        if kb.read_only {
            return Err(PyriteError::KBReadOnly(name.to_string()));
        }
        Ok(())
    }

    pub fn touch_indexed(&self, name: &KbName, entry_count: u64) -> Result<()> {
        let mut entry = self
            .kbs
            .get_mut(name.as_str())
            .ok_or_else(|| PyriteError::KBNotFound(name.to_string()))?;
        entry.last_indexed = Some(Utc::now());
        entry.entry_count = entry_count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_get_round_trips() {
        let registry = KbRegistry::new();
        let name = KbName::new("k").unwrap();
        registry.register(Kb::new(name.clone(), "generic", "/tmp/k"));
        assert_eq!(registry.get(&name).unwrap().kb_type, "generic");
    }

    #[test]
    fn unregister_missing_kb_errors() {
        let registry = KbRegistry::new();
        let name = KbName::new("missing").unwrap();
        assert!(registry.unregister(&name).is_err());
    }

    #[test]
    fn read_only_kb_rejects_writes() {
        let registry = KbRegistry::new();
        let name = KbName::new("k").unwrap();
        let mut kb = Kb::new(name.clone(), "generic", "/tmp/k");
        kb.read_only = true;
        registry.register(kb);
        assert!(registry.check_writable(&name).is_err());
    }
}
