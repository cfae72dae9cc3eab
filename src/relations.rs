// Relation Registry (C3): a process-wide, read-only-after-init mapping
// from relation name to inverse relation name. Symmetric relations map to
// themselves; directed relations form ordered pairs. Lookup of an unknown
// relation falls back to the bidirectional sentinel `related_to`.

use crate::types::RelationName;
use std::collections::HashMap;
use tracing::warn;

/// The sentinel relation used when no inverse is registered for a name.
pub const RELATED_TO: &str = "related_to";

#[derive(Debug, Clone)]
pub struct RelationRegistry {
    inverses: HashMap<String, String>,
}

impl Default for RelationRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl RelationRegistry {
    /// Build a registry with no relations registered but the sentinel
    /// always resolvable.
    pub fn empty() -> Self {
        let mut inverses = HashMap::new();
        inverses.insert(RELATED_TO.to_string(), RELATED_TO.to_string());
        Self { inverses }
    }

    /// Build the registry with the default relation vocabulary: the two
    /// pairs named by the core data model plus the additional pairs this
    /// implementation ships out of the box (see SPEC_FULL clarifications).
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register_pair("parent_of", "child_of");
        registry.register_pair("mentions", "mentioned_by");
        registry.register_pair("references", "referenced_by");
        registry.register_pair("depends_on", "required_by");
        registry
    }

    /// Register a symmetric relation: its own inverse.
    pub fn register_symmetric(&mut self, relation: impl Into<String>) {
        let relation = relation.into();
        self.inverses.insert(relation.clone(), relation);
    }

    /// Register a directed pair: `relation` inverts to `inverse`, and
    /// `inverse` inverts back to `relation`.
    pub fn register_pair(&mut self, relation: impl Into<String>, inverse: impl Into<String>) {
        let relation = relation.into();
        let inverse = inverse.into();
        self.inverses.insert(relation.clone(), inverse.clone());
        self.inverses.insert(inverse, relation);
    }

    /// Resolve the inverse of `relation`. Unregistered names resolve to
    /// `related_to`, logged at `warn`. Registration never fails (§9 open
    /// question resolution: a plugin-owned relation missing an inverse is
    /// not an error the core can reject, since it does not own plugin
    /// loading).
    pub fn inverse(&self, relation: &RelationName) -> RelationName {
        match self.inverses.get(relation.as_str()) {
            Some(inverse) => RelationName::new(inverse.clone()).expect("stored inverse is non-empty"),
            None => {
                warn!(relation = %relation, "no inverse registered, falling back to related_to");
                RelationName::new(RELATED_TO).expect("sentinel is non-empty")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pairs_resolve_both_directions() {
        let registry = RelationRegistry::with_defaults();
        let mentions = RelationName::new("mentions").unwrap();
        let mentioned_by = RelationName::new("mentioned_by").unwrap();
        assert_eq!(registry.inverse(&mentions).as_str(), "mentioned_by");
        assert_eq!(registry.inverse(&mentioned_by).as_str(), "mentions");
    }

    #[test]
    fn sentinel_is_its_own_inverse() {
        let registry = RelationRegistry::empty();
        let related = RelationName::new(RELATED_TO).unwrap();
        assert_eq!(registry.inverse(&related).as_str(), RELATED_TO);
    }

    #[test]
    fn unknown_relation_falls_back_to_sentinel() {
        let registry = RelationRegistry::empty();
        let custom = RelationName::new("custom_plugin_relation").unwrap();
        assert_eq!(registry.inverse(&custom).as_str(), RELATED_TO);
    }

    #[test]
    fn symmetric_registration_maps_to_itself() {
        let mut registry = RelationRegistry::empty();
        registry.register_symmetric("related_version_of");
        let rel = RelationName::new("related_version_of").unwrap();
        assert_eq!(registry.inverse(&rel).as_str(), "related_version_of");
    }
}
