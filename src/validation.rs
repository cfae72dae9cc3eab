// Validation layer: runtime contract enforcement sitting above the
// construction-time checks in `types.rs`. Used where a check depends on
// more than one value (e.g. a pair of entries) and so can't live on a
// single newtype constructor.

use crate::entry::Entry;
use anyhow::{bail, Result};
use std::collections::HashMap;

/// Validation errors with detailed context.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("precondition failed: {condition}")]
    PreconditionFailed { condition: String, context: String },

    #[error("invariant violated: {invariant}")]
    InvariantViolated { invariant: String, state: String },

    #[error("invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },
}

/// Validation context carrying attributes for error messages.
#[derive(Clone)]
pub struct ValidationContext {
    operation: String,
    attributes: HashMap<String, String>,
}

impl ValidationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self { operation: operation.into(), attributes: HashMap::new() }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn validate(self, condition: bool, message: &str) -> Result<()> {
        if !condition {
            let context = format!("operation: {}, attributes: {:?}", self.operation, self.attributes);
            bail!(ValidationError::PreconditionFailed { condition: message.to_string(), context });
        }
        Ok(())
    }
}

/// Entry validation beyond what `entry::Entry::new` enforces at construction.
pub mod entry {
    use super::*;

    /// Validate an entry update against its predecessor: identity must be
    /// stable and `created_at`/`created_by` must be carried forward.
    pub fn validate_for_update(new_entry: &Entry, old_entry: &Entry) -> Result<()> {
        let ctx = ValidationContext::new("entry_update")
            .with_attribute("entry_id", new_entry.id.to_string())
            .with_attribute("kb_name", new_entry.kb_name.to_string());

        ctx.clone().validate(
            new_entry.id == old_entry.id && new_entry.kb_name == old_entry.kb_name,
            "entry identity cannot change during update",
        )?;

        ctx.validate(
            new_entry.updated_at >= old_entry.created_at,
            "updated_at cannot precede created_at",
        )?;

        Ok(())
    }

    /// A malformed `date` string (entries that declare one must be
    /// `YYYY-MM-DD`).
    pub fn validate_date(date: &str) -> Result<chrono::NaiveDate> {
        chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
            ValidationError::InvalidInput {
                field: "date".to_string(),
                reason: format!("'{date}' is not a valid YYYY-MM-DD date"),
            }
            .into()
        })
    }
}

/// Storage-facing sanity checks, used by backends before they persist
/// a batch of derived rows.
pub mod storage {
    use super::*;

    pub fn validate_limit(limit: usize, max: usize) -> Result<()> {
        let ctx = ValidationContext::new("limit").with_attribute("limit", limit.to_string());
        ctx.clone().validate(limit > 0, "limit must be greater than zero")?;
        ctx.validate(limit <= max, &format!("limit exceeds maximum of {max}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Entry, EntryKind};
    use crate::types::{EntryId, KbName, Title};

    fn sample(id: &str) -> Entry {
        Entry::new(
            EntryId::new(id).unwrap(),
            KbName::new("k").unwrap(),
            EntryKind::Note,
            Title::new("Title").unwrap(),
            "body".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn update_validation_rejects_identity_change() {
        let old = sample("e1");
        let mut new = sample("e2");
        new.created_at = old.created_at;
        assert!(entry::validate_for_update(&new, &old).is_err());
    }

    #[test]
    fn update_validation_accepts_same_identity() {
        let old = sample("e1");
        let mut new = sample("e1");
        new.created_at = old.created_at;
        new.updated_at = old.updated_at;
        assert!(entry::validate_for_update(&new, &old).is_ok());
    }

    #[test]
    fn date_validation_rejects_malformed_dates() {
        assert!(entry::validate_date("2024-01-15").is_ok());
        assert!(entry::validate_date("not-a-date").is_err());
        assert!(entry::validate_date("2024-13-40").is_err());
    }
}
