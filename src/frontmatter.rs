// Markdown-with-YAML-frontmatter parsing for the CLI binary. The library
// deliberately has no opinion on this (see `EntryParser` in
// `pyrite::index_manager`); this is the one concrete implementation the
// `pyrite` binary supplies for itself.

use pyrite::{Entry, EntryKind, EntryId, KbName, Source, Tag, Title};
use pyrite::errors::{PyriteError, Result, StorageError};
use pyrite::index_manager::EntryParser;
use std::path::Path;

const RECOGNIZED_KEYS: &[&str] =
    &["id", "type", "title", "date", "importance", "status", "location", "summary", "tags", "sources"];

pub struct FrontmatterParser;

impl FrontmatterParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FrontmatterParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryParser for FrontmatterParser {
    fn parse_file(&self, path: &Path, kb_name: &KbName) -> Result<Entry> {
        let raw = std::fs::read_to_string(path).map_err(|e| PyriteError::StorageError(StorageError::Io(e)))?;
        let (frontmatter, body) = split_frontmatter(&raw);
        let fm: serde_yaml::Value = if frontmatter.trim().is_empty() {
            serde_yaml::Value::Null
        } else {
            serde_yaml::from_str(frontmatter)
                .map_err(|e| PyriteError::InvalidEntry(format!("{}: invalid frontmatter: {e}", path.display())))?
        };

        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("entry");
        let id = yaml_str(&fm, "id").unwrap_or_else(|| slugify(stem));
        let entry_id = EntryId::new(id).map_err(|e| PyriteError::InvalidEntry(e.to_string()))?;

        let entry_type = yaml_str(&fm, "type").map(|s| EntryKind::from_str(&s)).unwrap_or(EntryKind::Note);
        let title_str = yaml_str(&fm, "title").unwrap_or_else(|| stem.to_string());
        let title = Title::new(title_str).map_err(|e| PyriteError::InvalidEntry(e.to_string()))?;

        let mut entry = Entry::new(entry_id, kb_name.clone(), entry_type, title, body.to_string())?;
        entry.file_path = Some(path.to_string_lossy().to_string());

        if let Some(date) = yaml_str(&fm, "date") {
            entry = entry.with_date(&date)?;
        }
        if let Some(importance) = fm.get("importance").and_then(|v| v.as_i64()) {
            entry.importance =
                Some(pyrite::Importance::new(importance).map_err(|e| PyriteError::InvalidEntry(e.to_string()))?);
        }
        entry.status = yaml_str(&fm, "status");
        entry.location = yaml_str(&fm, "location");
        entry.summary = yaml_str(&fm, "summary");

        if let Some(tags) = fm.get("tags").and_then(|v| v.as_sequence()) {
            for tag in tags {
                if let Some(s) = tag.as_str() {
                    entry.tags.push(Tag::new(s).map_err(|e| PyriteError::InvalidEntry(e.to_string()))?);
                }
            }
        }

        if let Some(sources) = fm.get("sources") {
            let sources: Vec<Source> = serde_yaml::from_value(sources.clone())
                .map_err(|e| PyriteError::InvalidEntry(format!("{}: invalid sources: {e}", path.display())))?;
            entry.sources = sources;
        }

        if let Some(mapping) = fm.as_mapping() {
            for (key, value) in mapping {
                let Some(key_str) = key.as_str() else { continue };
                if RECOGNIZED_KEYS.contains(&key_str) {
                    continue;
                }
                if let Ok(json_value) = serde_json::to_value(value) {
                    entry.metadata.insert(key_str.to_string(), json_value);
                }
            }
        }

        Ok(entry)
    }
}

fn yaml_str(fm: &serde_yaml::Value, key: &str) -> Option<String> {
    fm.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Splits `---\n...\n---\n<body>` frontmatter from the rest of the file.
/// Files without a well-formed delimiter are treated as bodies with no
/// frontmatter.
fn split_frontmatter(raw: &str) -> (&str, &str) {
    let trimmed = raw.trim_start_matches('\u{feff}');
    if let Some(rest) = trimmed.strip_prefix("---\n") {
        if let Some(end) = rest.find("\n---") {
            let frontmatter = &rest[..end];
            let after = &rest[end + "\n---".len()..];
            let body = after.strip_prefix('\n').unwrap_or(after);
            return (frontmatter, body.trim_start_matches('\n'));
        }
    }
    ("", trimmed)
}

fn slugify(stem: &str) -> String {
    stem.chars()
        .map(|c| if c.is_whitespace() || c.is_control() { '-' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".md").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_frontmatter_and_body() {
        let file = write_temp(
            "---\nid: e1\ntitle: Hello\ntype: note\ntags:\n  - a\n  - a/b\n---\nBody text.\n",
        );
        let parser = FrontmatterParser::new();
        let kb = KbName::new("k").unwrap();
        let entry = parser.parse_file(file.path(), &kb).unwrap();
        assert_eq!(entry.id.as_str(), "e1");
        assert_eq!(entry.title.as_str(), "Hello");
        assert_eq!(entry.body.trim(), "Body text.");
        assert_eq!(entry.tags.len(), 2);
    }

    #[test]
    fn falls_back_to_file_stem_without_frontmatter() {
        let file = write_temp("Just a body, no frontmatter.\n");
        let parser = FrontmatterParser::new();
        let kb = KbName::new("k").unwrap();
        let entry = parser.parse_file(file.path(), &kb).unwrap();
        assert_eq!(entry.entry_type, EntryKind::Note);
        assert!(entry.body.contains("Just a body"));
    }

    #[test]
    fn unrecognized_keys_land_in_metadata() {
        let file = write_temp("---\nid: e1\ntitle: T\ncustom_field: 42\n---\nBody\n");
        let parser = FrontmatterParser::new();
        let kb = KbName::new("k").unwrap();
        let entry = parser.parse_file(file.path(), &kb).unwrap();
        assert_eq!(entry.metadata.get("custom_field").unwrap(), &serde_json::json!(42));
    }
}
