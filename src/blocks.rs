// Block Extractor (C2): parses a markdown body into addressable blocks
// with stable IDs. Pure and stateless, the same input always yields the
// same output (§8 property 5).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Heading,
    Paragraph,
    List,
    Code,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub block_id: String,
    pub heading: Option<String>,
    pub content: String,
    pub position: usize,
    pub block_type: BlockType,
}

/// A trailing `^alnum_underscore_dash` marker, either as a standalone
/// trailer line or inline after the block's text.
fn strip_explicit_id(content: &str) -> (String, Option<String>) {
    let trimmed_end = content.trim_end();
    if let Some(caret) = trimmed_end.rfind('^') {
        let candidate = &trimmed_end[caret + 1..];
        if !candidate.is_empty()
            && candidate.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            let preceding = &trimmed_end[..caret];
            // Marker must be its own token: preceded by start-of-content,
            // whitespace, or a newline.
            let is_own_token = preceding.is_empty()
                || preceding.ends_with(char::is_whitespace)
                || preceding.ends_with('\n');
            if is_own_token {
                let stripped = preceding.trim_end().to_string();
                return (stripped, Some(candidate.to_string()));
            }
        }
    }
    (content.to_string(), None)
}

fn make_block_id(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(&digest[..4])
}

fn is_list_marker(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with("- ") || trimmed.starts_with("* ") || trimmed.starts_with("+ ") {
        return true;
    }
    // Ordered: digits followed by '.' and a space.
    if let Some(dot) = trimmed.find('.') {
        let (digits, rest) = trimmed.split_at(dot);
        if !digits.is_empty()
            && digits.chars().all(|c| c.is_ascii_digit())
            && rest.starts_with(". ")
        {
            return true;
        }
    }
    false
}

fn is_heading(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if rest.is_empty() || rest.starts_with(' ') {
        Some((hashes, rest.trim_start()))
    } else {
        None
    }
}

/// A standalone `^id` line immediately following a block attaches to that
/// block's explicit ID instead of starting a new block.
fn is_standalone_marker(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix('^') {
        if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Some(rest);
        }
    }
    None
}

/// Parse a markdown body into an ordered list of addressable blocks.
pub fn extract_blocks(markdown_text: &str) -> Vec<Block> {
    let lines: Vec<&str> = markdown_text.lines().collect();
    let mut blocks = Vec::new();
    let mut current_heading: Option<String> = None;
    let mut position = 0usize;
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i];

        if line.trim().is_empty() {
            i += 1;
            continue;
        }

        // Fenced code block.
        if line.trim_start().starts_with("```") {
            let fence = line.trim_start();
            let fence_marker: String = fence.chars().take_while(|&c| c == '`').collect();
            let mut content_lines = vec![line.to_string()];
            let mut j = i + 1;
            while j < lines.len() {
                content_lines.push(lines[j].to_string());
                let closed = lines[j].trim_start().starts_with(&fence_marker)
                    && lines[j].trim().chars().all(|c| c == '`');
                j += 1;
                if closed {
                    break;
                }
            }
            let content = content_lines.join("\n");
            let next_idx = j;
            let (content, explicit_id, consumed_marker_line) =
                resolve_block_id(&content, &lines, next_idx);
            blocks.push(Block {
                block_id: explicit_id.unwrap_or_else(|| make_block_id(&content)),
                heading: current_heading.clone(),
                content,
                position,
                block_type: BlockType::Code,
            });
            position += 1;
            i = if consumed_marker_line { next_idx + 1 } else { next_idx };
            continue;
        }

        // ATX heading.
        if let Some((_, text)) = is_heading(line) {
            let (text, explicit_id) = strip_explicit_id(text);
            current_heading = Some(text.clone());
            blocks.push(Block {
                block_id: explicit_id.unwrap_or_else(|| make_block_id(&text)),
                heading: current_heading.clone(),
                content: text,
                position,
                block_type: BlockType::Heading,
            });
            position += 1;
            i += 1;
            continue;
        }

        // List item run.
        if is_list_marker(line) {
            let mut content_lines = vec![line.to_string()];
            let mut j = i + 1;
            loop {
                if j >= lines.len() {
                    break;
                }
                let next = lines[j];
                if next.trim().is_empty() {
                    // Blank line: only continue the list if another list
                    // item or indented continuation follows.
                    if j + 1 < lines.len()
                        && (is_list_marker(lines[j + 1]) || lines[j + 1].starts_with(char::is_whitespace))
                    {
                        content_lines.push(String::new());
                        j += 1;
                        continue;
                    }
                    break;
                }
                if is_list_marker(next) || next.starts_with(char::is_whitespace) {
                    content_lines.push(next.to_string());
                    j += 1;
                    continue;
                }
                break;
            }
            while content_lines.last().is_some_and(|l| l.is_empty()) {
                content_lines.pop();
            }
            let content = content_lines.join("\n");
            let (content, explicit_id, consumed_marker_line) = resolve_block_id(&content, &lines, j);
            blocks.push(Block {
                block_id: explicit_id.unwrap_or_else(|| make_block_id(&content)),
                heading: current_heading.clone(),
                content,
                position,
                block_type: BlockType::List,
            });
            position += 1;
            i = if consumed_marker_line { j + 1 } else { j };
            continue;
        }

        // Paragraph: contiguous non-blank, non-special lines.
        let mut content_lines = vec![line.to_string()];
        let mut j = i + 1;
        while j < lines.len()
            && !lines[j].trim().is_empty()
            && !is_list_marker(lines[j])
            && is_heading(lines[j]).is_none()
            && !lines[j].trim_start().starts_with("```")
        {
            content_lines.push(lines[j].to_string());
            j += 1;
        }
        let content = content_lines.join("\n");
        let (content, explicit_id, consumed_marker_line) = resolve_block_id(&content, &lines, j);
        blocks.push(Block {
            block_id: explicit_id.unwrap_or_else(|| make_block_id(&content)),
            heading: current_heading.clone(),
            content,
            position,
            block_type: BlockType::Paragraph,
        });
        position += 1;
        i = if consumed_marker_line { j + 1 } else { j };
    }

    blocks
}

/// Strips a trailing inline marker from `content`, or, if absent, checks
/// whether the very next line is a standalone `^id` marker. Returns
/// `(content, explicit_id, consumed_next_line)`.
fn resolve_block_id(content: &str, lines: &[&str], next_idx: usize) -> (String, Option<String>, bool) {
    let (stripped, inline_id) = strip_explicit_id(content);
    if let Some(id) = inline_id {
        return (stripped, Some(id), false);
    }
    if next_idx < lines.len() {
        if let Some(id) = is_standalone_marker(lines[next_idx]) {
            return (content.to_string(), Some(id.to_string()), true);
        }
    }
    (content.to_string(), None, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn heading_paragraph_and_explicit_id_list() {
        let body = "# H\nPara1\n\n- item ^mark1";
        let blocks = extract_blocks(body);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].block_type, BlockType::Heading);
        assert_eq!(blocks[0].content, "H");
        assert_eq!(blocks[0].position, 0);

        assert_eq!(blocks[1].block_type, BlockType::Paragraph);
        assert_eq!(blocks[1].content, "Para1");
        assert_eq!(blocks[1].heading.as_deref(), Some("H"));
        assert_eq!(blocks[1].position, 1);

        assert_eq!(blocks[2].block_type, BlockType::List);
        assert_eq!(blocks[2].block_id, "mark1");
        assert_eq!(blocks[2].position, 2);
    }

    #[test]
    fn fenced_code_block_is_single_block() {
        let body = "intro\n\n```rust\nfn main() {}\n```\n\nafter";
        let blocks = extract_blocks(body);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].block_type, BlockType::Code);
        assert!(blocks[1].content.contains("fn main()"));
    }

    #[test]
    fn standalone_marker_on_following_line_attaches() {
        let body = "Some paragraph text\n^custom-id\n\nNext paragraph";
        let blocks = extract_blocks(body);
        assert_eq!(blocks[0].block_id, "custom-id");
        assert_eq!(blocks[0].content, "Some paragraph text");
    }

    #[test]
    fn extraction_is_deterministic_and_idempotent() {
        let body = "# Title\n\nSome content here.\n\n- one\n- two\n\nMore text.";
        let first = extract_blocks(body);
        let second = extract_blocks(body);
        assert_eq!(first, second);
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.block_id, b.block_id);
            assert_eq!(a.position, b.position);
        }
    }

    #[test]
    fn positions_are_gap_free_and_monotonic() {
        let body = "# A\npara\n\n- item\n\n# B\nparb";
        let blocks = extract_blocks(body);
        for (idx, block) in blocks.iter().enumerate() {
            assert_eq!(block.position, idx);
        }
    }

    proptest! {
        #[test]
        fn extraction_is_deterministic_for_arbitrary_markdown(body in arbitrary_markdown()) {
            let first = extract_blocks(&body);
            let second = extract_blocks(&body);
            prop_assert_eq!(first.clone(), second);
            for (idx, block) in first.iter().enumerate() {
                prop_assert_eq!(block.position, idx);
            }
        }
    }

    fn arbitrary_markdown() -> impl Strategy<Value = String> {
        let line = prop_oneof![
            "[a-zA-Z0-9 ]{0,40}",
            "#{1,3} [a-zA-Z0-9 ]{1,20}",
            "- [a-zA-Z0-9 ]{1,20}",
            Just("```".to_string()),
            Just(String::new()),
        ];
        prop::collection::vec(line, 0..12).prop_map(|lines| lines.join("\n"))
    }

    #[test]
    fn block_id_without_marker_is_content_hash_prefix() {
        let blocks = extract_blocks("just a paragraph");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_id.len(), 8);
        assert!(blocks[0].block_id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
