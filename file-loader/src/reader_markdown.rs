//! Markdown and plain-text reader.
//!
//! Splits on headings and blank lines, keeps single newlines inside a
//! paragraph, and lifts YAML front matter into document metadata.

use std::fs;

use serde_json::Value as JsonValue;

use crate::blocks::{assemble, heading_title, Block};
use crate::{guess_mime, normalise_text, LoadError, LoadedDoc};

pub fn load_markdown(path: &str) -> Result<LoadedDoc, LoadError> {
    let bytes = fs::read(path).map_err(|e| LoadError::io(path, e))?;
    let raw = String::from_utf8_lossy(&bytes);
    let text = normalise_text(&raw);

    let (front, body) = split_frontmatter(&text);
    let mut meta = std::collections::BTreeMap::new();
    let mut title = None;
    if let Some(front) = front {
        if let Ok(yaml) = serde_yaml::from_str::<serde_yaml::Value>(front) {
            if let Some(tags) = frontmatter_tags(&yaml) {
                meta.insert("tags".to_string(), JsonValue::Array(tags));
            }
            if let Some(t) = yaml.get("title").and_then(|v| v.as_str()) {
                title = Some(t.to_string());
            }
        }
    }

    let blocks = parse_blocks(body);
    if title.is_none() {
        title = blocks
            .iter()
            .find(|b| b.heading_level.is_some())
            .map(|b| heading_title(&b.text));
    }
    let (text, segments) = assemble(&blocks);
    if text.trim().is_empty() {
        return Err(LoadError::Empty { path: path.to_string() });
    }

    Ok(LoadedDoc {
        text,
        mime: guess_mime(path).to_string(),
        title,
        author: None,
        created_ts: None,
        external_id: None,
        meta,
        segments,
    })
}

/// Returns `(front_matter, rest)` when the text opens with a `--- … ---`
/// block, else `(None, text)`.
fn split_frontmatter(text: &str) -> (Option<&str>, &str) {
    let Some(rest) = text.strip_prefix("---\n") else {
        return (None, text);
    };
    // Closing delimiter on its own line.
    let mut search_from = 0usize;
    while let Some(pos) = rest[search_from..].find("\n---") {
        let at = search_from + pos;
        let after = &rest[at + 4..];
        if after.is_empty() || after.starts_with('\n') {
            let front = &rest[..at];
            let body = after.strip_prefix('\n').unwrap_or(after);
            return (Some(front), body);
        }
        search_from = at + 4;
    }
    (None, text)
}

/// Accept `tags: a` as well as `tags: [a, b]`.
fn frontmatter_tags(yaml: &serde_yaml::Value) -> Option<Vec<JsonValue>> {
    match yaml.get("tags")? {
        serde_yaml::Value::String(s) => Some(vec![JsonValue::String(s.clone())]),
        serde_yaml::Value::Sequence(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| JsonValue::String(s.to_string())))
                .collect(),
        ),
        _ => None,
    }
}

fn parse_blocks(body: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut para: Vec<&str> = Vec::new();
    for line in body.lines() {
        if let Some(level) = heading_level(line) {
            if !para.is_empty() {
                blocks.push(Block::paragraph(para.join("\n")));
                para.clear();
            }
            blocks.push(Block::heading(line.trim_end(), level));
        } else if line.trim().is_empty() {
            if !para.is_empty() {
                blocks.push(Block::paragraph(para.join("\n")));
                para.clear();
            }
        } else {
            para.push(line);
        }
    }
    if !para.is_empty() {
        blocks.push(Block::paragraph(para.join("\n")));
    }
    blocks
}

fn heading_level(line: &str) -> Option<u8> {
    let hashes = line.bytes().take_while(|&b| b == b'#').count();
    if (1..=6).contains(&hashes) && line.as_bytes().get(hashes) == Some(&b' ') {
        Some(hashes as u8)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).expect("create");
        f.write_all(contents.as_bytes()).expect("write");
        (dir, path.to_string_lossy().to_string())
    }

    #[test]
    fn two_sections_produce_heading_and_paragraph_segments() {
        let (_dir, path) = write_temp("note.md", "# A\n\nparagraph one.\n\n# B\n\nparagraph two.");
        let doc = load_markdown(&path).expect("load");
        assert_eq!(doc.text, "# A\n\nparagraph one.\n\n# B\n\nparagraph two.");
        assert_eq!(doc.segments.len(), 4);
        assert_eq!(doc.title.as_deref(), Some("A"));
        for seg in &doc.segments {
            assert!(seg.end_char <= doc.text.len());
        }
    }

    #[test]
    fn frontmatter_tags_land_in_meta_and_leave_the_text() {
        let (_dir, path) =
            write_temp("tagged.md", "---\ntitle: Notes\ntags: [work, ideas]\n---\n\nBody text.");
        let doc = load_markdown(&path).expect("load");
        assert_eq!(doc.title.as_deref(), Some("Notes"));
        assert!(!doc.text.contains("tags"));
        let tags = doc.meta.get("tags").and_then(|v| v.as_array()).expect("tags");
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn crlf_input_is_normalised_to_lf() {
        let (_dir, path) = write_temp("dos.txt", "line one\r\n\r\nline two\r\n");
        let doc = load_markdown(&path).expect("load");
        assert_eq!(doc.text, "line one\n\nline two");
        assert_eq!(doc.segments.len(), 2);
    }

    #[test]
    fn empty_file_reports_empty() {
        let (_dir, path) = write_temp("empty.md", "\n\n");
        let err = load_markdown(&path).unwrap_err();
        assert_eq!(err.kind(), "empty");
    }
}
