//! Sequential text blocks emitted by the format readers, and the assembly
//! step that turns them into one normalised text plus byte-exact segments.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Heading,
    Paragraph,
}

/// One reader-level unit: a heading or a paragraph, optionally pinned to a
/// page of the original document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub text: String,
    pub heading_level: Option<u8>,
    pub page: Option<u32>,
}

impl Block {
    pub fn paragraph(text: impl Into<String>) -> Self {
        Self { kind: BlockKind::Paragraph, text: text.into(), heading_level: None, page: None }
    }

    pub fn heading(text: impl Into<String>, level: u8) -> Self {
        Self { kind: BlockKind::Heading, text: text.into(), heading_level: Some(level), page: None }
    }

    pub fn on_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Heading,
    Paragraph,
}

/// A block's span inside the assembled document text. Offsets are byte
/// positions into that text and always fall on char boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub start_char: usize,
    pub end_char: usize,
    /// Nearest enclosing heading, if any. Heading segments carry their own.
    pub section: Option<String>,
    pub heading_level: Option<u8>,
    pub page: Option<u32>,
}

/// Join blocks with blank lines into the document's canonical text and record
/// each block's exact span. The returned segments always satisfy
/// `text[seg.start_char..seg.end_char] == block text`.
pub fn assemble(blocks: &[Block]) -> (String, Vec<Segment>) {
    let mut text = String::new();
    let mut segments: Vec<Segment> = Vec::with_capacity(blocks.len());
    let mut section: Option<String> = None;

    for block in blocks {
        let body = block.text.trim_matches('\n');
        if body.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        let start = text.len();
        text.push_str(body);
        let end = text.len();

        let kind = match block.kind {
            BlockKind::Heading => {
                section = Some(heading_title(body));
                SegmentKind::Heading
            }
            BlockKind::Paragraph => SegmentKind::Paragraph,
        };
        segments.push(Segment {
            kind,
            start_char: start,
            end_char: end,
            section: section.clone(),
            heading_level: block.heading_level,
            page: block.page,
        });
    }

    (text, segments)
}

/// Strip leading `#` markers and surrounding whitespace from a heading line.
pub fn heading_title(line: &str) -> String {
    line.trim_start_matches('#').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_tracks_spans_and_sections() {
        let blocks = vec![
            Block::heading("# Intro", 1),
            Block::paragraph("first paragraph."),
            Block::heading("# Next", 1),
            Block::paragraph("second paragraph."),
        ];
        let (text, segs) = assemble(&blocks);
        assert_eq!(text, "# Intro\n\nfirst paragraph.\n\n# Next\n\nsecond paragraph.");
        assert_eq!(segs.len(), 4);
        for seg in &segs {
            assert!(text.is_char_boundary(seg.start_char) && text.is_char_boundary(seg.end_char));
        }
        assert_eq!(&text[segs[1].start_char..segs[1].end_char], "first paragraph.");
        assert_eq!(segs[1].section.as_deref(), Some("Intro"));
        assert_eq!(segs[3].section.as_deref(), Some("Next"));
    }

    #[test]
    fn empty_blocks_are_dropped() {
        let blocks = vec![Block::paragraph(""), Block::paragraph("only one")];
        let (text, segs) = assemble(&blocks);
        assert_eq!(text, "only one");
        assert_eq!(segs.len(), 1);
    }
}
