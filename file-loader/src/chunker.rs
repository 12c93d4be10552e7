//! Splits a document's normalised text into retrieval-sized chunks.
//!
//! The chunker only ever merges adjacent segments or splits a single oversized
//! one, so every emitted span slices the document text byte-exactly.

use crate::blocks::{Segment, SegmentKind};
use crate::tokenizer::Tokeniser;

#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub target_tokens: usize,
    pub max_tokens: usize,
    pub min_tokens: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self { target_tokens: 512, max_tokens: 768, min_tokens: 120 }
    }
}

/// A chunk before it gets an id: the exact span plus structural hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftChunk {
    pub start_char: usize,
    pub end_char: usize,
    pub token_count: usize,
    pub section: Option<String>,
    pub page_from: Option<u32>,
    pub page_to: Option<u32>,
}

#[derive(Debug, Clone)]
struct Unit {
    start: usize,
    end: usize,
    section: Option<String>,
    page: Option<u32>,
    starts_section: bool,
}

/// Chunk `text` along its segments. Top-level headings always start a new
/// chunk; within a section, segments accumulate greedily until the target is
/// reached, never exceeding `max_tokens`. The trailing remainder is always
/// flushed, even when short.
pub fn chunk_segments(
    text: &str,
    segments: &[Segment],
    tokeniser: Tokeniser,
    params: &ChunkParams,
) -> Vec<DraftChunk> {
    let units = build_units(text, segments, tokeniser, params);
    let mut out: Vec<DraftChunk> = Vec::new();
    let mut current: Vec<Unit> = Vec::new();

    for unit in units {
        if unit.starts_section && !current.is_empty() {
            flush(text, tokeniser, &mut current, &mut out);
        }
        if current.is_empty() {
            current.push(unit);
            continue;
        }
        let start = current[0].start;
        let grown = tokeniser.count(&text[start..unit.end]);
        if grown <= params.max_tokens {
            current.push(unit);
            if grown >= params.target_tokens {
                flush(text, tokeniser, &mut current, &mut out);
            }
        } else {
            // Does not fit: close the running chunk and start over. The
            // min_tokens floor only delays flushing while growth is possible.
            flush(text, tokeniser, &mut current, &mut out);
            current.push(unit);
        }
    }
    flush(text, tokeniser, &mut current, &mut out);
    out
}

fn flush(text: &str, tokeniser: Tokeniser, current: &mut Vec<Unit>, out: &mut Vec<DraftChunk>) {
    if current.is_empty() {
        return;
    }
    let start = current[0].start;
    let end = current.last().map(|u| u.end).unwrap_or(start);
    let section = current[0].section.clone();
    let page_from = current.iter().filter_map(|u| u.page).min();
    let page_to = current.iter().filter_map(|u| u.page).max();
    out.push(DraftChunk {
        start_char: start,
        end_char: end,
        token_count: tokeniser.count(&text[start..end]),
        section,
        page_from,
        page_to,
    });
    current.clear();
}

/// Turn segments into accumulation units, pre-splitting any single segment
/// that alone exceeds the token cap.
fn build_units(
    text: &str,
    segments: &[Segment],
    tokeniser: Tokeniser,
    params: &ChunkParams,
) -> Vec<Unit> {
    let mut units = Vec::with_capacity(segments.len());
    for seg in segments {
        let starts_section = seg.kind == SegmentKind::Heading && seg.heading_level == Some(1);
        let body = &text[seg.start_char..seg.end_char];
        if tokeniser.count(body) <= params.max_tokens {
            units.push(Unit {
                start: seg.start_char,
                end: seg.end_char,
                section: seg.section.clone(),
                page: seg.page,
                starts_section,
            });
            continue;
        }
        let mut first = true;
        for (start, end) in split_oversized(body, tokeniser, params.max_tokens) {
            units.push(Unit {
                start: seg.start_char + start,
                end: seg.start_char + end,
                section: seg.section.clone(),
                page: seg.page,
                starts_section: starts_section && first,
            });
            first = false;
        }
    }
    units
}

/// Split one oversized span at sentence ends, falling back to whitespace, so
/// that every piece stays within `max_tokens`. Offsets are relative to `body`.
fn split_oversized(body: &str, tokeniser: Tokeniser, max_tokens: usize) -> Vec<(usize, usize)> {
    let boundaries = sentence_boundaries(body);
    let mut pieces = Vec::new();
    let mut start = 0usize;
    let mut prev = 0usize;

    for &b in &boundaries {
        if tokeniser.count(&body[start..b]) > max_tokens {
            if prev > start {
                pieces.push((start, prev));
                start = prev;
            }
            // A single sentence over the cap gets whitespace-split.
            if tokeniser.count(&body[start..b]) > max_tokens {
                split_by_whitespace(body, start, b, tokeniser, max_tokens, &mut pieces);
                start = b;
            }
        }
        prev = b;
    }
    if start < body.len() {
        if tokeniser.count(&body[start..]) > max_tokens {
            split_by_whitespace(body, start, body.len(), tokeniser, max_tokens, &mut pieces);
        } else {
            pieces.push((start, body.len()));
        }
    }
    pieces.retain(|(s, e)| e > s);
    pieces
}

fn split_by_whitespace(
    body: &str,
    lo: usize,
    hi: usize,
    tokeniser: Tokeniser,
    max_tokens: usize,
    pieces: &mut Vec<(usize, usize)>,
) {
    let mut start = lo;
    let mut prev = lo;
    for (idx, ch) in body[lo..hi].char_indices() {
        let pos = lo + idx + ch.len_utf8();
        if !ch.is_whitespace() {
            continue;
        }
        if tokeniser.count(&body[start..pos]) > max_tokens && prev > start {
            pieces.push((start, prev));
            start = prev;
        }
        prev = pos;
    }
    // Whatever remains fits or is a single unbreakable run; emit it whole
    // rather than cutting mid-word.
    if start < hi {
        pieces.push((start, hi));
    }
}

fn sentence_boundaries(body: &str) -> Vec<usize> {
    let mut out = Vec::new();
    for (idx, ch) in body.char_indices() {
        if matches!(ch, '.' | '!' | '?' | '。' | '！' | '？') {
            out.push(idx + ch.len_utf8());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{assemble, Block};

    fn params() -> ChunkParams {
        ChunkParams::default()
    }

    #[test]
    fn headings_start_new_chunks() {
        let blocks = vec![
            Block::heading("# A", 1),
            Block::paragraph("paragraph one."),
            Block::heading("# B", 1),
            Block::paragraph("paragraph two."),
        ];
        let (text, segs) = assemble(&blocks);
        let chunks = chunk_segments(&text, &segs, Tokeniser::Approx, &params());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].section.as_deref(), Some("A"));
        assert_eq!(chunks[1].section.as_deref(), Some("B"));
        assert_eq!(&text[chunks[0].start_char..chunks[0].end_char], "# A\n\nparagraph one.");
        assert_eq!(&text[chunks[1].start_char..chunks[1].end_char], "# B\n\nparagraph two.");
    }

    #[test]
    fn spans_cover_all_paragraph_text() {
        let blocks: Vec<Block> =
            (0..40).map(|i| Block::paragraph(format!("sentence number {i} with several words."))).collect();
        let (text, segs) = assemble(&blocks);
        let chunks = chunk_segments(&text, &segs, Tokeniser::Approx, &params());
        assert!(!chunks.is_empty());
        // Every paragraph byte is inside some chunk span.
        for seg in &segs {
            assert!(
                chunks.iter().any(|c| c.start_char <= seg.start_char && seg.end_char <= c.end_char),
                "segment {:?} not covered",
                seg
            );
        }
        // Chunks are ordered and non-overlapping.
        for pair in chunks.windows(2) {
            assert!(pair[0].end_char <= pair[1].start_char);
        }
    }

    #[test]
    fn oversized_paragraph_is_split_under_the_cap() {
        let long = "word ".repeat(1200);
        let blocks = vec![Block::paragraph(long.trim_end().to_string())];
        let (text, segs) = assemble(&blocks);
        let p = params();
        let chunks = chunk_segments(&text, &segs, Tokeniser::Approx, &p);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.token_count <= p.max_tokens, "chunk of {} tokens over cap", c.token_count);
            assert_eq!(
                Tokeniser::Approx.count(&text[c.start_char..c.end_char]),
                c.token_count
            );
        }
        // No text is dropped.
        assert_eq!(chunks.first().unwrap().start_char, 0);
        assert_eq!(chunks.last().unwrap().end_char, text.len());
    }

    #[test]
    fn short_remainder_is_never_dropped() {
        let blocks = vec![Block::paragraph("tiny.")];
        let (text, segs) = assemble(&blocks);
        let chunks = chunk_segments(&text, &segs, Tokeniser::Approx, &params());
        assert_eq!(chunks.len(), 1);
        assert_eq!(&text[chunks[0].start_char..chunks[0].end_char], "tiny.");
    }

    #[test]
    fn pages_propagate_to_chunk_bounds() {
        let blocks = vec![
            Block::paragraph("page one text.").on_page(1),
            Block::paragraph("page two text.").on_page(2),
        ];
        let (text, segs) = assemble(&blocks);
        let chunks = chunk_segments(&text, &segs, Tokeniser::Approx, &params());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page_from, Some(1));
        assert_eq!(chunks[0].page_to, Some(2));
    }
}
