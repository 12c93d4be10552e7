//! Pure-Rust PDF reader, behind the `pdf` feature.
//!
//! Extracts text page by page and records a `pages[]` table over the
//! normalised text so chunk spans can be mapped back to page numbers even
//! when in-page offsets are approximate.

#![cfg(feature = "pdf")]

use lopdf::Document;
use serde_json::json;

use crate::blocks::{assemble, Block};
use crate::{normalise_text, LoadError, LoadedDoc};

pub fn load_pdf(path: &str) -> Result<LoadedDoc, LoadError> {
    let doc = Document::load(path).map_err(|e| LoadError::Decode {
        path: path.to_string(),
        detail: format!("pdf parse failed: {e}"),
    })?;

    let mut blocks: Vec<Block> = Vec::new();
    let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
    for page_num in &page_numbers {
        let page_text = match doc.extract_text(&[*page_num]) {
            Ok(t) => normalise_text(&t),
            Err(_) => continue,
        };
        for para in split_page_paragraphs(&page_text) {
            blocks.push(Block::paragraph(para).on_page(*page_num));
        }
    }

    let (text, segments) = assemble(&blocks);
    if text.trim().is_empty() {
        return Err(LoadError::Empty { path: path.to_string() });
    }

    // Page table: contiguous span each page's segments cover.
    let mut pages = Vec::new();
    for page_num in &page_numbers {
        let mut start: Option<usize> = None;
        let mut end: Option<usize> = None;
        for seg in segments.iter().filter(|s| s.page == Some(*page_num)) {
            start = Some(start.map_or(seg.start_char, |v: usize| v.min(seg.start_char)));
            end = Some(end.map_or(seg.end_char, |v: usize| v.max(seg.end_char)));
        }
        if let (Some(s), Some(e)) = (start, end) {
            pages.push(json!({ "index": page_num, "start_char": s, "end_char": e }));
        }
    }
    let mut meta = std::collections::BTreeMap::new();
    meta.insert("pages".to_string(), serde_json::Value::Array(pages));

    Ok(LoadedDoc {
        text,
        mime: "application/pdf".to_string(),
        title: None,
        author: None,
        created_ts: None,
        external_id: None,
        meta,
        segments,
    })
}

/// Page text arrives with erratic line breaks; treat blank lines as paragraph
/// breaks and fold the rest.
fn split_page_paragraphs(page_text: &str) -> Vec<String> {
    crate::reader_eml::split_paragraphs(page_text)
}
