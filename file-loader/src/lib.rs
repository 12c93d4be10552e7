//! Format readers and the structural chunker.
//!
//! A loader turns one file into one or more [`LoadedDoc`]s: normalised text
//! (LF endings, no BOM), structural segments with byte-exact spans, and
//! whatever metadata the format carries. The chunker then sizes those
//! segments into retrieval units without ever re-synthesising text.

pub mod blocks;
pub mod chunker;
pub mod reader_docx;
pub mod reader_eml;
pub mod reader_markdown;
pub mod reader_mbox;
#[cfg(feature = "pdf")]
pub mod reader_pdf;
pub mod tokenizer;

use std::collections::BTreeMap;
use std::path::Path;

use crate::blocks::Segment;

/// One extracted document, ready for chunking.
#[derive(Debug, Clone, Default)]
pub struct LoadedDoc {
    /// Canonical text all chunk spans point into.
    pub text: String,
    pub mime: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub created_ts: Option<String>,
    /// Stable id within the source for multi-document containers (mbox).
    pub external_id: Option<String>,
    pub meta: BTreeMap<String, serde_json::Value>,
    pub segments: Vec<Segment>,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("unsupported mime for {path}: {mime}")]
    UnsupportedMime { path: String, mime: String },
    #[error("decode error in {path}: {detail}")]
    Decode { path: String, detail: String },
    #[error("empty document: {path}")]
    Empty { path: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl LoadError {
    /// Stable machine-readable kind, recorded in job stats.
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::UnsupportedMime { .. } => "unsupported_mime",
            LoadError::Decode { .. } => "decode_error",
            LoadError::Empty { .. } => "empty",
            LoadError::Io { .. } => "io",
        }
    }

    pub fn io(path: &str, source: std::io::Error) -> Self {
        LoadError::Io { path: path.to_string(), source }
    }
}

/// Extract every document in the file at `path`, dispatching on extension.
/// Containers (mbox) yield several documents; everything else yields one.
pub fn load_path(path: &str) -> Result<Vec<LoadedDoc>, LoadError> {
    let lower = path.to_lowercase();
    if lower.ends_with(".pdf") {
        #[cfg(feature = "pdf")]
        {
            return reader_pdf::load_pdf(path).map(|d| vec![d]);
        }
        #[cfg(not(feature = "pdf"))]
        {
            return Err(LoadError::UnsupportedMime {
                path: path.to_string(),
                mime: "application/pdf".into(),
            });
        }
    }
    if lower.ends_with(".docx") {
        return reader_docx::load_docx(path).map(|d| vec![d]);
    }
    if lower.ends_with(".eml") {
        return reader_eml::load_eml(path).map(|d| vec![d]);
    }
    if lower.ends_with(".mbox") {
        return reader_mbox::load_mbox(path);
    }
    if is_text_like(path) {
        return reader_markdown::load_markdown(path).map(|d| vec![d]);
    }
    Err(LoadError::UnsupportedMime { path: path.to_string(), mime: guess_mime(path).to_string() })
}

/// MIME guess by extension, used for metadata and error reporting.
pub fn guess_mime(path: &str) -> &'static str {
    let lower = path.to_lowercase();
    if lower.ends_with(".md") || lower.ends_with(".markdown") {
        "text/markdown"
    } else if lower.ends_with(".pdf") {
        "application/pdf"
    } else if lower.ends_with(".docx") {
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
    } else if lower.ends_with(".eml") {
        "message/rfc822"
    } else if lower.ends_with(".mbox") {
        "application/mbox"
    } else if lower.ends_with(".html") || lower.ends_with(".htm") {
        "text/html"
    } else {
        "text/plain"
    }
}

pub(crate) fn is_text_like(path: &str) -> bool {
    let lower = path.to_lowercase();
    let exts = [
        ".txt", ".md", ".markdown", ".csv", ".tsv", ".log", ".json", ".yaml", ".yml", ".ini",
        ".toml", ".cfg", ".conf", ".rst", ".tex", ".srt", ".properties",
    ];
    if exts.iter().any(|e| lower.ends_with(e)) {
        return true;
    }
    // No extension: probe a short prefix for NUL bytes.
    if Path::new(path).extension().is_none() {
        use std::io::Read;
        if let Ok(mut f) = std::fs::File::open(path) {
            let mut buf = [0u8; 2048];
            if let Ok(n) = f.read(&mut buf) {
                return !buf[..n].contains(&0);
            }
        }
    }
    false
}

/// Canonicalise raw text: strip a UTF-8 BOM and fold CRLF/CR to LF.
pub(crate) fn normalise_text(raw: &str) -> String {
    let raw = raw.strip_prefix('\u{FEFF}').unwrap_or(raw);
    raw.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalise_strips_bom_and_folds_line_endings() {
        assert_eq!(normalise_text("\u{FEFF}a\r\nb\rc\n"), "a\nb\nc\n");
    }

    #[test]
    fn unknown_binary_extension_is_unsupported() {
        let err = load_path("photo.jpg").unwrap_err();
        assert_eq!(err.kind(), "unsupported_mime");
    }
}
