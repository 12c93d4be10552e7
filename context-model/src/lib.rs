//! Shared data model used across the Context Cache crates.
//!
//! Everything here is a plain serde value: records reference each other by id
//! (never by pointer), and metadata lives in ordered maps so serialized forms
//! stay stable across runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Bumped when the persisted record layout changes incompatibly.
pub const SCHEMA_MAJOR: u32 = 1;

/// URI scheme used for deep links resolved by the host application.
pub const DEEP_LINK_SCHEME: &str = "ctxc";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

/// Journal row id. Allocated by the store, strictly monotonic in creation time.
pub type QueryId = i64;

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl ChunkId {
    /// Chunk ids derive from the document id and ordinal, so identical
    /// content yields identical ids across ingest runs.
    pub fn derive(document_id: &DocumentId, ordinal: u32) -> Self {
        ChunkId(format!("{}#{}", document_id.0, ordinal))
    }
}

/// Deep link of the form `ctxc://doc/<document_id>?chunk=<chunk_id>`.
/// Opening it is the host application's responsibility.
pub fn deep_link(document_id: &DocumentId, chunk_id: &ChunkId) -> String {
    format!("{DEEP_LINK_SCHEME}://doc/{}?chunk={}", document_id.0, chunk_id.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Folder,
    Mbox,
    Eml,
    Markdown,
    NotionExport,
    Other,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Folder => "folder",
            SourceKind::Mbox => "mbox",
            SourceKind::Eml => "eml",
            SourceKind::Markdown => "markdown",
            SourceKind::NotionExport => "notion_export",
            SourceKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "folder" => Some(SourceKind::Folder),
            "mbox" => Some(SourceKind::Mbox),
            "eml" => Some(SourceKind::Eml),
            "markdown" => Some(SourceKind::Markdown),
            "notion_export" => Some(SourceKind::NotionExport),
            "other" => Some(SourceKind::Other),
            _ => None,
        }
    }
}

/// A registered place documents come from. Deleting a source cascades to its
/// documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: SourceId,
    pub kind: SourceKind,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_glob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_glob: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// One ingested file or message. `sha256` uniquely identifies the raw bytes;
/// re-ingesting bytes with the same hash is a metadata-only update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub source_id: SourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_ts: Option<String>,
    pub mime: String,
    pub sha256: String,
    /// Normalised text every chunk span points into.
    pub text: String,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
    pub size_bytes: u64,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Structural hints attached to a chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_from: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_to: Option<u32>,
    /// Which token counter produced `token_count`, for reproducibility.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokeniser: Option<String>,
}

/// A contiguous span of a document's normalised text, sized to be embedded
/// and retrieved as a unit.
///
/// Invariants: `start_char < end_char <= document.text.len()`,
/// `text == document.text[start_char..end_char]`, and ordinals form a
/// gap-free `0..N` sequence per document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub ordinal: u32,
    pub start_char: usize,
    pub end_char: usize,
    pub text: String,
    pub token_count: usize,
    #[serde(default)]
    pub meta: ChunkMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStyle {
    Dense,
    Sparse,
    Hybrid,
}

impl EmbeddingStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStyle::Dense => "dense",
            EmbeddingStyle::Sparse => "sparse",
            EmbeddingStyle::Hybrid => "hybrid",
        }
    }
}

/// One stored vector, keyed by `(chunk_id, model)`. `vector` is unit-norm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub chunk_id: ChunkId,
    pub model: String,
    pub dim: usize,
    pub vector: Vec<f32>,
    pub style: EmbeddingStyle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "error" => Some(JobStatus::Error),
            _ => None,
        }
    }
}

/// Counters accumulated while a job runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestStats {
    pub documents_added: u64,
    pub documents_skipped: u64,
    pub chunks: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Status transitions are monotonic: queued -> running -> done | error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestJobRecord {
    pub id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    pub status: JobStatus,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub stats: IngestStats,
}

/// Filters pushed down into both the FTS and the dense candidate set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_ids: Vec<SourceId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mimes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_before: Option<String>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self.source_ids.is_empty()
            && self.mimes.is_empty()
            && self.tags.is_empty()
            && self.modified_after.is_none()
            && self.modified_before.is_none()
    }
}

/// A journalled query. Once written, its result set is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: QueryId,
    pub text: String,
    #[serde(default)]
    pub filters: QueryFilters,
    pub rerank_enabled: bool,
    pub created_at: String,
}

/// Where a result came from: enough to re-open the source at the chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_label: Option<String>,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_from: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_to: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_ts: Option<String>,
}

/// One ranked answer as returned by a query and frozen in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub rank: u32,
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dense_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sparse_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub provenance: Provenance,
    pub deep_link: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_derive_from_document_and_ordinal() {
        let doc = DocumentId("a1b2c3".into());
        assert_eq!(ChunkId::derive(&doc, 0).0, "a1b2c3#0");
        assert_eq!(ChunkId::derive(&doc, 7).0, "a1b2c3#7");
    }

    #[test]
    fn deep_links_use_the_ctxc_scheme() {
        let doc = DocumentId("d".into());
        let chunk = ChunkId::derive(&doc, 2);
        assert_eq!(deep_link(&doc, &chunk), "ctxc://doc/d?chunk=d#2");
    }

    #[test]
    fn source_kind_round_trips_through_strings() {
        for kind in [
            SourceKind::Folder,
            SourceKind::Mbox,
            SourceKind::Eml,
            SourceKind::Markdown,
            SourceKind::NotionExport,
            SourceKind::Other,
        ] {
            assert_eq!(SourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SourceKind::parse("imap"), None);
    }

    #[test]
    fn filters_report_emptiness() {
        let mut f = QueryFilters::default();
        assert!(f.is_empty());
        f.mimes.push("text/markdown".into());
        assert!(!f.is_empty());
    }
}
