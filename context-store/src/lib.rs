//! Durable layer: the SQLite repository (metadata, chunks, embeddings, FTS,
//! query journal) and the in-memory vector index with its sidecar cache.

pub mod sqlite_repo;
pub mod vector_index;

use context_model::ChunkId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid record: {0}")]
    Invalid(String),
}

/// One full-text hit, score already normalised to higher-is-better.
#[derive(Debug, Clone, PartialEq)]
pub struct FtsHit {
    pub chunk_id: ChunkId,
    pub score: f32,
}
