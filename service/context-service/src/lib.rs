//! The ingestion-to-retrieval engine: pipeline, hybrid retriever, scheduler,
//! watcher and the HTTP surface over them.

pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod rerank;
pub mod retriever;
pub mod scheduler;
pub mod server;
pub mod watcher;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use context_store::vector_index::IndexError;
use context_store::StoreError;
use embedding_provider::embedder::EmbedderError;
use file_loader::LoadError;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Embed(#[from] EmbedderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid {field}: {detail}")]
    Validation { field: String, detail: String },
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("cancelled")]
    Cancelled,
}

impl ServiceError {
    pub fn validation(field: &str, detail: impl Into<String>) -> Self {
        ServiceError::Validation { field: field.to_string(), detail: detail.into() }
    }
}

/// Cancellation flag plus optional deadline, passed into every long
/// operation.
#[derive(Debug, Clone, Default)]
pub struct OpCtx {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl OpCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)), deadline: Some(deadline) }
    }

    /// Share the cancel flag with another owner (e.g. a scheduler handle).
    pub fn from_flag(cancelled: Arc<AtomicBool>) -> Self {
        Self { cancelled, deadline: None }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Bail out of a long operation when cancelled.
    pub fn check_cancelled(&self) -> Result<(), ServiceError> {
        if self.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_propagates_through_clones() {
        let ctx = OpCtx::new();
        let other = ctx.clone();
        assert!(ctx.check_cancelled().is_ok());
        other.cancel();
        assert!(matches!(ctx.check_cancelled(), Err(ServiceError::Cancelled)));
    }

    #[test]
    fn deadlines_expire() {
        let ctx = OpCtx::with_deadline(Instant::now() - std::time::Duration::from_millis(1));
        assert!(ctx.deadline_expired());
        let ctx = OpCtx::with_deadline(Instant::now() + std::time::Duration::from_secs(60));
        assert!(!ctx.deadline_expired());
    }
}
