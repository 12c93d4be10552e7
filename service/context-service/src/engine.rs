//! Shared ownership of the store, the vector index and the embedder.
//!
//! The store is opened per call (WAL lets readers run against the last
//! committed snapshot); writes serialise through one mutex. The vector index
//! lives behind a reader-writer lock and is a rebuildable cache of the
//! embeddings table.

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use context_store::sqlite_repo::SqliteRepo;
use context_store::vector_index::{VectorBackend, VectorIndex};
use embedding_provider::config::default_hashed_config;
use embedding_provider::embedder::{Embedder, HashedEmbedder};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::rerank::CrossEncoder;
use crate::ServiceError;

pub struct Engine {
    pub cfg: ServiceConfig,
    pub embedder: Arc<dyn Embedder>,
    pub cross_encoder: CrossEncoder,
    pub index: RwLock<VectorIndex>,
    /// Single-writer principle for store write transactions.
    pub write_lock: Mutex<()>,
}

impl Engine {
    pub fn new(cfg: ServiceConfig) -> Result<Arc<Self>, ServiceError> {
        if let Some(dir) = cfg.db_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let mut hashed = default_hashed_config();
        hashed.dimension = cfg.vectors.dimension;
        let embedder: Arc<dyn Embedder> = Arc::new(HashedEmbedder::new(hashed)?);

        // Make sure the schema exists and reclaim expired soft deletes.
        let mut repo = SqliteRepo::open(&cfg.db_path)?;
        let cutoff = (Utc::now() - Duration::days(cfg.retention_days as i64)).to_rfc3339();
        let reclaimed = repo.gc_soft_deleted(&cutoff)?;
        if !reclaimed.is_empty() {
            info!(chunks = reclaimed.len(), "garbage-collected expired soft deletes");
        }

        let backend = match cfg.vectors.backend.as_str() {
            "hnsw" => VectorBackend::Hnsw,
            _ => VectorBackend::Flat,
        };
        let mut index = load_or_rebuild_index(
            &cfg,
            backend,
            &repo,
            embedder.info().dimension,
            &embedder.info().model_id,
        )?;
        // The sidecar may predate the GC above.
        if !reclaimed.is_empty() {
            index.remove(&reclaimed);
        }
        info!(vectors = index.len(), backend = %cfg.vectors.backend, "vector index ready");

        Ok(Arc::new(Self {
            cfg,
            embedder,
            cross_encoder: CrossEncoder::default(),
            index: RwLock::new(index),
            write_lock: Mutex::new(()),
        }))
    }

    pub fn open_repo(&self) -> Result<SqliteRepo, ServiceError> {
        let repo = SqliteRepo::open(&self.cfg.db_path)?;
        let _ = repo.maybe_rebuild_fts();
        Ok(repo)
    }

    pub fn model_id(&self) -> &str {
        &self.embedder.info().model_id
    }

    /// Persist the index sidecar. Failures are logged, never fatal: the
    /// canonical vectors live in the store.
    pub fn save_index(&self) {
        let dir = self.cfg.sidecar_dir();
        if let Err(e) = self.index.read().save(&dir) {
            warn!(error = %e, dir = %dir.display(), "failed to persist vector index sidecar");
        }
    }
}

/// Load the sidecar cache; on any failure fall back to rebuilding from the
/// embeddings table.
fn load_or_rebuild_index(
    cfg: &ServiceConfig,
    backend: VectorBackend,
    repo: &SqliteRepo,
    dim: usize,
    model: &str,
) -> Result<VectorIndex, ServiceError> {
    let sidecar = cfg.sidecar_dir();
    if sidecar_present(&sidecar) {
        match VectorIndex::load(&sidecar, backend, dim) {
            Ok(index) => return Ok(index),
            Err(e) => {
                warn!(error = %e, "vector index sidecar unusable, rebuilding from store");
            }
        }
    }
    let mut index = VectorIndex::new(backend, dim);
    let stored = repo.all_embeddings(model)?;
    if !stored.is_empty() {
        let (ids, vectors): (Vec<_>, Vec<_>) = stored.into_iter().unzip();
        index.upsert(&ids, &vectors)?;
    }
    Ok(index)
}

fn sidecar_present(dir: &Path) -> bool {
    dir.join("map.tsv").exists() && dir.join("vectors.bin").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> ServiceConfig {
        let mut cfg = ServiceConfig::default();
        cfg.db_path = dir.join("cc.db");
        cfg.watch.enabled = false;
        cfg
    }

    #[test]
    fn engine_boots_with_an_empty_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::new(test_config(dir.path())).expect("engine");
        assert_eq!(engine.index.read().len(), 0);
        assert_eq!(engine.model_id(), embedding_provider::config::HASHED_DEFAULTS.model_id);
        engine.save_index();
        // A second boot loads the sidecar it just wrote.
        let engine2 = Engine::new(test_config(dir.path())).expect("engine again");
        assert_eq!(engine2.index.read().len(), 0);
    }
}
