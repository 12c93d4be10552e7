//! In-memory vector index over unit-norm embeddings.
//!
//! Two backends behind one enum: an exact flat scan and an approximate HNSW
//! graph. Both honour the same contract: cosine scores descending, ties
//! broken by lexicographic chunk id. The canonical vectors live in the
//! store's embeddings table; everything here is a rebuildable cache that can
//! be persisted to a sidecar directory.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;

use context_model::ChunkId;
use hnsw_rs::prelude::*;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    Dimension { expected: usize, got: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt index sidecar: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    Flat,
    Hnsw,
}

pub enum VectorIndex {
    Flat(FlatIndex),
    Hnsw(HnswBackend),
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorIndex::Flat(_) => f.debug_tuple("Flat").finish(),
            VectorIndex::Hnsw(_) => f.debug_tuple("Hnsw").finish(),
        }
    }
}

impl VectorIndex {
    pub fn new(backend: VectorBackend, dim: usize) -> Self {
        match backend {
            VectorBackend::Flat => VectorIndex::Flat(FlatIndex::new(dim)),
            VectorBackend::Hnsw => VectorIndex::Hnsw(HnswBackend::new(dim)),
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            VectorIndex::Flat(ix) => ix.dim,
            VectorIndex::Hnsw(ix) => ix.dim,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            VectorIndex::Flat(ix) => ix.ids.len(),
            VectorIndex::Hnsw(ix) => ix.by_id.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Idempotent: upserting an existing id replaces its vector.
    pub fn upsert(&mut self, ids: &[ChunkId], vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        let dim = self.dim();
        for v in vectors {
            if v.len() != dim {
                return Err(IndexError::Dimension { expected: dim, got: v.len() });
            }
        }
        match self {
            VectorIndex::Flat(ix) => ix.upsert(ids, vectors),
            VectorIndex::Hnsw(ix) => ix.upsert(ids, vectors),
        }
        Ok(())
    }

    pub fn remove(&mut self, ids: &[ChunkId]) {
        match self {
            VectorIndex::Flat(ix) => ix.remove(ids),
            VectorIndex::Hnsw(ix) => ix.remove(ids),
        }
    }

    /// Top-k by cosine (vectors are unit-norm, so cosine equals the inner
    /// product). Descending score; ties break on chunk id.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&HashSet<ChunkId>>,
    ) -> Result<Vec<(ChunkId, f32)>, IndexError> {
        if query.len() != self.dim() {
            return Err(IndexError::Dimension { expected: self.dim(), got: query.len() });
        }
        Ok(match self {
            VectorIndex::Flat(ix) => ix.search(query, k, filter),
            VectorIndex::Hnsw(ix) => ix.search(query, k, filter),
        })
    }

    /// Stored vector for one id, used for MMR similarity.
    pub fn get(&self, id: &ChunkId) -> Option<&[f32]> {
        match self {
            VectorIndex::Flat(ix) => ix.by_id.get(id).map(|&i| ix.vectors[i].as_slice()),
            VectorIndex::Hnsw(ix) => ix.vectors.get(id).map(|v| v.as_slice()),
        }
    }

    fn entries(&self) -> Vec<(&ChunkId, &[f32])> {
        match self {
            VectorIndex::Flat(ix) => {
                ix.ids.iter().zip(ix.vectors.iter().map(|v| v.as_slice())).collect()
            }
            VectorIndex::Hnsw(ix) => {
                ix.vectors.iter().map(|(id, v)| (id, v.as_slice())).collect()
            }
        }
    }

    /// Write the sidecar cache: a small manifest, an id map and the raw
    /// little-endian vectors.
    pub fn save(&self, dir: &Path) -> Result<(), IndexError> {
        fs::create_dir_all(dir)?;
        let mut entries = self.entries();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let manifest = format!(
            "{{\"schema\":{},\"dim\":{},\"count\":{}}}\n",
            context_model::SCHEMA_MAJOR,
            self.dim(),
            entries.len()
        );
        fs::write(dir.join("manifest.json"), manifest)?;

        let mut map = fs::File::create(dir.join("map.tsv"))?;
        let mut blob: Vec<u8> = Vec::with_capacity(entries.len() * self.dim() * 4);
        for (row, (id, vector)) in entries.iter().enumerate() {
            writeln!(map, "{row}\t{id}")?;
            blob.extend_from_slice(bytemuck::cast_slice(vector));
        }
        fs::write(dir.join("vectors.bin"), blob)?;
        Ok(())
    }

    /// Rebuild an index from a sidecar directory written by [`save`].
    pub fn load(dir: &Path, backend: VectorBackend, dim: usize) -> Result<Self, IndexError> {
        let map = fs::read_to_string(dir.join("map.tsv"))?;
        let blob = fs::read(dir.join("vectors.bin"))?;
        if blob.len() % (dim * 4) != 0 {
            return Err(IndexError::Corrupt(format!(
                "vectors.bin length {} is not a multiple of {} bytes",
                blob.len(),
                dim * 4
            )));
        }

        let mut ids = Vec::new();
        for line in map.lines() {
            let Some((_, id)) = line.split_once('\t') else {
                return Err(IndexError::Corrupt(format!("bad map line: {line}")));
            };
            ids.push(ChunkId(id.to_string()));
        }
        if ids.len() != blob.len() / (dim * 4) {
            return Err(IndexError::Corrupt("map.tsv and vectors.bin disagree".into()));
        }

        let mut index = VectorIndex::new(backend, dim);
        let mut vectors = Vec::with_capacity(ids.len());
        for row in 0..ids.len() {
            let bytes = &blob[row * dim * 4..(row + 1) * dim * 4];
            let vector: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            vectors.push(vector);
        }
        index.upsert(&ids, &vectors)?;
        Ok(index)
    }
}

pub struct FlatIndex {
    dim: usize,
    ids: Vec<ChunkId>,
    vectors: Vec<Vec<f32>>,
    by_id: HashMap<ChunkId, usize>,
}

impl FlatIndex {
    fn new(dim: usize) -> Self {
        Self { dim, ids: Vec::new(), vectors: Vec::new(), by_id: HashMap::new() }
    }

    fn upsert(&mut self, ids: &[ChunkId], vectors: &[Vec<f32>]) {
        for (id, vector) in ids.iter().zip(vectors) {
            match self.by_id.get(id) {
                Some(&slot) => self.vectors[slot] = vector.clone(),
                None => {
                    self.by_id.insert(id.clone(), self.ids.len());
                    self.ids.push(id.clone());
                    self.vectors.push(vector.clone());
                }
            }
        }
    }

    fn remove(&mut self, ids: &[ChunkId]) {
        for id in ids {
            if let Some(slot) = self.by_id.remove(id) {
                self.ids.swap_remove(slot);
                self.vectors.swap_remove(slot);
                if slot < self.ids.len() {
                    self.by_id.insert(self.ids[slot].clone(), slot);
                }
            }
        }
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&HashSet<ChunkId>>,
    ) -> Vec<(ChunkId, f32)> {
        let mut scored: Vec<(ChunkId, f32)> = self
            .ids
            .iter()
            .zip(&self.vectors)
            .filter(|(id, _)| filter.map_or(true, |f| f.contains(*id)))
            .map(|(id, v)| (id.clone(), dot(query, v)))
            .collect();
        sort_hits(&mut scored);
        scored.truncate(k);
        scored
    }
}

/// Approximate backend. hnsw_rs has no true delete, so replaced or removed
/// ids become dead slots that search filters out; the full vector map is kept
/// alongside for exact fallback and MMR lookups.
pub struct HnswBackend {
    dim: usize,
    hnsw: Hnsw<'static, f32, DistDot>,
    slots: Vec<ChunkId>,
    live: Vec<bool>,
    by_id: HashMap<ChunkId, usize>,
    vectors: HashMap<ChunkId, Vec<f32>>,
}

impl HnswBackend {
    fn new(dim: usize) -> Self {
        Self {
            dim,
            hnsw: Hnsw::new(16, 10_000, 16, 200, DistDot {}),
            slots: Vec::new(),
            live: Vec::new(),
            by_id: HashMap::new(),
            vectors: HashMap::new(),
        }
    }

    fn upsert(&mut self, ids: &[ChunkId], vectors: &[Vec<f32>]) {
        for (id, vector) in ids.iter().zip(vectors) {
            if let Some(&old) = self.by_id.get(id) {
                self.live[old] = false;
            }
            let slot = self.slots.len();
            self.hnsw.insert((vector, slot));
            self.slots.push(id.clone());
            self.live.push(true);
            self.by_id.insert(id.clone(), slot);
            self.vectors.insert(id.clone(), vector.clone());
        }
    }

    fn remove(&mut self, ids: &[ChunkId]) {
        for id in ids {
            if let Some(slot) = self.by_id.remove(id) {
                self.live[slot] = false;
                self.vectors.remove(id);
            }
        }
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&HashSet<ChunkId>>,
    ) -> Vec<(ChunkId, f32)> {
        // A restrictive filter defeats graph traversal; scan the candidates
        // exactly instead.
        if let Some(filter) = filter {
            let mut scored: Vec<(ChunkId, f32)> = filter
                .iter()
                .filter_map(|id| self.vectors.get(id).map(|v| (id.clone(), dot(query, v))))
                .collect();
            sort_hits(&mut scored);
            scored.truncate(k);
            return scored;
        }

        let dead = self.slots.len() - self.by_id.len();
        let ef = (2 * k + 48).max(k + dead.min(256));
        let neighbours = self.hnsw.search(query, k + dead, ef);
        let mut scored: Vec<(ChunkId, f32)> = neighbours
            .into_iter()
            .filter(|n| *self.live.get(n.d_id).unwrap_or(&false))
            .map(|n| {
                let id = self.slots[n.d_id].clone();
                // DistDot distance is 1 - dot for unit vectors.
                (id, 1.0 - n.distance)
            })
            .collect();
        sort_hits(&mut scored);
        scored.truncate(k);
        scored
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn sort_hits(hits: &mut [(ChunkId, f32)]) {
    hits.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}
