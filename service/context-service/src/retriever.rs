//! Hybrid retrieval: dense ANN + sparse FTS, reciprocal rank fusion,
//! optional cross-encoder rerank, MMR diversification, provenance assembly
//! and the atomic journal write.

use std::collections::{HashMap, HashSet};

use context_model::{
    deep_link, ChunkId, Provenance, QueryFilters, QueryId, RankedResult,
};
use context_store::sqlite_repo::ProvenanceRow;
use tracing::debug;

use crate::engine::Engine;
use crate::{OpCtx, ServiceError};

/// Dense and sparse candidate depths before fusion.
const K_DENSE: usize = 100;
const K_SPARSE: usize = 100;
/// Reciprocal rank fusion constant.
const RRF_K: f32 = 60.0;
/// Candidates handed to the cross-encoder.
const RERANK_TOP_M: usize = 50;
/// Soft-deleted chunks stay retrievable at half weight.
const SOFT_DELETE_WEIGHT: f32 = 0.5;
/// Snippet window, in chars.
const SNIPPET_MAX_CHARS: usize = 240;

#[derive(Debug, Clone)]
pub struct RetrieveParams {
    pub k: usize,
    pub hybrid: bool,
    pub rerank: bool,
    pub mmr_lambda: f32,
    pub return_text: bool,
    pub filters: QueryFilters,
}

impl Default for RetrieveParams {
    fn default() -> Self {
        Self {
            k: 8,
            hybrid: true,
            rerank: true,
            mmr_lambda: 0.5,
            return_text: true,
            filters: QueryFilters::default(),
        }
    }
}

#[derive(Debug)]
pub struct RetrieveOutcome {
    pub query_id: QueryId,
    pub results: Vec<RankedResult>,
}

#[derive(Debug, Clone)]
struct Candidate {
    id: ChunkId,
    score: f32,
    dense: Option<f32>,
    sparse: Option<f32>,
}

pub fn retrieve(
    engine: &Engine,
    query: &str,
    params: &RetrieveParams,
    ctx: &OpCtx,
) -> Result<RetrieveOutcome, ServiceError> {
    if query.trim().is_empty() {
        return Err(ServiceError::validation("query", "query must be non-empty"));
    }
    if params.k == 0 || params.k > 50 {
        return Err(ServiceError::validation("k", "k must be within 1..50"));
    }
    if !(0.0..=1.0).contains(&params.mmr_lambda) {
        return Err(ServiceError::validation("mmr_lambda", "mmr_lambda must be within 0..1"));
    }

    let mut repo = engine.open_repo()?;
    ctx.check_cancelled()?;

    // Metadata pre-filter shared by both retrieval arms.
    let candidate_filter: Option<HashSet<ChunkId>> = if params.filters.is_empty() {
        None
    } else {
        Some(repo.candidate_chunk_ids(&params.filters)?.into_iter().collect())
    };

    let query_vec = engine.embedder.encode_queries(&[query])?.remove(0);
    let dense_hits =
        engine.index.read().search(&query_vec, K_DENSE, candidate_filter.as_ref())?;
    let sparse_hits = if params.hybrid {
        repo.search_fts(query, K_SPARSE, &params.filters)?
    } else {
        Vec::new()
    };
    ctx.check_cancelled()?;

    let mut candidates = fuse(&dense_hits, &sparse_hits);
    debug!(dense = dense_hits.len(), sparse = sparse_hits.len(), fused = candidates.len(), "fusion done");

    // Past the deadline before rerank/MMR started: return what completed.
    if ctx.deadline_expired() {
        apply_soft_delete_weight(&repo, &mut candidates)?;
        candidates.truncate(params.k);
        let results = assemble(&repo, query, &candidates, params.return_text)?;
        let query_id = journal(engine, &mut repo, query, params, &results)?;
        return Ok(RetrieveOutcome { query_id, results });
    }

    if params.rerank && !candidates.is_empty() {
        candidates = rerank(engine, &repo, query, candidates)?;
        if ctx.deadline_expired() {
            return Err(ServiceError::DeadlineExceeded);
        }
    }

    apply_soft_delete_weight(&repo, &mut candidates)?;

    let selected = mmr_select(engine, &query_vec, candidates, params.k, params.mmr_lambda);
    if ctx.deadline_expired() {
        return Err(ServiceError::DeadlineExceeded);
    }

    let results = assemble(&repo, query, &selected, params.return_text)?;
    let query_id = journal(engine, &mut repo, query, params, &results)?;
    Ok(RetrieveOutcome { query_id, results })
}

/// Reciprocal rank fusion over the two ranked lists: `score(c) = Σ 1/(k+rank)`
/// with 1-based ranks. Ties break on higher dense score, then chunk id.
fn fuse(
    dense: &[(ChunkId, f32)],
    sparse: &[context_store::FtsHit],
) -> Vec<Candidate> {
    let mut merged: HashMap<ChunkId, Candidate> = HashMap::new();
    for (rank0, (id, score)) in dense.iter().enumerate() {
        let entry = merged.entry(id.clone()).or_insert_with(|| Candidate {
            id: id.clone(),
            score: 0.0,
            dense: None,
            sparse: None,
        });
        entry.score += 1.0 / (RRF_K + (rank0 + 1) as f32);
        entry.dense = Some(*score);
    }
    for (rank0, hit) in sparse.iter().enumerate() {
        let entry = merged.entry(hit.chunk_id.clone()).or_insert_with(|| Candidate {
            id: hit.chunk_id.clone(),
            score: 0.0,
            dense: None,
            sparse: None,
        });
        entry.score += 1.0 / (RRF_K + (rank0 + 1) as f32);
        entry.sparse = Some(hit.score);
    }
    let mut out: Vec<Candidate> = merged.into_values().collect();
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let da = a.dense.unwrap_or(f32::NEG_INFINITY);
                let db = b.dense.unwrap_or(f32::NEG_INFINITY);
                db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    out
}

/// Cross-encoder pass over the fusion head. The rerank score replaces the
/// fusion score for scored items; the tail keeps fusion order after them.
fn rerank(
    engine: &Engine,
    repo: &context_store::sqlite_repo::SqliteRepo,
    query: &str,
    candidates: Vec<Candidate>,
) -> Result<Vec<Candidate>, ServiceError> {
    let cut = RERANK_TOP_M.min(candidates.len());
    let (head, tail) = candidates.split_at(cut);

    let ids: Vec<ChunkId> = head.iter().map(|c| c.id.clone()).collect();
    let chunks = repo.get_chunks_by_ids(&ids)?;
    let text_by_id: HashMap<&ChunkId, &str> =
        chunks.iter().map(|c| (&c.id, c.text.as_str())).collect();

    let mut scored: Vec<Candidate> = head
        .iter()
        .map(|c| {
            let score = text_by_id
                .get(&c.id)
                .map(|text| engine.cross_encoder.score(query, text))
                .unwrap_or(0.0);
            Candidate { score, ..c.clone() }
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    scored.extend(tail.iter().cloned());
    Ok(scored)
}

fn apply_soft_delete_weight(
    repo: &context_store::sqlite_repo::SqliteRepo,
    candidates: &mut [Candidate],
) -> Result<(), ServiceError> {
    let ids: Vec<ChunkId> = candidates.iter().map(|c| c.id.clone()).collect();
    let deleted: HashSet<ChunkId> = repo.soft_deleted_among(&ids)?.into_iter().collect();
    if deleted.is_empty() {
        return Ok(());
    }
    for c in candidates.iter_mut() {
        if deleted.contains(&c.id) {
            c.score *= SOFT_DELETE_WEIGHT;
        }
    }
    Ok(())
}

/// Greedy maximal-marginal-relevance selection: relevance is the candidate's
/// current score, novelty is the max cosine against anything already picked.
/// With lambda = 1 this degenerates to plain score order.
fn mmr_select(
    engine: &Engine,
    _query_vec: &[f32],
    candidates: Vec<Candidate>,
    k: usize,
    lambda: f32,
) -> Vec<Candidate> {
    if candidates.len() <= k || lambda >= 1.0 {
        let mut out = candidates;
        out.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        out.truncate(k);
        return out;
    }

    let index = engine.index.read();
    let vectors: HashMap<ChunkId, Vec<f32>> = candidates
        .iter()
        .filter_map(|c| index.get(&c.id).map(|v| (c.id.clone(), v.to_vec())))
        .collect();
    drop(index);

    let mut pool = candidates;
    let mut selected: Vec<Candidate> = Vec::with_capacity(k);
    while selected.len() < k && !pool.is_empty() {
        let mut best = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for (i, c) in pool.iter().enumerate() {
            let redundancy = selected
                .iter()
                .filter_map(|s| {
                    let a = vectors.get(&c.id)?;
                    let b = vectors.get(&s.id)?;
                    Some(dot(a, b))
                })
                .fold(0.0f32, f32::max);
            let marginal = lambda * c.score - (1.0 - lambda) * redundancy;
            if marginal > best_score {
                best_score = marginal;
                best = i;
            }
        }
        selected.push(pool.remove(best));
    }
    selected
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn assemble(
    repo: &context_store::sqlite_repo::SqliteRepo,
    query: &str,
    selected: &[Candidate],
    return_text: bool,
) -> Result<Vec<RankedResult>, ServiceError> {
    let ids: Vec<ChunkId> = selected.iter().map(|c| c.id.clone()).collect();
    let rows = repo.provenance_rows(&ids)?;
    let by_id: HashMap<&ChunkId, &ProvenanceRow> =
        rows.iter().map(|r| (&r.chunk.id, r)).collect();

    let mut results = Vec::with_capacity(selected.len());
    for c in selected {
        // A chunk can vanish between search and assembly; ranks stay dense.
        let Some(row) = by_id.get(&c.id) else {
            continue;
        };
        let chunk = &row.chunk;
        let path = row.document_path.clone().unwrap_or_else(|| row.source_uri.clone());
        results.push(RankedResult {
            rank: results.len() as u32 + 1,
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            score: c.score,
            dense_score: c.dense,
            sparse_score: c.sparse,
            title: row.document_title.clone(),
            snippet: make_snippet(&chunk.text, query),
            text: return_text.then(|| chunk.text.clone()),
            provenance: Provenance {
                source_label: row.source_label.clone(),
                path,
                page_from: chunk.meta.page_from,
                page_to: chunk.meta.page_to,
                section: chunk.meta.section.clone(),
                modified_ts: row.modified_ts.clone(),
            },
            deep_link: deep_link(&chunk.document_id, &chunk.id),
        });
    }
    Ok(results)
}

fn journal(
    engine: &Engine,
    repo: &mut context_store::sqlite_repo::SqliteRepo,
    query: &str,
    params: &RetrieveParams,
    results: &[RankedResult],
) -> Result<QueryId, ServiceError> {
    let _write = engine.write_lock.lock();
    Ok(repo.record_query_with_results(query, &params.filters, params.rerank, results)?)
}

/// A window of at most `SNIPPET_MAX_CHARS` chars centred on the strongest
/// query-token match, ellipsised at cut edges.
pub fn make_snippet(text: &str, query: &str) -> String {
    if text.chars().count() <= SNIPPET_MAX_CHARS {
        return text.to_string();
    }

    // Longest token first: longer terms carry more signal.
    let mut tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();
    tokens.sort_by_key(|t| std::cmp::Reverse(t.chars().count()));

    let anchor = tokens.iter().find_map(|t| find_ci(text, t)).unwrap_or(0);

    // Centre the window on the anchor, clamped to the text.
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let anchor_char = chars.iter().position(|(b, _)| *b >= anchor).unwrap_or(0);
    let half = SNIPPET_MAX_CHARS / 2;
    let start_char = anchor_char.saturating_sub(half);
    let end_char = (start_char + SNIPPET_MAX_CHARS).min(chars.len());
    let start_char = end_char.saturating_sub(SNIPPET_MAX_CHARS);

    let start_byte = chars[start_char].0;
    let end_byte = if end_char == chars.len() { text.len() } else { chars[end_char].0 };
    let mut snippet = String::new();
    if start_char > 0 {
        snippet.push('…');
    }
    snippet.push_str(text[start_byte..end_byte].trim());
    if end_char < chars.len() {
        snippet.push('…');
    }
    snippet
}

/// Case-insensitive substring search returning a byte offset in `haystack`.
fn find_ci(haystack: &str, needle_lower: &str) -> Option<usize> {
    if needle_lower.is_empty() {
        return None;
    }
    let needle_chars: Vec<char> = needle_lower.chars().collect();
    let hay: Vec<(usize, char)> = haystack.char_indices().collect();
    'outer: for start in 0..hay.len() {
        let mut pos = start;
        for &nc in &needle_chars {
            let Some(&(_, hc)) = hay.get(pos) else {
                continue 'outer;
            };
            let mut lowered = hc.to_lowercase();
            if lowered.next() != Some(nc) || lowered.next().is_some() {
                continue 'outer;
            }
            pos += 1;
        }
        return Some(hay[start].0);
    }
    None
}
