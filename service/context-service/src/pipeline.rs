//! The ingest pipeline: load -> normalise -> content gate -> chunk -> embed
//! -> transactional upsert, with per-job stats.
//!
//! Files are processed in path order for reproducible runs. Each document's
//! rewrite (old chunks out, new chunks and embeddings in) happens inside one
//! store transaction, so a reader never observes a half-chunked document and
//! a cancelled job leaves every document either fully previous or fully new.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use context_model::{
    ChunkId, ChunkMeta, ChunkRecord, DocumentId, DocumentRecord, EmbeddingRecord, EmbeddingStyle,
    IngestStats, JobId, JobStatus, SourceId, SourceRecord,
};
use file_loader::chunker::{chunk_segments, ChunkParams, DraftChunk};
use file_loader::tokenizer::Tokeniser;
use file_loader::{load_path, LoadedDoc};
use sha2::Digest;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::{OpCtx, ServiceError};

/// IO failures inside a job retry this many times with doubling backoff.
const IO_RETRY_MAX: usize = 3;
const IO_BACKOFF_START_MS: u64 = 100;
const IO_BACKOFF_CAP_MS: u64 = 800;
/// Transient embedder failures retry per batch before the file fails.
const EMBED_RETRY_MAX: usize = 2;

/// Execute one ingest job end to end, recording status transitions and
/// accumulated stats on the job row.
pub fn run_job(
    engine: &Engine,
    job_id: &JobId,
    work: &[(SourceRecord, Vec<PathBuf>)],
    ctx: &OpCtx,
) -> IngestStats {
    let started = Instant::now();
    let mut stats = IngestStats::default();

    let repo = match engine.open_repo() {
        Ok(r) => r,
        Err(e) => {
            stats.errors.push(format!("open store: {e}"));
            return stats;
        }
    };
    let _ = repo.update_job(job_id, JobStatus::Running, None, &stats);

    let mut cancelled = false;
    'sources: for (source, explicit_paths) in work {
        let mut paths = if explicit_paths.is_empty() {
            collect_source_paths(source)
        } else {
            explicit_paths.clone()
        };
        paths.sort();
        paths.dedup();

        for path in &paths {
            if ctx.is_cancelled() {
                cancelled = true;
                break 'sources;
            }
            match ingest_file(engine, source, path, &mut stats, ctx) {
                Ok(()) => {}
                Err(ServiceError::Cancelled) => {
                    cancelled = true;
                    break 'sources;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "file failed, job continues");
                    stats.errors.push(format!("{}: {e}", path.display()));
                }
            }
        }
    }

    stats.duration_ms = started.elapsed().as_millis() as u64;
    let finished = context_store::sqlite_repo::SqliteRepo::now();
    if cancelled {
        stats.errors.push("cancelled".to_string());
        let _ = repo.update_job(job_id, JobStatus::Error, Some(&finished), &stats);
    } else {
        let _ = repo.update_job(job_id, JobStatus::Done, Some(&finished), &stats);
    }
    info!(
        job = %job_id,
        added = stats.documents_added,
        skipped = stats.documents_skipped,
        chunks = stats.chunks,
        errors = stats.errors.len(),
        "ingest job finished"
    );
    engine.save_index();
    stats
}

/// Soft-delete every live document registered under `path` for this source.
pub fn delete_path(engine: &Engine, source_id: &SourceId, path: &Path) -> Result<(), ServiceError> {
    let _write = engine.write_lock.lock();
    let mut repo = engine.open_repo()?;
    let ids = repo.documents_by_external_id(source_id, &path.to_string_lossy())?;
    if ids.is_empty() {
        return Ok(());
    }
    let affected = repo.mark_documents_deleted(&ids, false)?;
    debug!(path = %path.display(), chunks = affected.len(), "soft-deleted on watcher remove");
    Ok(())
}

fn ingest_file(
    engine: &Engine,
    source: &SourceRecord,
    path: &Path,
    stats: &mut IngestStats,
    ctx: &OpCtx,
) -> Result<(), ServiceError> {
    let path_str = path.to_string_lossy().to_string();
    let bytes = read_with_retry(path)?;
    let sha = hex::encode(sha2::Sha256::digest(&bytes));
    let (fs_mtime, fs_size) = file_stamp(path);

    let mut repo = engine.open_repo()?;

    // File-level content gate: same bytes means a metadata-only update.
    if let Some(existing) = repo.document_by_sha(&sha)? {
        let mut meta = existing.meta.clone();
        stamp_fs_meta(&mut meta, fs_mtime, fs_size);
        let _write = engine.write_lock.lock();
        repo.touch_document(
            &existing.id,
            Some(&path_str),
            fs_mtime_rfc3339(fs_mtime).as_deref(),
            Some(&meta),
        )?;
        stats.documents_skipped += 1;
        debug!(path = %path_str, doc = %existing.id, "unchanged bytes, metadata refresh only");
        return Ok(());
    }

    let docs = load_path(&path_str)?;
    let multi = docs.len() > 1;
    for loaded in docs {
        ctx.check_cancelled()?;
        let doc_sha = if multi {
            message_sha(&sha, &loaded)
        } else {
            sha.clone()
        };
        if multi {
            if let Some(_existing) = repo.document_by_sha(&doc_sha)? {
                stats.documents_skipped += 1;
                continue;
            }
        }
        ingest_loaded(
            engine, &mut repo, source, &path_str, loaded, &doc_sha, bytes.len() as u64, fs_mtime,
            fs_size, stats, ctx,
        )?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn ingest_loaded(
    engine: &Engine,
    repo: &mut context_store::sqlite_repo::SqliteRepo,
    source: &SourceRecord,
    path_str: &str,
    loaded: LoadedDoc,
    sha: &str,
    file_size: u64,
    fs_mtime: Option<i64>,
    fs_size: Option<i64>,
    stats: &mut IngestStats,
    ctx: &OpCtx,
) -> Result<(), ServiceError> {
    let document_id = DocumentId(sha[..16.min(sha.len())].to_string());
    let tokeniser = Tokeniser::default();
    let params = ChunkParams::default();

    let drafts = chunk_segments(&loaded.text, &loaded.segments, tokeniser, &params);
    let drafts = dedup_drafts(&loaded.text, drafts);
    let chunks = materialise_chunks(&document_id, &loaded.text, &drafts, tokeniser);

    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    let vectors = embed_with_retry(engine, &texts)?;
    let embeddings: Vec<EmbeddingRecord> = chunks
        .iter()
        .zip(vectors.iter())
        .map(|(c, v)| EmbeddingRecord {
            chunk_id: c.id.clone(),
            model: engine.model_id().to_string(),
            dim: v.len(),
            vector: v.clone(),
            style: EmbeddingStyle::Dense,
        })
        .collect();

    let now = context_store::sqlite_repo::SqliteRepo::now();
    let mut meta = loaded.meta.clone();
    stamp_fs_meta(&mut meta, fs_mtime, fs_size);
    let external_id = loaded.external_id.clone().unwrap_or_else(|| path_str.to_string());
    let doc = DocumentRecord {
        id: document_id.clone(),
        source_id: source.id.clone(),
        external_id: Some(external_id.clone()),
        title: loaded.title,
        author: loaded.author,
        created_ts: loaded.created_ts,
        modified_ts: fs_mtime_rfc3339(fs_mtime),
        mime: loaded.mime,
        sha256: sha.to_string(),
        text: loaded.text,
        meta,
        size_bytes: file_size,
        is_deleted: false,
        created_at: now.clone(),
        updated_at: now,
    };

    // Cancellation between embed and commit leaves the previous state intact.
    ctx.check_cancelled()?;

    {
        let _write = engine.write_lock.lock();
        repo.replace_document(&doc, &chunks, &embeddings)?;
        let superseded = repo.soft_delete_superseded(&source.id, &external_id, &document_id)?;
        if !superseded.is_empty() {
            debug!(path = path_str, count = superseded.len(), "superseded older revision chunks");
        }
    }
    {
        let ids: Vec<ChunkId> = chunks.iter().map(|c| c.id.clone()).collect();
        engine.index.write().upsert(&ids, &vectors)?;
    }

    stats.documents_added += 1;
    stats.chunks += chunks.len() as u64;
    Ok(())
}

fn materialise_chunks(
    document_id: &DocumentId,
    text: &str,
    drafts: &[DraftChunk],
    tokeniser: Tokeniser,
) -> Vec<ChunkRecord> {
    drafts
        .iter()
        .enumerate()
        .map(|(ordinal, d)| {
            let ordinal = ordinal as u32;
            ChunkRecord {
                id: ChunkId::derive(document_id, ordinal),
                document_id: document_id.clone(),
                ordinal,
                start_char: d.start_char,
                end_char: d.end_char,
                text: text[d.start_char..d.end_char].to_string(),
                token_count: d.token_count,
                meta: ChunkMeta {
                    section: d.section.clone(),
                    page_from: d.page_from,
                    page_to: d.page_to,
                    tokeniser: Some(tokeniser.id().to_string()),
                },
            }
        })
        .collect()
}

/// Chunk-level dedup: identical fingerprint plus identical text within one
/// document collapses to the first occurrence; survivors are renumbered so
/// ordinals stay gap-free.
fn dedup_drafts(text: &str, drafts: Vec<DraftChunk>) -> Vec<DraftChunk> {
    let mut seen: Vec<(u64, usize, usize)> = Vec::new();
    let mut out = Vec::with_capacity(drafts.len());
    for d in drafts {
        let body = &text[d.start_char..d.end_char];
        let fp = simhash64(body);
        let duplicate = seen.iter().any(|&(f, s, e)| f == fp && &text[s..e] == body);
        if duplicate {
            continue;
        }
        seen.push((fp, d.start_char, d.end_char));
        out.push(d);
    }
    out
}

/// 64-bit SimHash over word shingles of the normalised text.
pub fn simhash64(text: &str) -> u64 {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();
    let mut counts = [0i32; 64];
    for window in tokens.windows(2.min(tokens.len().max(1))) {
        let shingle = window.join(" ");
        let h = fnv1a64(shingle.as_bytes());
        for (bit, count) in counts.iter_mut().enumerate() {
            if (h >> bit) & 1 == 1 {
                *count += 1;
            } else {
                *count -= 1;
            }
        }
    }
    let mut hash = 0u64;
    for (bit, count) in counts.iter().enumerate() {
        if *count > 0 {
            hash |= 1 << bit;
        }
    }
    hash
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Expand a folder source into its matching files, honoring the source's
/// include/exclude globs.
pub fn collect_source_paths(source: &SourceRecord) -> Vec<PathBuf> {
    let root = PathBuf::from(&source.uri);
    if root.is_file() {
        return vec![root];
    }
    let include = build_glob(source.include_glob.as_deref());
    let exclude = build_glob(source.exclude_glob.as_deref());

    let mut out = Vec::new();
    let walk = ignore::WalkBuilder::new(&root)
        .hidden(true)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build();
    for entry in walk.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let rel = path.strip_prefix(&root).unwrap_or(path);
        if let Some(inc) = &include {
            if !inc.is_match(rel) {
                continue;
            }
        }
        if let Some(exc) = &exclude {
            if exc.is_match(rel) {
                continue;
            }
        }
        out.push(path.to_path_buf());
    }
    out
}

pub(crate) fn build_glob(pattern: Option<&str>) -> Option<globset::GlobSet> {
    let pattern = pattern?.trim();
    if pattern.is_empty() {
        return None;
    }
    let mut builder = globset::GlobSetBuilder::new();
    for part in pattern.split(',') {
        match globset::Glob::new(part.trim()) {
            Ok(g) => {
                builder.add(g);
            }
            Err(e) => warn!(pattern = part, error = %e, "ignoring bad glob"),
        }
    }
    builder.build().ok()
}

fn read_with_retry(path: &Path) -> Result<Vec<u8>, ServiceError> {
    let mut backoff = IO_BACKOFF_START_MS;
    let mut last_err: Option<std::io::Error> = None;
    for attempt in 0..=IO_RETRY_MAX {
        if attempt > 0 {
            std::thread::sleep(std::time::Duration::from_millis(backoff));
            backoff = (backoff * 2).min(IO_BACKOFF_CAP_MS);
        }
        match std::fs::read(path) {
            Ok(bytes) => return Ok(bytes),
            // Missing files will not appear on retry.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServiceError::Load(file_loader::LoadError::io(
                    &path.to_string_lossy(),
                    e,
                )))
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(ServiceError::Load(file_loader::LoadError::io(
        &path.to_string_lossy(),
        last_err.unwrap_or_else(|| std::io::Error::other("read failed")),
    )))
}

fn embed_with_retry(engine: &Engine, texts: &[&str]) -> Result<Vec<Vec<f32>>, ServiceError> {
    let mut last = None;
    for _ in 0..=EMBED_RETRY_MAX {
        match engine.embedder.encode_passages(texts) {
            Ok(v) => return Ok(v),
            Err(e) => last = Some(e),
        }
    }
    Err(ServiceError::Embed(last.expect("at least one attempt")))
}

/// Message documents inside a container get their own content hash derived
/// from the container hash and the message identity.
fn message_sha(file_sha: &str, loaded: &LoadedDoc) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(file_sha.as_bytes());
    if let Some(ext) = &loaded.external_id {
        hasher.update(ext.as_bytes());
    }
    hasher.update(loaded.text.as_bytes());
    hex::encode(hasher.finalize())
}

fn file_stamp(path: &Path) -> (Option<i64>, Option<i64>) {
    match std::fs::metadata(path) {
        Ok(md) => {
            let mtime = md
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64);
            (mtime, Some(md.len() as i64))
        }
        Err(_) => (None, None),
    }
}

fn fs_mtime_rfc3339(mtime: Option<i64>) -> Option<String> {
    mtime.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)).map(|dt| dt.to_rfc3339())
}

fn stamp_fs_meta(
    meta: &mut BTreeMap<String, serde_json::Value>,
    fs_mtime: Option<i64>,
    fs_size: Option<i64>,
) {
    if let Some(m) = fs_mtime {
        meta.insert("fs_mtime".to_string(), serde_json::Value::from(m));
    }
    if let Some(s) = fs_size {
        meta.insert("fs_size".to_string(), serde_json::Value::from(s));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simhash_is_stable_and_separates_content() {
        let a = simhash64("the quick brown fox jumps over the lazy dog");
        let b = simhash64("the quick brown fox jumps over the lazy dog");
        let c = simhash64("an entirely different sentence about databases");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn dedup_drops_exact_repeats_only() {
        let text = "same paragraph here\n\nsame paragraph here\n\nanother one";
        let drafts = vec![
            DraftChunk { start_char: 0, end_char: 19, token_count: 5, section: None, page_from: None, page_to: None },
            DraftChunk { start_char: 21, end_char: 40, token_count: 5, section: None, page_from: None, page_to: None },
            DraftChunk { start_char: 42, end_char: 53, token_count: 3, section: None, page_from: None, page_to: None },
        ];
        assert_eq!(&text[0..19], &text[21..40]);
        let kept = dedup_drafts(text, drafts);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].start_char, 0);
        assert_eq!(kept[1].start_char, 42);
    }

    #[test]
    fn globs_filter_relative_paths() {
        let include = build_glob(Some("**/*.md")).expect("globset");
        assert!(include.is_match("notes/a.md"));
        assert!(!include.is_match("notes/a.pdf"));
        let multi = build_glob(Some("*.md, *.txt")).expect("globset");
        assert!(multi.is_match("a.txt"));
    }
}
