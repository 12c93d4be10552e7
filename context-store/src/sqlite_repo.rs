//! SQLite-backed repository.
//!
//! One database file holds sources, documents, chunks, embeddings, tags, the
//! ingest-job ledger and the immutable query journal. WAL journaling lets
//! readers run against the last committed snapshot while a single writer
//! proceeds; foreign keys are enforced so ownership cascades hold.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use context_model::{
    ChunkId, ChunkMeta, ChunkRecord, DocumentId, DocumentRecord, EmbeddingRecord, EmbeddingStyle,
    IngestJobRecord, IngestStats, JobId, JobStatus, QueryFilters, QueryId, QueryRecord,
    RankedResult, SourceId, SourceKind, SourceRecord,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::{FtsHit, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id           TEXT PRIMARY KEY,
    kind         TEXT NOT NULL,
    uri          TEXT NOT NULL,
    label        TEXT,
    include_glob TEXT,
    exclude_glob TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id          TEXT PRIMARY KEY,
    source_id   TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    external_id TEXT,
    title       TEXT,
    author      TEXT,
    created_ts  TEXT,
    modified_ts TEXT,
    mime        TEXT NOT NULL,
    sha256      TEXT NOT NULL UNIQUE,
    text        TEXT NOT NULL,
    meta        TEXT NOT NULL DEFAULT '{}',
    size_bytes  INTEGER NOT NULL DEFAULT 0,
    is_deleted  INTEGER NOT NULL DEFAULT 0,
    deleted_at  TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source_id);
CREATE INDEX IF NOT EXISTS idx_documents_external ON documents(source_id, external_id);

CREATE TABLE IF NOT EXISTS chunks (
    id          TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    ordinal     INTEGER NOT NULL,
    start_char  INTEGER NOT NULL,
    end_char    INTEGER NOT NULL,
    text        TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    meta        TEXT NOT NULL DEFAULT '{}',
    UNIQUE(document_id, ordinal)
);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);

CREATE TABLE IF NOT EXISTS embeddings (
    chunk_id TEXT NOT NULL REFERENCES chunks(id) ON DELETE CASCADE,
    model    TEXT NOT NULL,
    dim      INTEGER NOT NULL,
    style    TEXT NOT NULL DEFAULT 'dense',
    vector   BLOB NOT NULL,
    PRIMARY KEY (chunk_id, model)
);

CREATE TABLE IF NOT EXISTS ingest_jobs (
    id          TEXT PRIMARY KEY,
    source_id   TEXT,
    status      TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    stats       TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS queries (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    text           TEXT NOT NULL,
    filters        TEXT NOT NULL DEFAULT '{}',
    rerank_enabled INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS query_results (
    query_id            INTEGER NOT NULL REFERENCES queries(id) ON DELETE CASCADE,
    chunk_id            TEXT NOT NULL,
    rank                INTEGER NOT NULL,
    score               REAL NOT NULL,
    provenance_snapshot TEXT NOT NULL,
    PRIMARY KEY (query_id, rank)
);

CREATE TABLE IF NOT EXISTS tags (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS document_tags (
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    tag_id      INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (document_id, tag_id)
);

CREATE TABLE IF NOT EXISTS chunk_tags (
    chunk_id TEXT NOT NULL REFERENCES chunks(id) ON DELETE CASCADE,
    tag_id   INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (chunk_id, tag_id)
);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    text,
    content='chunks',
    content_rowid='rowid',
    tokenize='unicode61 remove_diacritics 0'
);

CREATE TRIGGER IF NOT EXISTS chunks_fts_ai AFTER INSERT ON chunks BEGIN
    INSERT INTO chunks_fts(rowid, text) VALUES (new.rowid, new.text);
END;
CREATE TRIGGER IF NOT EXISTS chunks_fts_ad AFTER DELETE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
END;
CREATE TRIGGER IF NOT EXISTS chunks_fts_au AFTER UPDATE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
    INSERT INTO chunks_fts(rowid, text) VALUES (new.rowid, new.text);
END;
"#;

pub struct SqliteRepo {
    conn: Connection,
}

impl SqliteRepo {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn now() -> String {
        Utc::now().to_rfc3339()
    }

    // ---- sources -------------------------------------------------------

    pub fn upsert_source(&self, source: &SourceRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO sources (id, kind, uri, label, include_glob, exclude_glob, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 kind = excluded.kind, uri = excluded.uri, label = excluded.label,
                 include_glob = excluded.include_glob, exclude_glob = excluded.exclude_glob,
                 updated_at = excluded.updated_at",
            params![
                source.id.0,
                source.kind.as_str(),
                source.uri,
                source.label,
                source.include_glob,
                source.exclude_glob,
                source.created_at,
                source.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_source(&self, id: &SourceId) -> Result<Option<SourceRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, kind, uri, label, include_glob, exclude_glob, created_at, updated_at
                 FROM sources WHERE id = ?1",
                params![id.0],
                source_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_sources(&self) -> Result<Vec<SourceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, uri, label, include_glob, exclude_glob, created_at, updated_at
             FROM sources ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], source_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete (or soft-delete documents of) the given sources. Returns the
    /// chunk ids that went away so callers can update the vector index.
    pub fn delete_sources(
        &mut self,
        ids: &[SourceId],
        hard: bool,
    ) -> Result<Vec<ChunkId>, StoreError> {
        let mut affected = Vec::new();
        let now = Self::now();
        let tx = self.conn.transaction()?;
        for sid in ids {
            {
                let mut stmt = tx.prepare(
                    "SELECT c.id FROM chunks c
                     JOIN documents d ON d.id = c.document_id
                     WHERE d.source_id = ?1",
                )?;
                let rows = stmt.query_map(params![sid.0], |r| r.get::<_, String>(0))?;
                for id in rows {
                    affected.push(ChunkId(id?));
                }
            }
            if hard {
                tx.execute("DELETE FROM sources WHERE id = ?1", params![sid.0])?;
            } else {
                tx.execute(
                    "UPDATE documents SET is_deleted = 1, deleted_at = ?2, updated_at = ?2
                     WHERE source_id = ?1 AND is_deleted = 0",
                    params![sid.0, now],
                )?;
            }
        }
        tx.commit()?;
        Ok(affected)
    }

    // ---- documents and chunks -----------------------------------------

    pub fn document_by_sha(&self, sha256: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {DOC_COLS} FROM documents WHERE sha256 = ?1"),
                params![sha256],
                document_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_document(&self, id: &DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {DOC_COLS} FROM documents WHERE id = ?1"),
                params![id.0],
                document_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Metadata-only refresh for a document whose bytes were seen before.
    pub fn touch_document(
        &self,
        id: &DocumentId,
        external_id: Option<&str>,
        modified_ts: Option<&str>,
        meta: Option<&BTreeMap<String, serde_json::Value>>,
    ) -> Result<(), StoreError> {
        let meta_json = match meta {
            Some(m) => Some(serde_json::to_string(m)?),
            None => None,
        };
        self.conn.execute(
            "UPDATE documents SET
                 external_id = COALESCE(?2, external_id),
                 modified_ts = COALESCE(?3, modified_ts),
                 meta = COALESCE(?4, meta),
                 is_deleted = 0, deleted_at = NULL,
                 updated_at = ?5
             WHERE id = ?1",
            params![id.0, external_id, modified_ts, meta_json, Self::now()],
        )?;
        Ok(())
    }

    /// Atomically upsert a document and replace its entire chunk set and
    /// embeddings. Readers never observe a half-chunked document.
    pub fn replace_document(
        &mut self,
        doc: &DocumentRecord,
        chunks: &[ChunkRecord],
        embeddings: &[EmbeddingRecord],
    ) -> Result<(), StoreError> {
        let meta_json = serde_json::to_string(&doc.meta)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO documents
                 (id, source_id, external_id, title, author, created_ts, modified_ts, mime,
                  sha256, text, meta, size_bytes, is_deleted, deleted_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, NULL, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                 source_id = excluded.source_id, external_id = excluded.external_id,
                 title = excluded.title, author = excluded.author,
                 created_ts = excluded.created_ts, modified_ts = excluded.modified_ts,
                 mime = excluded.mime, sha256 = excluded.sha256, text = excluded.text,
                 meta = excluded.meta, size_bytes = excluded.size_bytes,
                 is_deleted = 0, deleted_at = NULL, updated_at = excluded.updated_at",
            params![
                doc.id.0,
                doc.source_id.0,
                doc.external_id,
                doc.title,
                doc.author,
                doc.created_ts,
                doc.modified_ts,
                doc.mime,
                doc.sha256,
                doc.text,
                meta_json,
                doc.size_bytes as i64,
                doc.created_at,
                doc.updated_at,
            ],
        )?;
        tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![doc.id.0])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (id, document_id, ordinal, start_char, end_char, text, token_count, meta)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for c in chunks {
                stmt.execute(params![
                    c.id.0,
                    c.document_id.0,
                    c.ordinal,
                    c.start_char as i64,
                    c.end_char as i64,
                    c.text,
                    c.token_count as i64,
                    serde_json::to_string(&c.meta)?,
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO embeddings (chunk_id, model, dim, style, vector)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for e in embeddings {
                stmt.execute(params![
                    e.chunk_id.0,
                    e.model,
                    e.dim as i64,
                    e.style.as_str(),
                    vector_to_blob(&e.vector),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace the chunk set of one document (no embeddings), atomically.
    pub fn insert_chunks(
        &mut self,
        document_id: &DocumentId,
        chunks: &[ChunkRecord],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![document_id.0])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (id, document_id, ordinal, start_char, end_char, text, token_count, meta)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for c in chunks {
                stmt.execute(params![
                    c.id.0,
                    c.document_id.0,
                    c.ordinal,
                    c.start_char as i64,
                    c.end_char as i64,
                    c.text,
                    c.token_count as i64,
                    serde_json::to_string(&c.meta)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Soft-delete older documents that share `(source_id, external_id)` with
    /// a fresher document (the path was re-ingested with changed bytes).
    /// Returns the chunk ids of the superseded documents.
    pub fn soft_delete_superseded(
        &mut self,
        source_id: &SourceId,
        external_id: &str,
        keep: &DocumentId,
    ) -> Result<Vec<ChunkId>, StoreError> {
        let now = Self::now();
        let mut affected = Vec::new();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "SELECT c.id FROM chunks c
                 JOIN documents d ON d.id = c.document_id
                 WHERE d.source_id = ?1 AND d.external_id = ?2 AND d.id != ?3 AND d.is_deleted = 0",
            )?;
            let rows = stmt.query_map(params![source_id.0, external_id, keep.0], |r| {
                r.get::<_, String>(0)
            })?;
            for id in rows {
                affected.push(ChunkId(id?));
            }
        }
        tx.execute(
            "UPDATE documents SET is_deleted = 1, deleted_at = ?4, updated_at = ?4
             WHERE source_id = ?1 AND external_id = ?2 AND id != ?3 AND is_deleted = 0",
            params![source_id.0, external_id, keep.0, now],
        )?;
        tx.commit()?;
        Ok(affected)
    }

    /// Live documents of a source registered under one external id (path).
    pub fn documents_by_external_id(
        &self,
        source_id: &SourceId,
        external_id: &str,
    ) -> Result<Vec<DocumentId>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM documents
             WHERE source_id = ?1 AND external_id = ?2 AND is_deleted = 0",
        )?;
        let rows = stmt.query_map(params![source_id.0, external_id], |r| r.get::<_, String>(0))?;
        Ok(rows.map(|r| r.map(DocumentId)).collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_chunks_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<ChunkRecord>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHUNK_COLS} FROM chunks WHERE id = ?1"
        ))?;
        for id in ids {
            if let Some(c) = stmt.query_row(params![id.0], chunk_from_row).optional()? {
                out.push(c);
            }
        }
        Ok(out)
    }

    pub fn chunks_for_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<Vec<ChunkRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHUNK_COLS} FROM chunks WHERE document_id = ?1 ORDER BY ordinal"
        ))?;
        let rows = stmt.query_map(params![document_id.0], chunk_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Soft delete (default) or hard delete documents. Returns affected chunk
    /// ids for index maintenance.
    pub fn mark_documents_deleted(
        &mut self,
        ids: &[DocumentId],
        hard: bool,
    ) -> Result<Vec<ChunkId>, StoreError> {
        let now = Self::now();
        let mut affected = Vec::new();
        let tx = self.conn.transaction()?;
        for id in ids {
            {
                let mut stmt = tx.prepare("SELECT id FROM chunks WHERE document_id = ?1")?;
                let rows = stmt.query_map(params![id.0], |r| r.get::<_, String>(0))?;
                for cid in rows {
                    affected.push(ChunkId(cid?));
                }
            }
            if hard {
                tx.execute("DELETE FROM documents WHERE id = ?1", params![id.0])?;
            } else {
                tx.execute(
                    "UPDATE documents SET is_deleted = 1, deleted_at = ?2, updated_at = ?2
                     WHERE id = ?1",
                    params![id.0, now],
                )?;
            }
        }
        tx.commit()?;
        Ok(affected)
    }

    /// Hard-delete documents soft-deleted before `cutoff`. Returns the chunk
    /// ids removed so the vector index can drop them too.
    pub fn gc_soft_deleted(&mut self, cutoff: &str) -> Result<Vec<ChunkId>, StoreError> {
        let mut affected = Vec::new();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "SELECT c.id FROM chunks c
                 JOIN documents d ON d.id = c.document_id
                 WHERE d.is_deleted = 1 AND d.deleted_at < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], |r| r.get::<_, String>(0))?;
            for id in rows {
                affected.push(ChunkId(id?));
            }
        }
        tx.execute(
            "DELETE FROM documents WHERE is_deleted = 1 AND deleted_at < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(affected)
    }

    /// Subset of `ids` whose owning document is soft-deleted.
    pub fn soft_deleted_among(&self, ids: &[ChunkId]) -> Result<Vec<ChunkId>, StoreError> {
        let mut out = Vec::new();
        let mut stmt = self.conn.prepare(
            "SELECT d.is_deleted FROM chunks c JOIN documents d ON d.id = c.document_id
             WHERE c.id = ?1",
        )?;
        for id in ids {
            let deleted: Option<bool> =
                stmt.query_row(params![id.0], |r| r.get(0)).optional()?;
            if deleted == Some(true) {
                out.push(id.clone());
            }
        }
        Ok(out)
    }

    /// Last-seen filesystem state per external id for one source, for the
    /// startup reconciliation sweep. Reads `fs_mtime` / `fs_size` out of the
    /// document metadata.
    pub fn last_seen_files(
        &self,
        source_id: &SourceId,
    ) -> Result<Vec<(String, Option<i64>, Option<i64>)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT external_id,
                    CAST(json_extract(meta, '$.fs_mtime') AS INTEGER),
                    CAST(json_extract(meta, '$.fs_size') AS INTEGER)
             FROM documents
             WHERE source_id = ?1 AND external_id IS NOT NULL AND is_deleted = 0",
        )?;
        let rows = stmt.query_map(params![source_id.0], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<i64>>(1)?, r.get::<_, Option<i64>>(2)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ---- filters and search -------------------------------------------

    /// Chunk ids matching the metadata filters, soft-deleted ones included
    /// (retrieval down-weights rather than hides them).
    pub fn candidate_chunk_ids(&self, filters: &QueryFilters) -> Result<Vec<ChunkId>, StoreError> {
        let (clause, params) = filter_clause(filters);
        let sql = format!(
            "SELECT c.id FROM chunks c JOIN documents d ON d.id = c.document_id WHERE 1=1{clause}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |r| r.get::<_, String>(0))?;
        Ok(rows.map(|r| r.map(ChunkId)).collect::<Result<Vec<_>, _>>()?)
    }

    /// BM25 full-text search with filter pushdown. SQLite's `bm25()` is
    /// smaller-is-better; the score is negated so callers always see
    /// higher-is-better.
    pub fn search_fts(
        &self,
        query: &str,
        limit: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<FtsHit>, StoreError> {
        let match_expr = fts_match_expr(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let (clause, mut params) = filter_clause(filters);
        let sql = format!(
            "SELECT c.id, -bm25(chunks_fts) AS score
             FROM chunks_fts
             JOIN chunks c ON c.rowid = chunks_fts.rowid
             JOIN documents d ON d.id = c.document_id
             WHERE chunks_fts MATCH ?1{clause}
             ORDER BY bm25(chunks_fts) ASC, c.id ASC
             LIMIT {limit}"
        );
        params.insert(0, Value::Text(match_expr));
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |r| {
            Ok(FtsHit { chunk_id: ChunkId(r.get::<_, String>(0)?), score: r.get::<_, f64>(1)? as f32 })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// FTS mirror consistency guard: rebuild when the row counts drift.
    pub fn maybe_rebuild_fts(&self) -> Result<bool, StoreError> {
        let (chunks, fts) = self.counts()?;
        if chunks != fts {
            self.conn
                .execute("INSERT INTO chunks_fts(chunks_fts) VALUES ('rebuild')", [])?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn counts(&self) -> Result<(i64, i64), StoreError> {
        let chunks: i64 = self.conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
        let fts: i64 =
            self.conn.query_row("SELECT COUNT(*) FROM chunks_fts", [], |r| r.get(0))?;
        Ok((chunks, fts))
    }

    // ---- embeddings ----------------------------------------------------

    pub fn embeddings_for(
        &self,
        ids: &[ChunkId],
        model: &str,
    ) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        let mut stmt = self.conn.prepare(
            "SELECT chunk_id, model, dim, style, vector FROM embeddings
             WHERE chunk_id = ?1 AND model = ?2",
        )?;
        for id in ids {
            if let Some(e) = stmt
                .query_row(params![id.0, model], embedding_from_row)
                .optional()?
            {
                out.push(e);
            }
        }
        Ok(out)
    }

    /// Every stored vector for one model; the canonical data the vector index
    /// is rebuilt from.
    pub fn all_embeddings(&self, model: &str) -> Result<Vec<(ChunkId, Vec<f32>)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT chunk_id, vector FROM embeddings WHERE model = ?1 ORDER BY chunk_id")?;
        let rows = stmt.query_map(params![model], |r| {
            Ok((ChunkId(r.get::<_, String>(0)?), blob_to_vector(&r.get::<_, Vec<u8>>(1)?)))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ---- provenance ----------------------------------------------------

    /// Joined chunk/document/source context for result assembly.
    pub fn provenance_rows(&self, ids: &[ChunkId]) -> Result<Vec<ProvenanceRow>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHUNK_COLS_PREFIXED}, d.title, d.external_id, d.modified_ts, d.is_deleted,
                    s.label, s.uri
             FROM chunks c
             JOIN documents d ON d.id = c.document_id
             JOIN sources s ON s.id = d.source_id
             WHERE c.id = ?1"
        ))?;
        for id in ids {
            let row = stmt
                .query_row(params![id.0], |r| {
                    Ok(ProvenanceRow {
                        chunk: chunk_from_row(r)?,
                        document_title: r.get(8)?,
                        document_path: r.get(9)?,
                        modified_ts: r.get(10)?,
                        is_deleted: r.get(11)?,
                        source_label: r.get(12)?,
                        source_uri: r.get(13)?,
                    })
                })
                .optional()?;
            if let Some(row) = row {
                out.push(row);
            }
        }
        Ok(out)
    }

    // ---- query journal -------------------------------------------------

    /// Persist the query row and its ranked snapshot in one transaction and
    /// return the new strictly monotonic query id.
    pub fn record_query_with_results(
        &mut self,
        text: &str,
        filters: &QueryFilters,
        rerank_enabled: bool,
        results: &[RankedResult],
    ) -> Result<QueryId, StoreError> {
        let filters_json = serde_json::to_string(filters)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO queries (text, filters, rerank_enabled, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![text, filters_json, rerank_enabled, Self::now()],
        )?;
        let query_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO query_results (query_id, chunk_id, rank, score, provenance_snapshot)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for r in results {
                stmt.execute(params![
                    query_id,
                    r.chunk_id.0,
                    r.rank,
                    r.score as f64,
                    serde_json::to_string(r)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(query_id)
    }

    /// Replay a past query verbatim from its frozen snapshot.
    pub fn fetch_why(
        &self,
        query_id: QueryId,
    ) -> Result<(QueryRecord, Vec<RankedResult>), StoreError> {
        let query = self
            .conn
            .query_row(
                "SELECT id, text, filters, rerank_enabled, created_at FROM queries WHERE id = ?1",
                params![query_id],
                query_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("query {query_id}")))?;

        let mut stmt = self.conn.prepare(
            "SELECT provenance_snapshot FROM query_results WHERE query_id = ?1 ORDER BY rank",
        )?;
        let rows = stmt.query_map(params![query_id], |r| r.get::<_, String>(0))?;
        let mut results = Vec::new();
        for snapshot in rows {
            results.push(serde_json::from_str(&snapshot?)?);
        }
        Ok((query, results))
    }

    /// The whole journal, oldest first.
    pub fn export_journal(
        &self,
    ) -> Result<Vec<(QueryRecord, Vec<RankedResult>)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, text, filters, rerank_enabled, created_at FROM queries ORDER BY id",
        )?;
        let queries =
            stmt.query_map([], query_from_row)?.collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(queries.len());
        for q in queries {
            let (_, results) = self.fetch_why(q.id)?;
            out.push((q, results));
        }
        Ok(out)
    }

    // ---- tags ----------------------------------------------------------

    /// Attach labels to documents (and, through them, to their chunks).
    /// Returns the number of documents touched.
    pub fn upsert_tags(
        &mut self,
        document_ids: &[DocumentId],
        labels: &[String],
    ) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut touched = 0usize;
        for label in labels {
            tx.execute("INSERT OR IGNORE INTO tags (label) VALUES (?1)", params![label])?;
        }
        for doc_id in document_ids {
            let exists: Option<i64> = tx
                .query_row("SELECT 1 FROM documents WHERE id = ?1", params![doc_id.0], |r| {
                    r.get(0)
                })
                .optional()?;
            if exists.is_none() {
                continue;
            }
            touched += 1;
            for label in labels {
                tx.execute(
                    "INSERT OR IGNORE INTO document_tags (document_id, tag_id)
                     SELECT ?1, id FROM tags WHERE label = ?2",
                    params![doc_id.0, label],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO chunk_tags (chunk_id, tag_id)
                     SELECT c.id, t.id FROM chunks c, tags t
                     WHERE c.document_id = ?1 AND t.label = ?2",
                    params![doc_id.0, label],
                )?;
            }
        }
        tx.commit()?;
        Ok(touched)
    }

    // ---- ingest jobs ---------------------------------------------------

    pub fn insert_job(&self, job: &IngestJobRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO ingest_jobs (id, source_id, status, started_at, finished_at, stats)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id.0,
                job.source_id.as_ref().map(|s| s.0.clone()),
                job.status.as_str(),
                job.started_at,
                job.finished_at,
                serde_json::to_string(&job.stats)?,
            ],
        )?;
        Ok(())
    }

    pub fn update_job(
        &self,
        id: &JobId,
        status: JobStatus,
        finished_at: Option<&str>,
        stats: &IngestStats,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE ingest_jobs SET status = ?2, finished_at = ?3, stats = ?4 WHERE id = ?1",
            params![id.0, status.as_str(), finished_at, serde_json::to_string(stats)?],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: &JobId) -> Result<Option<IngestJobRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, source_id, status, started_at, finished_at, stats
                 FROM ingest_jobs WHERE id = ?1",
                params![id.0],
                job_from_row,
            )
            .optional()?;
        Ok(row)
    }
}

/// Chunk plus the joined document/source context a result needs.
#[derive(Debug, Clone)]
pub struct ProvenanceRow {
    pub chunk: ChunkRecord,
    pub document_title: Option<String>,
    pub document_path: Option<String>,
    pub modified_ts: Option<String>,
    pub is_deleted: bool,
    pub source_label: Option<String>,
    pub source_uri: String,
}

const DOC_COLS: &str = "id, source_id, external_id, title, author, created_ts, modified_ts, mime, \
                        sha256, text, meta, size_bytes, is_deleted, created_at, updated_at";
const CHUNK_COLS: &str = "id, document_id, ordinal, start_char, end_char, text, token_count, meta";
const CHUNK_COLS_PREFIXED: &str = "c.id, c.document_id, c.ordinal, c.start_char, c.end_char, \
                                   c.text, c.token_count, c.meta";

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<SourceRecord> {
    let kind_str: String = row.get(1)?;
    Ok(SourceRecord {
        id: SourceId(row.get(0)?),
        kind: SourceKind::parse(&kind_str).unwrap_or(SourceKind::Other),
        uri: row.get(2)?,
        label: row.get(3)?,
        include_glob: row.get(4)?,
        exclude_glob: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<DocumentRecord> {
    let meta_json: String = row.get(10)?;
    Ok(DocumentRecord {
        id: DocumentId(row.get(0)?),
        source_id: SourceId(row.get(1)?),
        external_id: row.get(2)?,
        title: row.get(3)?,
        author: row.get(4)?,
        created_ts: row.get(5)?,
        modified_ts: row.get(6)?,
        mime: row.get(7)?,
        sha256: row.get(8)?,
        text: row.get(9)?,
        meta: serde_json::from_str(&meta_json).unwrap_or_default(),
        size_bytes: row.get::<_, i64>(11)? as u64,
        is_deleted: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<ChunkRecord> {
    let meta_json: String = row.get(7)?;
    let meta: ChunkMeta = serde_json::from_str(&meta_json).unwrap_or_default();
    Ok(ChunkRecord {
        id: ChunkId(row.get(0)?),
        document_id: DocumentId(row.get(1)?),
        ordinal: row.get(2)?,
        start_char: row.get::<_, i64>(3)? as usize,
        end_char: row.get::<_, i64>(4)? as usize,
        text: row.get(5)?,
        token_count: row.get::<_, i64>(6)? as usize,
        meta,
    })
}

fn embedding_from_row(row: &Row<'_>) -> rusqlite::Result<EmbeddingRecord> {
    let style_str: String = row.get(3)?;
    let blob: Vec<u8> = row.get(4)?;
    Ok(EmbeddingRecord {
        chunk_id: ChunkId(row.get(0)?),
        model: row.get(1)?,
        dim: row.get::<_, i64>(2)? as usize,
        style: match style_str.as_str() {
            "sparse" => EmbeddingStyle::Sparse,
            "hybrid" => EmbeddingStyle::Hybrid,
            _ => EmbeddingStyle::Dense,
        },
        vector: blob_to_vector(&blob),
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<IngestJobRecord> {
    let status_str: String = row.get(2)?;
    let stats_json: String = row.get(5)?;
    Ok(IngestJobRecord {
        id: JobId(row.get(0)?),
        source_id: row.get::<_, Option<String>>(1)?.map(SourceId),
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Error),
        started_at: row.get(3)?,
        finished_at: row.get(4)?,
        stats: serde_json::from_str(&stats_json).unwrap_or_default(),
    })
}

fn query_from_row(row: &Row<'_>) -> rusqlite::Result<QueryRecord> {
    let filters_json: String = row.get(2)?;
    Ok(QueryRecord {
        id: row.get(0)?,
        text: row.get(1)?,
        filters: serde_json::from_str(&filters_json).unwrap_or_default(),
        rerank_enabled: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Little-endian f32 blob round-trip for the embeddings column.
fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(vector).to_vec()
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    match bytemuck::try_cast_slice::<u8, f32>(blob) {
        Ok(slice) => slice.to_vec(),
        // Unaligned blob: fall back to a manual copy.
        Err(_) => blob
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    }
}

/// Build the shared `AND ...` pushdown clause over documents/tags. Returns
/// the SQL fragment plus its positional parameters (appended after any the
/// caller already bound).
fn filter_clause(filters: &QueryFilters) -> (String, Vec<Value>) {
    let mut clause = String::new();
    let mut params: Vec<Value> = Vec::new();

    if !filters.source_ids.is_empty() {
        clause.push_str(&format!(
            " AND d.source_id IN ({})",
            placeholders(filters.source_ids.len())
        ));
        params.extend(filters.source_ids.iter().map(|s| Value::Text(s.0.clone())));
    }
    if !filters.mimes.is_empty() {
        clause.push_str(&format!(" AND d.mime IN ({})", placeholders(filters.mimes.len())));
        params.extend(filters.mimes.iter().map(|m| Value::Text(m.clone())));
    }
    if let Some(after) = &filters.modified_after {
        clause.push_str(" AND d.modified_ts >= ?");
        params.push(Value::Text(after.clone()));
    }
    if let Some(before) = &filters.modified_before {
        clause.push_str(" AND d.modified_ts <= ?");
        params.push(Value::Text(before.clone()));
    }
    if !filters.tags.is_empty() {
        clause.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM document_tags dt JOIN tags t ON t.id = dt.tag_id
                          WHERE dt.document_id = d.id AND t.label IN ({}))",
            placeholders(filters.tags.len())
        ));
        params.extend(filters.tags.iter().map(|t| Value::Text(t.clone())));
    }
    (clause, params)
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(", ")
}

/// Turn free text into an FTS5 MATCH expression: each alphanumeric token is
/// quoted and OR-joined, so ranking rewards multi-term agreement without
/// demanding it.
fn fts_match_expr(query: &str) -> String {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    tokens.join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_source() -> SourceRecord {
        SourceRecord {
            id: SourceId("src-1".into()),
            kind: SourceKind::Folder,
            uri: "/notes".into(),
            label: Some("notes".into()),
            include_glob: None,
            exclude_glob: None,
            created_at: SqliteRepo::now(),
            updated_at: SqliteRepo::now(),
        }
    }

    fn sample_document(id: &str, sha: &str, text: &str) -> DocumentRecord {
        DocumentRecord {
            id: DocumentId(id.into()),
            source_id: SourceId("src-1".into()),
            external_id: Some(format!("/notes/{id}.md")),
            title: Some("Note".into()),
            author: None,
            created_ts: None,
            modified_ts: Some("2026-01-10T00:00:00+00:00".into()),
            mime: "text/markdown".into(),
            sha256: sha.into(),
            text: text.into(),
            meta: Default::default(),
            size_bytes: text.len() as u64,
            is_deleted: false,
            created_at: SqliteRepo::now(),
            updated_at: SqliteRepo::now(),
        }
    }

    fn chunk_of(doc: &DocumentRecord, ordinal: u32, start: usize, end: usize) -> ChunkRecord {
        ChunkRecord {
            id: ChunkId::derive(&doc.id, ordinal),
            document_id: doc.id.clone(),
            ordinal,
            start_char: start,
            end_char: end,
            text: doc.text[start..end].to_string(),
            token_count: (end - start).div_ceil(4),
            meta: Default::default(),
        }
    }

    fn embedding_of(chunk: &ChunkRecord, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            chunk_id: chunk.id.clone(),
            model: "hashed-test".into(),
            dim: vector.len(),
            vector,
            style: EmbeddingStyle::Dense,
        }
    }

    fn seeded_repo() -> SqliteRepo {
        let mut repo = SqliteRepo::open_in_memory().expect("open");
        repo.upsert_source(&sample_source()).expect("source");
        let doc = sample_document("doc-a", "sha-a", "alpha paragraph about retrieval.\n\nbeta paragraph about caching.");
        let c0 = chunk_of(&doc, 0, 0, 32);
        let c1 = chunk_of(&doc, 1, 34, doc.text.len());
        let e0 = embedding_of(&c0, vec![1.0, 0.0]);
        let e1 = embedding_of(&c1, vec![0.0, 1.0]);
        repo.replace_document(&doc, &[c0, c1], &[e0, e1]).expect("replace");
        repo
    }

    #[test]
    fn replace_document_round_trips_chunks_and_embeddings() {
        let repo = seeded_repo();
        let doc = repo.get_document(&DocumentId("doc-a".into())).expect("get").expect("exists");
        let chunks = repo.chunks_for_document(&doc.id).expect("chunks");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[1].ordinal, 1);
        for c in &chunks {
            assert_eq!(c.text, doc.text[c.start_char..c.end_char]);
        }
        let embs = repo
            .embeddings_for(&[chunks[0].id.clone(), chunks[1].id.clone()], "hashed-test")
            .expect("embeddings");
        assert_eq!(embs.len(), 2);
        assert_eq!(embs[0].vector, vec![1.0, 0.0]);
    }

    #[test]
    fn replacing_a_document_replaces_its_chunks() {
        let mut repo = seeded_repo();
        let mut doc = sample_document("doc-a", "sha-a2", "entirely new text.");
        doc.updated_at = SqliteRepo::now();
        let c0 = chunk_of(&doc, 0, 0, doc.text.len());
        let e0 = embedding_of(&c0, vec![0.5, 0.5]);
        repo.replace_document(&doc, &[c0], &[e0]).expect("replace");

        let chunks = repo.chunks_for_document(&doc.id).expect("chunks");
        assert_eq!(chunks.len(), 1);
        let (chunk_count, fts_count) = repo.counts().expect("counts");
        assert_eq!(chunk_count, 1);
        assert_eq!(fts_count, 1);
    }

    #[test]
    fn fts_search_finds_tokens_and_normalises_scores() {
        let repo = seeded_repo();
        let hits = repo
            .search_fts("alpha retrieval", 10, &QueryFilters::default())
            .expect("search");
        assert!(!hits.is_empty());
        assert_eq!(hits[0].chunk_id.0, "doc-a#0");
        // Matching rows score positive after normalisation.
        assert!(hits[0].score > 0.0);
        // Both-token chunk outranks any single-token chunk.
        if hits.len() > 1 {
            assert!(hits[0].score >= hits[1].score);
        }
    }

    #[test]
    fn fts_rows_follow_document_deletion() {
        let mut repo = seeded_repo();
        repo.mark_documents_deleted(&[DocumentId("doc-a".into())], true).expect("delete");
        let (chunks, fts) = repo.counts().expect("counts");
        assert_eq!(chunks, 0);
        assert_eq!(fts, 0);
    }

    #[test]
    fn filters_push_down_source_and_mime() {
        let repo = seeded_repo();
        let mut filters = QueryFilters::default();
        filters.mimes = vec!["application/pdf".into()];
        let hits = repo.search_fts("alpha", 10, &filters).expect("search");
        assert!(hits.is_empty());

        filters.mimes = vec!["text/markdown".into()];
        let hits = repo.search_fts("alpha", 10, &filters).expect("search");
        assert!(!hits.is_empty());

        let ids = repo.candidate_chunk_ids(&filters).expect("candidates");
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn tag_filters_match_tagged_documents_only() {
        let mut repo = seeded_repo();
        let updated = repo
            .upsert_tags(&[DocumentId("doc-a".into())], &["work".to_string()])
            .expect("tags");
        assert_eq!(updated, 1);

        let mut filters = QueryFilters::default();
        filters.tags = vec!["work".into()];
        assert_eq!(repo.candidate_chunk_ids(&filters).expect("candidates").len(), 2);
        filters.tags = vec!["personal".into()];
        assert!(repo.candidate_chunk_ids(&filters).expect("candidates").is_empty());
    }

    #[test]
    fn journal_snapshot_survives_document_deletion() {
        let mut repo = seeded_repo();
        let result = RankedResult {
            rank: 1,
            chunk_id: ChunkId("doc-a#0".into()),
            document_id: DocumentId("doc-a".into()),
            score: 0.9,
            dense_score: Some(0.8),
            sparse_score: Some(0.7),
            title: Some("Note".into()),
            snippet: "alpha paragraph about retrieval.".into(),
            text: None,
            provenance: Default::default(),
            deep_link: "ctxc://doc/doc-a?chunk=doc-a#0".into(),
        };
        let qid = repo
            .record_query_with_results("alpha", &QueryFilters::default(), false, &[result.clone()])
            .expect("journal");

        repo.mark_documents_deleted(&[DocumentId("doc-a".into())], true).expect("delete");

        let (query, results) = repo.fetch_why(qid).expect("why");
        assert_eq!(query.text, "alpha");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], result);
    }

    #[test]
    fn query_ids_are_strictly_monotonic() {
        let mut repo = seeded_repo();
        let a = repo
            .record_query_with_results("one", &QueryFilters::default(), false, &[])
            .expect("journal");
        let b = repo
            .record_query_with_results("two", &QueryFilters::default(), false, &[])
            .expect("journal");
        assert!(b > a);
        let err = repo.fetch_why(b + 100).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn soft_delete_marks_without_removing() {
        let mut repo = seeded_repo();
        let affected =
            repo.mark_documents_deleted(&[DocumentId("doc-a".into())], false).expect("delete");
        assert_eq!(affected.len(), 2);
        let deleted = repo.soft_deleted_among(&affected).expect("flags");
        assert_eq!(deleted.len(), 2);
        // Rows still present until GC.
        let (chunks, _) = repo.counts().expect("counts");
        assert_eq!(chunks, 2);

        let removed = repo.gc_soft_deleted(&SqliteRepo::now()).expect("gc");
        assert_eq!(removed.len(), 2);
        let (chunks, _) = repo.counts().expect("counts");
        assert_eq!(chunks, 0);
    }

    #[test]
    fn jobs_track_status_transitions() {
        let repo = SqliteRepo::open_in_memory().expect("open");
        let job = IngestJobRecord {
            id: JobId("job-1".into()),
            source_id: None,
            status: JobStatus::Queued,
            started_at: SqliteRepo::now(),
            finished_at: None,
            stats: IngestStats::default(),
        };
        repo.insert_job(&job).expect("insert");
        let mut stats = IngestStats::default();
        stats.documents_added = 3;
        repo.update_job(&job.id, JobStatus::Done, Some(&SqliteRepo::now()), &stats)
            .expect("update");
        let loaded = repo.get_job(&job.id).expect("get").expect("exists");
        assert_eq!(loaded.status, JobStatus::Done);
        assert_eq!(loaded.stats.documents_added, 3);
        assert!(loaded.finished_at.is_some());
    }

    #[test]
    fn vector_blob_round_trips() {
        let v = vec![0.25f32, -1.5, 3.75];
        assert_eq!(blob_to_vector(&vector_to_blob(&v)), v);
    }

    #[test]
    fn fts_match_expression_quotes_tokens() {
        assert_eq!(fts_match_expr("hello world"), "\"hello\" OR \"world\"");
        assert_eq!(fts_match_expr("c'est-la"), "\"c\" OR \"est\" OR \"la\"");
        assert_eq!(fts_match_expr("!!!"), "");
    }
}
