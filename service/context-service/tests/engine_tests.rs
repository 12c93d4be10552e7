//! End-to-end engine scenarios: ingest real files from disk, retrieve over
//! them, and replay journalled queries.

use std::path::PathBuf;
use std::sync::Arc;

use context_model::{
    DocumentId, IngestJobRecord, IngestStats, JobId, JobStatus, QueryFilters, SourceId,
    SourceKind, SourceRecord,
};
use context_service::config::ServiceConfig;
use context_service::engine::Engine;
use context_service::pipeline::run_job;
use context_service::retriever::{retrieve, RetrieveParams};
use context_service::{OpCtx, ServiceError};
use context_store::sqlite_repo::SqliteRepo;

struct Fixture {
    _dir: tempfile::TempDir,
    notes: PathBuf,
    engine: Arc<Engine>,
    source: SourceRecord,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let notes = dir.path().join("notes");
    std::fs::create_dir_all(&notes).expect("notes dir");

    let mut cfg = ServiceConfig::default();
    cfg.db_path = dir.path().join("cc.db");
    cfg.watch.enabled = false;
    let engine = Engine::new(cfg).expect("engine");

    let now = SqliteRepo::now();
    let source = SourceRecord {
        id: SourceId("src-notes".into()),
        kind: SourceKind::Folder,
        uri: notes.to_string_lossy().to_string(),
        label: Some("notes".into()),
        include_glob: None,
        exclude_glob: None,
        created_at: now.clone(),
        updated_at: now,
    };
    engine.open_repo().expect("repo").upsert_source(&source).expect("source");

    Fixture { _dir: dir, notes, engine, source }
}

impl Fixture {
    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.notes.join(name);
        std::fs::write(&path, contents).expect("write note");
        path
    }

    fn ingest(&self, paths: Vec<PathBuf>) -> IngestStats {
        self.ingest_with_ctx(paths, &OpCtx::new())
    }

    fn ingest_with_ctx(&self, paths: Vec<PathBuf>, ctx: &OpCtx) -> IngestStats {
        let job = IngestJobRecord {
            id: JobId(format!("job-{}", SqliteRepo::now())),
            source_id: Some(self.source.id.clone()),
            status: JobStatus::Queued,
            started_at: SqliteRepo::now(),
            finished_at: None,
            stats: IngestStats::default(),
        };
        self.engine.open_repo().expect("repo").insert_job(&job).expect("job");
        run_job(&self.engine, &job.id, &[(self.source.clone(), paths)], ctx)
    }
}

const NOTE: &str = "# A\n\nparagraph one.\n\n# B\n\nparagraph two.";

#[test]
fn empty_query_is_a_validation_error() {
    let fx = fixture();
    let err = retrieve(&fx.engine, "", &RetrieveParams::default(), &OpCtx::new()).unwrap_err();
    match err {
        ServiceError::Validation { field, detail } => {
            assert_eq!(field, "query");
            assert_eq!(detail, "query must be non-empty");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn single_markdown_file_yields_two_sectioned_chunks() {
    let fx = fixture();
    let path = fx.write("note.md", NOTE);
    let stats = fx.ingest(vec![path]);

    assert_eq!(stats.documents_added, 1);
    assert_eq!(stats.documents_skipped, 0);
    assert_eq!(stats.chunks, 2);
    assert!(stats.errors.is_empty());

    let repo = fx.engine.open_repo().expect("repo");
    let hits = repo.search_fts("paragraph", 10, &QueryFilters::default()).expect("fts");
    assert_eq!(hits.len(), 2, "both chunks must have FTS rows");

    let doc_id = hits[0].chunk_id.0.split('#').next().unwrap().to_string();
    let doc = repo.get_document(&DocumentId(doc_id)).expect("get").expect("document");
    let chunks = repo.chunks_for_document(&doc.id).expect("chunks");
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].meta.section.as_deref(), Some("A"));
    assert_eq!(chunks[1].meta.section.as_deref(), Some("B"));
    for (i, c) in chunks.iter().enumerate() {
        assert_eq!(c.ordinal, i as u32);
        assert_eq!(c.text, doc.text[c.start_char..c.end_char]);
    }

    let ids: Vec<_> = chunks.iter().map(|c| c.id.clone()).collect();
    let embeddings = repo.embeddings_for(&ids, fx.engine.model_id()).expect("embeddings");
    assert_eq!(embeddings.len(), 2);
    for e in &embeddings {
        let norm: f32 = e.vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() <= 1e-6, "stored norm {norm}");
        assert_eq!(e.vector.len(), e.dim);
    }
}

#[test]
fn reingesting_identical_bytes_is_a_no_op_with_stable_ids() {
    let fx = fixture();
    let path = fx.write("note.md", NOTE);

    let first = fx.ingest(vec![path.clone()]);
    assert_eq!(first.documents_added, 1);

    let repo = fx.engine.open_repo().expect("repo");
    let ids_before: Vec<String> = repo
        .search_fts("paragraph", 10, &QueryFilters::default())
        .expect("fts")
        .into_iter()
        .map(|h| h.chunk_id.0)
        .collect();

    let second = fx.ingest(vec![path]);
    assert_eq!(second.documents_added, 0);
    assert_eq!(second.documents_skipped, 1);
    assert_eq!(second.chunks, 0);

    let ids_after: Vec<String> = repo
        .search_fts("paragraph", 10, &QueryFilters::default())
        .expect("fts")
        .into_iter()
        .map(|h| h.chunk_id.0)
        .collect();
    assert_eq!(ids_before, ids_after);
}

#[test]
fn hybrid_dense_and_sparse_all_rank_section_a_first() {
    let fx = fixture();
    let path = fx.write("note.md", NOTE);
    fx.ingest(vec![path]);

    let base = RetrieveParams {
        k: 2,
        hybrid: true,
        rerank: false,
        mmr_lambda: 0.5,
        return_text: true,
        filters: QueryFilters::default(),
    };

    let hybrid =
        retrieve(&fx.engine, "paragraph one", &base, &OpCtx::new()).expect("hybrid query");
    assert!(!hybrid.results.is_empty());
    assert_eq!(hybrid.results[0].rank, 1);
    assert_eq!(hybrid.results[0].provenance.section.as_deref(), Some("A"));
    assert!(hybrid.results[0].text.as_deref().unwrap().contains("paragraph one."));

    let dense_only = RetrieveParams { hybrid: false, ..base.clone() };
    let dense =
        retrieve(&fx.engine, "paragraph one", &dense_only, &OpCtx::new()).expect("dense query");
    assert_eq!(dense.results[0].provenance.section.as_deref(), Some("A"));

    // Sparse arm in isolation agrees.
    let repo = fx.engine.open_repo().expect("repo");
    let sparse = repo.search_fts("paragraph one", 10, &QueryFilters::default()).expect("fts");
    assert!(sparse[0].chunk_id.0.ends_with("#0"));
}

#[test]
fn why_replays_the_snapshot_after_the_document_is_gone() {
    let fx = fixture();
    let path = fx.write("note.md", NOTE);
    fx.ingest(vec![path]);

    let params = RetrieveParams { k: 2, rerank: false, ..RetrieveParams::default() };
    let outcome =
        retrieve(&fx.engine, "paragraph one", &params, &OpCtx::new()).expect("query");
    let original = outcome.results.clone();
    assert!(!original.is_empty());
    let doc_id = original[0].document_id.clone();

    {
        let mut repo = fx.engine.open_repo().expect("repo");
        let affected = repo.mark_documents_deleted(&[doc_id], true).expect("hard delete");
        fx.engine.index.write().remove(&affected);
    }

    let repo = fx.engine.open_repo().expect("repo");
    let (query, replayed) = repo.fetch_why(outcome.query_id).expect("why");
    assert_eq!(query.text, "paragraph one");
    assert_eq!(replayed, original, "journal must replay the frozen snapshot verbatim");
    assert!(!replayed[0].snippet.is_empty());
}

#[test]
fn mmr_diversifies_across_documents_at_low_lambda() {
    let fx = fixture();
    let a = fx.write(
        "a.md",
        "# Alpha\n\ncache retrieval speed note.\n\n# Beta\n\ncache retrieval speed note again.",
    );
    let b = fx.write("b.md", "# Gamma\n\ncache retrieval memo.");
    fx.ingest(vec![a, b]);

    let diversified = RetrieveParams {
        k: 2,
        hybrid: true,
        rerank: true,
        mmr_lambda: 0.3,
        return_text: false,
        filters: QueryFilters::default(),
    };
    let outcome = retrieve(&fx.engine, "cache retrieval speed", &diversified, &OpCtx::new())
        .expect("diversified query");
    assert_eq!(outcome.results.len(), 2);
    assert_ne!(
        outcome.results[0].document_id, outcome.results[1].document_id,
        "lambda 0.3 must pull the second result from a different document"
    );

    let relevance_only = RetrieveParams { mmr_lambda: 1.0, ..diversified };
    let outcome = retrieve(&fx.engine, "cache retrieval speed", &relevance_only, &OpCtx::new())
        .expect("relevance query");
    assert_eq!(outcome.results.len(), 2);
    assert_eq!(
        outcome.results[0].document_id, outcome.results[1].document_id,
        "lambda 1.0 keeps the two strongest chunks even from one document"
    );
}

#[test]
fn soft_deleted_chunks_are_down_weighted_not_hidden() {
    let fx = fixture();
    let path = fx.write("note.md", NOTE);
    fx.ingest(vec![path]);

    let params = RetrieveParams { k: 2, rerank: false, ..RetrieveParams::default() };
    let before = retrieve(&fx.engine, "paragraph one", &params, &OpCtx::new()).expect("query");
    let top_score = before.results[0].score;
    let doc_id = before.results[0].document_id.clone();

    fx.engine
        .open_repo()
        .expect("repo")
        .mark_documents_deleted(&[doc_id], false)
        .expect("soft delete");

    let after = retrieve(&fx.engine, "paragraph one", &params, &OpCtx::new()).expect("query");
    assert!(!after.results.is_empty(), "soft-deleted chunks stay retrievable");
    assert!((after.results[0].score - top_score * 0.5).abs() < 1e-6);
}

#[test]
fn cancelled_jobs_leave_documents_whole() {
    let fx = fixture();
    let path = fx.write("note.md", NOTE);

    let ctx = OpCtx::new();
    ctx.cancel();
    let stats = fx.ingest_with_ctx(vec![path.clone()], &ctx);
    assert_eq!(stats.documents_added, 0);
    assert!(stats.errors.iter().any(|e| e == "cancelled"));

    // Nothing half-written: the store has no documents or chunks at all.
    let repo = fx.engine.open_repo().expect("repo");
    let (chunks, fts) = repo.counts().expect("counts");
    assert_eq!(chunks, 0);
    assert_eq!(fts, 0);

    // The same file ingests cleanly afterwards.
    let stats = fx.ingest(vec![path]);
    assert_eq!(stats.documents_added, 1);
    assert_eq!(stats.chunks, 2);
}

#[test]
fn filters_scope_retrieval_to_matching_documents() {
    let fx = fixture();
    let path = fx.write("note.md", NOTE);
    fx.ingest(vec![path]);

    let mut filters = QueryFilters::default();
    filters.mimes = vec!["application/pdf".into()];
    let params = RetrieveParams { k: 2, rerank: false, filters, ..RetrieveParams::default() };
    let outcome = retrieve(&fx.engine, "paragraph one", &params, &OpCtx::new()).expect("query");
    assert!(outcome.results.is_empty());

    let mut filters = QueryFilters::default();
    filters.mimes = vec!["text/markdown".into()];
    let params = RetrieveParams { k: 2, rerank: false, filters, ..RetrieveParams::default() };
    let outcome = retrieve(&fx.engine, "paragraph one", &params, &OpCtx::new()).expect("query");
    assert_eq!(outcome.results.len(), 2);
}

#[test]
fn changed_file_supersedes_the_previous_revision() {
    let fx = fixture();
    let path = fx.write("note.md", NOTE);
    fx.ingest(vec![path.clone()]);

    fx.write("note.md", "# A\n\nparagraph one revised substantially.");
    let stats = fx.ingest(vec![path]);
    assert_eq!(stats.documents_added, 1);

    // The old revision is soft-deleted; queries prefer the live one.
    let params = RetrieveParams { k: 1, rerank: false, ..RetrieveParams::default() };
    let outcome = retrieve(&fx.engine, "paragraph one", &params, &OpCtx::new()).expect("query");
    assert!(outcome.results[0].text.as_deref().unwrap().contains("revised"));
}
