//! HTTP surface: JSON in/out on loopback, errors as RFC 7807 problems.
//! Handlers stay thin and hand blocking work to the engine through
//! `spawn_blocking`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use context_model::{
    DocumentId, IngestStats, JobId, JobStatus, QueryFilters, QueryId, RankedResult, SourceId,
    SourceKind, SourceRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::Engine;
use crate::error::{ApiResult, Problem};
use crate::retriever::{retrieve, RetrieveParams};
use crate::scheduler::{Priority, Scheduler, Task, TaskKind};
use crate::watcher::WatchManager;
use crate::{OpCtx, ServiceError};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub scheduler: Arc<Scheduler>,
    pub watcher: Option<Arc<WatchManager>>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sources", post(create_source).get(list_sources))
        .route("/ingest", post(start_ingest))
        .route("/ingest/{job_id}", get(job_status))
        .route("/query", post(run_query))
        .route("/rerank", post(rerank_candidates))
        .route("/why/{query_id}", get(why))
        .route("/upsert_tags", post(upsert_tags))
        .route("/delete", post(delete))
        .route("/export", get(export_journal))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct CreateSourceRequest {
    kind: String,
    uri: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    include_glob: Option<String>,
    #[serde(default)]
    exclude_glob: Option<String>,
}

async fn create_source(
    State(state): State<AppState>,
    Json(req): Json<CreateSourceRequest>,
) -> ApiResult<Json<SourceRecord>> {
    let kind = SourceKind::parse(&req.kind)
        .ok_or_else(|| Problem::from(ServiceError::validation("kind", format!("unknown source kind `{}`", req.kind))))?;
    if req.uri.trim().is_empty() {
        return Err(ServiceError::validation("uri", "uri must be non-empty").into());
    }
    let now = context_store::sqlite_repo::SqliteRepo::now();
    let source = SourceRecord {
        id: SourceId(uuid::Uuid::new_v4().to_string()),
        kind,
        uri: req.uri,
        label: req.label,
        include_glob: req.include_glob,
        exclude_glob: req.exclude_glob,
        created_at: now.clone(),
        updated_at: now,
    };

    let engine = state.engine.clone();
    let record = source.clone();
    run_blocking(move || {
        let repo = engine.open_repo()?;
        repo.upsert_source(&record)?;
        Ok(())
    })
    .await?;

    if let Some(watcher) = &state.watcher {
        if let Err(e) = watcher.start_watching(&source) {
            tracing::warn!(source = %source.id, error = %e, "could not start watcher");
        }
    }
    info!(source = %source.id, uri = %source.uri, "source registered");
    Ok(Json(source))
}

async fn list_sources(State(state): State<AppState>) -> ApiResult<Json<Vec<SourceRecord>>> {
    let engine = state.engine.clone();
    let sources = run_blocking(move || Ok(engine.open_repo()?.list_sources()?)).await?;
    Ok(Json(sources))
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    include_glob: Option<String>,
    #[serde(default)]
    exclude_glob: Option<String>,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    job_id: String,
    status: JobStatus,
}

async fn start_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> ApiResult<Json<IngestResponse>> {
    if req.sources.is_empty() && req.paths.is_empty() {
        return Err(
            ServiceError::validation("sources", "provide sources or paths to ingest").into()
        );
    }
    let priority = match req.priority.as_deref() {
        None => Priority::Normal,
        Some(p) => Priority::parse(p).ok_or_else(|| {
            Problem::from(ServiceError::validation("priority", format!("unknown priority `{p}`")))
        })?,
    };

    let engine = state.engine.clone();
    let sources = req.sources.clone();
    let include = req.include_glob.clone();
    let exclude = req.exclude_glob.clone();
    let paths: Vec<PathBuf> = req.paths.iter().map(PathBuf::from).collect();

    let (job, work) = run_blocking(move || {
        let repo = engine.open_repo()?;
        let mut work: Vec<(SourceRecord, Vec<PathBuf>)> = Vec::new();
        for sid in &sources {
            let mut source = repo
                .get_source(&SourceId(sid.clone()))?
                .ok_or_else(|| ServiceError::NotFound(format!("source {sid}")))?;
            // Request-level globs narrow this run without touching the source.
            if include.is_some() {
                source.include_glob = include.clone();
            }
            if exclude.is_some() {
                source.exclude_glob = exclude.clone();
            }
            work.push((source, Vec::new()));
        }
        if !paths.is_empty() {
            work.push((adhoc_source(&repo)?, paths));
        }

        let job = context_model::IngestJobRecord {
            id: JobId(uuid::Uuid::new_v4().to_string()),
            source_id: match &work[..] {
                [(only, _)] => Some(only.id.clone()),
                _ => None,
            },
            status: JobStatus::Queued,
            started_at: context_store::sqlite_repo::SqliteRepo::now(),
            finished_at: None,
            stats: IngestStats::default(),
        };
        repo.insert_job(&job)?;
        Ok((job, work))
    })
    .await?;

    state.scheduler.submit(Task {
        job_id: Some(job.id.clone()),
        kind: TaskKind::Ingest { work },
        priority,
    });
    Ok(Json(IngestResponse { job_id: job.id.0, status: JobStatus::Queued }))
}

/// Explicit path ingests attach to a stable catch-all source.
fn adhoc_source(
    repo: &context_store::sqlite_repo::SqliteRepo,
) -> Result<SourceRecord, ServiceError> {
    let id = SourceId("adhoc".to_string());
    if let Some(existing) = repo.get_source(&id)? {
        return Ok(existing);
    }
    let now = context_store::sqlite_repo::SqliteRepo::now();
    let source = SourceRecord {
        id,
        kind: SourceKind::Other,
        uri: "adhoc://paths".to_string(),
        label: Some("ad-hoc paths".to_string()),
        include_glob: None,
        exclude_glob: None,
        created_at: now.clone(),
        updated_at: now,
    };
    repo.upsert_source(&source)?;
    Ok(source)
}

#[derive(Debug, Serialize)]
struct JobStatusResponse {
    job_id: String,
    status: JobStatus,
    stats: IngestStats,
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let engine = state.engine.clone();
    let job = run_blocking(move || {
        engine
            .open_repo()?
            .get_job(&JobId(job_id.clone()))?
            .ok_or(ServiceError::NotFound(format!("job {job_id}")))
    })
    .await?;
    Ok(Json(JobStatusResponse { job_id: job.id.0, status: job.status, stats: job.stats }))
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default = "default_k")]
    k: usize,
    #[serde(default = "default_true")]
    hybrid: bool,
    #[serde(default)]
    filters: Option<QueryFilters>,
    #[serde(default)]
    rerank: Option<bool>,
    #[serde(default)]
    mmr_lambda: Option<f32>,
    #[serde(default = "default_true")]
    return_text: bool,
    /// Optional per-query deadline.
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn default_k() -> usize {
    8
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    query_id: QueryId,
    results: Vec<RankedResult>,
}

async fn run_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<Json<QueryResponse>> {
    let engine = state.engine.clone();
    let params = RetrieveParams {
        k: req.k,
        hybrid: req.hybrid,
        rerank: req.rerank.unwrap_or(engine.cfg.rerank),
        mmr_lambda: req.mmr_lambda.unwrap_or(engine.cfg.mmr_lambda),
        return_text: req.return_text,
        filters: req.filters.unwrap_or_default(),
    };
    let ctx = match req.timeout_ms {
        Some(ms) => OpCtx::with_deadline(
            std::time::Instant::now() + std::time::Duration::from_millis(ms),
        ),
        None => OpCtx::new(),
    };
    let outcome =
        run_blocking(move || retrieve(&engine, &req.query, &params, &ctx)).await?;
    Ok(Json(QueryResponse { query_id: outcome.query_id, results: outcome.results }))
}

#[derive(Debug, Deserialize)]
struct RerankRequest {
    query: String,
    candidates: Vec<RerankCandidate>,
    #[serde(default = "default_rerank_top_k")]
    top_k: usize,
}

fn default_rerank_top_k() -> usize {
    10
}

#[derive(Debug, Deserialize)]
struct RerankCandidate {
    id: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct RerankResponse {
    results: Vec<RerankScore>,
}

#[derive(Debug, Serialize)]
struct RerankScore {
    id: String,
    score: f32,
}

async fn rerank_candidates(
    State(state): State<AppState>,
    Json(req): Json<RerankRequest>,
) -> ApiResult<Json<RerankResponse>> {
    if req.query.trim().is_empty() {
        return Err(ServiceError::validation("query", "query must be non-empty").into());
    }
    let mut results: Vec<RerankScore> = req
        .candidates
        .iter()
        .map(|c| RerankScore {
            id: c.id.clone(),
            score: state.engine.cross_encoder.score(&req.query, &c.text),
        })
        .collect();
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    results.truncate(req.top_k);
    Ok(Json(RerankResponse { results }))
}

#[derive(Debug, Serialize)]
struct WhyResponse {
    query_id: QueryId,
    results: Vec<RankedResult>,
}

async fn why(
    State(state): State<AppState>,
    Path(query_id): Path<QueryId>,
) -> ApiResult<Json<WhyResponse>> {
    let engine = state.engine.clone();
    let results =
        run_blocking(move || Ok(engine.open_repo()?.fetch_why(query_id)?.1)).await?;
    Ok(Json(WhyResponse { query_id, results }))
}

#[derive(Debug, Deserialize)]
struct UpsertTagsRequest {
    document_ids: Vec<String>,
    tags: Vec<String>,
}

async fn upsert_tags(
    State(state): State<AppState>,
    Json(req): Json<UpsertTagsRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let engine = state.engine.clone();
    let updated = run_blocking(move || {
        let _write = engine.write_lock.lock();
        let mut repo = engine.open_repo()?;
        let ids: Vec<DocumentId> = req.document_ids.into_iter().map(DocumentId).collect();
        Ok(repo.upsert_tags(&ids, &req.tags)?)
    })
    .await?;
    Ok(Json(json!({ "updated": updated })))
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    #[serde(default)]
    document_ids: Vec<String>,
    #[serde(default)]
    source_ids: Vec<String>,
    #[serde(default)]
    hard: bool,
}

async fn delete(
    State(state): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.document_ids.is_empty() && req.source_ids.is_empty() {
        return Err(ServiceError::validation(
            "document_ids",
            "provide document_ids or source_ids to delete",
        )
        .into());
    }
    let engine = state.engine.clone();
    let hard = req.hard;
    run_blocking(move || {
        let _write = engine.write_lock.lock();
        let mut repo = engine.open_repo()?;
        let mut affected = Vec::new();
        if !req.document_ids.is_empty() {
            let ids: Vec<DocumentId> = req.document_ids.into_iter().map(DocumentId).collect();
            affected.extend(repo.mark_documents_deleted(&ids, hard)?);
        }
        if !req.source_ids.is_empty() {
            let ids: Vec<SourceId> = req.source_ids.into_iter().map(SourceId).collect();
            affected.extend(repo.delete_sources(&ids, hard)?);
        }
        // Hard deletes leave the index too; soft deletes stay down-weighted.
        if hard && !affected.is_empty() {
            engine.index.write().remove(&affected);
        }
        Ok(())
    })
    .await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn export_journal(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let engine = state.engine.clone();
    let journal = run_blocking(move || Ok(engine.open_repo()?.export_journal()?)).await?;
    let entries: Vec<serde_json::Value> = journal
        .into_iter()
        .map(|(query, results)| json!({ "query": query, "results": results }))
        .collect();
    Ok(Json(serde_json::Value::Array(entries)))
}

/// Run blocking store/engine work off the async executor.
async fn run_blocking<T, F>(f: F) -> Result<T, Problem>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(Problem::from),
        Err(join_err) => Err(Problem::from(ServiceError::Config(format!(
            "worker task failed: {join_err}"
        )))),
    }
}
