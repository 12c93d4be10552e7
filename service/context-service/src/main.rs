use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use context_model::{IngestJobRecord, IngestStats, JobId, JobStatus, SourceKind};
use context_service::config::ServiceConfig;
use context_service::engine::Engine;
use context_service::pipeline;
use context_service::scheduler::{Priority, Scheduler, Task, TaskKind};
use context_service::server::{create_app, AppState};
use context_service::watcher::{
    reconcile_events, scan_source, EventSink, SaturationProbe, WatchEvent, WatchEventKind,
    WatchManager,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "context_service=info,tower_http=info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).compact().init();

    let cfg = ServiceConfig::load()?;
    let addr: SocketAddr = cfg.listen_addr().parse()?;
    info!(
        db_path = %cfg.db_path.display(),
        listen_addr = %cfg.listen_addr(),
        workers = cfg.effective_workers(),
        backend = %cfg.vectors.backend,
        "context cache starting"
    );

    let engine = Engine::new(cfg.clone())?;

    let runner_engine = engine.clone();
    let scheduler = Scheduler::new(
        cfg.effective_workers(),
        cfg.queue_soft_cap,
        move |task: Task, ctx| match task.kind {
            TaskKind::Ingest { work } => {
                let job_id = task.job_id.unwrap_or_else(|| JobId(uuid::Uuid::new_v4().to_string()));
                pipeline::run_job(&runner_engine, &job_id, &work, &ctx);
            }
            TaskKind::Delete { source_id, path } => {
                if let Err(e) = pipeline::delete_path(&runner_engine, &source_id, &path) {
                    error!(path = %path.display(), error = %e, "delete task failed");
                }
            }
        },
    );

    let watcher = if cfg.watch.enabled {
        let sink_engine = engine.clone();
        let sink_scheduler = scheduler.clone();
        let sink: EventSink = Arc::new(move |event: WatchEvent| {
            enqueue_watch_event(&sink_engine, &sink_scheduler, event)
        });
        let probe_scheduler = scheduler.clone();
        let probe: SaturationProbe = Arc::new(move || probe_scheduler.is_saturated());
        Some(Arc::new(WatchManager::new(cfg.watch.debounce_ms, sink, probe)))
    } else {
        None
    };

    let state = AppState { engine: engine.clone(), scheduler: scheduler.clone(), watcher: watcher.clone() };
    let app = create_app(state);

    // Serve first so /health answers while watchers warm up in the
    // background.
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    if let Some(watcher) = watcher.clone() {
        let sweep_engine = engine.clone();
        let sweep_scheduler = scheduler.clone();
        tokio::task::spawn_blocking(move || {
            restore_watchers_and_reconcile(&sweep_engine, &sweep_scheduler, &watcher)
        });
    }

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    scheduler.shutdown();
    engine.save_index();
    info!("context cache shut down");
    Ok(())
}

/// Turn a watcher event into scheduler work: upserts become single-path
/// ingest jobs, removals become delete tasks.
fn enqueue_watch_event(engine: &Arc<Engine>, scheduler: &Arc<Scheduler>, event: WatchEvent) {
    match event.kind {
        WatchEventKind::Upsert => {
            let job = IngestJobRecord {
                id: JobId(uuid::Uuid::new_v4().to_string()),
                source_id: Some(event.source.id.clone()),
                status: JobStatus::Queued,
                started_at: context_store::sqlite_repo::SqliteRepo::now(),
                finished_at: None,
                stats: IngestStats::default(),
            };
            match engine.open_repo().and_then(|repo| Ok(repo.insert_job(&job)?)) {
                Ok(()) => {
                    scheduler.submit(Task {
                        job_id: Some(job.id),
                        kind: TaskKind::Ingest {
                            work: vec![(event.source, vec![event.path])],
                        },
                        priority: Priority::Normal,
                    });
                }
                Err(e) => warn!(error = %e, "could not record watch-triggered job"),
            }
        }
        WatchEventKind::Delete => {
            scheduler.submit(Task {
                job_id: None,
                kind: TaskKind::Delete { source_id: event.source.id, path: event.path },
                priority: Priority::Normal,
            });
        }
    }
}

/// On startup: watch every folder source and run the reconciliation sweep,
/// catching changes made while the service was offline.
fn restore_watchers_and_reconcile(
    engine: &Arc<Engine>,
    scheduler: &Arc<Scheduler>,
    watcher: &Arc<WatchManager>,
) {
    let sources = match engine.open_repo().and_then(|repo| Ok(repo.list_sources()?)) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "could not list sources for watcher restore");
            return;
        }
    };
    for source in sources.iter().filter(|s| s.kind == SourceKind::Folder) {
        if let Err(e) = watcher.start_watching(source) {
            warn!(source = %source.id, error = %e, "could not watch source");
        }
        let last_seen = match engine.open_repo().and_then(|repo| Ok(repo.last_seen_files(&source.id)?)) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(source = %source.id, error = %e, "could not load last-seen state");
                continue;
            }
        };
        let on_disk = scan_source(source);
        let events = reconcile_events(source, &on_disk, &last_seen);
        if !events.is_empty() {
            info!(source = %source.id, events = events.len(), "reconciliation sweep enqueued work");
        }
        for event in events {
            enqueue_watch_event(engine, scheduler, event);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received terminate signal, shutting down"); },
    }
}
