//! Filesystem watching for folder sources.
//!
//! Events are debounced (one quiet window per write burst), filtered through
//! the source's include/exclude globs, and handed to a sink that turns them
//! into scheduler tasks. While the scheduler queue is past its soft cap,
//! events coalesce per path instead of piling up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use context_model::{SourceId, SourceKind, SourceRecord};
use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::pipeline::build_glob;
use crate::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Upsert,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub source: SourceRecord,
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

pub type EventSink = Arc<dyn Fn(WatchEvent) + Send + Sync>;
pub type SaturationProbe = Arc<dyn Fn() -> bool + Send + Sync>;

type DebouncerHandle = notify_debouncer_full::Debouncer<
    notify::RecommendedWatcher,
    notify_debouncer_full::RecommendedCache,
>;

pub struct WatchManager {
    debounce_ms: u64,
    sink: EventSink,
    saturated: SaturationProbe,
    pending: Arc<Mutex<HashMap<(SourceId, PathBuf), WatchEvent>>>,
    watchers: Mutex<HashMap<SourceId, DebouncerHandle>>,
}

impl WatchManager {
    pub fn new(debounce_ms: u64, sink: EventSink, saturated: SaturationProbe) -> Self {
        Self {
            debounce_ms,
            sink,
            saturated,
            pending: Arc::new(Mutex::new(HashMap::new())),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Start observing one folder source. Non-folder sources are ignored.
    pub fn start_watching(&self, source: &SourceRecord) -> Result<(), ServiceError> {
        if source.kind != SourceKind::Folder {
            return Ok(());
        }
        if self.watchers.lock().contains_key(&source.id) {
            return Ok(());
        }

        let root = PathBuf::from(&source.uri);
        let include = build_glob(source.include_glob.as_deref());
        let exclude = build_glob(source.exclude_glob.as_deref());
        let sink = self.sink.clone();
        let saturated = self.saturated.clone();
        let pending = self.pending.clone();
        let src = source.clone();
        let watch_root = root.clone();

        let mut debouncer = new_debouncer(
            Duration::from_millis(self.debounce_ms),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    // Last event kind wins per path within one burst.
                    let mut latest: HashMap<PathBuf, WatchEventKind> = HashMap::new();
                    for event in &events {
                        let Some(kind) = classify(event) else { continue };
                        for path in &event.paths {
                            latest.insert(path.clone(), kind);
                        }
                    }
                    for (path, kind) in latest {
                        let rel = path.strip_prefix(&watch_root).unwrap_or(&path);
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
                        dispatch(
                            WatchEvent { source: src.clone(), path, kind },
                            &sink,
                            &saturated,
                            &pending,
                        );
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!(error = ?e, "file watcher error");
                    }
                }
            },
        )
        .map_err(|e| ServiceError::Config(format!("watcher init failed: {e}")))?;

        debouncer
            .watch(root.as_path(), RecursiveMode::Recursive)
            .map_err(|e| ServiceError::Config(format!("watch {} failed: {e}", root.display())))?;

        self.watchers.lock().insert(source.id.clone(), debouncer);
        info!(source = %source.id, path = %root.display(), debounce_ms = self.debounce_ms, "watching source");
        Ok(())
    }

    pub fn stop_watching(&self, source_id: &SourceId) {
        if self.watchers.lock().remove(source_id).is_some() {
            info!(source = %source_id, "stopped watching source");
        }
    }

    pub fn is_watching(&self, source_id: &SourceId) -> bool {
        self.watchers.lock().contains_key(source_id)
    }
}

/// Deliver now, or coalesce per path while the scheduler is saturated.
fn dispatch(
    event: WatchEvent,
    sink: &EventSink,
    saturated: &SaturationProbe,
    pending: &Arc<Mutex<HashMap<(SourceId, PathBuf), WatchEvent>>>,
) {
    if saturated() {
        pending
            .lock()
            .insert((event.source.id.clone(), event.path.clone()), event);
        return;
    }
    // Capacity is back: flush anything that was held, newest state wins.
    let held: Vec<WatchEvent> = pending.lock().drain().map(|(_, e)| e).collect();
    for e in held {
        sink(e);
    }
    sink(event);
}

fn classify(event: &DebouncedEvent) -> Option<WatchEventKind> {
    use notify::EventKind;
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => Some(WatchEventKind::Upsert),
        EventKind::Remove(_) => Some(WatchEventKind::Delete),
        _ => None,
    }
}

/// Compare the current filesystem state of a source against the last-seen
/// `(external_id, mtime, size)` rows and produce the catch-up events: new or
/// changed paths upsert, vanished paths delete.
pub fn reconcile_events(
    source: &SourceRecord,
    on_disk: &[(PathBuf, Option<i64>, Option<i64>)],
    last_seen: &[(String, Option<i64>, Option<i64>)],
) -> Vec<WatchEvent> {
    let seen: HashMap<&str, (Option<i64>, Option<i64>)> =
        last_seen.iter().map(|(p, m, s)| (p.as_str(), (*m, *s))).collect();

    let mut events = Vec::new();
    for (path, mtime, size) in on_disk {
        let key = path.to_string_lossy();
        match seen.get(key.as_ref()) {
            Some((seen_mtime, seen_size)) if *seen_mtime == *mtime && *seen_size == *size => {}
            _ => events.push(WatchEvent {
                source: source.clone(),
                path: path.clone(),
                kind: WatchEventKind::Upsert,
            }),
        }
    }

    let on_disk_keys: std::collections::HashSet<String> =
        on_disk.iter().map(|(p, _, _)| p.to_string_lossy().to_string()).collect();
    for (external_id, _, _) in last_seen {
        if !on_disk_keys.contains(external_id) {
            events.push(WatchEvent {
                source: source.clone(),
                path: PathBuf::from(external_id),
                kind: WatchEventKind::Delete,
            });
        }
    }
    events
}

/// Walk the source folder and stamp each file, feeding [`reconcile_events`].
pub fn scan_source(source: &SourceRecord) -> Vec<(PathBuf, Option<i64>, Option<i64>)> {
    crate::pipeline::collect_source_paths(source)
        .into_iter()
        .map(|path| {
            let (mtime, size) = stamp(&path);
            (path, mtime, size)
        })
        .collect()
}

fn stamp(path: &Path) -> (Option<i64>, Option<i64>) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn source() -> SourceRecord {
        SourceRecord {
            id: SourceId("src".into()),
            kind: SourceKind::Folder,
            uri: "/vault".into(),
            label: None,
            include_glob: None,
            exclude_glob: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn reconcile_flags_new_changed_and_vanished_paths() {
        let src = source();
        let on_disk = vec![
            (PathBuf::from("/vault/same.md"), Some(100), Some(10)),
            (PathBuf::from("/vault/touched.md"), Some(200), Some(20)),
            (PathBuf::from("/vault/new.md"), Some(300), Some(30)),
        ];
        let last_seen = vec![
            ("/vault/same.md".to_string(), Some(100), Some(10)),
            ("/vault/touched.md".to_string(), Some(150), Some(20)),
            ("/vault/gone.md".to_string(), Some(50), Some(5)),
        ];
        let events = reconcile_events(&src, &on_disk, &last_seen);
        let upserts: Vec<_> = events
            .iter()
            .filter(|e| e.kind == WatchEventKind::Upsert)
            .map(|e| e.path.clone())
            .collect();
        let deletes: Vec<_> = events
            .iter()
            .filter(|e| e.kind == WatchEventKind::Delete)
            .map(|e| e.path.clone())
            .collect();
        assert_eq!(upserts, vec![PathBuf::from("/vault/touched.md"), PathBuf::from("/vault/new.md")]);
        assert_eq!(deletes, vec![PathBuf::from("/vault/gone.md")]);
    }

    #[test]
    fn saturation_coalesces_per_path_until_capacity_returns() {
        let delivered = Arc::new(Mutex::new(Vec::<PathBuf>::new()));
        let saturated_flag = Arc::new(AtomicBool::new(true));
        let pending = Arc::new(Mutex::new(HashMap::new()));

        let delivered_sink = delivered.clone();
        let sink: EventSink = Arc::new(move |e: WatchEvent| delivered_sink.lock().push(e.path));
        let flag = saturated_flag.clone();
        let probe: SaturationProbe = Arc::new(move || flag.load(Ordering::SeqCst));

        let ev = |p: &str| WatchEvent {
            source: source(),
            path: PathBuf::from(p),
            kind: WatchEventKind::Upsert,
        };
        // Saturated: both events for one path collapse into one held entry.
        dispatch(ev("/vault/a.md"), &sink, &probe, &pending);
        dispatch(ev("/vault/a.md"), &sink, &probe, &pending);
        dispatch(ev("/vault/b.md"), &sink, &probe, &pending);
        assert!(delivered.lock().is_empty());
        assert_eq!(pending.lock().len(), 2);

        // Capacity returns: the next event flushes everything held.
        saturated_flag.store(false, Ordering::SeqCst);
        dispatch(ev("/vault/c.md"), &sink, &probe, &pending);
        let got = delivered.lock().clone();
        assert_eq!(got.len(), 3);
        assert!(pending.lock().is_empty());
        assert_eq!(got.last(), Some(&PathBuf::from("/vault/c.md")));
    }
}
