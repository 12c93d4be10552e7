//! Bounded worker pool with a priority queue and per-job cancellation.
//!
//! Tasks order by priority (high > normal > low) and FIFO within one
//! priority. The queue has a soft cap: `submit` reports saturation and the
//! watcher coalesces further events for the same path instead of queueing
//! duplicates.

use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use context_model::{JobId, SourceId, SourceRecord};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::OpCtx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    /// Ingest the given paths per source (the whole source when its path
    /// list is empty).
    Ingest { work: Vec<(SourceRecord, Vec<PathBuf>)> },
    /// A watched file disappeared.
    Delete { source_id: SourceId, path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct Task {
    pub job_id: Option<JobId>,
    pub kind: TaskKind,
    pub priority: Priority,
}

struct QueuedTask {
    priority: Priority,
    seq: u64,
    task: Task,
    cancel: Arc<AtomicBool>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedTask {}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: highest priority first, then lowest sequence (FIFO).
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

type Runner = dyn Fn(Task, OpCtx) + Send + Sync;

struct Inner {
    queue: Mutex<BinaryHeap<QueuedTask>>,
    available: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
    soft_cap: usize,
    cancels: Mutex<HashMap<JobId, Arc<AtomicBool>>>,
    runner: Box<Runner>,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new<F>(workers: usize, soft_cap: usize, runner: F) -> Arc<Self>
    where
        F: Fn(Task, OpCtx) + Send + Sync + 'static,
    {
        let inner = Arc::new(Inner {
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            soft_cap,
            cancels: Mutex::new(HashMap::new()),
            runner: Box::new(runner),
        });

        let workers = workers.max(1);
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let inner = inner.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("ingest-worker-{worker_id}"))
                    .spawn(move || worker_loop(inner))
                    .expect("spawn ingest worker"),
            );
        }
        info!(workers, soft_cap, "scheduler started");
        Arc::new(Self { inner, workers: Mutex::new(handles) })
    }

    /// Enqueue a task. Returns `false` (task still accepted) once the queue
    /// has grown past its soft cap, signalling callers to coalesce.
    pub fn submit(&self, task: Task) -> bool {
        let cancel = Arc::new(AtomicBool::new(false));
        if let Some(job_id) = &task.job_id {
            self.inner.cancels.lock().insert(job_id.clone(), cancel.clone());
        }
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.inner.queue.lock();
        queue.push(QueuedTask { priority: task.priority, seq, task, cancel });
        let under_cap = queue.len() <= self.inner.soft_cap;
        drop(queue);
        self.inner.available.notify_one();
        under_cap
    }

    /// Flag a job for cancellation, whether queued or already running.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        match self.inner.cancels.lock().get(job_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                debug!(job = %job_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_saturated(&self) -> bool {
        self.queue_len() > self.inner.soft_cap
    }

    /// Stop accepting work and join the workers after the queue drains.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.available.notify_all();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let queued = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(t) = queue.pop() {
                    break t;
                }
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                inner.available.wait(&mut queue);
            }
        };
        let ctx = OpCtx::from_flag(queued.cancel.clone());
        (inner.runner)(queued.task.clone(), ctx);
        if let Some(job_id) = &queued.task.job_id {
            inner.cancels.lock().remove(job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn source() -> SourceRecord {
        SourceRecord {
            id: SourceId("s".into()),
            kind: context_model::SourceKind::Folder,
            uri: "/tmp".into(),
            label: None,
            include_glob: None,
            exclude_glob: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn task(job: &str, priority: Priority) -> Task {
        Task {
            job_id: Some(JobId(job.to_string())),
            kind: TaskKind::Ingest { work: vec![(source(), Vec::new())] },
            priority,
        }
    }

    #[test]
    fn priorities_run_before_later_lower_ones() {
        let order = Arc::new(Mutex::new(Vec::<String>::new()));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);

        let order_for_runner = order.clone();
        let scheduler = Scheduler::new(1, 100, move |task, _ctx| {
            // First task blocks until every other task is queued.
            let mut log = order_for_runner.lock();
            if log.is_empty() {
                drop(log);
                gate_rx.lock().recv().expect("gate");
                log = order_for_runner.lock();
            }
            log.push(task.job_id.unwrap().0);
        });

        scheduler.submit(task("first", Priority::Normal));
        // Give the worker time to pick up "first" before queueing the rest.
        std::thread::sleep(std::time::Duration::from_millis(50));
        scheduler.submit(task("low", Priority::Low));
        scheduler.submit(task("normal-a", Priority::Normal));
        scheduler.submit(task("high", Priority::High));
        scheduler.submit(task("normal-b", Priority::Normal));
        gate_tx.send(()).expect("open gate");

        scheduler.shutdown();
        let log = order.lock().clone();
        assert_eq!(log, vec!["first", "high", "normal-a", "normal-b", "low"]);
    }

    #[test]
    fn cancel_reaches_the_running_context() {
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (seen_tx, seen_rx) = mpsc::channel::<bool>();
        let started_tx = Mutex::new(started_tx);
        let seen_tx = Mutex::new(seen_tx);

        let scheduler = Scheduler::new(1, 100, move |_task, ctx| {
            started_tx.lock().send(()).expect("started");
            while !ctx.is_cancelled() {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            seen_tx.lock().send(true).expect("seen");
        });

        scheduler.submit(task("job-c", Priority::Normal));
        started_rx.recv().expect("task started");
        assert!(scheduler.cancel(&JobId("job-c".into())));
        assert!(seen_rx.recv_timeout(std::time::Duration::from_secs(5)).expect("cancelled"));
        scheduler.shutdown();
        // After completion the handle is gone.
        assert!(!scheduler.cancel(&JobId("job-c".into())));
    }

    #[test]
    fn soft_cap_reports_saturation() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let scheduler = Scheduler::new(1, 2, move |_task, _ctx| {
            gate_rx.lock().recv().ok();
        });
        assert!(scheduler.submit(task("a", Priority::Normal)));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(scheduler.submit(task("b", Priority::Normal)));
        assert!(scheduler.submit(task("c", Priority::Normal)));
        // Queue now holds more than the cap while "a" blocks the worker.
        assert!(!scheduler.submit(task("d", Priority::Normal)));
        assert!(scheduler.is_saturated());
        for _ in 0..4 {
            gate_tx.send(()).ok();
        }
        scheduler.shutdown();
    }
}
