//! Fixed-size worker pool consuming submitted tasks.
//!
//! # Architecture
//!
//! ```text
//!   ingress ──submit──► ArrayQueue<Pooled<Task>> ──pop──► worker 0..N
//!                        (bounded, non-blocking)            │
//!                                                           ▼
//!                                                   Dispatcher::dispatch
//!                                                           │
//!                                                   ResponseSink (MPSC)
//! ```
//!
//! Submission never blocks and never drops silently: a saturated queue
//! returns [`SubmitError::Busy`] with the task, and the caller decides.
//! Idle workers park with a timeout; every submit unparks one worker
//! round-robin.
//!
//! # Guarantees
//!
//! - Tasks may execute in any order relative to submission; the only
//!   cross-request promise (ack before response) is enforced upstream by the
//!   ingress thread.
//! - Handler panics are caught, converted to `-32000` error frames, and
//!   never escape the worker loop.
//! - `stop()` lets the current task finish, drains everything still queued,
//!   then joins. No timeout.
//! - Each worker holds registration guards for the task and frame pools for
//!   its whole lifetime, so releases hit per-thread caches.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::sync::{Parker, Unparker};

use crate::codec::{FrameBuf, CODE_APP_ERROR};
use crate::dispatch::{Dispatcher, ResponseSink, Task};
use crate::stdx::object_pool::{ObjectPool, Pooled};

/// Worker count when nothing is configured: all hardware threads, floor 4.
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
        .max(4)
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub struct WorkerPoolConfig {
    /// Number of worker threads.
    pub workers: usize,

    /// Capacity of the internal task FIFO. Submissions beyond this return
    /// [`SubmitError::Busy`].
    pub queue_cap: usize,

    /// How long an idle worker parks before rechecking the queue.
    pub park_timeout: Duration,
}

impl WorkerPoolConfig {
    /// Validate configuration. Panics on invalid values.
    pub fn validate(&self) {
        assert!(self.workers > 0, "workers must be > 0");
        assert!(self.queue_cap > 0, "queue_cap must be > 0");
        assert!(
            self.park_timeout > Duration::ZERO,
            "park_timeout must be > 0"
        );
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_cap: 1024,
            park_timeout: Duration::from_millis(10),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Submission refusal. Carries the task back so the caller can report an
/// error response and discard it.
pub enum SubmitError {
    Busy(Pooled<Task>),
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy(_) => f.write_str("SubmitError::Busy"),
        }
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy(_) => f.write_str("worker pool busy"),
        }
    }
}

// ============================================================================
// WorkerPool
// ============================================================================

struct Shared {
    queue: ArrayQueue<Pooled<Task>>,
    unparkers: Vec<Unparker>,
    next_unpark: AtomicUsize,
    /// Once set, workers exit as soon as the queue is drained.
    stop: AtomicBool,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the worker threads. Each registers with both pools before its
    /// first task and unregisters on exit.
    pub fn new(
        cfg: WorkerPoolConfig,
        dispatcher: Arc<Dispatcher>,
        sink: ResponseSink,
        task_pool: ObjectPool<Task>,
        frame_pool: ObjectPool<FrameBuf>,
    ) -> Self {
        cfg.validate();

        let mut parkers = Vec::with_capacity(cfg.workers);
        let mut unparkers = Vec::with_capacity(cfg.workers);
        for _ in 0..cfg.workers {
            let parker = Parker::new();
            unparkers.push(parker.unparker().clone());
            parkers.push(parker);
        }

        let shared = Arc::new(Shared {
            queue: ArrayQueue::new(cfg.queue_cap),
            unparkers,
            next_unpark: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        });

        let mut threads = Vec::with_capacity(cfg.workers);
        for (worker_id, parker) in parkers.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let dispatcher = Arc::clone(&dispatcher);
            let sink = sink.clone();
            let task_pool = task_pool.clone();
            let frame_pool = frame_pool.clone();

            let th = thread::Builder::new()
                .name(format!("mediactl-worker-{worker_id}"))
                .spawn(move || {
                    let _task_reg = task_pool.register_thread();
                    let _frame_reg = frame_pool.register_thread();
                    worker_loop(&cfg, &shared, &parker, &dispatcher, &sink);
                })
                .expect("failed to spawn worker thread");
            threads.push(th);
        }

        Self { shared, threads }
    }

    /// Non-blocking submit. On a saturated queue the task comes back in
    /// [`SubmitError::Busy`]; nothing is dropped here.
    pub fn submit(&self, task: Pooled<Task>) -> Result<(), SubmitError> {
        match self.shared.queue.push(task) {
            Ok(()) => {
                self.unpark_one();
                Ok(())
            }
            Err(task) => Err(SubmitError::Busy(task)),
        }
    }

    /// Tasks currently queued (snapshot).
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Signal workers to finish queued work and exit, then join them.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        for unparker in &self.shared.unparkers {
            unparker.unpark();
        }
        for th in self.threads.drain(..) {
            th.join().expect("worker thread panicked outside a task");
        }
    }

    fn unpark_one(&self) {
        let n = self.shared.unparkers.len();
        let idx = self.shared.next_unpark.fetch_add(1, Ordering::Relaxed) % n;
        self.shared.unparkers[idx].unpark();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
        }
    }
}

fn worker_loop(
    cfg: &WorkerPoolConfig,
    shared: &Shared,
    parker: &Parker,
    dispatcher: &Dispatcher,
    sink: &ResponseSink,
) {
    loop {
        if let Some(task) = shared.queue.pop() {
            run_task(dispatcher, sink, task);
            continue;
        }
        // Queue observed empty: exit only if the stop gate is closed, so
        // everything submitted before stop() still runs.
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        parker.park_timeout(cfg.park_timeout);
    }
}

fn run_task(dispatcher: &Dispatcher, sink: &ResponseSink, task: Pooled<Task>) {
    let req_id = task.req_id;
    let result = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(&task, sink)));
    if let Err(payload) = result {
        let _ = sink.error(
            req_id as i64,
            CODE_APP_ERROR,
            &format!("Handler panicked: {}", panic_message(payload.as_ref())),
        );
    }
    // Dropping the task releases its pool record and frees the frame.
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

// ============================================================================
// Tests
// ============================================================================
