//! Dispatcher contract and implementations
//!
//! The executor schedules its work loop through this seam: "submit a
//! runnable for eventual execution on some thread", nothing more. No
//! ordering is assumed across submissions, and the executor submits at most
//! one activation at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A unit of scheduling: one work-loop activation
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Anything that can run a job on some thread, eventually
pub trait Dispatcher: Send + Sync + 'static {
    /// Submit a runnable for eventual execution. A dispatcher that cannot
    /// schedule should panic: the executor treats scheduling failure as
    /// fatal and makes no recovery attempt.
    fn execute(&self, job: Job);
}

/// Production dispatcher backed by a tokio runtime handle
pub struct TokioDispatcher {
    handle: tokio::runtime::Handle,
}

impl TokioDispatcher {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        TokioDispatcher { handle }
    }

    /// Bind the ambient runtime
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime context.
    pub fn current() -> Self {
        TokioDispatcher {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl Dispatcher for TokioDispatcher {
    fn execute(&self, job: Job) {
        self.handle.spawn(async move { job() });
    }
}

impl std::fmt::Debug for TokioDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioDispatcher").finish()
    }
}

/// Deterministic dispatcher: jobs queue until the caller runs them
///
/// Single-steps the executor for tests and other environments that want full
/// control over when activations happen.
#[derive(Default)]
pub struct ManualDispatcher {
    queue: Mutex<VecDeque<Job>>,
    submitted: AtomicUsize,
}

impl ManualDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs currently waiting to run
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Total jobs ever submitted
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Run the oldest waiting job, if any. The queue lock is released while
    /// the job runs, so jobs may re-submit.
    pub fn run_next(&self) -> bool {
        let job = self.queue.lock().unwrap().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run jobs (including ones submitted while running) until the queue is
    /// empty. Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }
}

impl Dispatcher for ManualDispatcher {
    fn execute(&self, job: Job) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().unwrap().push_back(job);
    }
}

impl std::fmt::Debug for ManualDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualDispatcher")
            .field("pending", &self.pending())
            .field("submitted", &self.submitted())
            .finish()
    }
}
