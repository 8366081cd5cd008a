//! Uniform handle for one unit of queued work
//!
//! Every submission collapses to one tagged variant over completion shape
//! (sync / future / staged) crossed with submission mode (fire-and-forget /
//! result-bearing). The façade wires result signals and panic capture into
//! the body closure when it builds the variant, so by the time the work loop
//! calls [`Work::run`] the body cannot unwind for non-fatal failures and the
//! loop only needs to know whether a child is left in flight.

use crate::promise::{Eventual, Promise};

pub(crate) type SyncBody = Box<dyn FnOnce() + Send + 'static>;
pub(crate) type AsyncBody = Box<dyn FnOnce() -> Eventual<()> + Send + 'static>;

/// One queued task: acceptance signal plus tagged body
pub(crate) struct Work {
    /// Resolved exactly once when the task enters the admitted window.
    /// Never carries a task-body failure: acceptance means the executor has
    /// taken the job, independent of whether the job later fails.
    pub(crate) accept: Promise<()>,
    pub(crate) kind: WorkKind,
}

/// Completion shape crossed with submission mode
pub(crate) enum WorkKind {
    /// Sync thunk, nothing reported back
    DetachedSync(SyncBody),
    /// Sync thunk resolving a result signal
    ResultSync(SyncBody),
    /// Sync thunk resolving the result stage of a staged handle
    StagedSync(SyncBody),
    /// Future-returning thunk, result ignored; the returned hold settles
    /// when the child does and frees the slot
    DetachedAsync(AsyncBody),
    /// Future-returning thunk piped into a result signal
    ResultAsync(AsyncBody),
    /// Staged-returning thunk; the hold settles on downstream *acceptance*,
    /// propagating backpressure through chained executors
    Chained(AsyncBody),
}

impl Work {
    /// Execute the body. `Some` carries the in-flight hold that keeps the
    /// task's window slot occupied until it settles.
    pub(crate) fn run(self) -> Option<Eventual<()>> {
        match self.kind {
            WorkKind::DetachedSync(body)
            | WorkKind::ResultSync(body)
            | WorkKind::StagedSync(body) => {
                body();
                None
            }
            WorkKind::DetachedAsync(body)
            | WorkKind::ResultAsync(body)
            | WorkKind::Chained(body) => Some(body()),
        }
    }
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            WorkKind::DetachedSync(_) => "detached-sync",
            WorkKind::ResultSync(_) => "result-sync",
            WorkKind::StagedSync(_) => "staged-sync",
            WorkKind::DetachedAsync(_) => "detached-async",
            WorkKind::ResultAsync(_) => "result-async",
            WorkKind::Chained(_) => "chained",
        };
        f.debug_struct("Work").field("kind", &kind).finish()
    }
}
