//! The sequential executor: cooperative work loop plus submission façade
//!
//! One logical consumer drains the intake in admission order. The loop is
//! activated through the dispatcher in exactly three situations (the
//! empty-to-non-empty transition, the fairness yield after a batch, and the
//! resume after a backpressure suspension), and each activation observes the
//! previous one's hand-off, so at most one activation runs at a time and no
//! two task bodies ever overlap.

use crate::dispatch::Dispatcher;
use crate::error::{panic_message, TaskError};
use crate::intake::{Intake, Node};
use crate::promise::{Eventual, Promise};
use crate::staged::Staged;
use crate::work::{Work, WorkKind};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Nodes processed per activation before the loop yields the dispatcher
/// back, so other runnables sharing it cannot starve.
const YIELD_BATCH: u32 = 200;

/// Loop state handed across activations
#[derive(Default)]
struct Carry {
    /// Holds for started-but-unsettled children; each occupies one window
    /// slot until it settles.
    in_flight: Vec<Eventual<()>>,
}

struct Core {
    intake: Intake,
    dispatcher: Arc<dyn Dispatcher>,
    carry: Mutex<Carry>,
}

/// Serializes submitted work onto a single logical worker, admitting at
/// most `buf_len` tasks (running, queued, or in flight) at a time
///
/// Submission never blocks: when the admitted window is full the caller
/// gets a pending acceptance signal instead. Handles are cheap clones of
/// one shared executor.
///
/// Task bodies must not submit to their own executor and then synchronously
/// wait on the result; the single-consumer invariant makes that a deadlock.
pub struct SerialExecutor {
    core: Arc<Core>,
}

impl Clone for SerialExecutor {
    fn clone(&self) -> Self {
        SerialExecutor {
            core: Arc::clone(&self.core),
        }
    }
}

impl SerialExecutor {
    /// Create an executor with an admitted window of `buf_len` slots,
    /// scheduling its work loop on `dispatcher`.
    ///
    /// # Panics
    /// Panics if `buf_len < 1`.
    pub fn new(buf_len: usize, dispatcher: Arc<dyn Dispatcher>) -> Self {
        SerialExecutor {
            core: Arc::new(Core {
                intake: Intake::new(buf_len),
                dispatcher,
                carry: Mutex::new(Carry::default()),
            }),
        }
    }

    /// Executor scheduled on the ambient tokio runtime
    ///
    /// # Panics
    /// Panics if `buf_len < 1` or when called outside a tokio runtime.
    pub fn tokio(buf_len: usize) -> Self {
        Self::new(buf_len, Arc::new(crate::dispatch::TokioDispatcher::current()))
    }

    /// Admitted-window capacity
    pub fn buf_len(&self) -> usize {
        self.core.intake.buf_len()
    }

    /// Snapshot of currently occupied window slots
    pub fn admitted_len(&self) -> usize {
        self.core.intake.admitted_len()
    }

    fn submit(&self, work: Work) -> bool {
        let push = self.core.intake.push(work);
        if push.activate {
            Core::activate(&self.core);
        }
        push.accepted
    }

    /// Fire-and-forget sync submission. The returned signal resolves when
    /// the task is admitted; a panicking body is captured and dropped.
    pub fn enqueue<F>(&self, body: F) -> Eventual<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let (accept, accepted) = Promise::new();
        let kind = WorkKind::DetachedSync(Box::new(move || {
            let _ = catch_unwind(AssertUnwindSafe(body));
        }));
        self.submit(Work { accept, kind });
        accepted
    }

    /// Sync submission observing the result. Acceptance stays internal;
    /// the caller sees only the eventual value (or captured panic).
    pub fn enqueue_result<T, F>(&self, body: F) -> Eventual<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (accept, _accepted) = Promise::new();
        let (complete, result) = Promise::new();
        let kind = WorkKind::ResultSync(Box::new(move || {
            match catch_unwind(AssertUnwindSafe(body)) {
                Ok(value) => {
                    complete.resolve(value);
                }
                Err(payload) => {
                    complete.fail(TaskError::Panicked(panic_message(&*payload)));
                }
            }
        }));
        self.submit(Work { accept, kind });
        result
    }

    /// Sync submission observing both stages: acceptance resolves on
    /// admission into this executor, the result when the body runs.
    pub fn enqueue_staged<T, F>(&self, body: F) -> Staged<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (accept, complete, staged) = Staged::channel();
        let kind = WorkKind::StagedSync(Box::new(move || {
            match catch_unwind(AssertUnwindSafe(body)) {
                Ok(value) => {
                    complete.resolve(value);
                }
                Err(payload) => {
                    complete.fail(TaskError::Panicked(panic_message(&*payload)));
                }
            }
        }));
        self.submit(Work { accept, kind });
        staged
    }

    /// Fire-and-forget async submission. The body's returned signal keeps
    /// the window slot occupied until it settles; its outcome is dropped.
    pub fn enqueue_async<F>(&self, body: F) -> Eventual<()>
    where
        F: FnOnce() -> Eventual<()> + Send + 'static,
    {
        let (accept, accepted) = Promise::new();
        let kind = WorkKind::DetachedAsync(Box::new(move || {
            match catch_unwind(AssertUnwindSafe(body)) {
                Ok(child) => child,
                // Failed before producing a child: the slot frees at once.
                Err(_) => Eventual::ready(()),
            }
        }));
        self.submit(Work { accept, kind });
        accepted
    }

    /// Async submission observing the result. The slot frees when the
    /// child settles, success or failure.
    pub fn enqueue_async_result<T, F>(&self, body: F) -> Eventual<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Eventual<T> + Send + 'static,
    {
        let (accept, _accepted) = Promise::new();
        let (complete, result) = Promise::new();
        let kind = WorkKind::ResultAsync(Box::new(move || {
            match catch_unwind(AssertUnwindSafe(body)) {
                Ok(child) => {
                    let (hold, held) = Promise::new();
                    child.on_complete(move |res| {
                        complete.complete(res);
                        hold.resolve(());
                    });
                    held
                }
                Err(payload) => {
                    complete.fail(TaskError::Panicked(panic_message(&*payload)));
                    Eventual::ready(())
                }
            }
        }));
        self.submit(Work { accept, kind });
        result
    }

    /// Staged submission for executor chains. The returned handle's
    /// acceptance is the *downstream* acceptance, so a caller awaits
    /// "admitted end-to-end"; this executor's slot also frees on downstream
    /// acceptance, which is what carries backpressure through the chain.
    pub fn enqueue_chained<T, F>(&self, body: F) -> Staged<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Staged<T> + Send + 'static,
    {
        let (accept, _local) = Promise::new();
        let (outer_accept, outer_complete, staged) = Staged::channel();
        let kind = WorkKind::Chained(Box::new(move || {
            match catch_unwind(AssertUnwindSafe(body)) {
                Ok(inner) => {
                    let (hold, held) = Promise::new();
                    inner.on_accept(move |res| {
                        outer_accept.complete(res);
                        hold.resolve(());
                    });
                    inner.on_complete(move |res| {
                        outer_complete.complete(res);
                    });
                    held
                }
                Err(payload) => {
                    // Channel coupling fails the result stage alongside.
                    outer_accept.fail(TaskError::Panicked(panic_message(&*payload)));
                    Eventual::ready(())
                }
            }
        }));
        self.submit(Work { accept, kind });
        staged
    }
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("buf_len", &self.buf_len())
            .field("admitted_len", &self.admitted_len())
            .finish()
    }
}

impl Core {
    /// Submit one work-loop activation
    fn activate(core: &Arc<Core>) {
        let this = Arc::clone(core);
        core.dispatcher.execute(Box::new(move || this.run()));
    }

    /// One activation of the work loop
    fn run(self: Arc<Core>) {
        let mut carry = std::mem::take(&mut *self.carry.lock().unwrap());
        let mut cursor = self.intake.head();
        debug_assert!(!cursor.is_null(), "activation against an idle queue");
        if cursor.is_null() {
            *self.carry.lock().unwrap() = carry;
            return;
        }
        // Credit children that settled while the loop was parked.
        self.compact(&mut carry, cursor);

        let mut budget = YIELD_BATCH;
        loop {
            // SAFETY: cursor is the published head and this loop is the
            // single consumer.
            let seq = unsafe { self.intake.seq_of(cursor) };
            if !self.intake.is_admitted(seq) {
                self.compact(&mut carry, cursor);
                if !unsafe { self.intake.admit(cursor) } {
                    Core::suspend(&self, carry);
                    return;
                }
            }

            // Admission may have been effected by a helper whose hands
            // never held this node; make sure the signal fired.
            unsafe { self.intake.ensure_accept(cursor) };
            let work = unsafe { self.intake.take_work(cursor) }.expect("node executed twice");
            match work.run() {
                None => unsafe { self.intake.advance_admitted(1, cursor) },
                Some(hold) => {
                    carry.in_flight.push(hold);
                    self.compact(&mut carry, cursor);
                }
            }

            loop {
                let next = unsafe { self.intake.next_of(cursor) };
                if !next.is_null() {
                    unsafe { self.intake.step_head(cursor, next) };
                    cursor = next;
                    break;
                }
                // Possible tail. The carry is stashed before the close CAS:
                // the moment the queue reads empty, a producer may restart
                // the loop on another thread.
                *self.carry.lock().unwrap() = carry;
                if unsafe { self.intake.try_close(cursor) } {
                    return;
                }
                // A producer won the tail but has not published `next` yet.
                carry = std::mem::take(&mut *self.carry.lock().unwrap());
                self.intake.park_for_publish();
            }

            budget -= 1;
            if budget == 0 {
                // Fairness yield: let the dispatcher interleave other work,
                // then pick up at the current head.
                *self.carry.lock().unwrap() = carry;
                Core::activate(&self);
                return;
            }
        }
    }

    /// Drop settled holds and credit their slots back to the window
    fn compact(&self, carry: &mut Carry, anchor: *mut Node) {
        let before = carry.in_flight.len();
        carry.in_flight.retain(|hold| hold.is_pending());
        let freed = before - carry.in_flight.len();
        if freed > 0 {
            // SAFETY: anchor is the loop cursor; see advance_admitted.
            unsafe { self.intake.advance_admitted(freed, anchor) };
        }
    }

    /// Window full, nothing compacted: park until the first child settles.
    /// The carry is stashed before registering, because a child may settle
    /// during registration (or may have settled since the compaction) and
    /// re-activate immediately.
    fn suspend(core: &Arc<Core>, carry: Carry) {
        let waiters: Vec<Eventual<()>> = carry.in_flight.clone();
        assert!(
            !waiters.is_empty(),
            "admitted window full with nothing in flight"
        );
        *core.carry.lock().unwrap() = carry;

        let resumed = Arc::new(AtomicBool::new(false));
        for hold in waiters {
            let resumed = Arc::clone(&resumed);
            let core = Arc::clone(core);
            hold.on_complete(move |_| {
                if !resumed.swap(true, Ordering::AcqRel) {
                    Core::activate(&core);
                }
            });
        }
    }
}
