//! Single-resolution signal: `Promise` (completer) and `Eventual` (observer)
//!
//! The building block for every signal in this crate. A pair is created with
//! [`Promise::new`]; the promise side resolves it exactly once, the eventual
//! side observes it any number of times. Observation works three ways:
//! - state inspection (`is_pending`, `try_value`),
//! - registered callbacks (`on_complete`), which fire on the completing
//!   thread, or inline if the signal already settled,
//! - `await` / blocking waits, driven by stored wakers.
//!
//! Dropping the last `Promise` clone of a pending signal fails it with
//! [`TaskError::Abandoned`], so an observer is never left hanging.

use crate::error::TaskError;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

type Callback<T> = Box<dyn FnOnce(Result<T, TaskError>) + Send>;

enum State<T> {
    Pending {
        wakers: Vec<Waker>,
        callbacks: Vec<Callback<T>>,
    },
    Settled(Result<T, TaskError>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

impl<T> Inner<T> {
    fn new_pending() -> Arc<Self> {
        Arc::new(Inner {
            state: Mutex::new(State::Pending {
                wakers: Vec::new(),
                callbacks: Vec::new(),
            }),
        })
    }

    fn new_settled(result: Result<T, TaskError>) -> Arc<Self> {
        Arc::new(Inner {
            state: Mutex::new(State::Settled(result)),
        })
    }

    /// Transition to settled. Returns false if the signal already settled;
    /// callbacks and wakers run outside the lock, on the winning thread.
    fn settle(&self, result: Result<T, TaskError>) -> bool
    where
        T: Clone,
    {
        let (wakers, callbacks) = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                State::Settled(_) => return false,
                State::Pending { wakers, callbacks } => {
                    let w = std::mem::take(wakers);
                    let c = std::mem::take(callbacks);
                    *state = State::Settled(result.clone());
                    (w, c)
                }
            }
        };
        for cb in callbacks {
            cb(result.clone());
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Failure path of [`settle`] that needs no `T: Clone` (the error clones).
    fn settle_err(&self, err: TaskError) -> bool {
        let (wakers, callbacks) = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                State::Settled(_) => return false,
                State::Pending { wakers, callbacks } => {
                    let w = std::mem::take(wakers);
                    let c = std::mem::take(callbacks);
                    *state = State::Settled(Err(err.clone()));
                    (w, c)
                }
            }
        };
        for cb in callbacks {
            cb(Err(err.clone()));
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

/// Completer side of a signal
///
/// Cloneable; the signal resolves when any clone settles it, and fails with
/// [`TaskError::Abandoned`] when the last clone drops unsettled.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
    guard: Arc<AbandonGuard<T>>,
}

struct AbandonGuard<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Drop for AbandonGuard<T> {
    fn drop(&mut self) {
        self.inner.settle_err(TaskError::Abandoned);
    }
}

impl<T> Promise<T> {
    /// Create a pending signal pair
    pub fn new() -> (Promise<T>, Eventual<T>) {
        let inner = Inner::new_pending();
        let promise = Promise {
            inner: Arc::clone(&inner),
            guard: Arc::new(AbandonGuard {
                inner: Arc::clone(&inner),
            }),
        };
        (promise, Eventual { inner })
    }

    /// Observer handle for this signal
    pub fn eventual(&self) -> Eventual<T> {
        Eventual {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Fail the signal. Returns whether this call settled it.
    pub fn fail(&self, err: TaskError) -> bool {
        self.inner.settle_err(err)
    }
}

impl<T: Clone> Promise<T> {
    /// Settle the signal. Returns whether this call settled it; a signal
    /// settles exactly once and later calls are no-ops returning false.
    pub fn complete(&self, result: Result<T, TaskError>) -> bool {
        self.inner.settle(result)
    }

    /// Shorthand for `complete(Ok(value))`
    pub fn resolve(&self, value: T) -> bool {
        self.inner.settle(Ok(value))
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: Arc::clone(&self.inner),
            guard: Arc::clone(&self.guard),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("pending", &matches!(*self.inner.state.lock().unwrap(), State::Pending { .. }))
            .finish()
    }
}

/// Observer side of a signal
///
/// Cloneable; every clone sees the same resolution. Awaiting yields a clone
/// of the settled value, so result-bearing observers require `T: Clone`.
pub struct Eventual<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Eventual<T> {
    fn clone(&self) -> Self {
        Eventual {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Eventual<T> {
    /// An already-resolved signal
    pub fn ready(value: T) -> Self {
        Eventual {
            inner: Inner::new_settled(Ok(value)),
        }
    }

    /// An already-failed signal
    pub fn failed(err: TaskError) -> Self {
        Eventual {
            inner: Inner::new_settled(Err(err)),
        }
    }

    /// Still unresolved?
    pub fn is_pending(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), State::Pending { .. })
    }

    /// Resolved or failed?
    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    /// Resolved with a value?
    pub fn is_resolved(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), State::Settled(Ok(_)))
    }

    /// Settled with a failure?
    pub fn is_failed(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), State::Settled(Err(_)))
    }
}

impl<T: Clone + Send + 'static> Eventual<T> {
    /// Snapshot of the settled value, if any
    pub fn try_value(&self) -> Option<Result<T, TaskError>> {
        match &*self.inner.state.lock().unwrap() {
            State::Settled(res) => Some(res.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Run `f` with the settled value: inline if already settled, otherwise
    /// on whichever thread settles the signal.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        match &mut *state {
            State::Settled(res) => {
                let res = res.clone();
                drop(state);
                f(res);
            }
            State::Pending { callbacks, .. } => callbacks.push(Box::new(f)),
        }
    }

    /// Derived signal carrying `f` of this signal's value; failures pass
    /// through unchanged.
    pub fn map<U, F>(&self, f: F) -> Eventual<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (promise, mapped) = Promise::new();
        self.on_complete(move |res| {
            promise.complete(res.map(f));
        });
        mapped
    }

    /// Block the calling thread until the signal settles or `deadline`
    /// passes. Returns `None` on timeout.
    ///
    /// Never call this from a task body running on the executor that will
    /// resolve the signal: the single-consumer invariant makes that a
    /// deadlock.
    pub fn wait_deadline(&self, deadline: Instant) -> Option<Result<T, TaskError>> {
        let waker = Waker::from(Arc::new(ThreadUnpark(std::thread::current())));
        loop {
            {
                let mut state = self.inner.state.lock().unwrap();
                match &mut *state {
                    State::Settled(res) => return Some(res.clone()),
                    State::Pending { wakers, .. } => register_waker(wakers, &waker),
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return self.try_value();
            }
            std::thread::park_timeout(deadline - now);
        }
    }

    /// Block the calling thread for at most `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        self.wait_deadline(Instant::now() + timeout)
    }
}

struct ThreadUnpark(std::thread::Thread);

impl std::task::Wake for ThreadUnpark {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

fn register_waker(wakers: &mut Vec<Waker>, waker: &Waker) {
    // One slot per awaiter: refresh an equivalent waker instead of growing
    // the list on every poll.
    for stored in wakers.iter_mut() {
        if stored.will_wake(waker) {
            stored.clone_from(waker);
            return;
        }
    }
    wakers.push(waker.clone());
}

impl<T: Clone + Send + 'static> Future for Eventual<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock().unwrap();
        match &mut *state {
            State::Settled(res) => Poll::Ready(res.clone()),
            State::Pending { wakers, .. } => {
                register_waker(wakers, cx.waker());
                Poll::Pending
            }
        }
    }
}

impl<T> std::fmt::Debug for Eventual<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match &*self.inner.state.lock().unwrap() {
            State::Pending { .. } => "pending",
            State::Settled(Ok(_)) => "resolved",
            State::Settled(Err(_)) => "failed",
        };
        write!(f, "Eventual({label})")
    }
}
