//! Two-stage async value: acceptance, then result
//!
//! A [`Staged`] value separates "the downstream system has taken the job"
//! from "the job produced its value". The acceptance stage is the
//! backpressure vehicle: an executor handing out a `Staged` resolves
//! acceptance as soon as the work is admitted into its bounded window, long
//! before the result exists. Chaining executors couples the stages so a
//! caller can await "admitted end-to-end".

use crate::error::TaskError;
use crate::promise::{Eventual, Promise};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// A value observable in two stages
///
/// If acceptance fails, the result fails with the same cause; the converse
/// does not hold (an accepted job may still fail while running).
pub struct Staged<T> {
    accepted: Eventual<()>,
    result: Eventual<T>,
}

impl<T> Clone for Staged<T> {
    fn clone(&self) -> Self {
        Staged {
            accepted: self.accepted.clone(),
            result: self.result.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Staged<T> {
    /// A staged value whose work is already admitted
    pub fn ready(result: Eventual<T>) -> Self {
        Staged {
            accepted: Eventual::ready(()),
            result,
        }
    }

    /// An admitted, already-produced value
    pub fn ready_value(value: T) -> Self {
        Self::ready(Eventual::ready(value))
    }

    /// Assemble from independently wired stages
    ///
    /// The caller is responsible for the failure coupling: if `accepted` can
    /// fail without `result` settling, wire that before assembling (the
    /// executor does, and [`channel`](Staged::channel) does it for you).
    pub fn from_parts(accepted: Eventual<()>, result: Eventual<T>) -> Self {
        Staged { accepted, result }
    }

    /// Collapse a nested signal: the outer resolution is the acceptance, the
    /// inner signal carries the result.
    pub fn from_nested(outer: Eventual<Eventual<T>>) -> Self {
        let (accept, accepted) = Promise::new();
        let (complete, result) = Promise::new();
        outer.on_complete(move |res| match res {
            Ok(inner) => {
                accept.resolve(());
                inner.on_complete(move |r| {
                    complete.complete(r);
                });
            }
            Err(err) => {
                accept.fail(err.clone());
                complete.fail(err);
            }
        });
        Staged { accepted, result }
    }

    /// Fresh pending pair with the acceptance-failure coupling pre-wired
    pub fn channel() -> (Promise<()>, Promise<T>, Staged<T>) {
        let (accept, accepted) = Promise::new();
        let (complete, result) = Promise::new();
        let coupled = complete.clone();
        accepted.on_complete(move |res| {
            if let Err(err) = res {
                coupled.fail(err);
            }
        });
        (accept, complete, Staged { accepted, result })
    }

    /// The acceptance stage
    pub fn accepted(&self) -> Eventual<()> {
        self.accepted.clone()
    }

    /// Has the downstream system admitted the work?
    pub fn is_accepted(&self) -> bool {
        self.accepted.is_resolved()
    }

    /// Run `f` once the acceptance stage settles
    pub fn on_accept<F>(&self, f: F)
    where
        F: FnOnce(Result<(), TaskError>) + Send + 'static,
    {
        self.accepted.on_complete(f);
    }

    /// The result stage
    pub fn result(&self) -> Eventual<T> {
        self.result.clone()
    }

    /// Run `f` once the result stage settles
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        self.result.on_complete(f);
    }

    /// Block for the result, charging both stages against one deadline.
    /// Time spent waiting for acceptance is subtracted from the wait on the
    /// result, so the total never exceeds `timeout`.
    pub fn wait_result(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        let deadline = Instant::now() + timeout;
        match self.accepted.wait_deadline(deadline)? {
            Err(err) => Some(Err(err)),
            Ok(()) => self.result.wait_deadline(deadline),
        }
    }
}

impl<T: Clone + Send + 'static> Future for Staged<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().result).poll(cx)
    }
}

impl<T> std::fmt::Debug for Staged<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Staged")
            .field("accepted", &self.accepted)
            .field("result", &self.result)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_is_accepted() {
        let staged = Staged::ready_value(5_u32);
        assert!(staged.is_accepted());
        assert_eq!(staged.result().try_value(), Some(Ok(5)));
    }

    #[test]
    fn test_channel_stages_resolve_in_order() {
        let (accept, complete, staged) = Staged::<u32>::channel();
        assert!(!staged.is_accepted());
        assert!(staged.result().is_pending());

        accept.resolve(());
        assert!(staged.is_accepted());
        assert!(staged.result().is_pending());

        complete.resolve(11);
        assert_eq!(staged.result().try_value(), Some(Ok(11)));
    }

    #[test]
    fn test_acceptance_failure_fails_result() {
        let (accept, _complete, staged) = Staged::<u32>::channel();
        accept.fail(TaskError::Abandoned);
        assert_eq!(
            staged.result().try_value(),
            Some(Err(TaskError::Abandoned))
        );
    }

    #[test]
    fn test_from_nested() {
        let (outer, nested) = Promise::new();
        let staged = Staged::from_nested(nested);
        assert!(!staged.is_accepted());

        let (inner_promise, inner) = Promise::new();
        outer.resolve(inner);
        assert!(staged.is_accepted());
        assert!(staged.result().is_pending());

        inner_promise.resolve(3_u32);
        assert_eq!(staged.result().try_value(), Some(Ok(3)));
    }

    #[test]
    fn test_from_nested_outer_failure_fails_both() {
        let (outer, nested) = Promise::<Eventual<u32>>::new();
        let staged = Staged::from_nested(nested);
        outer.fail(TaskError::Panicked("gone".into()));
        assert!(staged.accepted().is_failed());
        assert_eq!(
            staged.result().try_value(),
            Some(Err(TaskError::Panicked("gone".into())))
        );
    }

    #[test]
    fn test_wait_result_shares_one_deadline() {
        let (accept, _complete, staged) = Staged::<u32>::channel();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            accept.resolve(());
        });
        // Acceptance arrives inside the window, the result never does; the
        // total wait stays near the timeout instead of doubling it.
        let started = Instant::now();
        assert_eq!(staged.wait_result(Duration::from_millis(80)), None);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(80));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_await_yields_result() {
        let (accept, complete, staged) = Staged::<&'static str>::channel();
        accept.resolve(());
        complete.resolve("v");
        assert_eq!(staged.await, Ok("v"));
    }
}
