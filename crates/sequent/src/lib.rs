//! Sequent: sequential execution with bounded, acceptance-signalled
//! backpressure
//!
//! A [`SerialExecutor`] serializes work from many concurrent producers onto
//! a single logical worker. Submission never blocks; instead every task
//! carries two signals:
//! - **acceptance**: the task entered the executor's bounded admitted
//!   window (at most `buf_len` tasks queued-or-in-flight at once),
//! - **result**: the task produced its value (or captured its failure).
//!
//! A fast producer facing a slow consumer sees pending acceptance signals
//! rather than a blocked thread or a dropped task; that is the whole flow
//! control story. [`Staged`] exposes the two stages as one value, and
//! chaining executors through [`SerialExecutor::enqueue_chained`] couples
//! the stages so backpressure propagates end-to-end.
//!
//! The work loop is driven through the [`dispatch::Dispatcher`] seam:
//! [`dispatch::TokioDispatcher`] in production, and the deterministic
//! [`dispatch::ManualDispatcher`] wherever single-stepping the executor
//! matters.

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod dispatch;
mod error;
mod exec;
mod intake;
mod promise;
mod staged;
mod work;

pub use dispatch::{Dispatcher, ManualDispatcher, TokioDispatcher};
pub use error::TaskError;
pub use exec::SerialExecutor;
pub use promise::{Eventual, Promise};
pub use staged::Staged;
