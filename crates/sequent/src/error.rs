//! Task failure classification

use thiserror::Error;

/// Failure delivered through a task's signals
///
/// A `TaskError` never poisons the executor: the failing task's slot is
/// released and the queue keeps draining. Structural failures (a corrupted
/// admission window, `buf_len == 0`) panic instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task body (or its child future) panicked
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The executor or the completer was dropped before the signal resolved
    #[error("task abandoned before completion")]
    Abandoned,
}

/// Best-effort extraction of a panic payload message
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
