//! Backpressure propagation through chained executors

use pretty_assertions::assert_eq;
use sequent::{ManualDispatcher, Promise, SerialExecutor};
use std::sync::Arc;

#[test]
fn test_chained_acceptance_is_end_to_end() {
    let dispatcher = Arc::new(ManualDispatcher::new());
    let upstream = SerialExecutor::new(1, dispatcher.clone());
    let downstream = SerialExecutor::new(1, dispatcher.clone());

    // Occupy the downstream's only slot with an unsettled async task.
    let (blocker, blocker_hold) = Promise::new();
    downstream.enqueue_async(move || blocker_hold);
    dispatcher.run_all();
    assert_eq!(downstream.admitted_len(), 1);

    // Submit through the chain: locally admitted at once, but the staged
    // acceptance tracks the *downstream* admission.
    let chained = {
        let downstream = downstream.clone();
        upstream.enqueue_chained(move || downstream.enqueue_staged(|| 5_u32))
    };
    let follow_up = upstream.enqueue(|| {});
    assert!(follow_up.is_pending());

    dispatcher.run_all();
    // The chain body ran and parked on the downstream window; the upstream
    // slot is still held, so the follow-up stays unaccepted. Backpressure
    // has crossed both executors.
    assert!(!chained.is_accepted());
    assert!(follow_up.is_pending());
    assert_eq!(upstream.admitted_len(), 1);

    // Freeing the downstream slot releases the whole chain: the staged
    // task is admitted and runs, the chained acceptance fires, the
    // upstream slot frees, and the follow-up gets admitted and runs.
    blocker.resolve(());
    dispatcher.run_all();
    assert!(chained.is_accepted());
    assert_eq!(chained.result().try_value(), Some(Ok(5)));
    assert!(follow_up.is_resolved());
    assert_eq!(upstream.admitted_len(), 0);
}

#[test]
fn test_chain_completes_inline_when_downstream_has_room() {
    let dispatcher = Arc::new(ManualDispatcher::new());
    let upstream = SerialExecutor::new(2, dispatcher.clone());
    let downstream = SerialExecutor::new(2, dispatcher.clone());

    let chained = {
        let downstream = downstream.clone();
        upstream.enqueue_chained(move || downstream.enqueue_staged(|| "through"))
    };
    assert!(!chained.is_accepted());

    dispatcher.run_all();
    assert!(chained.is_accepted());
    assert_eq!(chained.result().try_value(), Some(Ok("through")));
}

#[test]
fn test_chained_body_panic_fails_both_stages() {
    let dispatcher = Arc::new(ManualDispatcher::new());
    let upstream = SerialExecutor::new(1, dispatcher.clone());

    let chained = upstream.enqueue_chained::<u32, _>(|| panic!("no downstream"));
    dispatcher.run_all();
    assert!(chained.accepted().is_failed());
    assert!(chained.result().is_failed());

    // The slot freed despite the failure: the executor keeps serving.
    let next = upstream.enqueue_result(|| 1_u32);
    dispatcher.run_all();
    assert_eq!(next.try_value(), Some(Ok(1)));
}
