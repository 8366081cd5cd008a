//! Bounded MPSC intake: lock-free list with an atomically admitted window
//!
//! Producers append with a tail CAS and never block; admission into the
//! bounded window is a separate CAS protocol over one packed word. The
//! consumer side (a single logical work loop) drains the list in order and
//! slides the window as slots free up.
//!
//! # Cursors
//!
//! - `tail`: last appended node, null when empty. The tail CAS linearizes
//!   producers; its winner order is the execution order.
//! - `head`: next node the work loop will run. Written by the loop as it
//!   advances, and by a producer on the empty-to-non-empty transition.
//! - `admitted`: one `u64` packing `{len, seq}`, the current occupancy and
//!   the serial number of the furthest admitted node. Every transition
//!   keeps `len <= buf_len`.
//!
//! Serial numbers stand in for the list positions: node `seq`s increase by
//! one in tail-CAS order, so "is this node admitted" and "which node is
//! admitted next" are wrapping integer comparisons rather than pointer
//! chases, and the `{len, seq}` pair CASes as a single word.
//!
//! # Ownership
//!
//! A producer touches its own node only until the node is published (seq
//! store, then `next`/`head` store); after that the consumer is the sole
//! owner and frees each node as it moves past it. `next` is publish-once.

use crate::promise::Promise;
use crate::work::Work;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::time::Duration;

/// Marks a node whose producer has won the tail CAS but not yet assigned
/// the serial number. Real serial numbers are `u32`, so they never collide.
const SEQ_UNSET: u64 = u64::MAX;

/// `a` has reached or passed `b` in wrapping serial-number order
pub(crate) fn seq_reached(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 >= 0
}

/// Admitted-window snapshot
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Window {
    /// Occupied slots: admitted-but-unreleased nodes plus in-flight
    /// children. Never exceeds `buf_len`.
    pub(crate) len: u32,
    /// Serial number of the furthest admitted node
    pub(crate) seq: u32,
}

impl Window {
    fn pack(self) -> u64 {
        (u64::from(self.len) << 32) | u64::from(self.seq)
    }

    fn unpack(raw: u64) -> Self {
        Window {
            len: (raw >> 32) as u32,
            seq: raw as u32,
        }
    }
}

pub(crate) struct Node {
    /// Serial number; `SEQ_UNSET` until the owning producer assigns it,
    /// always assigned before the node is reachable by anyone who reads it
    /// through `next` or `head`.
    seq: AtomicU64,
    work: UnsafeCell<Option<Work>>,
    next: AtomicPtr<Node>,
}

impl Node {
    /// Serial number of a published node
    fn seq(&self) -> u32 {
        let raw = self.seq.load(Ordering::Acquire);
        debug_assert_ne!(raw, SEQ_UNSET);
        raw as u32
    }

    /// Serial number of a node that may still be mid-assignment by its
    /// producer. The window between a producer's tail CAS and its seq store
    /// is a few instructions wide.
    fn wait_seq(&self) -> u32 {
        loop {
            let raw = self.seq.load(Ordering::Acquire);
            if raw != SEQ_UNSET {
                return raw as u32;
            }
            std::hint::spin_loop();
        }
    }
}

/// Outcome of a producer append
pub(crate) struct Push {
    /// Acceptance fired synchronously by this call
    pub(crate) accepted: bool,
    /// The append was the empty-to-non-empty transition; the caller must
    /// submit a work-loop activation.
    pub(crate) activate: bool,
}

pub(crate) struct Intake {
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
    admitted: AtomicU64,
    buf_len: u32,
}

// Nodes are handed off producer-to-consumer through the atomics above; the
// raw pointers are never aliased mutably across threads.
unsafe impl Send for Intake {}
unsafe impl Sync for Intake {}

impl Intake {
    pub(crate) fn new(buf_len: usize) -> Self {
        assert!(buf_len >= 1, "buffer length must be at least 1");
        assert!(
            buf_len <= (i32::MAX as usize) / 2,
            "buffer length exceeds the admissible window range"
        );
        Intake {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            admitted: AtomicU64::new(Window { len: 0, seq: 0 }.pack()),
            buf_len: buf_len as u32,
        }
    }

    pub(crate) fn buf_len(&self) -> usize {
        self.buf_len as usize
    }

    pub(crate) fn window(&self) -> Window {
        Window::unpack(self.admitted.load(Ordering::Acquire))
    }

    pub(crate) fn admitted_len(&self) -> usize {
        self.window().len as usize
    }

    /// Append one unit of work. Wait-free for the producer apart from the
    /// momentary seq hand-off; never blocks on a full window.
    pub(crate) fn push(&self, work: Work) -> Push {
        let accept = work.accept.clone();
        let node = Box::into_raw(Box::new(Node {
            seq: AtomicU64::new(SEQ_UNSET),
            work: UnsafeCell::new(Some(work)),
            next: AtomicPtr::new(ptr::null_mut()),
        }));

        let mut prev = self.tail.load(Ordering::Relaxed);
        loop {
            match self
                .tail
                .compare_exchange_weak(prev, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => prev = observed,
            }
        }

        if prev.is_null() {
            // Empty-to-non-empty. The previous activation released every
            // processed slot before nulling `tail`, so `admitted` is an
            // exact anchor: its seq is the last serial ever assigned and
            // its len counts only in-flight children.
            let seq = self.window().seq.wrapping_add(1);
            // SAFETY: the node is not yet reachable by any other thread.
            unsafe {
                (*node).seq.store(u64::from(seq), Ordering::Release);
            }
            self.head.store(node, Ordering::Release);
            let accepted = self.extend(seq, &accept);
            Push {
                accepted,
                activate: true,
            }
        } else {
            // SAFETY: `prev` stays alive until its `next` is published;
            // the consumer cannot move past it before that, and no other
            // producer touches it.
            let seq = unsafe { (*prev).wait_seq() }.wrapping_add(1);
            unsafe {
                (*node).seq.store(u64::from(seq), Ordering::Release);
                (*prev).next.store(node, Ordering::Release);
            }
            let accepted = self.extend(seq, &accept);
            Push {
                accepted,
                activate: false,
            }
        }
    }

    /// Producer-side admission: extend the window until it covers `my_seq`,
    /// it fills up, or someone else covers us. Each successful CAS admits
    /// exactly one node: ours, or an earlier producer's that we help
    /// forward (its own producer or the work loop fires that acceptance).
    fn extend(&self, my_seq: u32, accept: &Promise<()>) -> bool {
        loop {
            let raw = self.admitted.load(Ordering::Acquire);
            let q = Window::unpack(raw);
            if seq_reached(q.seq, my_seq) {
                // Already admitted by a helper or the work loop; resolution
                // is idempotent, so a racing firer is harmless.
                accept.resolve(());
                return true;
            }
            if q.len >= self.buf_len {
                // Window full: backpressure, not an error. The work loop
                // admits and fires once a slot frees.
                return false;
            }
            let next = Window {
                len: q.len + 1,
                seq: q.seq.wrapping_add(1),
            };
            if self
                .admitted
                .compare_exchange_weak(raw, next.pack(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
                && next.seq == my_seq
            {
                accept.resolve(());
                return true;
            }
        }
    }

    /// Consumer: next node the loop will run, null when idle/empty
    pub(crate) fn head(&self) -> *mut Node {
        self.head.load(Ordering::Acquire)
    }

    /// Consumer: serial number of a published node
    pub(crate) unsafe fn seq_of(&self, node: *mut Node) -> u32 {
        (*node).seq()
    }

    /// Consumer: is this serial inside the admitted window?
    pub(crate) fn is_admitted(&self, seq: u32) -> bool {
        seq_reached(self.window().seq, seq)
    }

    /// Consumer: admit the cursor node if the window has room, helping a
    /// producer that published its node but has not extended the window
    /// yet. Returns false when the window is genuinely full.
    ///
    /// Every node behind the cursor is processed and therefore admitted, so
    /// the single-step slide below always lands exactly on the cursor.
    pub(crate) unsafe fn admit(&self, node: *mut Node) -> bool {
        let seq = self.seq_of(node);
        loop {
            let raw = self.admitted.load(Ordering::Acquire);
            let q = Window::unpack(raw);
            if seq_reached(q.seq, seq) {
                return true;
            }
            if q.len >= self.buf_len {
                return false;
            }
            let next = Window {
                len: q.len + 1,
                seq: q.seq.wrapping_add(1),
            };
            debug_assert_eq!(next.seq, seq);
            if self
                .admitted
                .compare_exchange_weak(raw, next.pack(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Consumer: fire a node's acceptance if its producer has not. Covers a
    /// helped node whose producer observed a full window and already
    /// returned pending.
    pub(crate) unsafe fn ensure_accept(&self, node: *mut Node) {
        if let Some(work) = &*(*node).work.get() {
            work.accept.resolve(());
        }
    }

    /// Consumer: take the body for execution. Runs at most once per node.
    pub(crate) unsafe fn take_work(&self, node: *mut Node) -> Option<Work> {
        (*(*node).work.get()).take()
    }

    /// Consumer: published successor, null if none yet
    pub(crate) unsafe fn next_of(&self, node: *mut Node) -> *mut Node {
        (*node).next.load(Ordering::Acquire)
    }

    /// Consumer: step the loop cursor to `next`, releasing the node just
    /// processed.
    pub(crate) unsafe fn step_head(&self, node: *mut Node, next: *mut Node) {
        self.head.store(next, Ordering::Release);
        drop(Box::from_raw(node));
    }

    /// Consumer: attempt the non-empty-to-empty transition. On success the
    /// node is freed and true is returned; the caller must have stashed its
    /// carry first, because a producer may immediately restart the loop. On
    /// failure a producer has appended and the caller continues.
    pub(crate) unsafe fn try_close(&self, node: *mut Node) -> bool {
        if self
            .tail
            .compare_exchange(node, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Clear `head` unless a producer already restarted the queue and
        // re-pointed it.
        let _ = self.head.compare_exchange(
            node,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        drop(Box::from_raw(node));
        true
    }

    /// Consumer: bounded wait for a mid-publish producer to land `next`
    pub(crate) fn park_for_publish(&self) {
        std::thread::park_timeout(Duration::from_nanos(100));
    }

    /// Consumer: credit `n` released slots. While the window is full each
    /// credit is handed to the oldest waiting node (admit it, fire its
    /// acceptance), so acceptances fire in FIFO order. Once no published
    /// waiter remains, the remaining credits shrink the occupancy.
    ///
    /// `anchor` is the loop's current node; the node being admitted is
    /// always at or ahead of it, so the walk stays within live nodes.
    pub(crate) unsafe fn advance_admitted(&self, n: usize, anchor: *mut Node) {
        let mut remaining = n as u32;
        while remaining > 0 {
            let raw = self.admitted.load(Ordering::Acquire);
            let q = Window::unpack(raw);
            if q.len == self.buf_len {
                let target = q.seq.wrapping_add(1);
                match self.find_from(anchor, target) {
                    Some(node) => {
                        // Full window: producers cannot touch `admitted`
                        // (every producer path requires len < buf_len), so
                        // a plain store is race-free here.
                        let next = Window {
                            len: q.len,
                            seq: target,
                        };
                        self.admitted.store(next.pack(), Ordering::Release);
                        self.ensure_accept(node);
                        remaining -= 1;
                    }
                    None => {
                        // No published waiter to hand the slots to; the
                        // unpublished node's producer is still inside
                        // `extend` and will admit itself against the
                        // shrunken window.
                        let next = Window {
                            len: q.len - remaining,
                            seq: q.seq,
                        };
                        self.admitted.store(next.pack(), Ordering::Release);
                        return;
                    }
                }
            } else {
                // Not full: nobody is waiting on acceptance, release by
                // decrement. The CAS doubles as the barrier against
                // producers racing to extend the window: interference
                // fails it and we re-read.
                let next = Window {
                    len: q.len - 1,
                    seq: q.seq,
                };
                if self
                    .admitted
                    .compare_exchange(raw, next.pack(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    remaining -= 1;
                }
            }
        }
    }

    /// Walk forward from `anchor` to the node carrying `target`, or None if
    /// the chain is not published that far yet.
    unsafe fn find_from(&self, anchor: *mut Node, target: u32) -> Option<*mut Node> {
        let mut node = anchor;
        loop {
            let seq = (*node).seq();
            if seq == target {
                return Some(node);
            }
            debug_assert!(
                !seq_reached(seq, target),
                "admitted walk anchored past its target"
            );
            let next = (*node).next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }
            node = next;
        }
    }
}

impl Drop for Intake {
    fn drop(&mut self) {
        // Unrun nodes drop their work here; the promise abandon-guards fail
        // every still-pending signal.
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            // SAFETY: drop has exclusive access; every node from `head`
            // onward is live and owned by the queue.
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            drop(unsafe { Box::from_raw(node) });
            node = next;
        }
    }
}
