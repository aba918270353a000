//! Completion queue demultiplexing.
//!
//! The dispatcher pulls `(tag, ok)` events and forwards them to the call
//! context encoded in the tag. It never interprets `ok` or the flag bits;
//! both are local to the receiving state machine.

use crate::context::ContextCell;
use crate::runtime::CompletionQueue;
use crate::tag::Tag;

/// Deliver one event to the context behind `tag`, destroying the cell on a
/// terminal verdict.
///
/// # Safety
///
/// `tag` must have been armed from a cell spawned by [`crate::context`]
/// that is still live, and the queue contract must hold: at most one thread
/// processes a given tag at a time.
pub unsafe fn deliver(tag: Tag, ok: bool) {
    let (id, flags) = tag.unpack();
    let cell = id.0 as *const ContextCell;
    // Clone the machine out first: the event frame below may outlive the
    // cell when a concurrent completion (or the frame itself) turns out to
    // be terminal.
    let fsm = (*cell).fsm();
    if fsm.on_event(id, ok, flags).is_dead() {
        drop(Box::from_raw(cell as *mut ContextCell));
    }
}

/// Blocking dispatch loop, run by each server dispatcher thread.
///
/// Exits once the queue has been shut down and drained.
pub fn dispatch_loop<Q: CompletionQueue>(queue: &Q) {
    while let Some((tag, ok)) = queue.next() {
        unsafe { deliver(tag, ok) };
    }
}
