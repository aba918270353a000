//! Type-erased call contexts and their liveness protocol.
//!
//! Every RPC call is represented by one finite state machine held in a
//! [`ContextCell`]. The cell address is the completion queue identity of
//! the call; the dispatcher owns the cell between events and frees it when
//! the machine reports a terminal transition.

use std::sync::Arc;

use crate::tag::{ContextId, Flags, FLAGS_MASK};

/// Liveness verdict of one event delivery.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aliveness {
    Alive,
    Dead,
}

impl Aliveness {
    #[inline]
    pub fn is_dead(self) -> bool {
        matches!(self, Aliveness::Dead)
    }
}

/// One RPC call lifecycle, advanced only by completion queue events.
///
/// `run` arms the first operation. `on_event` consumes one `(ok, flags)`
/// completion. Returning [`Aliveness::Dead`] hands the cell back to the
/// dispatcher for destruction, so an implementation must never return it
/// while any of its tags is still in flight on the queue.
///
/// Differently flagged tags of one context may be delivered from different
/// dispatcher threads; a machine that can have more than one tag in flight
/// serializes internally.
pub trait CallFsm: Send + Sync + 'static {
    fn run(&self, this: ContextId);

    fn on_event(&self, this: ContextId, ok: bool, flags: Flags) -> Aliveness;
}

/// Heap cell behind every queue tag.
///
/// The cell keeps the tag a thin pointer while the machine stays a trait
/// object. It holds the machine through an `Arc` so an event frame that is
/// still on some dispatcher stack (e.g. inside a userspace callback)
/// outlives a concurrent terminal transition of another tag.
pub struct ContextCell {
    fsm: Arc<dyn CallFsm>,
}

// The flag field must fit under the alignment of every cell.
const _: () = assert!(std::mem::align_of::<ContextCell>() > FLAGS_MASK);

impl ContextCell {
    #[inline]
    pub(crate) fn fsm(&self) -> Arc<dyn CallFsm> {
        self.fsm.clone()
    }
}

/// Move `fsm` into a fresh cell and return its queue identity.
///
/// The cell is leaked on purpose; it is reclaimed by the dispatcher on a
/// terminal transition, or by [`reclaim`] when the caller can prove the
/// machine has no tags in flight.
pub fn spawn(fsm: Box<dyn CallFsm>) -> ContextId {
    let cell = Box::new(ContextCell { fsm: Arc::from(fsm) });
    let addr = Box::into_raw(cell) as usize;
    debug_assert_eq!(addr & FLAGS_MASK, 0);
    ContextId(addr)
}

/// Spawn `fsm` and arm its first operation.
pub fn launch(fsm: Box<dyn CallFsm>) -> ContextId {
    let id = spawn(fsm);
    // The cell cannot be freed before run() arms something, so the access
    // is still exclusive here.
    let fsm = unsafe { (*(id.0 as *const ContextCell)).fsm() };
    fsm.run(id);
    id
}

/// Free a spawned cell without delivering any further event.
///
/// # Safety
///
/// No tag derived from `id` may still be in flight on any queue, and the
/// cell must not be delivered to again. Event frames that already cloned
/// the machine out of the cell are unaffected.
pub unsafe fn reclaim(id: ContextId) {
    drop(Box::from_raw(id.0 as *mut ContextCell));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        ran: Arc<AtomicUsize>,
        events: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
        die_after: usize,
    }

    impl CallFsm for Probe {
        fn run(&self, _this: ContextId) {
            self.ran.fetch_add(1, Ordering::SeqCst);
        }

        fn on_event(&self, _this: ContextId, _ok: bool, _flags: Flags) -> Aliveness {
            let seen = self.events.fetch_add(1, Ordering::SeqCst) + 1;
            if seen >= self.die_after { Aliveness::Dead } else { Aliveness::Alive }
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_launch_and_terminal_free() {
        let ran = Arc::new(AtomicUsize::new(0));
        let events = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        let id = launch(Box::new(Probe {
            ran: ran.clone(),
            events: events.clone(),
            drops: drops.clone(),
            die_after: 2,
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        unsafe {
            crate::dispatcher::deliver(id.tag(Flags::NONE), true);
        }
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        unsafe {
            crate::dispatcher::deliver(id.tag(Flags::new(0b01)), true);
        }
        assert_eq!(events.load(Ordering::SeqCst), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reclaim_unarmed() {
        let ran = Arc::new(AtomicUsize::new(0));
        let events = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        let id = spawn(Box::new(Probe {
            ran: ran.clone(),
            events: events.clone(),
            drops: drops.clone(),
            die_after: 1,
        }));
        unsafe { reclaim(id) };
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
