//! The in-process completion queue.
//!
//! A condvar-guarded event deque with a timer heap on the side. Alarms and
//! internal expiry tasks share the heap; pending operations (accepts, armed
//! client reads) are tracked so shutdown can fail them with `ok = false`.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use cqrpc_core::runtime::{Alarm, CompletionQueue};
use cqrpc_core::tag::Tag;

#[derive(Clone)]
pub struct InprocQueue {
    shared: Arc<QueueShared>,
}

struct QueueShared {
    state: Mutex<QueueState>,
    cond: Condvar,
    seq: AtomicU64,
}

struct QueueState {
    events: VecDeque<(Tag, bool)>,
    timers: BinaryHeap<TimerEntry>,
    pending: Vec<Tag>,
    shut_down: bool,
}

enum TimerFire {
    /// An armed alarm; the token flips once when the alarm fires or is
    /// cancelled, whichever comes first.
    Alarm { tag: Tag, token: Arc<AtomicBool> },
    /// Internal expiry hook, e.g. a call deadline. Dropped on shutdown.
    Task(Box<dyn FnOnce() + Send>),
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    fire: TimerFire,
}

// Min-heap by (deadline, seq) on top of the std max-heap.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline).then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl InprocQueue {
    /// Enqueue one completion.
    pub(crate) fn post(&self, tag: Tag, ok: bool) {
        let mut st = self.shared.state.lock().unwrap();
        st.events.push_back((tag, ok));
        self.shared.cond.notify_one();
    }

    /// Track an armed operation so shutdown can fail it.
    pub(crate) fn register_pending(&self, tag: Tag) {
        let mut st = self.shared.state.lock().unwrap();
        if st.shut_down {
            // Arming raced the shutdown; fail it right away.
            st.events.push_back((tag, false));
            self.shared.cond.notify_one();
            return;
        }
        debug_assert!(!st.pending.contains(&tag));
        st.pending.push(tag);
    }

    /// Claim a tracked operation for completion. Returns false when the
    /// operation was already failed by shutdown (or never tracked).
    pub(crate) fn claim_pending(&self, tag: Tag) -> bool {
        let mut st = self.shared.state.lock().unwrap();
        match st.pending.iter().position(|t| *t == tag) {
            Some(at) => {
                st.pending.swap_remove(at);
                true
            }
            None => false,
        }
    }

    /// Schedule an internal expiry hook; best effort, dropped on shutdown.
    pub(crate) fn schedule_task(&self, deadline: Instant, task: Box<dyn FnOnce() + Send>) {
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        let mut st = self.shared.state.lock().unwrap();
        if st.shut_down {
            return;
        }
        st.timers.push(TimerEntry { deadline, seq, fire: TimerFire::Task(task) });
        self.shared.cond.notify_all();
    }

    fn schedule_alarm(&self, deadline: Instant, tag: Tag, token: Arc<AtomicBool>) {
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        let mut st = self.shared.state.lock().unwrap();
        if st.shut_down {
            // Shutdown semantics for timers: fire with ok = false.
            if !token.swap(true, Ordering::SeqCst) {
                st.events.push_back((tag, false));
                self.shared.cond.notify_one();
            }
            return;
        }
        st.timers.push(TimerEntry { deadline, seq, fire: TimerFire::Alarm { tag, token } });
        self.shared.cond.notify_all();
    }
}

impl CompletionQueue for InprocQueue {
    type Alarm = InprocAlarm;

    fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    events: VecDeque::new(),
                    timers: BinaryHeap::new(),
                    pending: Vec::new(),
                    shut_down: false,
                }),
                cond: Condvar::new(),
                seq: AtomicU64::new(1),
            }),
        }
    }

    fn next(&self) -> Option<(Tag, bool)> {
        loop {
            let mut expired: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
            {
                let mut st = self.shared.state.lock().unwrap();
                loop {
                    let now = Instant::now();
                    while st.timers.peek().map_or(false, |t| t.deadline <= now) {
                        let entry = st.timers.pop().unwrap();
                        match entry.fire {
                            TimerFire::Alarm { tag, token } => {
                                if !token.swap(true, Ordering::SeqCst) {
                                    st.events.push_back((tag, true));
                                }
                            }
                            TimerFire::Task(task) => expired.push(task),
                        }
                    }
                    if !expired.is_empty() {
                        // Run expiry hooks without the queue lock, they may
                        // post back into this queue.
                        break;
                    }
                    if let Some(event) = st.events.pop_front() {
                        return Some(event);
                    }
                    if st.shut_down {
                        return None;
                    }
                    match st.timers.peek().map(|t| t.deadline) {
                        Some(deadline) => {
                            let wait = deadline.saturating_duration_since(Instant::now());
                            let (guard, _) =
                                self.shared.cond.wait_timeout(st, wait).unwrap();
                            st = guard;
                        }
                        None => {
                            st = self.shared.cond.wait(st).unwrap();
                        }
                    }
                }
            }
            for task in expired {
                task();
            }
        }
    }

    fn shutdown(&self) {
        let mut st = self.shared.state.lock().unwrap();
        if st.shut_down {
            return;
        }
        st.shut_down = true;
        // Pending alarms fire ok = false, expiry hooks are dropped.
        while let Some(entry) = st.timers.pop() {
            if let TimerFire::Alarm { tag, token } = entry.fire {
                if !token.swap(true, Ordering::SeqCst) {
                    st.events.push_back((tag, false));
                }
            }
        }
        let pending = std::mem::take(&mut st.pending);
        for tag in pending {
            st.events.push_back((tag, false));
        }
        self.shared.cond.notify_all();
    }

    fn alarm(&self) -> InprocAlarm {
        InprocAlarm { queue: self.clone(), armed: Mutex::new(None) }
    }
}

/// Alarm bound to an [`InprocQueue`].
pub struct InprocAlarm {
    queue: InprocQueue,
    armed: Mutex<Option<(Tag, Arc<AtomicBool>)>>,
}

impl Alarm for InprocAlarm {
    fn set(&self, deadline: Instant, tag: Tag) {
        let token = Arc::new(AtomicBool::new(false));
        *self.armed.lock().unwrap() = Some((tag, token.clone()));
        self.queue.schedule_alarm(deadline, tag, token);
    }

    fn cancel(&self) {
        if let Some((tag, token)) = self.armed.lock().unwrap().take() {
            if !token.swap(true, Ordering::SeqCst) {
                self.queue.post(tag, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqrpc_core::context::{reclaim, spawn, Aliveness, CallFsm};
    use cqrpc_core::tag::{ContextId, Flags};
    use std::time::Duration;

    struct Nop;

    impl CallFsm for Nop {
        fn run(&self, _this: ContextId) {}
        fn on_event(&self, _this: ContextId, _ok: bool, _flags: Flags) -> Aliveness {
            Aliveness::Alive
        }
    }

    // Tags must point at real cells; the guard frees them after the test.
    struct TestTag(ContextId);

    impl TestTag {
        fn new() -> Self {
            Self(spawn(Box::new(Nop)))
        }

        fn tag(&self) -> Tag {
            self.0.tag(Flags::NONE)
        }
    }

    impl Drop for TestTag {
        fn drop(&mut self) {
            unsafe { reclaim(self.0) };
        }
    }

    #[test]
    fn test_post_next_order() {
        let queue = InprocQueue::new();
        let (a, b) = (TestTag::new(), TestTag::new());
        queue.post(a.tag(), true);
        queue.post(b.tag(), false);
        assert_eq!(queue.next(), Some((a.tag(), true)));
        assert_eq!(queue.next(), Some((b.tag(), false)));
    }

    #[test]
    fn test_alarm_fires() {
        let queue = InprocQueue::new();
        let a = TestTag::new();
        let alarm = queue.alarm();
        alarm.set(Instant::now(), a.tag());
        assert_eq!(queue.next(), Some((a.tag(), true)));
    }

    #[test]
    fn test_alarm_deadline_ordering() {
        let queue = InprocQueue::new();
        let (a, b) = (TestTag::new(), TestTag::new());
        let late = queue.alarm();
        let soon = queue.alarm();
        late.set(Instant::now() + Duration::from_millis(30), b.tag());
        soon.set(Instant::now(), a.tag());
        assert_eq!(queue.next(), Some((a.tag(), true)));
        assert_eq!(queue.next(), Some((b.tag(), true)));
    }

    #[test]
    fn test_alarm_cancel_delivers_not_ok() {
        let queue = InprocQueue::new();
        let a = TestTag::new();
        let alarm = queue.alarm();
        alarm.set(Instant::now() + Duration::from_secs(60), a.tag());
        alarm.cancel();
        assert_eq!(queue.next(), Some((a.tag(), false)));
        // A second cancel is a no-op.
        alarm.cancel();
        queue.shutdown();
        assert_eq!(queue.next(), None);
    }

    #[test]
    fn test_shutdown_fails_pending_and_drains() {
        let queue = InprocQueue::new();
        let (a, b, c) = (TestTag::new(), TestTag::new(), TestTag::new());
        queue.register_pending(a.tag());
        queue.post(b.tag(), true);
        let alarm = queue.alarm();
        alarm.set(Instant::now() + Duration::from_secs(60), c.tag());
        queue.shutdown();
        let mut seen = Vec::new();
        while let Some(event) = queue.next() {
            seen.push(event);
        }
        assert!(seen.contains(&(b.tag(), true)));
        assert!(seen.contains(&(a.tag(), false)));
        assert!(seen.contains(&(c.tag(), false)));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_claim_pending() {
        let queue = InprocQueue::new();
        let a = TestTag::new();
        queue.register_pending(a.tag());
        assert!(queue.claim_pending(a.tag()));
        assert!(!queue.claim_pending(a.tag()));
        queue.shutdown();
        assert_eq!(queue.next(), None);
    }

    #[test]
    fn test_task_runs_off_lock() {
        let queue = InprocQueue::new();
        let a = TestTag::new();
        let q2 = queue.clone();
        let tag = a.tag();
        queue.schedule_task(Instant::now(), Box::new(move || q2.post(tag, true)));
        assert_eq!(queue.next(), Some((a.tag(), true)));
    }
}
