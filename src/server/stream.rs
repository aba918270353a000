//! Server-side state machine of one server-stream call: one inbound
//! request, any number of outbound notifications, one terminal status.
//!
//! Three event sources meet here: dispatcher completions, notifications
//! posted from arbitrary user threads, and remote cancellation. The shared
//! inner block is held strongly by the context cell and weakly by the
//! userspace handle; every transition happens under its mutex.
//!
//! Tag flags: plain tags carry accept/write/finish completions, `ALARM`
//! marks the user-thread hop, `DONE` marks the done notification
//! registered for cancellation delivery.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use cqrpc_core::context::{self, Aliveness, CallFsm};
use cqrpc_core::runtime::{
    Alarm, CompletionQueue, ServerContext, StreamPending, StreamPort, StreamWriter,
};
use cqrpc_core::status::Status;
use cqrpc_core::tag::{ContextId, Flags};

use super::ServerStreamCallback;

const OP_FLAGS: Flags = Flags::NONE;
const DONE_FLAGS: Flags = Flags::new(0b01);
const ALARM_FLAGS: Flags = Flags::new(0b10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StandingBy,
    AwaitingRequest,
    AwaitingNotifications,
    AwaitingAlarm,
    AwaitingWrite,
    AwaitingFinish,
    Cancelled,
}

/// Stream liveness as observed through the userspace handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Running,
    Finished,
}

pub(crate) struct ServerStreamFsm<P: StreamPort> {
    shared: Arc<StreamShared<P>>,
}

impl<P: StreamPort> ServerStreamFsm<P> {
    pub(crate) fn new(port: P, queue: P::Queue, callback: ServerStreamCallback<P>) -> Self {
        let alarm = queue.alarm();
        Self {
            shared: Arc::new(StreamShared {
                port,
                queue,
                callback,
                alarm,
                st: Mutex::new(StreamSt {
                    state: State::StandingBy,
                    this: None,
                    pending: None,
                    request: None,
                    notifications: VecDeque::new(),
                    alarm_count: 0,
                    op_in_flight: false,
                    done_armed: false,
                    done_seen: false,
                    drop_notifications: false,
                }),
            }),
        }
    }
}

impl<P: StreamPort> CallFsm for ServerStreamFsm<P> {
    fn run(&self, this: ContextId) {
        self.shared.run(this);
    }

    fn on_event(&self, this: ContextId, ok: bool, flags: Flags) -> Aliveness {
        self.shared.clone().on_event(this, ok, flags)
    }
}

pub(crate) struct StreamShared<P: StreamPort> {
    port: P,
    queue: P::Queue,
    callback: ServerStreamCallback<P>,
    alarm: <P::Queue as CompletionQueue>::Alarm,
    st: Mutex<StreamSt<P>>,
}

struct StreamSt<P: StreamPort> {
    state: State,
    this: Option<ContextId>,
    pending: Option<StreamPending<P>>,
    request: Option<P::Request>,
    notifications: VecDeque<Result<P::Notification, Status>>,
    /// Alarm tags still in flight on the queue.
    alarm_count: usize,
    /// An accept, write or finish tag is in flight.
    op_in_flight: bool,
    /// The done notification was registered with a live call.
    done_armed: bool,
    done_seen: bool,
    drop_notifications: bool,
}

impl<P: StreamPort> StreamSt<P> {
    /// True once nothing of this machine remains on the queue.
    fn drained(&self) -> bool {
        self.alarm_count == 0 && !self.op_in_flight && (self.done_seen || !self.done_armed)
    }
}

impl<P: StreamPort> StreamShared<P> {
    fn run(&self, this: ContextId) {
        let mut st = self.st.lock().unwrap();
        debug_assert_eq!(st.state, State::StandingBy, "illegal state");
        st.this = Some(this);
        st.state = State::AwaitingRequest;
        st.op_in_flight = true;
        trace!("{} running", self.identity(&st));
        let pending = self.port.accept(&self.queue, this.tag(OP_FLAGS));
        pending.context.notify_when_done(this.tag(DONE_FLAGS));
        st.pending = Some(pending);
    }

    fn on_event(self: Arc<Self>, this: ContextId, ok: bool, flags: Flags) -> Aliveness {
        let mut st = self.st.lock().unwrap();
        debug_assert_eq!(st.this, Some(this));
        trace!(
            "{} got event, state - {:?}, ok - {}, flags - {:?}, queue - {}, alarms - {}",
            self.identity(&st),
            st.state,
            ok,
            flags,
            st.notifications.len(),
            st.alarm_count
        );

        // Per-completion bookkeeping, independent of the state transition.
        match flags {
            DONE_FLAGS => st.done_seen = true,
            ALARM_FLAGS => {
                debug_assert!(st.alarm_count >= 1);
                st.alarm_count = st.alarm_count.saturating_sub(1);
            }
            _ => st.op_in_flight = false,
        }

        if !ok {
            return self.on_failure(&mut st);
        }

        // Remote cancellation is observed on any completion once the call
        // is live; the accept completion itself still runs its course so
        // the replacement machine gets spawned.
        if st.state != State::AwaitingRequest && st.state != State::Cancelled {
            let cancelled =
                st.pending.as_ref().map(|p| p.context.is_cancelled()).unwrap_or(false);
            if cancelled {
                debug!("{} cancelled by remote", self.identity(&st));
                st.state = State::Cancelled;
                st.drop_notifications = true;
            }
        }

        if st.state == State::AwaitingRequest {
            // The replacement keeps the method armed before userspace runs.
            context::launch(Box::new(ServerStreamFsm::new(
                self.port.clone(),
                self.queue.clone(),
                self.callback.clone(),
            )));
            st.request = st.pending.as_ref().and_then(|p| p.request.take());
            debug_assert!(st.request.is_some(), "accept completed without a request");
            st.state = State::AwaitingNotifications;
            st.done_armed = true;
            trace!("{} notifying userspace", self.identity(&st));
            // The callback may push right away, which takes this lock again.
            drop(st);
            let handle = ServerStreamMethod { inner: Arc::downgrade(&self) };
            (self.callback.as_ref())(handle);
            return Aliveness::Alive;
        }

        match st.state {
            State::AwaitingAlarm => {
                debug_assert_eq!(flags, ALARM_FLAGS, "completion kind mismatch");
                debug_assert!(!st.notifications.is_empty());
                self.process_pending(&mut st)
            }
            State::AwaitingWrite => {
                if st.notifications.is_empty() {
                    trace!("{} awaiting notifications", self.identity(&st));
                    st.state = State::AwaitingNotifications;
                    Aliveness::Alive
                } else {
                    self.process_pending(&mut st)
                }
            }
            State::AwaitingFinish => {
                if flags == DONE_FLAGS {
                    // Remote close raced our finish; the finish completion
                    // is still on its way.
                    trace!("{} done notification during finish", self.identity(&st));
                    return Aliveness::Alive;
                }
                debug_assert!(st.done_seen || !st.done_armed);
                debug!("{} finished, destructing", self.identity(&st));
                self.verdict(&st)
            }
            State::Cancelled => {
                st.notifications.clear();
                let verdict = self.verdict(&st);
                if verdict == Aliveness::Alive {
                    debug!(
                        "{} draining on cancel, alarms - {}",
                        self.identity(&st),
                        st.alarm_count
                    );
                }
                verdict
            }
            State::StandingBy | State::AwaitingRequest | State::AwaitingNotifications => {
                error!("{} event in illegal state {:?}", self.identity(&st), st.state);
                debug_assert!(false, "illegal state");
                st.drop_notifications = true;
                st.state = State::Cancelled;
                self.verdict(&st)
            }
        }
    }

    fn process_pending(&self, st: &mut StreamSt<P>) -> Aliveness {
        debug_assert!(!st.notifications.is_empty());
        let this = st.this.expect("processing before run");
        let head = st.notifications.pop_front().unwrap();
        match head {
            Ok(notification) => {
                trace!(
                    "{} writing, queue - {}, alarms - {}",
                    self.identity(st),
                    st.notifications.len(),
                    st.alarm_count
                );
                st.state = State::AwaitingWrite;
                st.op_in_flight = true;
                let pending = st.pending.as_ref().expect("no pending call");
                pending.writer.write(notification, this.tag(OP_FLAGS));
            }
            Err(status) => {
                trace!(
                    "{} finishing with {}, queue - {}, alarms - {}",
                    self.identity(st),
                    status,
                    st.notifications.len(),
                    st.alarm_count
                );
                st.state = State::AwaitingFinish;
                st.op_in_flight = true;
                let pending = st.pending.as_ref().expect("no pending call");
                pending.writer.finish(status, this.tag(OP_FLAGS));
            }
        }
        Aliveness::Alive
    }

    fn on_failure(&self, st: &mut StreamSt<P>) -> Aliveness {
        warn!(
            "{} not ok, state - {:?}, queue - {}, alarms - {}",
            self.identity(st),
            st.state,
            st.notifications.len(),
            st.alarm_count
        );
        st.drop_notifications = true;
        st.notifications.clear();
        st.state = State::Cancelled;
        self.verdict(st)
    }

    fn verdict(&self, st: &StreamSt<P>) -> Aliveness {
        if st.drained() { Aliveness::Dead } else { Aliveness::Alive }
    }

    /// Userspace pushes one notification or the terminal status.
    fn post(&self, notification: Result<P::Notification, Status>) {
        let mut st = self.st.lock().unwrap();
        trace!("{} userspace posts, state - {:?}", self.identity(&st), st.state);

        if st.drop_notifications {
            trace!("{} dropped", self.identity(&st));
            return;
        }
        if notification.is_err() {
            // Closed by userspace; everything after the status is dropped.
            st.drop_notifications = true;
            debug!("{} closed by userspace", self.identity(&st));
        }

        match st.state {
            State::StandingBy | State::AwaitingRequest | State::AwaitingFinish => {
                error!("{} post in illegal state {:?}", self.identity(&st), st.state);
                debug_assert!(false, "illegal state for post");
            }
            State::AwaitingAlarm | State::AwaitingWrite => {
                trace!("{} processing, pushing", self.identity(&st));
                st.notifications.push_back(notification);
            }
            State::AwaitingNotifications => {
                trace!("{} idle, alarming and pushing", self.identity(&st));
                st.state = State::AwaitingAlarm;
                st.alarm_count += 1;
                st.notifications.push_back(notification);
                let this = st.this.expect("posting before run");
                self.alarm.set(Instant::now(), this.tag(ALARM_FLAGS));
            }
            State::Cancelled => {
                trace!("{} notification attempt after cancellation", self.identity(&st));
            }
        }
    }

    fn peer(&self) -> String {
        let st = self.st.lock().unwrap();
        st.pending.as_ref().map(|p| p.context.peer()).unwrap_or_default()
    }

    fn request(&self) -> Option<P::Request>
    where
        P::Request: Clone,
    {
        self.st.lock().unwrap().request.clone()
    }

    fn identity(&self, st: &StreamSt<P>) -> String {
        format!(
            "{}[{}]",
            self.port.descriptor().full_name(),
            st.this.map(|t| format!("{}", t)).unwrap_or_default()
        )
    }
}

/// Userspace handle of one inbound server stream.
///
/// Non-owning: the underlying machine may finish or be cancelled at any
/// time, after which pushes are dropped and observers report
/// [`StreamState::Finished`].
pub struct ServerStreamMethod<P: StreamPort> {
    inner: Weak<StreamShared<P>>,
}

impl<P: StreamPort> Clone for ServerStreamMethod<P> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<P: StreamPort> ServerStreamMethod<P> {
    /// Current liveness; a stream may be closed by remote or by userspace.
    pub fn state(&self) -> StreamState {
        if self.inner.strong_count() > 0 { StreamState::Running } else { StreamState::Finished }
    }

    /// Remote address, while the stream is running.
    pub fn peer(&self) -> Result<String, StreamState> {
        match self.inner.upgrade() {
            Some(shared) => Ok(shared.peer()),
            None => Err(StreamState::Finished),
        }
    }

    /// Inbound request, while the stream is running.
    pub fn request(&self) -> Result<P::Request, StreamState>
    where
        P::Request: Clone,
    {
        match self.inner.upgrade() {
            Some(shared) => shared.request().ok_or(StreamState::Finished),
            None => Err(StreamState::Finished),
        }
    }

    /// Queue one outbound notification; dropped when the stream is gone.
    pub fn push(&self, notification: P::Notification) -> StreamState {
        match self.inner.upgrade() {
            Some(shared) => {
                shared.post(Ok(notification));
                StreamState::Running
            }
            None => StreamState::Finished,
        }
    }

    /// Close the stream with `status`; later pushes are dropped.
    pub fn close(&self, status: Status) -> StreamState {
        match self.inner.upgrade() {
            Some(shared) => {
                shared.post(Err(status));
                StreamState::Running
            }
            None => StreamState::Finished,
        }
    }
}

impl<P: StreamPort> fmt::Debug for ServerStreamMethod<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "server stream method ({:?})", self.state())
    }
}
