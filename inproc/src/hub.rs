//! In-process wire: routes client calls to server method ports.
//!
//! The hub keeps one entry per method full name. Server acceptors queue
//! pending accepts, client calls queue until an accept is available, and
//! binding moves the request across and wires the two call halves to each
//! other.
//!
//! Locking discipline: the hub lock may be held while taking queue, call or
//! seat locks (binding), but no path takes the hub lock while holding any
//! of those, and call and seat locks are never nested into each other.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cqrpc_core::status::Status;
use cqrpc_core::tag::Tag;
use rustc_hash::FxHashMap;

use crate::queue::InprocQueue;
use crate::service::ServerSeat;

pub(crate) type AnyMessage = Box<dyn Any + Send>;

/// Outcome of trying to bind a waiting call to a pending accept.
pub(crate) type BindFn = Box<dyn FnOnce(WaitingCall) -> Result<(), WaitingCall> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MethodKind {
    Unary,
    Stream,
}

pub(crate) enum WaitingCall {
    Unary(Arc<UnaryCall>),
    Stream(Arc<StreamCall>),
}

impl WaitingCall {
    fn kind(&self) -> MethodKind {
        match self {
            WaitingCall::Unary(_) => MethodKind::Unary,
            WaitingCall::Stream(_) => MethodKind::Stream,
        }
    }
}

struct MethodEntry {
    kind: MethodKind,
    accepts: VecDeque<BindFn>,
    waiting: VecDeque<WaitingCall>,
}

struct HubInner {
    methods: Mutex<FxHashMap<&'static str, MethodEntry>>,
    next_client_id: AtomicU64,
}

/// One in-process address space; servers and clients attach to it.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                methods: Mutex::new(FxHashMap::default()),
                next_client_id: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn next_client_id(&self) -> u64 {
        self.inner.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Declare a method (or check its kind when already declared).
    pub(crate) fn declare_method(&self, method: &'static str, kind: MethodKind) {
        let mut methods = self.inner.methods.lock().unwrap();
        let entry = methods.entry(method).or_insert_with(|| MethodEntry {
            kind,
            accepts: VecDeque::new(),
            waiting: VecDeque::new(),
        });
        if entry.kind != kind {
            panic!("method kind mismatch on {}", method);
        }
    }

    /// Server side: queue a pending accept, then match as far as possible.
    pub(crate) fn register_accept(&self, method: &'static str, kind: MethodKind, bind: BindFn) {
        let mut methods = self.inner.methods.lock().unwrap();
        let entry = methods.get_mut(method).expect("method not declared");
        if entry.kind != kind {
            panic!("method kind mismatch on {}", method);
        }
        entry.accepts.push_back(bind);
        Self::drain(entry);
    }

    /// Client side: submit a call, matching it to an accept when one is
    /// available, queueing it otherwise.
    pub(crate) fn submit(&self, method: &'static str, call: WaitingCall) {
        let mut methods = self.inner.methods.lock().unwrap();
        let entry = methods.entry(method).or_insert_with(|| MethodEntry {
            kind: call.kind(),
            accepts: VecDeque::new(),
            waiting: VecDeque::new(),
        });
        if entry.kind != call.kind() {
            panic!("method kind mismatch on {}", method);
        }
        entry.waiting.push_back(call);
        Self::drain(entry);
    }

    fn drain(entry: &mut MethodEntry) {
        while !entry.accepts.is_empty() && !entry.waiting.is_empty() {
            let bind = entry.accepts.pop_front().unwrap();
            let call = entry.waiting.pop_front().unwrap();
            if let Err(call) = bind(call) {
                // Accept revoked by queue shutdown; try the next one.
                entry.waiting.push_front(call);
            }
        }
    }
}

/// Client/server shared state of one singular call.
pub(crate) struct UnaryCall {
    pub(crate) method: &'static str,
    pub(crate) peer: String,
    client_queue: InprocQueue,
    st: Mutex<UnarySt>,
}

struct UnarySt {
    request: Option<AnyMessage>,
    outcome: Option<Result<AnyMessage, Status>>,
    finish_tag: Option<Tag>,
    seat: Option<Arc<ServerSeat>>,
    cancelled: bool,
}

impl UnaryCall {
    pub(crate) fn new(
        method: &'static str, peer: String, client_queue: InprocQueue, request: AnyMessage,
    ) -> Self {
        Self {
            method,
            peer,
            client_queue,
            st: Mutex::new(UnarySt {
                request: Some(request),
                outcome: None,
                finish_tag: None,
                seat: None,
                cancelled: false,
            }),
        }
    }

    /// Server bind: move the request across.
    pub(crate) fn take_request(&self) -> Option<AnyMessage> {
        self.st.lock().unwrap().request.take()
    }

    pub(crate) fn attach_seat(&self, seat: Arc<ServerSeat>) {
        self.st.lock().unwrap().seat = Some(seat);
    }

    /// Client side: arm the terminal completion.
    pub(crate) fn arm_finish(&self, tag: Tag) {
        self.client_queue.register_pending(tag);
        let mut st = self.st.lock().unwrap();
        st.finish_tag = Some(tag);
        if st.outcome.is_some() {
            self.deliver_locked(&mut st);
        }
    }

    /// Server side (or expiry): settle the call once.
    pub(crate) fn complete(&self, outcome: Result<AnyMessage, Status>) {
        let mut st = self.st.lock().unwrap();
        if st.outcome.is_some() {
            return;
        }
        st.outcome = Some(outcome);
        self.deliver_locked(&mut st);
    }

    pub(crate) fn take_outcome(&self) -> Result<AnyMessage, Status> {
        self.st
            .lock()
            .unwrap()
            .outcome
            .take()
            .unwrap_or_else(|| Err(Status::internal("no outcome available")))
    }

    /// Cancel from the client half: settle locally, then tell the server.
    pub(crate) fn cancel(&self, status: Status) {
        let seat = {
            let mut st = self.st.lock().unwrap();
            if st.cancelled {
                return;
            }
            st.cancelled = true;
            if st.outcome.is_none() {
                st.outcome = Some(Err(status));
                self.deliver_locked(&mut st);
            }
            st.seat.clone()
        };
        if let Some(seat) = seat {
            seat.cancel();
        }
    }

    /// Schedule the deadline expiry hook on the client queue.
    pub(crate) fn schedule_expiry(self: Arc<Self>, after: Duration) {
        let queue = self.client_queue.clone();
        queue.schedule_task(
            Instant::now() + after,
            Box::new(move || self.cancel(Status::deadline_exceeded("deadline exceeded"))),
        );
    }

    fn deliver_locked(&self, st: &mut UnarySt) {
        if let Some(tag) = st.finish_tag.take() {
            if self.client_queue.claim_pending(tag) {
                self.client_queue.post(tag, true);
            }
        }
    }
}

/// Client/server shared state of one server-stream call.
pub(crate) struct StreamCall {
    pub(crate) method: &'static str,
    pub(crate) peer: String,
    client_queue: InprocQueue,
    st: Mutex<StreamSt>,
}

struct StreamSt {
    request: Option<AnyMessage>,
    start_tag: Option<Tag>,
    buffer: VecDeque<AnyMessage>,
    read_tag: Option<Tag>,
    read_slot: Option<AnyMessage>,
    status: Option<Status>,
    closed: bool,
    cancelled: bool,
    seat: Option<Arc<ServerSeat>>,
}

impl StreamCall {
    pub(crate) fn new(
        method: &'static str, peer: String, client_queue: InprocQueue, request: AnyMessage,
    ) -> Self {
        Self {
            method,
            peer,
            client_queue,
            st: Mutex::new(StreamSt {
                request: Some(request),
                start_tag: None,
                buffer: VecDeque::new(),
                read_tag: None,
                read_slot: None,
                status: None,
                closed: false,
                cancelled: false,
                seat: None,
            }),
        }
    }

    pub(crate) fn take_request(&self) -> Option<AnyMessage> {
        self.st.lock().unwrap().request.take()
    }

    /// Client side: arm the connect completion.
    pub(crate) fn arm_start(&self, tag: Tag) {
        self.client_queue.register_pending(tag);
        let mut st = self.st.lock().unwrap();
        st.start_tag = Some(tag);
        if st.seat.is_some() || st.closed {
            let ok = !st.closed;
            self.deliver_start_locked(&mut st, ok);
        }
    }

    /// Server bind: attach the seat and complete a pending connect.
    pub(crate) fn on_bound(&self, seat: Arc<ServerSeat>) {
        let mut st = self.st.lock().unwrap();
        st.seat = Some(seat);
        self.deliver_start_locked(&mut st, true);
    }

    /// Client side: arm one read.
    pub(crate) fn arm_read(&self, tag: Tag) {
        let mut st = self.st.lock().unwrap();
        if let Some(n) = st.buffer.pop_front() {
            st.read_slot = Some(n);
            self.client_queue.post(tag, true);
            return;
        }
        if st.closed {
            self.client_queue.post(tag, false);
            return;
        }
        self.client_queue.register_pending(tag);
        st.read_tag = Some(tag);
    }

    pub(crate) fn take_read(&self) -> Option<AnyMessage> {
        self.st.lock().unwrap().read_slot.take()
    }

    /// Server side: deliver one notification. False when the call is gone,
    /// which fails the write completion.
    pub(crate) fn push_from_server(&self, notification: AnyMessage) -> bool {
        let mut st = self.st.lock().unwrap();
        if st.cancelled || st.closed {
            return false;
        }
        match st.read_tag.take() {
            Some(tag) => {
                st.read_slot = Some(notification);
                if self.client_queue.claim_pending(tag) {
                    self.client_queue.post(tag, true);
                }
            }
            None => st.buffer.push_back(notification),
        }
        true
    }

    /// Server side: close the stream with `status`.
    pub(crate) fn close_from_server(&self, status: Status) {
        let mut st = self.st.lock().unwrap();
        if st.closed {
            return;
        }
        st.closed = true;
        st.status = Some(status);
        if let Some(tag) = st.read_tag.take() {
            if self.client_queue.claim_pending(tag) {
                self.client_queue.post(tag, false);
            }
        }
    }

    /// Client side: arm the terminal completion. Only legal once the
    /// stream broke, so the status is already known.
    pub(crate) fn arm_finish(&self, tag: Tag) {
        self.client_queue.post(tag, true);
    }

    pub(crate) fn take_status(&self) -> Status {
        let st = self.st.lock().unwrap();
        st.status.clone().unwrap_or_else(|| Status::internal("no status available"))
    }

    /// Cancel from the client half.
    pub(crate) fn cancel(&self, status: Status) {
        let seat = {
            let mut st = self.st.lock().unwrap();
            if st.cancelled {
                return;
            }
            st.cancelled = true;
            if !st.closed {
                st.closed = true;
                st.status = Some(status);
            }
            if let Some(tag) = st.read_tag.take() {
                if self.client_queue.claim_pending(tag) {
                    self.client_queue.post(tag, false);
                }
            }
            if let Some(tag) = st.start_tag.take() {
                if self.client_queue.claim_pending(tag) {
                    self.client_queue.post(tag, false);
                }
            }
            st.seat.clone()
        };
        if let Some(seat) = seat {
            seat.cancel();
        }
    }

    fn deliver_start_locked(&self, st: &mut StreamSt, ok: bool) {
        if let Some(tag) = st.start_tag.take() {
            if self.client_queue.claim_pending(tag) {
                self.client_queue.post(tag, ok);
            }
        }
    }
}
