//! Server half of the in-process substrate: method ports, per-call seats,
//! contexts and writers.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use cqrpc_core::runtime::{
    MethodDescriptor, RequestSlot, ServerContext, StreamPending, StreamPort, StreamWriter,
    UnaryPending, UnaryPort, UnaryWriter,
};
use cqrpc_core::status::Status;
use cqrpc_core::tag::Tag;

use crate::hub::{Hub, MethodKind, StreamCall, UnaryCall, WaitingCall};
use crate::queue::InprocQueue;

/// Server view of one service; a factory of method ports.
#[derive(Clone)]
pub struct InprocService {
    hub: Hub,
}

impl InprocService {
    pub(crate) fn new(hub: Hub) -> Self {
        Self { hub }
    }

    pub fn unary_port<Req, Resp>(&self, method: &'static str) -> InprocUnaryPort<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        self.hub.declare_method(method, MethodKind::Unary);
        InprocUnaryPort {
            hub: self.hub.clone(),
            descriptor: MethodDescriptor::new::<Req, Resp>(method),
            _marker: PhantomData,
        }
    }

    pub fn stream_port<Req, N>(&self, method: &'static str) -> InprocStreamPort<Req, N>
    where
        Req: Send + 'static,
        N: Send + 'static,
    {
        self.hub.declare_method(method, MethodKind::Stream);
        InprocStreamPort {
            hub: self.hub.clone(),
            descriptor: MethodDescriptor::new::<Req, N>(method),
            _marker: PhantomData,
        }
    }
}

/// Server side of one accept slot; becomes a live call once bound.
pub(crate) struct ServerSeat {
    queue: InprocQueue,
    st: Mutex<SeatSt>,
}

struct SeatSt {
    peer: String,
    done_tag: Option<Tag>,
    cancelled: bool,
    closed: bool,
    bound: Option<BoundCall>,
}

#[derive(Clone)]
pub(crate) enum BoundCall {
    Unary(Arc<UnaryCall>),
    Stream(Arc<StreamCall>),
}

impl ServerSeat {
    fn new(queue: InprocQueue) -> Self {
        Self {
            queue,
            st: Mutex::new(SeatSt {
                peer: String::new(),
                done_tag: None,
                cancelled: false,
                closed: false,
                bound: None,
            }),
        }
    }

    fn set_done_tag(&self, tag: Tag) {
        self.st.lock().unwrap().done_tag = Some(tag);
    }

    /// Attach the matched call. The done tag becomes a tracked pending
    /// operation only now; an unmatched accept never delivers it.
    fn bind(&self, call: BoundCall, peer: String) {
        let mut st = self.st.lock().unwrap();
        st.peer = peer;
        st.bound = Some(call);
        if let Some(done) = st.done_tag {
            self.queue.register_pending(done);
        }
    }

    fn peer(&self) -> String {
        self.st.lock().unwrap().peer.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.st.lock().unwrap().cancelled
    }

    /// Remote (client) cancellation: flag it and fire the done tag first,
    /// before any in-flight server operation fails.
    pub(crate) fn cancel(&self) {
        let done = {
            let mut st = self.st.lock().unwrap();
            if st.cancelled {
                return;
            }
            st.cancelled = true;
            st.done_tag.take()
        };
        if let Some(tag) = done {
            if self.queue.claim_pending(tag) {
                self.queue.post(tag, true);
            }
        }
    }

    /// Server-initiated cancel via the context.
    fn cancel_from_server(&self) {
        let bound = {
            let st = self.st.lock().unwrap();
            st.bound.clone()
        };
        match bound {
            Some(BoundCall::Unary(call)) => {
                call.complete(Err(Status::cancelled("cancelled by server")))
            }
            Some(BoundCall::Stream(call)) => {
                call.close_from_server(Status::cancelled("cancelled by server"))
            }
            None => {}
        }
        self.cancel();
    }

    /// Close the call from the writer. Returns the bound call for the
    /// caller to settle, after the done tag and the op completion have
    /// been posted in contract order.
    fn finish_op(&self, tag: Tag) -> Option<BoundCall> {
        let (bound, done, dead) = {
            let mut st = self.st.lock().unwrap();
            let dead = st.cancelled || st.bound.is_none();
            if !dead {
                st.closed = true;
            }
            (st.bound.clone(), st.done_tag.take(), dead)
        };
        if dead {
            self.queue.post(tag, false);
            return None;
        }
        if let Some(done) = done {
            if self.queue.claim_pending(done) {
                self.queue.post(done, true);
            }
        }
        self.queue.post(tag, true);
        bound
    }

    fn write_op(&self, tag: Tag) -> Option<BoundCall> {
        let (bound, dead) = {
            let st = self.st.lock().unwrap();
            (st.bound.clone(), st.cancelled || st.bound.is_none())
        };
        if dead {
            self.queue.post(tag, false);
            return None;
        }
        // The write completion is posted by the caller once the call half
        // took the notification; a vanished call fails it instead.
        bound
    }

    fn post(&self, tag: Tag, ok: bool) {
        self.queue.post(tag, ok);
    }
}

impl Drop for ServerSeat {
    fn drop(&mut self) {
        // The server context went away without finishing; break the call so
        // the client does not hang on a dead stream.
        let st = self.st.get_mut().unwrap();
        if st.closed || st.cancelled {
            return;
        }
        match st.bound.take() {
            Some(BoundCall::Unary(call)) => {
                call.complete(Err(Status::unavailable("server call dropped")))
            }
            Some(BoundCall::Stream(call)) => {
                call.close_from_server(Status::unavailable("server call dropped"))
            }
            None => {}
        }
    }
}

/// Server context handed to the singular and stream state machines.
#[derive(Clone)]
pub struct InprocServerContext {
    seat: Arc<ServerSeat>,
}

impl ServerContext for InprocServerContext {
    fn peer(&self) -> String {
        self.seat.peer()
    }

    fn is_cancelled(&self) -> bool {
        self.seat.is_cancelled()
    }

    fn notify_when_done(&self, tag: Tag) {
        self.seat.set_done_tag(tag);
    }

    fn try_cancel(&self) {
        self.seat.cancel_from_server();
    }
}

/// Response writer of one singular call.
pub struct InprocUnaryWriter<Resp> {
    seat: Arc<ServerSeat>,
    _marker: PhantomData<fn(Resp)>,
}

impl<Resp: Send + 'static> UnaryWriter<Resp> for InprocUnaryWriter<Resp> {
    fn finish(&self, response: Resp, tag: Tag) {
        if let Some(BoundCall::Unary(call)) = self.seat.finish_op(tag) {
            call.complete(Ok(Box::new(response)));
        }
    }

    fn finish_with_error(&self, status: Status, tag: Tag) {
        if let Some(BoundCall::Unary(call)) = self.seat.finish_op(tag) {
            call.complete(Err(status));
        }
    }
}

/// Notification writer of one server stream.
pub struct InprocStreamWriter<N> {
    seat: Arc<ServerSeat>,
    _marker: PhantomData<fn(N)>,
}

impl<N: Send + 'static> StreamWriter<N> for InprocStreamWriter<N> {
    fn write(&self, notification: N, tag: Tag) {
        if let Some(BoundCall::Stream(call)) = self.seat.write_op(tag) {
            let ok = call.push_from_server(Box::new(notification));
            self.seat.post(tag, ok);
        }
    }

    fn finish(&self, status: Status, tag: Tag) {
        if let Some(BoundCall::Stream(call)) = self.seat.finish_op(tag) {
            call.close_from_server(status);
        }
    }
}

/// Acceptor of one singular method.
pub struct InprocUnaryPort<Req, Resp> {
    hub: Hub,
    descriptor: MethodDescriptor,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Clone for InprocUnaryPort<Req, Resp> {
    fn clone(&self) -> Self {
        Self { hub: self.hub.clone(), descriptor: self.descriptor.clone(), _marker: PhantomData }
    }
}

impl<Req, Resp> UnaryPort for InprocUnaryPort<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Request = Req;
    type Response = Resp;
    type Context = InprocServerContext;
    type Writer = InprocUnaryWriter<Resp>;
    type Queue = InprocQueue;

    fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    fn accept(&self, queue: &InprocQueue, tag: Tag) -> UnaryPending<Self> {
        queue.register_pending(tag);
        let seat = Arc::new(ServerSeat::new(queue.clone()));
        let slot = RequestSlot::new();
        let method = self.descriptor.full_name();

        let bind = {
            let queue = queue.clone();
            let seat = seat.clone();
            let slot = slot.clone();
            Box::new(move |waiting: WaitingCall| -> Result<(), WaitingCall> {
                let WaitingCall::Unary(call) = waiting else {
                    panic!("method kind mismatch on {}", method);
                };
                if !queue.claim_pending(tag) {
                    return Err(WaitingCall::Unary(call));
                }
                let request = call.take_request().expect("request already taken");
                let request = request
                    .downcast::<Req>()
                    .unwrap_or_else(|_| panic!("request type mismatch on {}", method));
                slot.put(*request);
                seat.bind(BoundCall::Unary(call.clone()), call.peer.clone());
                call.attach_seat(seat.clone());
                queue.post(tag, true);
                Ok(())
            })
        };
        self.hub.register_accept(method, MethodKind::Unary, bind);

        UnaryPending {
            context: InprocServerContext { seat: seat.clone() },
            request: slot,
            writer: InprocUnaryWriter { seat, _marker: PhantomData },
        }
    }
}

/// Acceptor of one server-stream method.
pub struct InprocStreamPort<Req, N> {
    hub: Hub,
    descriptor: MethodDescriptor,
    _marker: PhantomData<fn(Req) -> N>,
}

impl<Req, N> Clone for InprocStreamPort<Req, N> {
    fn clone(&self) -> Self {
        Self { hub: self.hub.clone(), descriptor: self.descriptor.clone(), _marker: PhantomData }
    }
}

impl<Req, N> StreamPort for InprocStreamPort<Req, N>
where
    Req: Send + 'static,
    N: Send + 'static,
{
    type Request = Req;
    type Notification = N;
    type Context = InprocServerContext;
    type Writer = InprocStreamWriter<N>;
    type Queue = InprocQueue;

    fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    fn accept(&self, queue: &InprocQueue, tag: Tag) -> StreamPending<Self> {
        queue.register_pending(tag);
        let seat = Arc::new(ServerSeat::new(queue.clone()));
        let slot = RequestSlot::new();
        let method = self.descriptor.full_name();

        let bind = {
            let queue = queue.clone();
            let seat = seat.clone();
            let slot = slot.clone();
            Box::new(move |waiting: WaitingCall| -> Result<(), WaitingCall> {
                let WaitingCall::Stream(call) = waiting else {
                    panic!("method kind mismatch on {}", method);
                };
                if !queue.claim_pending(tag) {
                    return Err(WaitingCall::Stream(call));
                }
                let request = call.take_request().expect("request already taken");
                let request = request
                    .downcast::<Req>()
                    .unwrap_or_else(|_| panic!("request type mismatch on {}", method));
                slot.put(*request);
                seat.bind(BoundCall::Stream(call.clone()), call.peer.clone());
                call.on_bound(seat.clone());
                queue.post(tag, true);
                Ok(())
            })
        };
        self.hub.register_accept(method, MethodKind::Stream, bind);

        StreamPending {
            context: InprocServerContext { seat: seat.clone() },
            request: slot,
            writer: InprocStreamWriter { seat, _marker: PhantomData },
        }
    }
}
