//! Client half of the in-process substrate: channel, call contexts,
//! routes and readers.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cqrpc_core::config::{ClientOptions, Credentials};
use cqrpc_core::runtime::{
    ClientChannel, ClientContext, MethodDescriptor, StreamReader, StreamRoute, UnaryReader,
    UnaryRoute,
};
use cqrpc_core::status::Status;
use cqrpc_core::tag::Tag;

use crate::hub::{Hub, StreamCall, UnaryCall, WaitingCall};
use crate::queue::InprocQueue;

/// Credentials accepted by the in-process transport.
pub struct InsecureCredentials;

impl Credentials for InsecureCredentials {}

/// Connection of one client to a [`Hub`].
pub struct InprocChannel {
    hub: Hub,
    peer: String,
    request_size_limit: Option<usize>,
    response_size_limit: Option<usize>,
}

impl InprocChannel {
    pub(crate) fn new(hub: Hub, options: &ClientOptions) -> Self {
        let id = hub.next_client_id();
        Self {
            hub,
            peer: format!("inproc:client-{}", id),
            request_size_limit: options.request_size_limit(),
            response_size_limit: options.response_size_limit(),
        }
    }

    /// Recorded from the options; the in-process wire moves typed values
    /// and does not enforce byte limits.
    pub fn request_size_limit(&self) -> Option<usize> {
        self.request_size_limit
    }

    pub fn response_size_limit(&self) -> Option<usize> {
        self.response_size_limit
    }
}

impl ClientChannel for InprocChannel {
    type Queue = InprocQueue;
    type Context = InprocClientContext;

    fn new_call_context(&self) -> InprocClientContext {
        InprocClientContext {
            core: Arc::new(CtxCore {
                cancelled: AtomicBool::new(false),
                fail_fast: AtomicBool::new(false),
                deadline: Mutex::new(None),
                target: Mutex::new(None),
            }),
        }
    }
}

struct CtxCore {
    cancelled: AtomicBool,
    fail_fast: AtomicBool,
    deadline: Mutex<Option<Duration>>,
    target: Mutex<Option<CtxTarget>>,
}

enum CtxTarget {
    Unary(Arc<UnaryCall>),
    Stream(Arc<StreamCall>),
}

/// Per-call client context.
#[derive(Clone)]
pub struct InprocClientContext {
    core: Arc<CtxCore>,
}

impl InprocClientContext {
    fn attach_unary(&self, call: Arc<UnaryCall>) {
        if self.core.cancelled.load(Ordering::SeqCst) {
            call.cancel(Status::cancelled("call cancelled"));
        }
        *self.core.target.lock().unwrap() = Some(CtxTarget::Unary(call));
    }

    fn attach_stream(&self, call: Arc<StreamCall>) {
        if self.core.cancelled.load(Ordering::SeqCst) {
            call.cancel(Status::cancelled("call cancelled"));
        }
        *self.core.target.lock().unwrap() = Some(CtxTarget::Stream(call));
    }

    fn deadline(&self) -> Option<Duration> {
        *self.core.deadline.lock().unwrap()
    }
}

impl ClientContext for InprocClientContext {
    fn set_deadline(&self, after: Duration) {
        *self.core.deadline.lock().unwrap() = Some(after);
    }

    fn set_fail_fast(&self, enabled: bool) {
        self.core.fail_fast.store(enabled, Ordering::SeqCst);
    }

    fn try_cancel(&self) {
        self.core.cancelled.store(true, Ordering::SeqCst);
        let target = {
            let target = self.core.target.lock().unwrap();
            match &*target {
                Some(CtxTarget::Unary(call)) => Some(CtxTarget::Unary(call.clone())),
                Some(CtxTarget::Stream(call)) => Some(CtxTarget::Stream(call.clone())),
                None => None,
            }
        };
        match target {
            Some(CtxTarget::Unary(call)) => call.cancel(Status::cancelled("call cancelled")),
            Some(CtxTarget::Stream(call)) => call.cancel(Status::cancelled("call cancelled")),
            None => {}
        }
    }
}

/// Client stub of one singular method.
pub struct InprocUnaryRoute<Req, Resp> {
    descriptor: MethodDescriptor,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Clone for InprocUnaryRoute<Req, Resp> {
    fn clone(&self) -> Self {
        Self { descriptor: self.descriptor.clone(), _marker: PhantomData }
    }
}

impl<Req, Resp> InprocUnaryRoute<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(method: &'static str) -> Self {
        Self { descriptor: MethodDescriptor::new::<Req, Resp>(method), _marker: PhantomData }
    }
}

impl<Req, Resp> UnaryRoute<InprocChannel> for InprocUnaryRoute<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    type Request = Req;
    type Response = Resp;
    type Reader = InprocUnaryReader<Resp>;

    fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    fn open(
        &self, channel: &InprocChannel, context: &InprocClientContext, request: &Req,
        queue: &InprocQueue,
    ) -> InprocUnaryReader<Resp> {
        let call = Arc::new(UnaryCall::new(
            self.descriptor.full_name(),
            channel.peer.clone(),
            queue.clone(),
            Box::new(request.clone()),
        ));
        context.attach_unary(call.clone());
        InprocUnaryReader {
            hub: channel.hub.clone(),
            call,
            context: context.clone(),
            _marker: PhantomData,
        }
    }
}

/// Response reader of one singular call.
pub struct InprocUnaryReader<Resp> {
    hub: Hub,
    call: Arc<UnaryCall>,
    context: InprocClientContext,
    _marker: PhantomData<fn() -> Resp>,
}

impl<Resp: Send + 'static> UnaryReader<Resp> for InprocUnaryReader<Resp> {
    fn start_call(&self) {
        if let Some(after) = self.context.deadline() {
            self.call.clone().schedule_expiry(after);
        }
        self.hub.submit(self.call.method, WaitingCall::Unary(self.call.clone()));
    }

    fn finish(&self, tag: Tag) {
        self.call.arm_finish(tag);
    }

    fn take(&self) -> Result<Resp, Status> {
        self.call.take_outcome().map(|message| {
            *message
                .downcast::<Resp>()
                .unwrap_or_else(|_| panic!("response type mismatch on {}", self.call.method))
        })
    }
}

/// Client stub of one server-stream method.
pub struct InprocStreamRoute<Req, N> {
    descriptor: MethodDescriptor,
    _marker: PhantomData<fn(Req) -> N>,
}

impl<Req, N> Clone for InprocStreamRoute<Req, N> {
    fn clone(&self) -> Self {
        Self { descriptor: self.descriptor.clone(), _marker: PhantomData }
    }
}

impl<Req, N> InprocStreamRoute<Req, N>
where
    Req: Clone + Send + 'static,
    N: Send + 'static,
{
    pub fn new(method: &'static str) -> Self {
        Self { descriptor: MethodDescriptor::new::<Req, N>(method), _marker: PhantomData }
    }
}

impl<Req, N> StreamRoute<InprocChannel> for InprocStreamRoute<Req, N>
where
    Req: Clone + Send + 'static,
    N: Send + 'static,
{
    type Request = Req;
    type Notification = N;
    type Reader = InprocStreamReader<N>;

    fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    fn open(
        &self, channel: &InprocChannel, context: &InprocClientContext, request: &Req,
        queue: &InprocQueue,
    ) -> InprocStreamReader<N> {
        let call = Arc::new(StreamCall::new(
            self.descriptor.full_name(),
            channel.peer.clone(),
            queue.clone(),
            Box::new(request.clone()),
        ));
        context.attach_stream(call.clone());
        InprocStreamReader { hub: channel.hub.clone(), call, _marker: PhantomData }
    }
}

/// Notification reader of one server-stream call.
pub struct InprocStreamReader<N> {
    hub: Hub,
    call: Arc<StreamCall>,
    _marker: PhantomData<fn() -> N>,
}

impl<N: Send + 'static> StreamReader<N> for InprocStreamReader<N> {
    fn start_call(&self, tag: Tag) {
        self.call.arm_start(tag);
        self.hub.submit(self.call.method, WaitingCall::Stream(self.call.clone()));
    }

    fn read(&self, tag: Tag) {
        self.call.arm_read(tag);
    }

    fn take_notification(&self) -> Option<N> {
        self.call.take_read().map(|message| {
            *message
                .downcast::<N>()
                .unwrap_or_else(|_| panic!("notification type mismatch on {}", self.call.method))
        })
    }

    fn finish(&self, tag: Tag) {
        self.call.arm_finish(tag);
    }

    fn take_status(&self) -> Status {
        self.call.take_status()
    }
}
