//! Server-side state machine of one singular call: one inbound request,
//! one outbound response or error status.
//!
//! The machine is armed by `run`, waits for a request, spawns its own
//! replacement, hands the request to userspace, and hops back onto a
//! dispatcher thread through an immediate alarm when userspace responds.
//! The current state is encoded into the tag flags on every armed
//! operation and cross-checked on delivery.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use cqrpc_core::context::{self, Aliveness, CallFsm};
use cqrpc_core::runtime::{
    Alarm, CompletionQueue, ServerContext, UnaryPending, UnaryPort, UnaryWriter,
};
use cqrpc_core::status::Status;
use cqrpc_core::tag::{ContextId, Flags};

use super::SingularCallback;

const REQUEST_FLAGS: Flags = Flags::new(0b01);
const ALARM_FLAGS: Flags = Flags::new(0b10);
const FINISH_FLAGS: Flags = Flags::new(0b11);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StandingBy,
    AwaitingRequest,
    AwaitingResponse,
    AwaitingAlarm,
    AwaitingFinish,
}

pub(crate) struct SingularMethodFsm<P: UnaryPort> {
    shared: Arc<SingularShared<P>>,
}

impl<P: UnaryPort> SingularMethodFsm<P> {
    pub(crate) fn new(port: P, queue: P::Queue, callback: SingularCallback<P>) -> Self {
        let alarm = queue.alarm();
        Self {
            shared: Arc::new(SingularShared {
                port,
                queue,
                callback,
                alarm,
                inner: UnsafeCell::new(FsmInner {
                    state: State::StandingBy,
                    this: None,
                    pending: None,
                    response: None,
                }),
            }),
        }
    }
}

impl<P: UnaryPort> CallFsm for SingularMethodFsm<P> {
    fn run(&self, this: ContextId) {
        self.shared.run(this);
    }

    fn on_event(&self, this: ContextId, ok: bool, flags: Flags) -> Aliveness {
        self.shared.clone().on_event(this, ok, flags)
    }
}

struct SingularShared<P: UnaryPort> {
    port: P,
    queue: P::Queue,
    callback: SingularCallback<P>,
    alarm: <P::Queue as CompletionQueue>::Alarm,
    inner: UnsafeCell<FsmInner<P>>,
}

struct FsmInner<P: UnaryPort> {
    state: State,
    this: Option<ContextId>,
    pending: Option<UnaryPending<P>>,
    response: Option<Result<P::Response, Status>>,
}

// At most one tag of this machine is ever in flight, events for one tag
// are linearized, and userspace touches the machine only through respond()
// while nothing is in flight. Accesses to the inner state therefore never
// overlap.
unsafe impl<P: UnaryPort> Send for SingularShared<P> {}
unsafe impl<P: UnaryPort> Sync for SingularShared<P> {}

impl<P: UnaryPort> SingularShared<P> {
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    fn inner_mut(&self) -> &mut FsmInner<P> {
        unsafe { &mut *self.inner.get() }
    }

    fn run(&self, this: ContextId) {
        let inner = self.inner_mut();
        debug_assert_eq!(inner.state, State::StandingBy, "illegal state");
        inner.this = Some(this);
        inner.state = State::AwaitingRequest;
        trace!("{} running", self.identity(inner));
        inner.pending = Some(self.port.accept(&self.queue, this.tag(REQUEST_FLAGS)));
    }

    fn on_event(self: Arc<Self>, this: ContextId, ok: bool, flags: Flags) -> Aliveness {
        let inner = self.inner_mut();
        trace!(
            "{} got event, state - {:?}, ok - {}, flags - {:?}",
            self.identity(inner),
            inner.state,
            ok,
            flags
        );

        if !ok {
            warn!("{} not ok, destructing", self.identity(inner));
            return Aliveness::Dead;
        }

        match inner.state {
            State::AwaitingRequest => Self::on_request(&self, inner, this, flags),
            State::AwaitingAlarm => self.on_alarm(inner, this, flags),
            State::AwaitingFinish => {
                debug_assert_eq!(flags, FINISH_FLAGS, "completion kind mismatch");
                trace!("{} finished, destructing", self.identity(inner));
                Aliveness::Dead
            }
            State::StandingBy | State::AwaitingResponse => {
                error!("{} event in illegal state {:?}", self.identity(inner), inner.state);
                debug_assert!(false, "illegal state");
                Aliveness::Dead
            }
        }
    }

    fn on_request(
        shared: &Arc<Self>, inner: &mut FsmInner<P>, this: ContextId, flags: Flags,
    ) -> Aliveness {
        if flags != REQUEST_FLAGS {
            error!("{} unexpected completion {:?}", shared.identity(inner), flags);
            debug_assert!(false, "completion kind mismatch");
            return Aliveness::Dead;
        }
        // The replacement keeps the method armed before userspace runs.
        context::launch(Box::new(SingularMethodFsm::new(
            shared.port.clone(),
            shared.queue.clone(),
            shared.callback.clone(),
        )));

        let request = inner
            .pending
            .as_ref()
            .and_then(|p| p.request.take())
            .expect("accept completed without a request");
        let peer = inner.pending.as_ref().map(|p| p.context.peer()).unwrap_or_default();
        inner.state = State::AwaitingResponse;
        trace!("{} notifying userspace", shared.identity(inner));

        let method = SingularMethod {
            fsm: shared.clone(),
            this,
            peer,
            request: Some(request),
            responded: false,
        };
        (shared.callback.as_ref())(method);
        Aliveness::Alive
    }

    fn on_alarm(&self, inner: &mut FsmInner<P>, this: ContextId, flags: Flags) -> Aliveness {
        if flags != ALARM_FLAGS {
            error!("{} unexpected completion {:?}", self.identity(inner), flags);
            debug_assert!(false, "completion kind mismatch");
            return Aliveness::Dead;
        }
        inner.state = State::AwaitingFinish;
        let pending = inner.pending.as_ref().expect("no pending call");
        match inner.response.take().expect("no response when finishing") {
            Ok(response) => {
                trace!("{} writing", self.identity(inner));
                pending.writer.finish(response, this.tag(FINISH_FLAGS));
            }
            Err(status) => {
                trace!("{} finishing with {}", self.identity(inner), status);
                pending.writer.finish_with_error(status, this.tag(FINISH_FLAGS));
            }
        }
        Aliveness::Alive
    }

    /// Userspace responds; hop back onto a dispatcher thread.
    fn respond(&self, response: Result<P::Response, Status>) {
        let inner = self.inner_mut();
        debug_assert_eq!(inner.state, State::AwaitingResponse, "illegal state");
        trace!("{} userspace responds", self.identity(inner));
        inner.response = Some(response);
        inner.state = State::AwaitingAlarm;
        let this = inner.this.expect("responding before run");
        self.alarm.set(Instant::now(), this.tag(ALARM_FLAGS));
    }

    fn identity(&self, inner: &FsmInner<P>) -> String {
        format!(
            "{}[{}]",
            self.port.descriptor().full_name(),
            inner.this.map(|t| format!("{}", t)).unwrap_or_default()
        )
    }
}

impl<P: UnaryPort> fmt::Debug for SingularMethodFsm<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.shared.port.descriptor().full_name())
    }
}

/// Inbound singular request handed to userspace.
///
/// Holds the request and the right to respond exactly once. Dropping the
/// handle without responding abandons the call; the client side is then
/// governed by its own deadline.
pub struct SingularMethod<P: UnaryPort> {
    fsm: Arc<SingularShared<P>>,
    this: ContextId,
    peer: String,
    request: Option<P::Request>,
    responded: bool,
}

impl<P: UnaryPort> SingularMethod<P> {
    /// Remote address of the caller.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn request(&self) -> &P::Request {
        self.request.as_ref().expect("request already taken")
    }

    /// Move the request out, e.g. to build the response in place.
    pub fn take_request(&mut self) -> P::Request {
        self.request.take().expect("request already taken")
    }

    /// Send the response or an error status; allowed exactly once.
    pub fn respond(mut self, response: Result<P::Response, Status>) {
        self.responded = true;
        self.fsm.respond(response);
    }
}

impl<P: UnaryPort> Drop for SingularMethod<P> {
    fn drop(&mut self) {
        if !self.responded {
            warn!("singular method dropped without a response, abandoning the call");
            // No tag is in flight while userspace owns the call, so the
            // cell can be reclaimed directly; this shared block stays
            // alive until the handle is gone.
            unsafe { context::reclaim(self.this) };
        }
    }
}

impl<P: UnaryPort> fmt::Debug for SingularMethod<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "singular method from {}", self.peer)
    }
}
