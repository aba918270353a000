//! User-facing call objects submitted to the client engine.

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use cqrpc_core::config::RelaunchPolicy;
use cqrpc_core::runtime::{ClientChannel, StreamRoute, UnaryRoute};
use cqrpc_core::status::Status;

/// Identifier of one logical server-stream subscription, preserved across
/// relaunches. Unique within a client engine.
pub type SessionId = String;

/// Outcome of one singular call, handed to the completion callback.
pub struct Summary<Req, Resp> {
    pub request: Req,
    pub result: Result<Resp, Status>,
}

impl<Req, Resp> Summary<Req, Resp> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

impl<Req: fmt::Debug, Resp> fmt::Debug for Summary<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.result {
            Ok(_) => write!(f, "summary of {:?}: ok", self.request),
            Err(status) => write!(f, "summary of {:?}: {}", self.request, status),
        }
    }
}

pub type CompletionCallback<Req, Resp> = Box<dyn FnOnce(Summary<Req, Resp>) + Send>;

/// Request-response RPC, like a function call.
///
/// Runs under a deadline; the result or the error status comes back
/// through the completion callback.
pub struct SingularCall<C: ClientChannel, R: UnaryRoute<C>> {
    pub route: R,
    pub request: R::Request,
    pub callback: CompletionCallback<R::Request, R::Response>,
    /// Overrides the engine default when set.
    pub deadline: Option<Duration>,
    _marker: PhantomData<fn(C)>,
}

impl<C: ClientChannel, R: UnaryRoute<C>> SingularCall<C, R> {
    pub fn new(
        route: R, request: R::Request, callback: CompletionCallback<R::Request, R::Response>,
    ) -> Self {
        Self { route, request, callback, deadline: None, _marker: PhantomData }
    }
}

/// One event of a server stream: a notification, or the terminal status.
#[derive(Debug)]
pub enum StreamEvent<N> {
    Notification(N),
    Finished(Status),
}

impl<N> StreamEvent<N> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finished(_))
    }
}

pub type EventCallback<N> = Box<dyn FnMut(StreamEvent<N>) + Send>;

/// Server-stream RPC: one request, a stream of notifications.
///
/// The session id must be unique within the client, as must the request
/// type across live streams. Deadline, relaunch interval and policy fall
/// back to the engine defaults when unset.
pub struct ServerStreamCall<C: ClientChannel, R: StreamRoute<C>> {
    pub session_id: SessionId,
    pub route: R,
    pub request: R::Request,
    pub callback: EventCallback<R::Notification>,
    /// Recorded for the call; stream contexts run without a deadline, the
    /// relaunch interval governs reconnection.
    pub deadline: Option<Duration>,
    pub relaunch_interval: Option<Duration>,
    pub relaunch_policy: Option<RelaunchPolicy>,
    _marker: PhantomData<fn(C)>,
}

impl<C: ClientChannel, R: StreamRoute<C>> ServerStreamCall<C, R> {
    pub fn new(
        session_id: SessionId, route: R, request: R::Request,
        callback: EventCallback<R::Notification>,
    ) -> Self {
        assert!(!session_id.is_empty(), "empty session id");
        Self {
            session_id,
            route,
            request,
            callback,
            deadline: None,
            relaunch_interval: None,
            relaunch_policy: None,
            _marker: PhantomData,
        }
    }
}

/// Command shutting one server stream down.
pub struct ServerStreamShutdown {
    pub session_id: SessionId,
}

impl ServerStreamShutdown {
    pub fn new(session_id: SessionId) -> Self {
        assert!(!session_id.is_empty(), "empty session id");
        Self { session_id }
    }
}
