//! Contracts of the underlying completion-queue RPC runtime.
//!
//! The engines are written against these traits rather than a concrete
//! transport: per-method acceptors post pending-request entries, writers
//! and readers arm tagged operations, and an alarm can fire a tag at a
//! chosen time. [cqrpc-inproc](https://docs.rs/cqrpc-inproc) carries the
//! in-process realization used by the integration suite.
//!
//! Ordering contract every implementation must honor:
//!
//! 1. Events for one tag are linearized, and at most one thread processes
//!    a given tag at a time.
//! 2. The done notification registered via
//!    [`ServerContext::notify_when_done`] is delivered exactly once per
//!    accepted call, `ok = true`, before any completion that fails because
//!    of cancellation, and before the finish completion on a normal close.
//!    It is never delivered for an accept that did not match a call.
//! 3. On [`CompletionQueue::shutdown`], pending accepts complete
//!    `ok = false`, pending alarms fire `ok = false`, queued events drain,
//!    then `next` returns `None`.

use std::any::TypeId;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::status::Status;
use crate::tag::Tag;

/// Blocking completion queue delivering `(tag, ok)` events.
pub trait CompletionQueue: Clone + Send + Sync + 'static {
    type Alarm: Alarm;

    fn new() -> Self;

    /// Blocking dequeue; `None` once the queue is shut down and drained.
    fn next(&self) -> Option<(Tag, bool)>;

    fn shutdown(&self);

    /// Create an alarm bound to this queue.
    fn alarm(&self) -> Self::Alarm;
}

/// Completion-queue timer.
///
/// `set` schedules `(tag, ok = true)` at `deadline`, firing immediately
/// when the deadline is due. `cancel` delivers a still-pending completion
/// with `ok = false` instead.
pub trait Alarm: Send + Sync + 'static {
    fn set(&self, deadline: Instant, tag: Tag);

    fn cancel(&self);
}

/// Server half of one call: observation and cancellation surface.
pub trait ServerContext: Send + Sync + 'static {
    fn peer(&self) -> String;

    fn is_cancelled(&self) -> bool;

    /// Register a tag completed when the call terminates, see the module
    /// level ordering contract.
    fn notify_when_done(&self, tag: Tag);

    fn try_cancel(&self);
}

/// Cell the runtime fills with the inbound request when an accept
/// completes with `ok = true`.
pub struct RequestSlot<T>(Arc<Mutex<Option<T>>>);

impl<T> RequestSlot<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    /// Runtime side: store the matched request.
    pub fn put(&self, value: T) {
        *self.0.lock().unwrap() = Some(value);
    }

    /// Machine side: take the request after the accept completion.
    pub fn take(&self) -> Option<T> {
        self.0.lock().unwrap().take()
    }
}

impl<T> Default for RequestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for RequestSlot<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Async response writer of a singular call.
pub trait UnaryWriter<R>: Send + Sync + 'static {
    fn finish(&self, response: R, tag: Tag);

    fn finish_with_error(&self, status: Status, tag: Tag);
}

/// Async writer of a server stream.
pub trait StreamWriter<N>: Send + Sync + 'static {
    fn write(&self, notification: N, tag: Tag);

    fn finish(&self, status: Status, tag: Tag);
}

/// Per-method acceptor for singular calls, bound to a service.
///
/// Arming posts a pending-request entry on `queue`; the entry completes
/// `(tag, ok = true)` when a call arrives, with the request stored in the
/// returned slot.
pub trait UnaryPort: Send + Sync + Clone + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;
    type Context: ServerContext;
    type Writer: UnaryWriter<Self::Response>;
    type Queue: CompletionQueue;

    fn descriptor(&self) -> &MethodDescriptor;

    fn accept(&self, queue: &Self::Queue, tag: Tag) -> UnaryPending<Self>;
}

/// Per-call objects handed out by [`UnaryPort::accept`].
pub struct UnaryPending<P: UnaryPort + ?Sized> {
    pub context: P::Context,
    pub request: RequestSlot<P::Request>,
    pub writer: P::Writer,
}

/// Per-method acceptor for server-stream calls.
pub trait StreamPort: Send + Sync + Clone + 'static {
    type Request: Send + 'static;
    type Notification: Send + 'static;
    type Context: ServerContext;
    type Writer: StreamWriter<Self::Notification>;
    type Queue: CompletionQueue;

    fn descriptor(&self) -> &MethodDescriptor;

    fn accept(&self, queue: &Self::Queue, tag: Tag) -> StreamPending<Self>;
}

/// Per-call objects handed out by [`StreamPort::accept`].
pub struct StreamPending<P: StreamPort + ?Sized> {
    pub context: P::Context,
    pub request: RequestSlot<P::Request>,
    pub writer: P::Writer,
}

/// Client half of one call.
pub trait ClientContext: Send + Sync + Clone + 'static {
    fn set_deadline(&self, after: Duration);

    fn set_fail_fast(&self, enabled: bool);

    fn try_cancel(&self);
}

/// Connection to a remote service, factory of per-call contexts.
pub trait ClientChannel: Send + Sync + 'static {
    type Queue: CompletionQueue;
    type Context: ClientContext;

    fn new_call_context(&self) -> Self::Context;
}

/// Response reader of one singular call.
pub trait UnaryReader<R>: Send + Sync + 'static {
    fn start_call(&self);

    /// Arm the terminal completion; `take` yields the outcome afterwards.
    fn finish(&self, tag: Tag);

    fn take(&self) -> Result<R, Status>;
}

/// Notification reader of one server-stream call.
pub trait StreamReader<N>: Send + Sync + 'static {
    fn start_call(&self, tag: Tag);

    /// Arm one read; on `ok = true`, `take_notification` yields the value.
    fn read(&self, tag: Tag);

    fn take_notification(&self) -> Option<N>;

    /// Arm the terminal completion; `take_status` yields the status.
    fn finish(&self, tag: Tag);

    fn take_status(&self) -> Status;
}

/// Client stub function of one singular method.
pub trait UnaryRoute<C: ClientChannel>: Send + Sync + Clone + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;
    type Reader: UnaryReader<Self::Response>;

    fn descriptor(&self) -> &MethodDescriptor;

    fn open(
        &self, channel: &C, context: &C::Context, request: &Self::Request, queue: &C::Queue,
    ) -> Self::Reader;
}

/// Client stub function of one server-stream method.
///
/// Requests are `Clone` so a broken stream can be relaunched with the same
/// payload.
pub trait StreamRoute<C: ClientChannel>: Send + Sync + Clone + 'static {
    type Request: Clone + Send + 'static;
    type Notification: Send + 'static;
    type Reader: StreamReader<Self::Notification>;

    fn descriptor(&self) -> &MethodDescriptor;

    fn open(
        &self, channel: &C, context: &C::Context, request: &Self::Request, queue: &C::Queue,
    ) -> Self::Reader;
}

/// Runtime type identity with a readable name, used for registration
/// validation.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: 'static>() -> Self {
        Self { id: TypeId::of::<T>(), name: std::any::type_name::<T>() }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Identity of one RPC method plus the message types it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    full_name: &'static str,
    input: TypeKey,
    output: TypeKey,
}

impl MethodDescriptor {
    pub fn new<In: 'static, Out: 'static>(full_name: &'static str) -> Self {
        Self { full_name, input: TypeKey::of::<In>(), output: TypeKey::of::<Out>() }
    }

    pub fn full_name(&self) -> &'static str {
        self.full_name
    }

    pub fn input(&self) -> &TypeKey {
        &self.input
    }

    pub fn output(&self) -> &TypeKey {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_key_identity() {
        assert_eq!(TypeKey::of::<String>(), TypeKey::of::<String>());
        assert_ne!(TypeKey::of::<String>(), TypeKey::of::<u32>());
        assert!(TypeKey::of::<String>().name().contains("String"));
    }

    #[test]
    fn test_descriptor_types() {
        let d = MethodDescriptor::new::<u32, String>("test.Svc/Get");
        assert_eq!(d.full_name(), "test.Svc/Get");
        assert_eq!(*d.input(), TypeKey::of::<u32>());
        assert_eq!(*d.output(), TypeKey::of::<String>());
    }

    #[test]
    fn test_request_slot() {
        let slot = RequestSlot::new();
        assert!(slot.take().is_none());
        slot.put(7u32);
        assert_eq!(slot.clone().take(), Some(7));
        assert!(slot.take().is_none());
    }
}
