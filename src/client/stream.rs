//! Client-side state machine of one server stream, with relaunch on a
//! broken stream.
//!
//! Tag flags: plain tags carry connect/finish completions, `READ` marks
//! read completions, `RELAUNCH` the engine relaunch alarm that drives a
//! cloned machine after the configured interval.

use std::cell::UnsafeCell;
use std::sync::Arc;

use cqrpc_core::config::RelaunchPolicy;
use cqrpc_core::context::{Aliveness, CallFsm};
use cqrpc_core::runtime::{ClientChannel, ClientContext, StreamReader, StreamRoute};
use cqrpc_core::status::{Status, StatusCode};
use cqrpc_core::tag::{ContextId, Flags};

use super::call::{EventCallback, SessionId, StreamEvent};
use super::engine::{EngineShared, StrandHandle};

pub(crate) const READ_FLAGS: Flags = Flags::new(0b01);
pub(crate) const RELAUNCH_FLAGS: Flags = Flags::new(0b10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Spawned for a relaunch, waiting for the engine alarm.
    Armed,
    Connecting,
    Reading,
    Finishing,
}

pub(crate) struct ServerStreamCallFsm<C: ClientChannel, R: StreamRoute<C>> {
    channel: Arc<C>,
    queue: C::Queue,
    route: R,
    session_id: SessionId,
    policy: RelaunchPolicy,
    strand: StrandHandle<C>,
    shared: Arc<EngineShared>,
    inner: UnsafeCell<Inner<C, R>>,
}

struct Inner<C: ClientChannel, R: StreamRoute<C>> {
    state: State,
    context: C::Context,
    reader: Option<R::Reader>,
    request: Option<R::Request>,
    callback: Option<EventCallback<R::Notification>>,
}

// One tag in flight at a time, and every event is delivered on the engine
// strand, so accesses to the inner state never overlap.
unsafe impl<C: ClientChannel, R: StreamRoute<C>> Send for ServerStreamCallFsm<C, R> {}
unsafe impl<C: ClientChannel, R: StreamRoute<C>> Sync for ServerStreamCallFsm<C, R> {}

impl<C: ClientChannel, R: StreamRoute<C>> ServerStreamCallFsm<C, R> {
    /// Machine for a fresh launch; `run` connects immediately.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        channel: Arc<C>, queue: C::Queue, route: R, context: C::Context, request: R::Request,
        session_id: SessionId, policy: RelaunchPolicy,
        callback: EventCallback<R::Notification>, strand: StrandHandle<C>,
        shared: Arc<EngineShared>,
    ) -> Self {
        Self {
            channel,
            queue,
            route,
            session_id,
            policy,
            strand,
            shared,
            inner: UnsafeCell::new(Inner {
                state: State::Connecting,
                context,
                reader: None,
                request: Some(request),
                callback: Some(callback),
            }),
        }
    }

    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    fn inner_mut(&self) -> &mut Inner<C, R> {
        unsafe { &mut *self.inner.get() }
    }

    fn start(&self, this: ContextId, inner: &mut Inner<C, R>) {
        debug!("stream '{}' connecting", self.session_id);
        let request = inner.request.as_ref().expect("no request to send");
        let reader = self.route.open(&self.channel, &inner.context, request, &self.queue);
        reader.start_call(this.tag(Flags::NONE));
        inner.reader = Some(reader);
        inner.state = State::Connecting;
    }

    fn deliver(&self, inner: &mut Inner<C, R>, event: StreamEvent<R::Notification>) {
        if event.is_terminal() {
            let mut callback = inner.callback.take().expect("terminal event delivered twice");
            callback(event);
        } else {
            (inner.callback.as_mut().expect("stream callback gone"))(event);
        }
    }

    fn on_error(&self, this: ContextId, running: bool, inner: &mut Inner<C, R>) -> Aliveness {
        if running {
            inner.state = State::Finishing;
            inner.reader.as_ref().expect("no reader").finish(this.tag(Flags::NONE));
            return Aliveness::Alive;
        }
        self.deliver(inner, StreamEvent::Finished(Status::aborted("client shutdown")));
        Aliveness::Dead
    }

    fn on_finished(&self, running: bool, inner: &mut Inner<C, R>) -> Aliveness {
        let status = inner.reader.as_ref().expect("no reader").take_status();
        let relaunch = running
            && self.policy == RelaunchPolicy::Relaunch
            && status.code() != StatusCode::Cancelled;

        if !relaunch {
            debug!("stream '{}' finished with {}", self.session_id, status);
            self.deliver(inner, StreamEvent::Finished(status));
            let session_id = self.session_id.clone();
            self.strand.post(Box::new(move |core| core.cleanup_stream(&session_id)));
            return Aliveness::Dead;
        }

        debug!("stream '{}' broke with {}, scheduling relaunch", self.session_id, status);
        let context = self.channel.new_call_context();
        context.set_fail_fast(true);
        let clone = Box::new(Self {
            channel: self.channel.clone(),
            queue: self.queue.clone(),
            route: self.route.clone(),
            session_id: self.session_id.clone(),
            policy: self.policy,
            strand: self.strand.clone(),
            shared: self.shared.clone(),
            inner: UnsafeCell::new(Inner {
                state: State::Armed,
                context: context.clone(),
                reader: None,
                request: inner.request.take(),
                callback: inner.callback.take(),
            }),
        });
        let session_id = self.session_id.clone();
        self.strand
            .post(Box::new(move |core| core.relaunch_stream(session_id, clone, context)));
        Aliveness::Dead
    }
}

impl<C: ClientChannel, R: StreamRoute<C>> CallFsm for ServerStreamCallFsm<C, R> {
    fn run(&self, this: ContextId) {
        let inner = self.inner_mut();
        self.start(this, inner);
    }

    fn on_event(&self, this: ContextId, ok: bool, flags: Flags) -> Aliveness {
        let running = self.shared.is_running();
        let inner = self.inner_mut();

        if inner.state == State::Armed {
            // The engine relaunch alarm; cancelled on shutdown.
            debug_assert_eq!(flags, RELAUNCH_FLAGS, "completion kind mismatch");
            if !ok || !running {
                self.deliver(inner, StreamEvent::Finished(Status::aborted("client shutdown")));
                let session_id = self.session_id.clone();
                self.strand.post(Box::new(move |core| core.cleanup_stream(&session_id)));
                return Aliveness::Dead;
            }
            self.start(this, inner);
            return Aliveness::Alive;
        }

        if !ok {
            return self.on_error(this, running, inner);
        }

        match inner.state {
            State::Connecting => {
                inner.state = State::Reading;
                inner.reader.as_ref().expect("no reader").read(this.tag(READ_FLAGS));
                Aliveness::Alive
            }
            State::Reading => {
                debug_assert_eq!(flags, READ_FLAGS, "completion kind mismatch");
                let reader = inner.reader.as_ref().expect("no reader");
                let notification =
                    reader.take_notification().expect("read completed without a notification");
                self.deliver(inner, StreamEvent::Notification(notification));
                inner.reader.as_ref().expect("no reader").read(this.tag(READ_FLAGS));
                Aliveness::Alive
            }
            State::Finishing => self.on_finished(running, inner),
            State::Armed => unreachable!(),
        }
    }
}
