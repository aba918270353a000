//! Client-side state machine of one singular call. One shot: arm the
//! call, await the sole terminal completion under the deadline.

use std::cell::UnsafeCell;
use std::time::Duration;

use cqrpc_core::context::{Aliveness, CallFsm};
use cqrpc_core::runtime::{ClientChannel, ClientContext, UnaryReader, UnaryRoute};
use cqrpc_core::status::Status;
use cqrpc_core::tag::{ContextId, Flags};

use super::call::{CompletionCallback, Summary};

pub(crate) struct SingularCallFsm<C: ClientChannel, R: UnaryRoute<C>> {
    // The context carries deadline and fail-fast for the whole call.
    _context: C::Context,
    reader: R::Reader,
    inner: UnsafeCell<Inner<R::Request, R::Response>>,
}

struct Inner<Req, Resp> {
    request: Option<Req>,
    callback: Option<CompletionCallback<Req, Resp>>,
}

// One tag, one terminal event, both handled on the engine strand.
unsafe impl<C: ClientChannel, R: UnaryRoute<C>> Send for SingularCallFsm<C, R> {}
unsafe impl<C: ClientChannel, R: UnaryRoute<C>> Sync for SingularCallFsm<C, R> {}

impl<C: ClientChannel, R: UnaryRoute<C>> SingularCallFsm<C, R> {
    pub(crate) fn new(
        channel: &C, queue: &C::Queue, route: R, request: R::Request,
        callback: CompletionCallback<R::Request, R::Response>, deadline: Duration,
    ) -> Self {
        let context = channel.new_call_context();
        context.set_fail_fast(true);
        context.set_deadline(deadline);
        let reader = route.open(channel, &context, &request, queue);
        Self {
            _context: context,
            reader,
            inner: UnsafeCell::new(Inner { request: Some(request), callback: Some(callback) }),
        }
    }

    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    fn inner_mut(&self) -> &mut Inner<R::Request, R::Response> {
        unsafe { &mut *self.inner.get() }
    }
}

impl<C: ClientChannel, R: UnaryRoute<C>> CallFsm for SingularCallFsm<C, R> {
    fn run(&self, this: ContextId) {
        self.reader.start_call();
        self.reader.finish(this.tag(Flags::NONE));
    }

    fn on_event(&self, _this: ContextId, ok: bool, _flags: Flags) -> Aliveness {
        let inner = self.inner_mut();
        let request = inner.request.take().expect("event delivered twice");
        let callback = inner.callback.take().expect("event delivered twice");
        let result = if ok {
            self.reader.take()
        } else {
            Err(Status::aborted("client shutdown"))
        };
        callback(Summary { request, result });
        Aliveness::Dead
    }
}
