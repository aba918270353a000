//! Client runtime engine.
//!
//! Two worker threads: the strand thread runs posted closures one at a
//! time and owns every piece of engine state; the poller thread (started
//! by `run`) pulls the completion queue and posts each dispatch onto the
//! strand. User-facing APIs post closures as well and no-op unless the
//! engine is running.

use std::any::TypeId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cqrpc_core::config::ClientOptions;
use cqrpc_core::context::{self, CallFsm};
use cqrpc_core::dispatcher;
use cqrpc_core::runtime::{Alarm, ClientChannel, ClientContext, CompletionQueue, StreamRoute, UnaryRoute};
use cqrpc_core::status::Status;
use rustc_hash::FxHashMap;

use super::call::{ServerStreamCall, ServerStreamShutdown, SessionId, SingularCall, StreamEvent};
use super::singular::SingularCallFsm;
use super::stream::{ServerStreamCallFsm, RELAUNCH_FLAGS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientState {
    Running,
    Standby,
}

/// State shared with the call machines; flipped only on the strand.
pub(crate) struct EngineShared {
    running: AtomicBool,
}

impl EngineShared {
    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

type StrandOp<C> = Box<dyn FnOnce(&mut EngineCore<C>) + Send>;

/// Posting half of the engine strand.
pub(crate) struct StrandHandle<C: ClientChannel>(mpsc::Sender<StrandOp<C>>);

impl<C: ClientChannel> Clone for StrandHandle<C> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<C: ClientChannel> StrandHandle<C> {
    pub(crate) fn post(&self, op: StrandOp<C>) {
        // A dead strand means the engine is tearing down; drop silently.
        let _ = self.0.send(op);
    }
}

/// Registry entry of one live (or relaunch-pending) server stream.
struct StreamEntry<C: ClientChannel> {
    type_key: TypeId,
    context: C::Context,
    relaunch_alarm: <C::Queue as CompletionQueue>::Alarm,
    relaunch_interval: Duration,
}

impl<C: ClientChannel> StreamEntry<C> {
    fn cancel(&self) {
        self.relaunch_alarm.cancel();
        self.context.try_cancel();
    }
}

/// Engine state, owned by the strand thread.
pub(crate) struct EngineCore<C: ClientChannel> {
    channel: Arc<C>,
    queue: C::Queue,
    shared: Arc<EngineShared>,
    state: ClientState,
    streams: FxHashMap<SessionId, StreamEntry<C>>,
}

impl<C: ClientChannel> EngineCore<C> {
    pub(crate) fn cleanup_stream(&mut self, session_id: &str) {
        self.streams.remove(session_id);
    }

    pub(crate) fn relaunch_stream(
        &mut self, session_id: SessionId, fsm: Box<dyn CallFsm>, new_context: C::Context,
    ) {
        if self.state != ClientState::Running {
            self.streams.remove(&session_id);
            return;
        }
        let Some(entry) = self.streams.get_mut(&session_id) else {
            warn!("stream '{}' vanished before relaunch", session_id);
            return;
        };
        entry.context = new_context;
        let id = context::spawn(fsm);
        entry
            .relaunch_alarm
            .set(Instant::now() + entry.relaunch_interval, id.tag(RELAUNCH_FLAGS));
    }
}

/// Dispatches calls to the runtime and runs callbacks on RPC events.
///
/// Dropping the engine cancels every live stream, shuts the queue down and
/// joins both worker threads; affected callbacks observe a terminal
/// status first.
pub struct ClientEngine<C: ClientChannel> {
    options: ClientOptions,
    channel: Arc<C>,
    queue: C::Queue,
    shared: Arc<EngineShared>,
    strand_tx: Option<StrandHandle<C>>,
    strand_thread: Option<JoinHandle<()>>,
    poller_thread: Option<JoinHandle<()>>,
}

impl<C: ClientChannel> ClientEngine<C> {
    /// Build the engine around an established channel. The strand starts
    /// immediately; the queue is polled only after [`run`](Self::run).
    pub fn new(options: ClientOptions, channel: C) -> Self {
        let channel = Arc::new(channel);
        let queue = C::Queue::new();
        let shared = Arc::new(EngineShared { running: AtomicBool::new(false) });
        let (tx, rx) = mpsc::channel::<StrandOp<C>>();

        let mut core = EngineCore {
            channel: channel.clone(),
            queue: queue.clone(),
            shared: shared.clone(),
            state: ClientState::Standby,
            streams: FxHashMap::default(),
        };
        let strand_thread = std::thread::Builder::new()
            .name("cq-strand".into())
            .spawn(move || {
                while let Ok(op) = rx.recv() {
                    op(&mut core);
                }
            })
            .expect("spawn strand thread");

        Self {
            options,
            channel,
            queue,
            shared,
            strand_tx: Some(StrandHandle(tx)),
            strand_thread: Some(strand_thread),
            poller_thread: None,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    fn strand(&self) -> &StrandHandle<C> {
        self.strand_tx.as_ref().expect("strand gone")
    }

    /// Start polling the completion queue; one shot, idempotent.
    pub fn run(&mut self) {
        let (tx, rx) = mpsc::channel();
        self.strand().post(Box::new(move |core| {
            if core.state != ClientState::Running {
                core.state = ClientState::Running;
                core.shared.running.store(true, Ordering::SeqCst);
            }
            let _ = tx.send(());
        }));
        let _ = rx.recv();

        if self.poller_thread.is_some() {
            return;
        }
        let queue = self.queue.clone();
        let strand = self.strand().clone();
        let poller = std::thread::Builder::new()
            .name("cq-client".into())
            .spawn(move || {
                while let Some((tag, ok)) = queue.next() {
                    strand.post(Box::new(move |_core| unsafe { dispatcher::deliver(tag, ok) }));
                }
            })
            .expect("spawn queue poller");
        self.poller_thread = Some(poller);
    }

    /// Execute one singular call; a no-op unless the engine is running.
    pub fn execute_singular<R: UnaryRoute<C>>(&self, call: SingularCall<C, R>) {
        let deadline = call.deadline.unwrap_or(self.options.singular_call_deadline());
        self.strand().post(Box::new(move |core| {
            if core.state != ClientState::Running {
                return;
            }
            context::launch(Box::new(SingularCallFsm::new(
                core.channel.as_ref(),
                &core.queue,
                call.route,
                call.request,
                call.callback,
                deadline,
            )));
        }));
    }

    /// Launch one server stream; a no-op unless the engine is running.
    ///
    /// A duplicate session id, or a second live stream of the same request
    /// type, is rejected by a terminal `AlreadyExists` event on the
    /// submitted call's callback.
    pub fn launch_server_stream<R: StreamRoute<C>>(&self, call: ServerStreamCall<C, R>) {
        let interval = call.relaunch_interval.unwrap_or(self.options.relaunch_interval());
        let policy = call.relaunch_policy.unwrap_or(self.options.relaunch_policy());
        let strand = self.strand().clone();
        self.strand().post(Box::new(move |core| {
            if core.state != ClientState::Running {
                return;
            }
            let session_id = call.session_id;
            let route = call.route;
            let request = call.request;
            let mut callback = call.callback;

            let type_key = TypeId::of::<R::Request>();
            if core.streams.values().any(|entry| entry.type_key == type_key) {
                warn!("stream '{}' rejected: duplicated stream request type", session_id);
                callback(StreamEvent::Finished(Status::already_exists(
                    "duplicated stream request type",
                )));
                return;
            }
            if core.streams.contains_key(&session_id) {
                warn!("stream '{}' rejected: duplicated session id", session_id);
                callback(StreamEvent::Finished(Status::already_exists("duplicated session id")));
                return;
            }

            let context = core.channel.new_call_context();
            context.set_fail_fast(true);
            core.streams.insert(
                session_id.clone(),
                StreamEntry {
                    type_key,
                    context: context.clone(),
                    relaunch_alarm: core.queue.alarm(),
                    relaunch_interval: interval,
                },
            );
            context::launch(Box::new(ServerStreamCallFsm::new(
                core.channel.clone(),
                core.queue.clone(),
                route,
                context,
                request,
                session_id,
                policy,
                callback,
                strand,
                core.shared.clone(),
            )));
        }));
    }

    /// Shut one server stream down, if present; a no-op unless running.
    pub fn shutdown_server_stream(&self, shutdown: ServerStreamShutdown) {
        self.strand().post(Box::new(move |core| {
            if core.state != ClientState::Running {
                return;
            }
            if let Some(entry) = core.streams.remove(&shutdown.session_id) {
                debug!("stream '{}' shut down", shutdown.session_id);
                entry.cancel();
            }
        }));
    }
}

impl<C: ClientChannel> Drop for ClientEngine<C> {
    fn drop(&mut self) {
        // Stop on the strand: flip to standby and cancel every stream, so
        // in-flight machines observe a shutdown on their next completion.
        let (tx, rx) = mpsc::channel();
        self.strand().post(Box::new(move |core| {
            core.state = ClientState::Standby;
            core.shared.running.store(false, Ordering::SeqCst);
            for entry in core.streams.values() {
                entry.cancel();
            }
            let _ = tx.send(());
        }));
        let _ = rx.recv();

        self.queue.shutdown();
        if let Some(poller) = self.poller_thread.take() {
            let _ = poller.join();
        }
        // All remaining senders die as the drained machines are freed;
        // the strand loop then exits on disconnect.
        self.strand_tx.take();
        if let Some(strand) = self.strand_thread.take() {
            let _ = strand.join();
        }
        debug!("client engine for {} closed", self.options.address());
    }
}
