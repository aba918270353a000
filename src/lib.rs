//! # cqrpc
//!
//! Typed, callback-driven RPC engines on top of a tag-dispatched
//! completion-queue runtime.
//!
//! The runtime underneath exposes an awkward surface: every asynchronous
//! operation is armed with an opaque tag and completes as a `(tag, ok)`
//! pair pulled from a blocking queue. `cqrpc` turns that into safe, typed
//! method handlers on the server and typed call objects on the client,
//! with per-call state machines taking care of lifecycle, cancellation,
//! stream relaunch and thread-safe notification posting.
//!
//! ## Components
//!
//! - [`cqrpc-core`](https://docs.rs/cqrpc-core): pointer-tagged call
//!   contexts, the dispatcher and the substrate contracts.
//! - [`cqrpc-inproc`](https://docs.rs/cqrpc-inproc): an in-process
//!   substrate, also the vehicle of the integration suite.
//! - [`server`]: [`server::ServiceEngine`] with singular and
//!   server-stream method handlers.
//! - [`client`]: [`client::ClientEngine`] with singular calls and
//!   relaunching server-stream subscriptions.
//!
//! ## Shape of the server side
//!
//! A service engine owns completion queues and dispatcher threads. Every
//! registered method keeps a pool of *accepting* machines parked on the
//! queues; when a request arrives, the machine spawns its replacement
//! first and then hands the request to the registered callback, either as
//! a one-shot [`server::SingularMethod`] or as a pushable
//! [`server::ServerStreamMethod`] handle.
//!
//! ## Shape of the client side
//!
//! The client engine serializes all of its state on a strand: one thread
//! runs posted closures, a second polls the completion queue and posts
//! each dispatch. Singular calls run under a deadline; server streams are
//! identified by a session id and relaunched on breakage according to the
//! configured policy and interval.

#[macro_use]
extern crate log;

pub mod client;
pub mod server;

pub use cqrpc_core::config;
pub use cqrpc_core::error::{ConfigError, RegisterError};
pub use cqrpc_core::runtime;
pub use cqrpc_core::status::{Status, StatusCode};
