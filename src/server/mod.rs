//! Server side: the service engine plus the per-call state machines behind
//! singular and server-stream methods.

use std::sync::Arc;

mod engine;
mod singular;
mod stream;

pub use engine::ServiceEngine;
pub use singular::SingularMethod;
pub use stream::{ServerStreamMethod, StreamState};

pub use cqrpc_core::config::{Credentials, ServerOptions};
pub use cqrpc_core::error::RegisterError;

/// Userspace callback invoked once per inbound singular request.
pub type SingularCallback<P> = Arc<dyn Fn(SingularMethod<P>) + Send + Sync>;

/// Userspace callback invoked once per inbound server stream.
pub type ServerStreamCallback<P> = Arc<dyn Fn(ServerStreamMethod<P>) + Send + Sync>;
