//! Client side: the runtime engine plus typed call objects.

mod call;
mod engine;
mod singular;
mod stream;

pub use call::{
    CompletionCallback, EventCallback, ServerStreamCall, ServerStreamShutdown, SessionId,
    SingularCall, StreamEvent, Summary,
};
pub use engine::ClientEngine;

pub use cqrpc_core::config::{ClientOptions, Credentials, RelaunchPolicy};
