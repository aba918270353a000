//! # cqrpc-core
//!
//! Core primitives shared by the `cqrpc` engines:
//!
//! - pointer-tagged completion queue tags ([`tag`]),
//! - type-erased call context cells and their liveness protocol
//!   ([`context`]),
//! - the event dispatch loop ([`dispatcher`]),
//! - the contracts a completion-queue substrate has to provide
//!   ([`runtime`]),
//! - call status, engine options and boundary errors.
//!
//! The engines themselves live in [cqrpc](https://docs.rs/cqrpc); an
//! in-process substrate lives in
//! [cqrpc-inproc](https://docs.rs/cqrpc-inproc).

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod runtime;
pub mod status;
pub mod tag;

pub use config::{ClientOptions, Credentials, RelaunchPolicy, ServerOptions};
pub use error::{ConfigError, RegisterError};
pub use status::{Status, StatusCode};
