//! Errors reported at the configuration and registration boundaries.
//!
//! Remote failures never surface here; they reach user callbacks as a
//! [`crate::status::Status`].

use thiserror::Error;

/// Rejected configuration values, reported on construction.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("service name should be non empty")]
    EmptyServiceName,
    #[error("empty address")]
    EmptyAddress,
    #[error("non unique address: {0}")]
    DuplicateEndpoint(String),
    #[error("{what} should be within [1, 1024], got {value}")]
    OutOfBounds { what: &'static str, value: usize },
    #[error("call deadline should be at least 10ms")]
    DeadlineTooShort,
    #[error("relaunch interval should be at least 100ms")]
    IntervalTooShort,
    #[error("size limit should be positive")]
    ZeroSizeLimit,
}

/// Rejected method registrations and engine misuse.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegisterError {
    #[error("duplicated method: {0}")]
    DuplicateMethod(&'static str),
    #[error("descriptor mismatch on {method}: expected {expected}, got {actual}")]
    TypeMismatch { method: &'static str, expected: &'static str, actual: &'static str },
    #[error("none of the methods registered")]
    NoMethods,
    #[error("engine is already running")]
    AlreadyRunning,
}
