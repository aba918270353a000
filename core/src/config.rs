//! Engine options, validated at construction.

use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

const COUNT_MIN: usize = 1;
const COUNT_MAX: usize = 1024;
const DEADLINE_FLOOR: Duration = Duration::from_millis(10);
const RELAUNCH_INTERVAL_FLOOR: Duration = Duration::from_millis(100);
const DEFAULT_SIZE_LIMIT: usize = 32 << 20;

/// Opaque transport credentials; concrete meaning belongs to the substrate.
pub trait Credentials: Send + Sync + 'static {}

/// Automatic relaunch of a broken server stream, or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaunchPolicy {
    Relaunch,
    Shutdown,
}

/// Service engine options.
#[derive(Clone)]
pub struct ServerOptions {
    service_name: String,
    endpoints: Vec<(String, Arc<dyn Credentials>)>,
    queue_count: usize,
    threads_per_queue: usize,
    handlers_per_thread: usize,
}

impl ServerOptions {
    pub fn new(service_name: impl Into<String>) -> Result<Self, ConfigError> {
        let service_name = service_name.into();
        if service_name.is_empty() {
            return Err(ConfigError::EmptyServiceName);
        }
        Ok(Self {
            service_name,
            endpoints: Vec::new(),
            queue_count: 1,
            threads_per_queue: 1,
            handlers_per_thread: 1,
        })
    }

    pub fn add_endpoint(
        mut self, address: impl Into<String>, credentials: Arc<dyn Credentials>,
    ) -> Result<Self, ConfigError> {
        let address = address.into();
        if address.is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        if self.endpoints.iter().any(|(a, _)| *a == address) {
            return Err(ConfigError::DuplicateEndpoint(address));
        }
        self.endpoints.push((address, credentials));
        Ok(self)
    }

    pub fn set_queue_count(mut self, count: usize) -> Result<Self, ConfigError> {
        self.queue_count = bounded("queue count", count)?;
        Ok(self)
    }

    pub fn set_threads_per_queue(mut self, count: usize) -> Result<Self, ConfigError> {
        self.threads_per_queue = bounded("threads per queue", count)?;
        Ok(self)
    }

    pub fn set_handlers_per_thread(mut self, count: usize) -> Result<Self, ConfigError> {
        self.handlers_per_thread = bounded("handlers per thread", count)?;
        Ok(self)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn endpoints(&self) -> &[(String, Arc<dyn Credentials>)] {
        &self.endpoints
    }

    pub fn queue_count(&self) -> usize {
        self.queue_count
    }

    pub fn threads_per_queue(&self) -> usize {
        self.threads_per_queue
    }

    pub fn handlers_per_thread(&self) -> usize {
        self.handlers_per_thread
    }
}

/// Client engine options.
///
/// Defaults here can be overridden per call.
#[derive(Clone)]
pub struct ClientOptions {
    address: String,
    credentials: Arc<dyn Credentials>,
    singular_call_deadline: Duration,
    server_stream_deadline: Duration,
    relaunch_interval: Duration,
    relaunch_policy: RelaunchPolicy,
    request_size_limit: Option<usize>,
    response_size_limit: Option<usize>,
}

impl ClientOptions {
    pub fn new(
        address: impl Into<String>, credentials: Arc<dyn Credentials>,
    ) -> Result<Self, ConfigError> {
        let address = address.into();
        if address.is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        Ok(Self {
            address,
            credentials,
            singular_call_deadline: Duration::from_secs(1),
            server_stream_deadline: Duration::from_secs(1),
            relaunch_interval: Duration::from_secs(5),
            relaunch_policy: RelaunchPolicy::Relaunch,
            request_size_limit: Some(DEFAULT_SIZE_LIMIT),
            response_size_limit: Some(DEFAULT_SIZE_LIMIT),
        })
    }

    pub fn set_singular_call_deadline(mut self, deadline: Duration) -> Result<Self, ConfigError> {
        if deadline < DEADLINE_FLOOR {
            return Err(ConfigError::DeadlineTooShort);
        }
        self.singular_call_deadline = deadline;
        Ok(self)
    }

    pub fn set_server_stream_deadline(mut self, deadline: Duration) -> Result<Self, ConfigError> {
        if deadline < DEADLINE_FLOOR {
            return Err(ConfigError::DeadlineTooShort);
        }
        self.server_stream_deadline = deadline;
        Ok(self)
    }

    pub fn set_relaunch_interval(mut self, interval: Duration) -> Result<Self, ConfigError> {
        if interval < RELAUNCH_INTERVAL_FLOOR {
            return Err(ConfigError::IntervalTooShort);
        }
        self.relaunch_interval = interval;
        Ok(self)
    }

    pub fn set_relaunch_policy(mut self, policy: RelaunchPolicy) -> Self {
        self.relaunch_policy = policy;
        self
    }

    pub fn set_request_size_limit(mut self, limit: Option<usize>) -> Result<Self, ConfigError> {
        if limit == Some(0) {
            return Err(ConfigError::ZeroSizeLimit);
        }
        self.request_size_limit = limit;
        Ok(self)
    }

    pub fn set_response_size_limit(mut self, limit: Option<usize>) -> Result<Self, ConfigError> {
        if limit == Some(0) {
            return Err(ConfigError::ZeroSizeLimit);
        }
        self.response_size_limit = limit;
        Ok(self)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn credentials(&self) -> &Arc<dyn Credentials> {
        &self.credentials
    }

    pub fn singular_call_deadline(&self) -> Duration {
        self.singular_call_deadline
    }

    /// Kept on the options surface; stream call contexts intentionally run
    /// without a deadline, relaunch is governed by the interval.
    pub fn server_stream_deadline(&self) -> Duration {
        self.server_stream_deadline
    }

    pub fn relaunch_interval(&self) -> Duration {
        self.relaunch_interval
    }

    pub fn relaunch_policy(&self) -> RelaunchPolicy {
        self.relaunch_policy
    }

    pub fn request_size_limit(&self) -> Option<usize> {
        self.request_size_limit
    }

    pub fn response_size_limit(&self) -> Option<usize> {
        self.response_size_limit
    }
}

fn bounded(what: &'static str, value: usize) -> Result<usize, ConfigError> {
    if !(COUNT_MIN..=COUNT_MAX).contains(&value) {
        return Err(ConfigError::OutOfBounds { what, value });
    }
    Ok(value)
}
