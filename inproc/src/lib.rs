//! # cqrpc-inproc
//!
//! In-process realization of the [cqrpc-core](https://docs.rs/cqrpc-core)
//! substrate contracts: a condvar-backed completion queue with alarms, and
//! a hub that routes client calls to server method ports inside one
//! process. It backs the integration suite of
//! [cqrpc](https://docs.rs/cqrpc) and serves as the reference for what a
//! real transport binding has to provide.
//!
//! ```rust
//! use cqrpc_inproc::Hub;
//!
//! let hub = Hub::new();
//! let service = hub.serve();
//! let port = service.unary_port::<u32, String>("demo.Echo/Get");
//! let _ = port;
//! ```

#[macro_use]
extern crate log;

mod channel;
mod hub;
mod queue;
mod service;

pub use channel::{
    InprocChannel, InprocClientContext, InprocStreamReader, InprocStreamRoute, InprocUnaryReader,
    InprocUnaryRoute, InsecureCredentials,
};
pub use hub::Hub;
pub use queue::{InprocAlarm, InprocQueue};
pub use service::{
    InprocServerContext, InprocService, InprocStreamPort, InprocStreamWriter, InprocUnaryPort,
    InprocUnaryWriter,
};

use cqrpc_core::config::ClientOptions;

impl Hub {
    /// Server view of this hub.
    pub fn serve(&self) -> InprocService {
        InprocService::new(self.clone())
    }

    /// Connect a client, recording its channel options.
    pub fn connect(&self, options: &ClientOptions) -> InprocChannel {
        debug!("connecting client to {}", options.address());
        InprocChannel::new(self.clone(), options)
    }
}
