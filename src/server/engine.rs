//! Service engine: owns the completion queues of one service, spawns
//! accepting machines for every registered method, and runs the dispatcher
//! threads.

use std::thread::JoinHandle;

use cqrpc_core::context;
use cqrpc_core::dispatcher::dispatch_loop;
use cqrpc_core::error::RegisterError;
use cqrpc_core::runtime::{CompletionQueue, MethodDescriptor, StreamPort, TypeKey, UnaryPort};
use cqrpc_core::ServerOptions;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use super::singular::SingularMethodFsm;
use super::stream::ServerStreamFsm;
use super::{ServerStreamCallback, SingularCallback};

type Spawner<Q> = Box<dyn Fn(&Q) + Send + Sync>;

struct Registration<Q> {
    descriptor: MethodDescriptor,
    spawn: Spawner<Q>,
}

/// Execution engine of one service.
///
/// Handlers are registered before [`run`](ServiceEngine::run); each must be
/// unique for its method. The engine owns its queues and dispatcher
/// threads; dropping it shuts the queues down and joins the threads, with
/// in-flight machines draining on their failed completions.
pub struct ServiceEngine<Q: CompletionQueue> {
    options: ServerOptions,
    queues: Vec<Q>,
    registrations: FxHashMap<&'static str, Registration<Q>>,
    threads: Vec<JoinHandle<()>>,
    running: bool,
}

impl<Q: CompletionQueue> ServiceEngine<Q> {
    pub fn new(options: ServerOptions) -> Self {
        let queues = (0..options.queue_count()).map(|_| Q::new()).collect();
        Self { options, queues, registrations: FxHashMap::default(), threads: Vec::new(), running: false }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Register a singular method handler, unique per method.
    pub fn register_singular<P>(
        &mut self, descriptor: MethodDescriptor, port: P,
        callback: impl Fn(super::SingularMethod<P>) + Send + Sync + 'static,
    ) -> Result<(), RegisterError>
    where
        P: UnaryPort<Queue = Q>,
    {
        if self.running {
            return Err(RegisterError::AlreadyRunning);
        }
        check_descriptor::<P::Request, P::Response>(&descriptor, port.descriptor())?;
        let name = descriptor.full_name();
        if self.registrations.contains_key(name) {
            return Err(RegisterError::DuplicateMethod(name));
        }

        let callback: SingularCallback<P> = Arc::new(callback);
        let spawn: Spawner<Q> = Box::new(move |queue| {
            context::launch(Box::new(SingularMethodFsm::new(
                port.clone(),
                queue.clone(),
                callback.clone(),
            )));
        });
        self.registrations.insert(name, Registration { descriptor, spawn });
        info!("service '{}' method '{}' register succeed", self.options.service_name(), name);
        Ok(())
    }

    /// Register a server-stream method handler, unique per method.
    pub fn register_server_stream<P>(
        &mut self, descriptor: MethodDescriptor, port: P,
        callback: impl Fn(super::ServerStreamMethod<P>) + Send + Sync + 'static,
    ) -> Result<(), RegisterError>
    where
        P: StreamPort<Queue = Q>,
    {
        if self.running {
            return Err(RegisterError::AlreadyRunning);
        }
        check_descriptor::<P::Request, P::Notification>(&descriptor, port.descriptor())?;
        let name = descriptor.full_name();
        if self.registrations.contains_key(name) {
            return Err(RegisterError::DuplicateMethod(name));
        }

        let callback: ServerStreamCallback<P> = Arc::new(callback);
        let spawn: Spawner<Q> = Box::new(move |queue| {
            context::launch(Box::new(ServerStreamFsm::new(
                port.clone(),
                queue.clone(),
                callback.clone(),
            )));
        });
        self.registrations.insert(name, Registration { descriptor, spawn });
        info!("service '{}' method '{}' register succeed", self.options.service_name(), name);
        Ok(())
    }

    /// Start serving: spawn the accepting machines and dispatcher threads.
    pub fn run(&mut self) -> Result<(), RegisterError> {
        if self.running {
            return Err(RegisterError::AlreadyRunning);
        }
        if self.registrations.is_empty() {
            return Err(RegisterError::NoMethods);
        }
        self.running = true;

        let endpoints: Vec<&str> =
            self.options.endpoints().iter().map(|(a, _)| a.as_str()).collect();
        info!(
            "running '{}' service on: {}",
            self.options.service_name(),
            endpoints.join(",")
        );

        for (queue_at, queue) in self.queues.iter().enumerate() {
            for thread_at in 0..self.options.threads_per_queue() {
                for registration in self.registrations.values() {
                    for _ in 0..self.options.handlers_per_thread() {
                        (registration.spawn)(queue);
                    }
                }
                let queue = queue.clone();
                let name = format!("cq{}-t{}", queue_at, thread_at);
                let handle = std::thread::Builder::new()
                    .name(name)
                    .spawn(move || dispatch_loop(&queue))
                    .expect("spawn dispatcher thread");
                self.threads.push(handle);
            }
        }
        Ok(())
    }

    /// Shut the queues down and join the dispatcher threads.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() && !self.running {
            return;
        }
        for queue in &self.queues {
            queue.shutdown();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.running = false;
        info!("service '{}' closed", self.options.service_name());
    }
}

impl<Q: CompletionQueue> Drop for ServiceEngine<Q> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_descriptor<In: 'static, Out: 'static>(
    registered: &MethodDescriptor, port: &MethodDescriptor,
) -> Result<(), RegisterError> {
    let method = registered.full_name();
    if *registered.input() != TypeKey::of::<In>() {
        return Err(RegisterError::TypeMismatch {
            method,
            expected: registered.input().name(),
            actual: TypeKey::of::<In>().name(),
        });
    }
    if *registered.output() != TypeKey::of::<Out>() {
        return Err(RegisterError::TypeMismatch {
            method,
            expected: registered.output().name(),
            actual: TypeKey::of::<Out>().name(),
        });
    }
    if port.full_name() != method || port.input() != registered.input() || port.output() != registered.output() {
        return Err(RegisterError::TypeMismatch {
            method,
            expected: method,
            actual: port.full_name(),
        });
    }
    Ok(())
}
