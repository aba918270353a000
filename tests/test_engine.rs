mod common;

use cqrpc::runtime::MethodDescriptor;
use cqrpc::server::{RegisterError, ServiceEngine, SingularMethod};
use cqrpc_inproc::{Hub, InprocQueue, InprocUnaryPort};
use rstest::rstest;

use common::*;

type CounterPort = InprocUnaryPort<GetCounterRequest, CounterResponse>;

fn respond_nothing(method: SingularMethod<CounterPort>) {
    drop(method);
}

#[rstest]
fn test_duplicate_method_rejected(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();
    let mut server = ServiceEngine::<InprocQueue>::new(server_options());

    server
        .register_singular(
            MethodDescriptor::new::<GetCounterRequest, CounterResponse>(GET_COUNTER),
            service.unary_port::<GetCounterRequest, CounterResponse>(GET_COUNTER),
            respond_nothing,
        )
        .expect("first registration");

    let again = server.register_singular(
        MethodDescriptor::new::<GetCounterRequest, CounterResponse>(GET_COUNTER),
        service.unary_port::<GetCounterRequest, CounterResponse>(GET_COUNTER),
        respond_nothing,
    );
    assert_eq!(again, Err(RegisterError::DuplicateMethod(GET_COUNTER)));
}

#[rstest]
fn test_descriptor_type_mismatch_rejected(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();
    let mut server = ServiceEngine::<InprocQueue>::new(server_options());

    // The descriptor claims a different request type than the port carries.
    let result = server.register_singular(
        MethodDescriptor::new::<CounterResponse, CounterResponse>(GET_COUNTER),
        service.unary_port::<GetCounterRequest, CounterResponse>(GET_COUNTER),
        respond_nothing,
    );
    assert!(matches!(result, Err(RegisterError::TypeMismatch { method: GET_COUNTER, .. })));
}

#[rstest]
fn test_run_without_methods_rejected(runner: TestRunner) {
    let _ = runner;
    let mut server = ServiceEngine::<InprocQueue>::new(server_options());
    assert_eq!(server.run(), Err(RegisterError::NoMethods));
}

#[rstest]
fn test_register_after_run_rejected(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();
    let mut server = ServiceEngine::<InprocQueue>::new(server_options());

    server
        .register_singular(
            MethodDescriptor::new::<GetCounterRequest, CounterResponse>(GET_COUNTER),
            service.unary_port::<GetCounterRequest, CounterResponse>(GET_COUNTER),
            respond_nothing,
        )
        .expect("registration");
    server.run().expect("run");

    assert_eq!(server.run(), Err(RegisterError::AlreadyRunning));
    let late = server.register_singular(
        MethodDescriptor::new::<GetCounterRequest, CounterResponse>("test.Counter/Late"),
        service.unary_port::<GetCounterRequest, CounterResponse>("test.Counter/Late"),
        respond_nothing,
    );
    assert_eq!(late, Err(RegisterError::AlreadyRunning));
}

#[rstest]
fn test_shutdown_joins_and_is_idempotent(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();
    let mut server = ServiceEngine::<InprocQueue>::new(
        server_options()
            .set_queue_count(2)
            .and_then(|o| o.set_threads_per_queue(2))
            .and_then(|o| o.set_handlers_per_thread(4))
            .expect("options"),
    );
    server
        .register_singular(
            MethodDescriptor::new::<GetCounterRequest, CounterResponse>(GET_COUNTER),
            service.unary_port::<GetCounterRequest, CounterResponse>(GET_COUNTER),
            respond_nothing,
        )
        .expect("registration");
    server.run().expect("run");
    server.shutdown();
    server.shutdown();
}
