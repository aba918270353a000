mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use cqrpc::client::{ClientEngine, SingularCall};
use cqrpc::runtime::MethodDescriptor;
use cqrpc::server::{ServiceEngine, SingularMethod};
use cqrpc::{Status, StatusCode};
use cqrpc_inproc::{Hub, InprocChannel, InprocQueue, InprocUnaryPort, InprocUnaryRoute};
use rstest::rstest;

use common::*;

type CounterPort = InprocUnaryPort<GetCounterRequest, CounterResponse>;

#[rstest]
fn test_unary_success(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();

    let mut server = ServiceEngine::<InprocQueue>::new(server_options());
    let counter = Arc::new(AtomicU64::new(0));
    {
        let counter = counter.clone();
        server
            .register_singular(
                MethodDescriptor::new::<GetCounterRequest, CounterResponse>(GET_COUNTER),
                service.unary_port::<GetCounterRequest, CounterResponse>(GET_COUNTER),
                move |method: SingularMethod<CounterPort>| {
                    let value = counter.fetch_add(1, Ordering::SeqCst);
                    method.respond(Ok(CounterResponse { value }));
                },
            )
            .expect("register");
    }
    server.run().expect("server run");

    let mut client = ClientEngine::new(client_options(), hub.connect(&client_options()));
    client.run();
    let route = InprocUnaryRoute::<GetCounterRequest, CounterResponse>::new(GET_COUNTER);

    for expected in 0..3u64 {
        let (tx, rx) = mpsc::channel();
        let call: SingularCall<InprocChannel, _> = SingularCall::new(
            route.clone(),
            GetCounterRequest { who: "tester".to_string() },
            Box::new(move |summary| {
                let _ = tx.send(summary);
            }),
        );
        client.execute_singular(call);
        let summary = rx.recv_timeout(Duration::from_secs(2)).expect("response");
        assert_eq!(summary.request.who, "tester");
        let response = summary.result.expect("call failed");
        assert_eq!(response.value, expected);
    }
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[rstest]
fn test_unary_peer_and_error_status(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();

    let mut server = ServiceEngine::<InprocQueue>::new(server_options());
    server
        .register_singular(
            MethodDescriptor::new::<GetCounterRequest, CounterResponse>(GET_COUNTER),
            service.unary_port::<GetCounterRequest, CounterResponse>(GET_COUNTER),
            move |method: SingularMethod<CounterPort>| {
                assert!(method.peer().starts_with("inproc:client-"));
                let who = method.request().who.clone();
                method.respond(Err(Status::new(
                    StatusCode::PermissionDenied,
                    format!("{} may not count", who),
                )));
            },
        )
        .expect("register");
    server.run().expect("server run");

    let mut client = ClientEngine::new(client_options(), hub.connect(&client_options()));
    client.run();
    let route = InprocUnaryRoute::<GetCounterRequest, CounterResponse>::new(GET_COUNTER);

    let (tx, rx) = mpsc::channel();
    client.execute_singular(SingularCall::new(
        route,
        GetCounterRequest { who: "mallory".to_string() },
        Box::new(move |summary| {
            let _ = tx.send(summary);
        }),
    ));
    let summary = rx.recv_timeout(Duration::from_secs(2)).expect("response");
    let status = summary.result.expect_err("expected an error status");
    assert_eq!(status.code(), StatusCode::PermissionDenied);
    assert_eq!(status.message(), "mallory may not count");
}

#[rstest]
fn test_unary_deadline_exceeded(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();

    // Parked methods outlive the engines; drop order below keeps them
    // alive until the machines have drained.
    let parked: Arc<Mutex<Vec<SingularMethod<CounterPort>>>> = Arc::new(Mutex::new(Vec::new()));

    let mut server = ServiceEngine::<InprocQueue>::new(server_options());
    {
        let parked = parked.clone();
        server
            .register_singular(
                MethodDescriptor::new::<GetCounterRequest, CounterResponse>(GET_COUNTER),
                service.unary_port::<GetCounterRequest, CounterResponse>(GET_COUNTER),
                move |method| {
                    // Deliberately never respond.
                    parked.lock().unwrap().push(method);
                },
            )
            .expect("register");
    }
    server.run().expect("server run");

    let mut client = ClientEngine::new(client_options(), hub.connect(&client_options()));
    client.run();
    let route = InprocUnaryRoute::<GetCounterRequest, CounterResponse>::new(GET_COUNTER);

    let (tx, rx) = mpsc::channel();
    let mut call: SingularCall<InprocChannel, _> = SingularCall::new(
        route,
        GetCounterRequest { who: "patient".to_string() },
        Box::new(move |summary| {
            let _ = tx.send(summary);
        }),
    );
    call.deadline = Some(Duration::from_millis(10));
    let started = Instant::now();
    client.execute_singular(call);

    let summary = rx.recv_timeout(Duration::from_secs(2)).expect("response");
    let status = summary.result.expect_err("expected deadline");
    assert_eq!(status.code(), StatusCode::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_millis(500), "deadline fired too late");
}

#[rstest]
fn test_client_api_noop_before_run(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let client = ClientEngine::new(client_options(), hub.connect(&client_options()));
    let route = InprocUnaryRoute::<GetCounterRequest, CounterResponse>::new(GET_COUNTER);

    let (tx, rx) = mpsc::channel();
    client.execute_singular(SingularCall::new(
        route,
        GetCounterRequest { who: "early".to_string() },
        Box::new(move |summary| {
            let _ = tx.send(summary);
        }),
    ));
    // Not running: the call is silently dropped.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}
