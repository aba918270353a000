mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use cqrpc::client::{ClientEngine, RelaunchPolicy, ServerStreamCall, ServerStreamShutdown, StreamEvent};
use cqrpc::runtime::MethodDescriptor;
use cqrpc::server::{ServerStreamMethod, ServiceEngine, StreamState};
use cqrpc::{Status, StatusCode};
use cqrpc_inproc::{Hub, InprocChannel, InprocQueue, InprocStreamPort, InprocStreamRoute};
use rstest::rstest;

use common::*;

type FeedPort = InprocStreamPort<SubscribeRequest, Tick>;

fn feed_descriptor() -> MethodDescriptor {
    MethodDescriptor::new::<SubscribeRequest, Tick>(SUBSCRIBE)
}

fn subscribe(
    client: &ClientEngine<InprocChannel>, session: &str, policy: RelaunchPolicy,
    tx: mpsc::Sender<StreamEvent<Tick>>,
) {
    let route = InprocStreamRoute::<SubscribeRequest, Tick>::new(SUBSCRIBE);
    let mut call = ServerStreamCall::new(
        session.to_string(),
        route,
        SubscribeRequest { topic: "news".to_string() },
        Box::new(move |event| {
            let _ = tx.send(event);
        }),
    );
    call.relaunch_policy = Some(policy);
    client.launch_server_stream(call);
}

#[rstest]
fn test_stream_broadcast_in_order(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();

    let mut server = ServiceEngine::<InprocQueue>::new(server_options());
    server
        .register_server_stream(
            feed_descriptor(),
            service.stream_port::<SubscribeRequest, Tick>(SUBSCRIBE),
            move |stream: ServerStreamMethod<FeedPort>| {
                assert_eq!(stream.request().expect("request").topic, "news");
                for at in 0..10 {
                    assert_eq!(stream.push(Tick { payload: at.to_string() }), StreamState::Running);
                }
                stream.close(Status::ok());
            },
        )
        .expect("register");
    server.run().expect("server run");

    let mut client = ClientEngine::new(client_options(), hub.connect(&client_options()));
    client.run();
    let (tx, rx) = mpsc::channel();
    subscribe(&client, "s1", RelaunchPolicy::Shutdown, tx);

    let mut payloads = Vec::new();
    loop {
        match rx.recv_timeout(Duration::from_secs(2)).expect("stream event") {
            StreamEvent::Notification(tick) => payloads.push(tick.payload),
            StreamEvent::Finished(status) => {
                assert!(status.is_ok(), "unexpected terminal: {}", status);
                break;
            }
        }
    }
    let expected: Vec<String> = (0..10).map(|at| at.to_string()).collect();
    assert_eq!(payloads, expected);
}

#[rstest]
fn test_stream_server_close_with_error(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();

    let mut server = ServiceEngine::<InprocQueue>::new(server_options());
    server
        .register_server_stream(
            feed_descriptor(),
            service.stream_port::<SubscribeRequest, Tick>(SUBSCRIBE),
            move |stream: ServerStreamMethod<FeedPort>| {
                for at in 0..3 {
                    stream.push(Tick { payload: at.to_string() });
                }
                stream.close(Status::aborted("stop"));
            },
        )
        .expect("register");
    server.run().expect("server run");

    let mut client = ClientEngine::new(client_options(), hub.connect(&client_options()));
    client.run();
    let (tx, rx) = mpsc::channel();
    subscribe(&client, "s1", RelaunchPolicy::Shutdown, tx);

    let mut payloads = Vec::new();
    let status = loop {
        match rx.recv_timeout(Duration::from_secs(2)).expect("stream event") {
            StreamEvent::Notification(tick) => payloads.push(tick.payload),
            StreamEvent::Finished(status) => break status,
        }
    };
    assert_eq!(payloads, vec!["0", "1", "2"]);
    assert_eq!(status.code(), StatusCode::Aborted);
    assert_eq!(status.message(), "stop");
}

#[rstest]
fn test_stream_drop_after_close(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();

    let mut server = ServiceEngine::<InprocQueue>::new(server_options());
    server
        .register_server_stream(
            feed_descriptor(),
            service.stream_port::<SubscribeRequest, Tick>(SUBSCRIBE),
            move |stream: ServerStreamMethod<FeedPort>| {
                stream.push(Tick { payload: "kept".to_string() });
                stream.close(Status::ok());
                // Everything after the close is dropped without wire events.
                stream.push(Tick { payload: "dropped".to_string() });
                stream.close(Status::aborted("late"));
            },
        )
        .expect("register");
    server.run().expect("server run");

    let mut client = ClientEngine::new(client_options(), hub.connect(&client_options()));
    client.run();
    let (tx, rx) = mpsc::channel();
    subscribe(&client, "s1", RelaunchPolicy::Shutdown, tx);

    let mut payloads = Vec::new();
    let status = loop {
        match rx.recv_timeout(Duration::from_secs(2)).expect("stream event") {
            StreamEvent::Notification(tick) => payloads.push(tick.payload),
            StreamEvent::Finished(status) => break status,
        }
    };
    assert_eq!(payloads, vec!["kept"]);
    assert!(status.is_ok());
}

#[rstest]
fn test_stream_relaunch_reuses_request(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();

    let accepts = Arc::new(AtomicUsize::new(0));
    let topics: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let mut server = ServiceEngine::<InprocQueue>::new(server_options());
    {
        let accepts = accepts.clone();
        let topics = topics.clone();
        server
            .register_server_stream(
                feed_descriptor(),
                service.stream_port::<SubscribeRequest, Tick>(SUBSCRIBE),
                move |stream: ServerStreamMethod<FeedPort>| {
                    accepts.fetch_add(1, Ordering::SeqCst);
                    topics.lock().unwrap().push(stream.request().expect("request").topic);
                    stream.push(Tick { payload: "once".to_string() });
                    stream.close(Status::aborted("stop"));
                },
            )
            .expect("register");
    }
    server.run().expect("server run");

    let options = client_options()
        .set_relaunch_interval(Duration::from_millis(100))
        .expect("client options");
    let mut client = ClientEngine::new(options.clone(), hub.connect(&options));
    client.run();
    let (tx, rx) = mpsc::channel();
    subscribe(&client, "s1", RelaunchPolicy::Relaunch, tx);

    // First connection breaks right away; a second attempt with the same
    // request must land within the relaunch interval plus slack.
    let started = Instant::now();
    while accepts.load(Ordering::SeqCst) < 2 {
        assert!(started.elapsed() < Duration::from_millis(2000), "no relaunch observed");
        std::thread::sleep(Duration::from_millis(10));
    }
    let seen = topics.lock().unwrap().clone();
    assert!(seen.len() >= 2);
    assert!(seen.iter().all(|topic| topic == "news"));
    // Relaunch cycles deliver their notifications to the same callback.
    match rx.recv_timeout(Duration::from_secs(2)).expect("stream event") {
        StreamEvent::Notification(tick) => assert_eq!(tick.payload, "once"),
        StreamEvent::Finished(status) => panic!("unexpected terminal: {}", status),
    }
}

#[rstest]
fn test_stream_type_uniqueness(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();

    let parked: Arc<Mutex<Vec<ServerStreamMethod<FeedPort>>>> = Arc::new(Mutex::new(Vec::new()));

    let mut server = ServiceEngine::<InprocQueue>::new(server_options());
    {
        let parked = parked.clone();
        server
            .register_server_stream(
                feed_descriptor(),
                service.stream_port::<SubscribeRequest, Tick>(SUBSCRIBE),
                move |stream| {
                    parked.lock().unwrap().push(stream);
                },
            )
            .expect("register");
    }
    server.run().expect("server run");

    let mut client = ClientEngine::new(client_options(), hub.connect(&client_options()));
    client.run();

    let (tx_a, rx_a) = mpsc::channel();
    subscribe(&client, "s1", RelaunchPolicy::Shutdown, tx_a);

    // Wait for A to be accepted before racing B against it.
    let started = Instant::now();
    while parked.lock().unwrap().is_empty() {
        assert!(started.elapsed() < Duration::from_secs(2), "stream never accepted");
        std::thread::sleep(Duration::from_millis(5));
    }

    let (tx_b, rx_b) = mpsc::channel();
    subscribe(&client, "s2", RelaunchPolicy::Shutdown, tx_b);
    match rx_b.recv_timeout(Duration::from_secs(2)).expect("rejection event") {
        StreamEvent::Finished(status) => assert_eq!(status.code(), StatusCode::AlreadyExists),
        StreamEvent::Notification(_) => panic!("second stream was not rejected"),
    }

    // A is intact: the parked handle still delivers.
    let handle = parked.lock().unwrap().pop().expect("parked stream");
    assert_eq!(handle.push(Tick { payload: "alive".to_string() }), StreamState::Running);
    match rx_a.recv_timeout(Duration::from_secs(2)).expect("stream event") {
        StreamEvent::Notification(tick) => assert_eq!(tick.payload, "alive"),
        StreamEvent::Finished(status) => panic!("unexpected terminal: {}", status),
    }
    handle.close(Status::ok());
}

#[rstest]
fn test_stream_session_uniqueness(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();

    let parked: Arc<Mutex<Vec<ServerStreamMethod<FeedPort>>>> = Arc::new(Mutex::new(Vec::new()));

    let mut server = ServiceEngine::<InprocQueue>::new(server_options());
    {
        let parked = parked.clone();
        server
            .register_server_stream(
                feed_descriptor(),
                service.stream_port::<SubscribeRequest, Tick>(SUBSCRIBE),
                move |stream| {
                    parked.lock().unwrap().push(stream);
                },
            )
            .expect("register");
    }
    server.run().expect("server run");

    let mut client = ClientEngine::new(client_options(), hub.connect(&client_options()));
    client.run();

    let (tx_a, rx_a) = mpsc::channel();
    subscribe(&client, "dup", RelaunchPolicy::Shutdown, tx_a);

    // Same session id under a different request type: rejected, A intact.
    let audit_route = InprocStreamRoute::<AuditRequest, Tick>::new(AUDIT);
    let (tx_b, rx_b) = mpsc::channel::<StreamEvent<Tick>>();
    client.launch_server_stream(ServerStreamCall::new(
        "dup".to_string(),
        audit_route,
        AuditRequest { topic: "audit".to_string() },
        Box::new(move |event| {
            let _ = tx_b.send(event);
        }),
    ));
    match rx_b.recv_timeout(Duration::from_secs(2)).expect("rejection event") {
        StreamEvent::Finished(status) => assert_eq!(status.code(), StatusCode::AlreadyExists),
        StreamEvent::Notification(_) => panic!("duplicate session was not rejected"),
    }

    let started = Instant::now();
    while parked.lock().unwrap().is_empty() {
        assert!(started.elapsed() < Duration::from_secs(2), "stream never accepted");
        std::thread::sleep(Duration::from_millis(5));
    }
    let handle = parked.lock().unwrap().pop().expect("parked stream");
    assert_eq!(handle.push(Tick { payload: "alive".to_string() }), StreamState::Running);
    match rx_a.recv_timeout(Duration::from_secs(2)).expect("stream event") {
        StreamEvent::Notification(tick) => assert_eq!(tick.payload, "alive"),
        StreamEvent::Finished(status) => panic!("unexpected terminal: {}", status),
    }
    handle.close(Status::ok());
}

#[rstest]
fn test_stream_shutdown_by_session(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();

    let parked: Arc<Mutex<Vec<ServerStreamMethod<FeedPort>>>> = Arc::new(Mutex::new(Vec::new()));

    let mut server = ServiceEngine::<InprocQueue>::new(server_options());
    {
        let parked = parked.clone();
        server
            .register_server_stream(
                feed_descriptor(),
                service.stream_port::<SubscribeRequest, Tick>(SUBSCRIBE),
                move |stream| {
                    parked.lock().unwrap().push(stream);
                },
            )
            .expect("register");
    }
    server.run().expect("server run");

    let mut client = ClientEngine::new(client_options(), hub.connect(&client_options()));
    client.run();
    let (tx, rx) = mpsc::channel();
    // Relaunch policy: the engine-side shutdown must still be terminal.
    subscribe(&client, "s1", RelaunchPolicy::Relaunch, tx);

    let started = Instant::now();
    while parked.lock().unwrap().is_empty() {
        assert!(started.elapsed() < Duration::from_secs(2), "stream never accepted");
        std::thread::sleep(Duration::from_millis(5));
    }

    client.shutdown_server_stream(ServerStreamShutdown::new("s1".to_string()));
    match rx.recv_timeout(Duration::from_secs(2)).expect("terminal event") {
        StreamEvent::Finished(status) => assert_eq!(status.code(), StatusCode::Cancelled),
        StreamEvent::Notification(tick) => panic!("unexpected notification: {:?}", tick),
    }
}

#[rstest]
fn test_stream_engine_drop_is_terminal(runner: TestRunner) {
    let _ = runner;
    let hub = Hub::new();
    let service = hub.serve();

    let parked: Arc<Mutex<Vec<ServerStreamMethod<FeedPort>>>> = Arc::new(Mutex::new(Vec::new()));

    let mut server = ServiceEngine::<InprocQueue>::new(server_options());
    {
        let parked = parked.clone();
        server
            .register_server_stream(
                feed_descriptor(),
                service.stream_port::<SubscribeRequest, Tick>(SUBSCRIBE),
                move |stream| {
                    parked.lock().unwrap().push(stream);
                },
            )
            .expect("register");
    }
    server.run().expect("server run");

    let mut client = ClientEngine::new(client_options(), hub.connect(&client_options()));
    client.run();
    let (tx, rx) = mpsc::channel();
    subscribe(&client, "s1", RelaunchPolicy::Relaunch, tx);

    let started = Instant::now();
    while parked.lock().unwrap().is_empty() {
        assert!(started.elapsed() < Duration::from_secs(2), "stream never accepted");
        std::thread::sleep(Duration::from_millis(5));
    }

    // Dropping the engine cancels the stream and joins both threads; the
    // callback observes a terminal status first.
    drop(client);
    assert!(started.elapsed() < Duration::from_secs(5), "engine drop did not bound");
    match rx.recv_timeout(Duration::from_secs(2)).expect("terminal event") {
        StreamEvent::Finished(status) => assert!(
            status.code() == StatusCode::Aborted || status.code() == StatusCode::Cancelled,
            "unexpected terminal: {}",
            status
        ),
        StreamEvent::Notification(tick) => panic!("unexpected notification: {:?}", tick),
    }
}
