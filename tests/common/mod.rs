#![allow(dead_code)]

use std::sync::Arc;

use captains_log::*;
use cqrpc::client::ClientOptions;
use cqrpc::server::ServerOptions;
use cqrpc_inproc::InsecureCredentials;
use rstest::fixture;

pub struct TestRunner;

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/cqrpc_test.log", Level::Trace).test().build().expect("log");
        Self
    }
}

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

pub const GET_COUNTER: &str = "test.Counter/Get";
pub const SUBSCRIBE: &str = "test.Feed/Subscribe";
pub const AUDIT: &str = "test.Feed/Audit";

#[derive(Clone, Debug, PartialEq)]
pub struct GetCounterRequest {
    pub who: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CounterResponse {
    pub value: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubscribeRequest {
    pub topic: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuditRequest {
    pub topic: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tick {
    pub payload: String,
}

pub fn server_options() -> ServerOptions {
    ServerOptions::new("test.Service")
        .expect("server options")
        .add_endpoint("inproc://svc", Arc::new(InsecureCredentials))
        .expect("endpoint")
}

pub fn client_options() -> ClientOptions {
    ClientOptions::new("inproc://svc", Arc::new(InsecureCredentials)).expect("client options")
}
