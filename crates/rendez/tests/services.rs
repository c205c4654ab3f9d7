// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service integration tests
//!
//! A server and a client node negotiate a stream channel through an
//! in-process Master and exchange calls over it.

use parking_lot::Mutex;
use rendez::{
    ChannelDescriptor, ChannelKinds, Context, InProcessMaster, NodeConfig, NodeIdentity,
    NodeLifecycle, Responder, ServiceClient, ServiceServer, ServiceStatus, Status, StatusCode,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

struct Capture(Arc<Mutex<Option<NodeIdentity>>>);

impl NodeLifecycle for Capture {
    fn on_did_create(&mut self, identity: NodeIdentity) {
        *self.0.lock() = Some(identity);
    }
}

struct Fixture {
    ctx: Context,
    server_node: NodeIdentity,
    client_node: NodeIdentity,
}

fn fixture() -> Fixture {
    let master = InProcessMaster::new();
    let config = NodeConfig::default().with_heartbeat_interval(Duration::from_millis(10));
    let mut ctx = Context::with_transport(config, Arc::new(master.transport()));
    let server_slot = Arc::new(Mutex::new(None));
    let client_slot = Arc::new(Mutex::new(None));
    ctx.create_node("server", Capture(server_slot.clone()));
    ctx.create_node("client", Capture(client_slot.clone()));
    ctx.run_until_idle().expect("node registration");
    let server_node = server_slot.lock().clone().expect("server identity");
    let client_node = client_slot.lock().clone().expect("client identity");
    Fixture {
        ctx,
        server_node,
        client_node,
    }
}

fn upper_case_server(f: &mut Fixture) -> ServiceServer<String, String> {
    let server = f.ctx.service_server::<String, String>();
    server.request_register(
        &f.server_node,
        "upper",
        ChannelDescriptor::with_kinds(ChannelKinds::TCP),
        |req: String, responder: Responder<String>| {
            if req.is_empty() {
                responder.done(Err(Status::invalid_argument("empty request")));
            } else {
                responder.done(Ok(req.to_uppercase()));
            }
        },
        |status| assert!(status.ok(), "register failed: {}", status),
    );
    f.ctx.run_until_idle().unwrap();
    assert!(server.is_registered());
    server
}

type Connections = Arc<Mutex<Vec<ServiceStatus>>>;

fn connected_client(f: &mut Fixture) -> (ServiceClient<String, String>, Connections) {
    let client = f.ctx.service_client::<String, String>();
    let connections: Connections = Arc::default();
    let sink = connections.clone();
    client.request_register(
        &f.client_node,
        "upper",
        ChannelDescriptor::with_kinds(ChannelKinds::TCP),
        move |status| sink.lock().push(status),
        |status| assert!(status.ok(), "client register failed: {}", status),
    );
    let watched = client.clone();
    assert!(f.ctx.run_until(WAIT, move || watched.is_connected()).unwrap());
    (client, connections)
}

type Outcome = Arc<Mutex<Option<Result<String, StatusCode>>>>;

fn call(f: &mut Fixture, client: &ServiceClient<String, String>, request: &str, timeout: Duration) -> Result<String, StatusCode> {
    let outcome: Outcome = Arc::default();
    let slot = outcome.clone();
    client.call_with_timeout(&request.to_string(), timeout, move |result| {
        *slot.lock() = Some(result.map_err(|s| s.code()));
    });
    let done = outcome.clone();
    assert!(f.ctx.run_until(WAIT, move || done.lock().is_some()).unwrap());
    let result = outcome.lock().take();
    result.expect("call completed")
}

#[test]
fn test_call_round_trip() {
    let mut f = fixture();
    let _server = upper_case_server(&mut f);
    let (client, connections) = connected_client(&mut f);

    assert_eq!(call(&mut f, &client, "hello", WAIT), Ok("HELLO".to_string()));
    assert_eq!(call(&mut f, &client, "", WAIT), Err(StatusCode::InvalidArgument));
    assert_eq!(connections.lock().as_slice(), &[ServiceStatus::Connected]);
    assert_eq!(client.in_flight(), 0);
}

#[test]
fn test_client_registered_before_server_connects_later() {
    let mut f = fixture();
    let client = f.ctx.service_client::<String, String>();
    let connections: Connections = Arc::default();
    let sink = connections.clone();
    client.request_register(
        &f.client_node,
        "upper",
        ChannelDescriptor::with_kinds(ChannelKinds::TCP),
        move |status| sink.lock().push(status),
        |status| assert!(status.ok()),
    );
    f.ctx.run_until_idle().unwrap();
    assert!(!client.is_connected());
    assert_eq!(call(&mut f, &client, "early", WAIT), Err(StatusCode::Unavailable));

    let _server = upper_case_server(&mut f);
    let watched = client.clone();
    assert!(f.ctx.run_until(WAIT, move || watched.is_connected()).unwrap());
    assert_eq!(call(&mut f, &client, "late", WAIT), Ok("LATE".to_string()));
}

#[test]
fn test_unanswered_call_times_out() {
    let mut f = fixture();
    let held: Arc<Mutex<Vec<Responder<String>>>> = Arc::default();
    let keep = held.clone();
    let server = f.ctx.service_server::<String, String>();
    server.request_register(
        &f.server_node,
        "upper",
        ChannelDescriptor::with_kinds(ChannelKinds::TCP),
        move |_req: String, responder: Responder<String>| keep.lock().push(responder),
        |status| assert!(status.ok()),
    );
    f.ctx.run_until_idle().unwrap();
    let (client, _) = connected_client(&mut f);

    assert_eq!(
        call(&mut f, &client, "slow", Duration::from_millis(100)),
        Err(StatusCode::Timeout)
    );
    assert_eq!(client.in_flight(), 0);

    // A late answer for an expired call is ignored.
    let late = held.lock().pop();
    if let Some(responder) = late {
        responder.done(Ok("too late".to_string()));
    }
    f.ctx.run_for(Duration::from_millis(50)).unwrap();
    assert_eq!(client.in_flight(), 0);
}

#[test]
fn test_server_withdrawal_disconnects_client() {
    let mut f = fixture();
    let held: Arc<Mutex<Vec<Responder<String>>>> = Arc::default();
    let keep = held.clone();
    let server = f.ctx.service_server::<String, String>();
    server.request_register(
        &f.server_node,
        "upper",
        ChannelDescriptor::with_kinds(ChannelKinds::TCP),
        move |_req: String, responder: Responder<String>| keep.lock().push(responder),
        |status| assert!(status.ok()),
    );
    f.ctx.run_until_idle().unwrap();
    let (client, connections) = connected_client(&mut f);

    let outcome: Outcome = Arc::default();
    let slot = outcome.clone();
    client.call(&"pending".to_string(), move |result| {
        *slot.lock() = Some(result.map_err(|s| s.code()));
    });
    let arrived = held.clone();
    assert!(f.ctx.run_until(WAIT, move || !arrived.lock().is_empty()).unwrap());

    server.request_unregister(&f.server_node, "upper", |status| assert!(status.ok()));
    let done = outcome.clone();
    assert!(f.ctx.run_until(WAIT, move || done.lock().is_some()).unwrap());
    assert_eq!(outcome.lock().clone(), Some(Err(StatusCode::Unavailable)));

    let watched = client.clone();
    assert!(f.ctx.run_until(WAIT, move || !watched.is_connected()).unwrap());
    assert_eq!(
        connections.lock().as_slice(),
        &[ServiceStatus::Connected, ServiceStatus::Disconnected]
    );
    held.lock().clear();
}

#[test]
fn test_datagram_only_service_is_refused() {
    let mut f = fixture();
    let server = f.ctx.service_server::<String, String>();
    let result = Arc::new(Mutex::new(None));
    let slot = result.clone();
    server.request_register(
        &f.server_node,
        "udp-only",
        ChannelDescriptor::with_kinds(ChannelKinds::UDP),
        |_req: String, responder: Responder<String>| responder.done(Ok(String::new())),
        move |status| *slot.lock() = Some(status.code()),
    );
    f.ctx.run_until_idle().unwrap();
    assert_eq!(*result.lock(), Some(StatusCode::InvalidArgument));
    assert!(!server.is_registered());
}

#[test]
fn test_call_beyond_queue_size_is_backpressure() {
    let mut f = fixture();
    let held: Arc<Mutex<Vec<Responder<String>>>> = Arc::default();
    let keep = held.clone();
    let server = f.ctx.service_server::<String, String>();
    server.request_register(
        &f.server_node,
        "upper",
        ChannelDescriptor::with_kinds(ChannelKinds::TCP),
        move |_req: String, responder: Responder<String>| keep.lock().push(responder),
        |status| assert!(status.ok()),
    );
    f.ctx.run_until_idle().unwrap();

    let client = f.ctx.service_client::<String, String>();
    let descriptor = ChannelDescriptor::builder()
        .kinds(ChannelKinds::TCP)
        .queue_size(1)
        .build()
        .unwrap();
    client.request_register(&f.client_node, "upper", descriptor, |_| {}, |status| assert!(status.ok()));
    let watched = client.clone();
    assert!(f.ctx.run_until(WAIT, move || watched.is_connected()).unwrap());

    let first: Outcome = Arc::default();
    let slot = first.clone();
    client.call(&"one".to_string(), move |result| {
        *slot.lock() = Some(result.map_err(|s| s.code()));
    });
    assert_eq!(client.in_flight(), 1);
    assert_eq!(call(&mut f, &client, "two", WAIT), Err(StatusCode::Backpressure));

    let arrived = held.clone();
    assert!(f.ctx.run_until(WAIT, move || !arrived.lock().is_empty()).unwrap());
    let responder = held.lock().pop();
    if let Some(responder) = responder {
        responder.done(Ok("ONE".to_string()));
    }
    let done = first.clone();
    assert!(f.ctx.run_until(WAIT, move || done.lock().is_some()).unwrap());
    assert_eq!(first.lock().clone(), Some(Ok("ONE".to_string())));
}

#[test]
fn test_concurrent_calls_complete_out_of_order() {
    let mut f = fixture();
    let held: Arc<Mutex<Vec<(String, Responder<String>)>>> = Arc::default();
    let keep = held.clone();
    let server = f.ctx.service_server::<String, String>();
    server.request_register(
        &f.server_node,
        "upper",
        ChannelDescriptor::with_kinds(ChannelKinds::TCP),
        move |req: String, responder: Responder<String>| keep.lock().push((req, responder)),
        |status| assert!(status.ok()),
    );
    f.ctx.run_until_idle().unwrap();
    let (client, _) = connected_client(&mut f);

    let completed: Arc<Mutex<Vec<(String, Result<String, StatusCode>)>>> = Arc::default();
    for request in ["a", "b", "c"] {
        let sink = completed.clone();
        client.call(&request.to_string(), move |result| {
            sink.lock().push((request.to_string(), result.map_err(|s| s.code())));
        });
    }
    assert_eq!(client.in_flight(), 3);

    let arrived = held.clone();
    assert!(f.ctx.run_until(WAIT, move || arrived.lock().len() == 3).unwrap());
    let pending: Vec<_> = held.lock().drain(..).collect();
    for (req, responder) in pending.into_iter().rev() {
        responder.done(Ok(req.to_uppercase()));
    }

    let done = completed.clone();
    assert!(f.ctx.run_until(WAIT, move || done.lock().len() == 3).unwrap());
    let completed = completed.lock().clone();
    assert_eq!(
        completed,
        vec![
            ("c".to_string(), Ok("C".to_string())),
            ("b".to_string(), Ok("B".to_string())),
            ("a".to_string(), Ok("A".to_string())),
        ]
    );
    assert_eq!(client.in_flight(), 0);
}
