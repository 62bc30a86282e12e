// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lifecycle scenarios: master offline, exit-flag latency, graceful
//! destroy, callback-once guarantees.

mod common;

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::XmlrpcServer;
use rros::{ErrorKind, Node, NodeConfig, StaticSchemaDb, Value};

const MD5: &str = "992ce8a1687cec8c8bd883ec73ca41d1";

fn schema_db() -> Box<StaticSchemaDb> {
    let mut db = StaticSchemaDb::new();
    db.insert_message("std_msgs/String", MD5, "string data\n");
    Box::new(db)
}

/// Port with nothing listening: bind an ephemeral port and release it.
fn dead_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

fn node_against(master_port: u16) -> Node {
    let config = NodeConfig::new("/lonely", "127.0.0.1", "127.0.0.1", master_port)
        .with_shutdown_timeout(Duration::from_millis(800));
    Node::with_config(config, schema_db()).unwrap()
}

#[test]
fn master_offline_keeps_engine_alive_and_exit_is_prompt() {
    let mut node = node_against(dead_port());
    node.register_subscriber("/chatter", "std_msgs/String", false, |_| {})
        .unwrap();

    // The registration RPC fails with Transport, the engine keeps running
    // until the caller-supplied deadline.
    let exit = AtomicBool::new(false);
    node.run(Some(1_500), &exit).unwrap();
    let err = node.take_last_error().expect("transport failure recorded");
    assert_eq!(err.kind(), ErrorKind::Transport);

    // Toggling the flag returns within one tick.
    exit.store(true, Ordering::Relaxed);
    let started = Instant::now();
    node.run(None, &exit).unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn rpc_callback_fires_exactly_once_on_failure() {
    let mut node = node_against(dead_port());

    let invocations = Arc::new(Mutex::new(Vec::<bool>::new()));
    let seen = invocations.clone();
    node.get_param("/robot_name", move |value| {
        seen.lock().unwrap().push(value.is_some());
    })
    .unwrap();

    let exit = AtomicBool::new(false);
    node.run(Some(1_500), &exit).unwrap();

    // Exactly one invocation, with the null result.
    assert_eq!(invocations.lock().unwrap().as_slice(), &[false]);
}

#[test]
fn param_round_trip_against_fixture_master() {
    let master = XmlrpcServer::serve(|method, params| match method {
        "getParam" => {
            assert_eq!(params[1].as_str(), Some("/robot_name"));
            vec![
                Value::Int(1),
                Value::string(""),
                Value::string("curiosity"),
            ]
        }
        "hasParam" => vec![Value::Int(1), Value::string(""), Value::Bool(true)],
        _ => vec![Value::Int(1), Value::string(""), Value::Int(0)],
    });

    let mut node = node_against(master.port);

    let got: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let has: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
    let g = got.clone();
    node.get_param("/robot_name", move |value| {
        *g.lock().unwrap() = value.and_then(Value::as_str).map(str::to_string);
    })
    .unwrap();
    let h = has.clone();
    node.has_param("/robot_name", move |answer| {
        *h.lock().unwrap() = answer;
    })
    .unwrap();
    node.set_param("/speed", Value::Double(1.5)).unwrap();

    let exit = AtomicBool::new(false);
    node.run(Some(2_000), &exit).unwrap();

    assert_eq!(got.lock().unwrap().as_deref(), Some("curiosity"));
    assert_eq!(*has.lock().unwrap(), Some(true));
    assert!(master.called("setParam"));
}

#[test]
fn graceful_destroy_cancels_pending_rpcs() {
    // A master that accepts but never answers: the call stays in flight
    // until shutdown abandons it.
    let blackhole = TcpListener::bind("127.0.0.1:0").unwrap();
    let master_port = blackhole.local_addr().unwrap().port();

    let mut node = node_against(master_port);

    let invocations = Arc::new(Mutex::new(Vec::<bool>::new()));
    let seen = invocations.clone();
    node.get_param("/stuck", move |value| {
        seen.lock().unwrap().push(value.is_some());
    })
    .unwrap();

    let started = Instant::now();
    node.shutdown().unwrap();
    // Bounded by the shutdown budget, not the RPC timeout.
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(invocations.lock().unwrap().as_slice(), &[false]);

    // The node is destroyed: further use is a usage error, repeated
    // shutdown is idempotent.
    let err = node
        .register_subscriber("/x", "std_msgs/String", false, |_| {})
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);
    node.shutdown().unwrap();
}

#[test]
fn destroy_unregisters_with_master() {
    let master = XmlrpcServer::serve(|_, _| vec![Value::Int(1), Value::string(""), Value::Int(0)]);
    let mut node = node_against(master.port);
    node.register_subscriber("/chatter", "std_msgs/String", false, |_| {})
        .unwrap();
    node.register_publisher("/out", "std_msgs/String", false, None, None)
        .unwrap();

    node.shutdown().unwrap();

    assert!(master.called("unregisterSubscriber"));
    assert!(master.called("unregisterPublisher"));
}

#[test]
fn registry_slots_and_duplicates() {
    let mut node = node_against(dead_port());

    let a = node
        .register_subscriber("/a", "std_msgs/String", false, |_| {})
        .unwrap();
    let b = node
        .register_subscriber("/b", "std_msgs/String", false, |_| {})
        .unwrap();
    assert_ne!(a, b);

    let err = node
        .register_subscriber("/a", "std_msgs/String", false, |_| {})
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Registry);

    node.unregister_subscriber(a).unwrap();
    let c = node
        .register_subscriber("/c", "std_msgs/String", false, |_| {})
        .unwrap();
    // Freed slot is reused.
    assert_eq!(c, a);

    let err = node.unregister_subscriber(99).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);
}

#[test]
fn exit_flag_via_handle_command() {
    let mut node = node_against(dead_port());
    let handle = node.handle();

    // Queue the command before running; the engine drains it on the first
    // iteration and shuts down.
    handle.shutdown();
    let exit = AtomicBool::new(false);
    let started = Instant::now();
    node.run(None, &exit).unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
}
