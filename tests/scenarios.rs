//! End-to-end scenarios (spec §8), each exercised over the in-process
//! loopback transport pair the way the teacher exercises
//! `bidirectional_proxy.rs` without real hardware.

use satlink::codec::{decode_bytes, encode_bytes, Proxied, ProxyTable, Value};
use satlink::config::StackConfig;
use satlink::dispatch::StaticHandler;
use satlink::transport::loopback::{self, AdversaryConfig};
use satlink::Stack;
use std::sync::Arc;

fn perfect() -> StackConfig {
    StackConfig { lossy: false, guarded: false, ..StackConfig::default() }
}

/// 1. Ping: a satellite handler `b` exposing `echo(m) -> {r: m}`.
#[test]
fn scenario_ping() {
    let ((a_read, a_write), (b_read, b_write)) = loopback::pair(AdversaryConfig::perfect());

    let echo = StaticHandler::builder()
        .simple_command("echo", |data| Ok(Value::Map(vec![(Value::str("r"), data)])))
        .build_arc();
    let server_apps = StaticHandler::builder().child("b", echo).build_arc();
    let client_apps = StaticHandler::builder().build_arc();

    let _server = Stack::build(perfect(), (b_read, b_write), Box::new(|_| {}), server_apps, Value::Nil, None);
    let client = Stack::build(perfect(), (a_read, a_write), Box::new(|_| {}), client_apps, Value::Nil, None);

    let reply = client
        .call(vec!["apps", "b", "echo"], Value::str("hello"))
        .unwrap();
    assert_eq!(reply.map_get("r"), Some(&Value::str("hello")));
}

/// 2. Config update: partial writes through `sys.cfg`, verified by
/// `sys.cfg_r`, preserving untouched keys and honoring deletion.
#[test]
fn scenario_config_update() {
    let ((a_read, a_write), (b_read, b_write)) = loopback::pair(AdversaryConfig::perfect());
    let empty = StaticHandler::builder().build_arc();

    let initial = Value::Map(vec![(
        Value::str("tt"),
        Value::Map(vec![
            (Value::str("x"), Value::str("y")),
            (Value::str("z"), Value::str("before")),
        ]),
    )]);

    let _server = Stack::build(perfect(), (b_read, b_write), Box::new(|_| {}), empty.clone(), initial, None);
    let client = Stack::build(perfect(), (a_read, a_write), Box::new(|_| {}), empty, Value::Nil, None);

    let set = |path: Vec<&str>, data: Value| {
        let p = Value::Array(path.into_iter().map(Value::str).collect());
        client
            .call(
                vec!["sys", "cfg"],
                Value::Map(vec![(Value::str("p"), p), (Value::str("d"), data)]),
            )
            .unwrap();
    };

    set(vec!["tt", "a"], Value::str("d"));
    set(vec!["tt", "e", "f"], Value::Int(42));
    set(vec!["tt", "z"], Value::NotGiven);

    let read = |path: Vec<&str>| -> Value {
        let p = Value::Array(path.into_iter().map(Value::str).collect());
        client.call(vec!["sys", "cfg_r"], p).unwrap()
    };

    let tt = read(vec!["tt"]);
    assert_eq!(tt.map_get("a"), Some(&Value::str("d")));
    assert_eq!(tt.map_get("x"), Some(&Value::str("y")));
    assert_eq!(tt.map_get("e").unwrap().map_get("f"), Some(&Value::Int(42)));
    assert_eq!(tt.map_get("z"), None);
}

#[derive(Debug)]
struct Bar {
    x: i64,
}

impl Proxied for Bar {
    fn class_name(&self) -> &str {
        "Bar"
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// 3. Proxy round-trip: a registered object crosses the wire by name,
/// round-trips back to the originating side with its original identity,
/// and the peer's two resolutions of the same name are equal to each
/// other (structural/by-name equality, since the peer never held the
/// real object).
#[test]
fn scenario_proxy_round_trip() {
    let mut client_table = ProxyTable::new();
    let mut peer_table = ProxyTable::new();

    let bar: Arc<dyn Proxied> = Arc::new(Bar { x: 95 });
    client_table.register("b", bar.clone());

    let wire = encode_bytes(&Value::Proxy(bar.clone()), &mut client_table).unwrap();

    let seen_once = decode_bytes(&wire, &mut peer_table).unwrap();
    let seen_twice = decode_bytes(&wire, &mut peer_table).unwrap();
    assert_eq!(seen_once, seen_twice);

    let wire_back = encode_bytes(&seen_once, &mut peer_table).unwrap();
    let back_home = decode_bytes(&wire_back, &mut client_table).unwrap();
    assert_eq!(back_home, Value::Proxy(bar));
}

/// 5. Lossy channel: a batch of requests all complete, in order, over a
/// link that drops 20% of frames and reorders survivors.
#[test]
fn scenario_lossy_channel() {
    let ((a_read, a_write), (b_read, b_write)) = loopback::pair(AdversaryConfig::new(0xC0FFEE, 20, true));

    let echo = StaticHandler::builder()
        .simple_command("ping", |data| Ok(data))
        .build_arc();
    let server_apps = StaticHandler::builder().child("echo", echo).build_arc();
    let client_apps = StaticHandler::builder().build_arc();

    let config = StackConfig { lossy: true, ..StackConfig::default() };
    let _server = Stack::build(config.clone(), (b_read, b_write), Box::new(|_| {}), server_apps, Value::Nil, None);
    let client = Stack::build(config, (a_read, a_write), Box::new(|_| {}), client_apps, Value::Nil, None);

    for i in 0..100i64 {
        let reply = client.call(vec!["apps", "echo", "ping"], Value::Int(i)).unwrap();
        assert_eq!(reply, Value::Int(i));
    }
}

/// 6. Reset after disconnect: a pending call fails once the transport is
/// torn down, and a fresh connection's ping succeeds afterward.
#[test]
fn scenario_reset_after_disconnect() {
    let ((a_read, a_write), (b_read, b_write)) = loopback::pair(AdversaryConfig::perfect());
    let empty = StaticHandler::builder().build_arc();

    let config = StackConfig { lossy: true, ..StackConfig::default() };
    let server = Stack::build(config.clone(), (b_read, b_write), Box::new(|_| {}), empty.clone(), Value::Nil, None);
    let client = Stack::build(config.clone(), (a_read, a_write), Box::new(|_| {}), empty.clone(), Value::Nil, None);

    // Establish the reset handshake before tearing anything down.
    client.call(vec!["sys", "ping"], Value::str("hi")).unwrap();

    drop(server);
    let err = client.call(vec!["sys", "ping"], Value::str("hi"));
    assert!(err.is_err());

    // A fresh connection's ping succeeds.
    let ((c_read, c_write), (d_read, d_write)) = loopback::pair(AdversaryConfig::perfect());
    let _server2 = Stack::build(config.clone(), (d_read, d_write), Box::new(|_| {}), empty.clone(), Value::Nil, None);
    let client2 = Stack::build(config, (c_read, c_write), Box::new(|_| {}), empty, Value::Nil, None);
    let reply = client2.call(vec!["sys", "ping"], Value::str("hi")).unwrap();
    assert_eq!(reply, Value::str("R:hi"));
}
