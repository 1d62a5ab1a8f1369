//! Demonstrates the reliable layer riding out a lossy, reordering link:
//! a client fires a batch of requests at a server over a loopback pair
//! configured to drop 20% of frames and reorder survivors, and every
//! request still completes exactly once, in order.

use satlink::codec::Value;
use satlink::config::StackConfig;
use satlink::dispatch::StaticHandler;
use satlink::transport::loopback::{self, AdversaryConfig};
use satlink::Stack;

fn main() {
    let ((a_read, a_write), (b_read, b_write)) =
        loopback::pair(AdversaryConfig::new(0x5EED, 20, true));

    let echo = StaticHandler::builder()
        .simple_command("ping", |data| Ok(data))
        .build_arc();
    let server_apps = StaticHandler::builder().child("echo", echo).build_arc();
    let client_apps = StaticHandler::builder().build_arc();

    let config = StackConfig { lossy: true, ..StackConfig::default() };

    let _server = Stack::build(
        config.clone(),
        (b_read, b_write),
        Box::new(|_| {}),
        server_apps,
        Value::Nil,
        None,
    );
    let client = Stack::build(config, (a_read, a_write), Box::new(|_| {}), client_apps, Value::Nil, None);

    for i in 0..100 {
        let reply = client
            .call(vec!["apps", "echo", "ping"], Value::Int(i))
            .expect("request should complete despite loss and reorder");
        assert_eq!(reply, Value::Int(i));
    }
    println!("100 requests completed over a lossy, reordering link");
}
