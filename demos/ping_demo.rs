//! Minimal end-to-end demo: two stacks talking over a perfect in-process
//! loopback, one calling `sys.ping` on the other.

use satlink::codec::Value;
use satlink::config::StackConfig;
use satlink::dispatch::StaticHandler;
use satlink::transport::loopback::{self, AdversaryConfig};
use satlink::Stack;

fn main() {
    let ((a_read, a_write), (b_read, b_write)) = loopback::pair(AdversaryConfig::perfect());
    let empty_apps = StaticHandler::builder().build_arc();

    let config = StackConfig::default();
    let _server = Stack::build(
        config.clone(),
        (b_read, b_write),
        Box::new(|_| {}),
        empty_apps.clone(),
        Value::Nil,
        None,
    );
    let client = Stack::build(config, (a_read, a_write), Box::new(|_| {}), empty_apps, Value::Nil, None);

    let reply = client.call(vec!["sys", "ping"], Value::str("hello satellite")).unwrap();
    println!("ping reply: {reply:?}");

    let test_bytes = client.call(vec!["sys", "test"], Value::Nil).unwrap();
    println!("test reply: {test_bytes:?}");
}
