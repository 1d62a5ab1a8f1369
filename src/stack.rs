//! The supervisor: builds one connection's stack top-down from
//! configuration and owns its structured-concurrency scope (spec §2,
//! §5). Byte transport -> frame -> codec -> (optional) reliable ->
//! request -> dispatch tree.
//!
//! A `Stack` is a scope: dropping it cancels every layer's background
//! task (via each layer's own `TaskGroup`) and runs teardown in reverse
//! creation order, the way `bidirectional_proxy.rs`'s connection handling
//! tears down its reader/writer threads on disconnect.

use crate::codec::ProxyTable;
use crate::config::{Framing, StackConfig};
use crate::dispatch::{self, builtin, Tree};
use crate::frame::{self, ConsoleSink, FrameStream};
use crate::message::Action;
use crate::reliable::ReliableLayer;
use crate::request::{DirectChannel, MessageChannel, RequestLayer};
use crate::transport::{ReadTransport, WriteTransport};
use std::sync::{Arc, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Request(#[from] crate::request::Error),
    #[error(transparent)]
    Dispatch(#[from] dispatch::Error),
}

/// Everything needed to (re)build the dispatch tree on a live
/// reconfiguration commit (spec §4.5): a plain function from the current
/// `apps` config subtree to a fresh root handler, the way the source
/// rebuilds handlers from `apps` configuration on reconnect or commit.
pub type HandlerFactory = Arc<dyn Fn(&crate::codec::Value) -> Arc<dyn dispatch::Handler> + Send + Sync>;

/// One connection's assembled stack (spec §2 pipeline, §5 scope).
pub struct Stack {
    request: Arc<RequestLayer>,
    tree: Arc<RwLock<Arc<Tree>>>,
    config: Arc<builtin::ConfigStore>,
    app_factory: Option<HandlerFactory>,
}

impl Stack {
    /// Assembles a stack over `transport` per `config`, rooted at
    /// `app_root` (the `apps` subtree handler, out of scope per spec
    /// §1, supplied by the embedder) alongside the always-registered
    /// `sys` subtree (spec §6).
    pub fn build(
        config: StackConfig,
        transport: (Box<dyn ReadTransport>, Box<dyn WriteTransport>),
        console: ConsoleSink,
        app_root: Arc<dyn dispatch::Handler>,
        app_config: crate::codec::Value,
        app_factory: Option<HandlerFactory>,
    ) -> Arc<Stack> {
        let (read, write) = transport;
        let framer: Arc<dyn frame::Framer> = match config.framing {
            Framing::Prefix { sentinel } => Arc::new(frame::prefix::PrefixFramer::new(sentinel)),
            Framing::Packet { start } => Arc::new(frame::packet::PacketFramer::new(start)),
        };
        let frames = Arc::new(FrameStream::new(read, write, framer, console));
        let config_store = builtin::ConfigStore::new(app_config);

        let tree_slot = Arc::new(RwLock::new(build_tree(app_root, config_store.clone())));
        let tree_for_commit = tree_slot.clone();
        let app_factory_for_commit = app_factory.clone();
        let config_store_for_commit = config_store.clone();

        let channel: Arc<dyn MessageChannel> = if config.lossy || config.guarded {
            Arc::new(ReliableLayer::new(
                frames,
                ProxyTable::new(),
                config.window,
                config.timeout_ms,
                config.recv_queue_len(),
            ))
        } else {
            Arc::new(DirectChannel::new(frames, ProxyTable::new()))
        };

        let request = RequestLayer::new(channel, tree_slot.clone());
        let weak_request = Arc::downgrade(&request);

        // Reassemble the `sys` subtree now that `request` (needed for
        // `sys.unproxy`) exists, and commit it into the live tree. The
        // tiny window where `sys.unproxy` silently no-ops (the `Weak`
        // has nothing to upgrade to yet) only spans this function.
        let on_commit_tree = tree_for_commit.clone();
        let on_commit = move || {
            if let Some(factory) = &app_factory_for_commit {
                let subtree = config_store_for_commit.read(&["apps".to_string()]);
                let new_app_root = factory(&subtree);
                new_app_root.config_updated(subtree);
                let rebuilt = build_tree(new_app_root, config_store_for_commit.clone());
                *on_commit_tree.write().unwrap() = rebuilt;
            }
        };
        let committed_root = rebuild_root(&tree_slot.read().unwrap().root(), config_store.clone(), weak_request, on_commit);
        *tree_slot.write().unwrap() = Tree::new(committed_root).into();

        Arc::new(Stack { request, tree: tree_slot, config: config_store, app_factory })
    }

    /// `send(action, payload) -> reply` (spec §4.4).
    pub fn call(&self, action: impl Into<Action>, data: crate::codec::Value) -> Result<crate::codec::Value, Error> {
        Ok(self.request.send(action, data)?)
    }

    /// `send_nr(action, payload)` (spec §4.4).
    pub fn notify(&self, action: impl Into<Action>, data: crate::codec::Value) -> Result<(), Error> {
        Ok(self.request.send_nr(action, data)?)
    }

    pub fn config(&self) -> &Arc<builtin::ConfigStore> {
        &self.config
    }

    /// Routes directly through the dispatch tree, bypassing the wire.
    /// Used by the supervisor's own reconfiguration commit path and by
    /// tests that want to exercise routing without a transport.
    pub fn route_local(&self, action: &Action, data: crate::codec::Value) -> Result<crate::codec::Value, Error> {
        Ok(self.tree.read().unwrap().route(action, data)?)
    }

    /// True once this stack has a handler factory registered for live
    /// reconfiguration (spec §4.5).
    pub fn supports_reconfiguration(&self) -> bool {
        self.app_factory.is_some()
    }
}

fn build_tree(app_root: Arc<dyn dispatch::Handler>, config: Arc<builtin::ConfigStore>) -> Arc<Tree> {
    // `sys` is rebuilt again once the request layer exists (see
    // `rebuild_root`); this first pass exists only so the request layer
    // itself can be constructed against *some* tree.
    let sys = builtin::sys_handler(config, std::sync::Weak::new(), || {});
    let root = crate::dispatch::StaticHandler::builder()
        .child("sys", sys)
        .child("apps", app_root)
        .build_arc();
    Arc::new(Tree::new(root))
}

fn rebuild_root(
    app_root: &Arc<dyn dispatch::Handler>,
    config: Arc<builtin::ConfigStore>,
    request: std::sync::Weak<RequestLayer>,
    on_commit: impl Fn() + Send + Sync + 'static,
) -> Arc<dyn dispatch::Handler> {
    let sys = builtin::sys_handler(config, request, on_commit);
    crate::dispatch::StaticHandler::builder()
        .child("sys", sys)
        .child("apps", app_root.clone())
        .build_arc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::dispatch::StaticHandler;
    use crate::transport::loopback;

    fn perfect_config() -> StackConfig {
        StackConfig { lossy: false, guarded: false, ..StackConfig::default() }
    }

    #[test]
    fn ping_end_to_end_over_loopback() {
        let ((a_read, a_write), (b_read, b_write)) = loopback::pair(loopback::AdversaryConfig::perfect());

        let echo_handler = StaticHandler::builder()
            .simple_command("echo", |data| Ok(Value::Map(vec![(Value::str("r"), data)])))
            .build_arc();
        let server_apps = StaticHandler::builder().child("b", echo_handler).build_arc();

        let client_apps = StaticHandler::builder().build_arc();

        let _server = Stack::build(perfect_config(), (b_read, b_write), Box::new(|_| {}), server_apps, Value::Nil, None);
        let client = Stack::build(perfect_config(), (a_read, a_write), Box::new(|_| {}), client_apps, Value::Nil, None);

        let reply = client
            .call(
                vec!["apps", "b", "echo"],
                Value::Map(vec![(Value::str("m"), Value::str("hello"))]),
            )
            .unwrap();
        assert_eq!(reply.map_get("r").unwrap().map_get("m"), Some(&Value::str("hello")));
    }

    #[test]
    fn sys_test_round_trips_literal_bytes() {
        let ((a_read, a_write), (b_read, b_write)) = loopback::pair(loopback::AdversaryConfig::perfect());
        let empty = StaticHandler::builder().build_arc();
        let _server = Stack::build(perfect_config(), (b_read, b_write), Box::new(|_| {}), empty.clone(), Value::Nil, None);
        let client = Stack::build(perfect_config(), (a_read, a_write), Box::new(|_| {}), empty, Value::Nil, None);

        let reply = client.call(vec!["sys", "test"], Value::Nil).unwrap();
        assert_eq!(reply, Value::Bytes(builtin::TEST_BYTES.to_vec()));
    }

    #[test]
    fn sys_ping_echoes_with_prefix() {
        let ((a_read, a_write), (b_read, b_write)) = loopback::pair(loopback::AdversaryConfig::perfect());
        let empty = StaticHandler::builder().build_arc();
        let _server = Stack::build(perfect_config(), (b_read, b_write), Box::new(|_| {}), empty.clone(), Value::Nil, None);
        let client = Stack::build(perfect_config(), (a_read, a_write), Box::new(|_| {}), empty, Value::Nil, None);

        let reply = client.call(vec!["sys", "ping"], Value::str("hi")).unwrap();
        assert_eq!(reply, Value::str("R:hi"));
    }
}
