//! Request/response dispatcher (spec §4.4): carries request identifiers,
//! routes replies to waiters, and routes incoming actions to the
//! dispatch tree.
//!
//! Sits above either the reliable layer or, for loss-free transports,
//! directly on the codec (spec §4.3 intro). Both are exposed to this
//! layer through the `MessageChannel` trait so it never needs to know
//! which one it is talking to.

use crate::codec::{self, ProxyTable, Value};
use crate::dispatch::{self, Tree};
use crate::message::{Action, RequestFrame};
use crate::task_group::TaskGroup;
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};

/// A dispatch tree that can be swapped out in place (spec §4.5, "live
/// reconfiguration"). The request layer always routes through the
/// current value, so a supervisor-driven tree rebuild takes effect for
/// the very next incoming request.
pub type DispatchSlot = Arc<RwLock<Arc<Tree>>>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("channel closed")]
    Closed,
    /// The reply carried an error payload from the peer or a local
    /// handler (spec §4.4, §6: known-type errors cross as tag-5
    /// constructs, everything else as an `E:`/`T:`-prefixed string).
    #[error("remote error: {0:?}")]
    Remote(Value),
    #[error("remote error (silent): {0:?}")]
    SilentRemote(Value),
    /// Encoding the value for the wire failed (spec §6, "send-time type
    /// error"). Distinct from `Closed` so the request layer can fall back
    /// to a `T:`-prefixed error reply instead of silently dropping the
    /// send.
    #[error("send-time type error: {0}")]
    Encode(String),
}

/// Abstracts over the reliable layer and a direct codec-on-frame
/// channel, so the request layer is agnostic to which one is beneath it
/// (spec §4.3 intro: "Sits above either the reliable layer or ... loss-
/// free transports ... directly on the codec").
pub trait MessageChannel: Send + Sync {
    fn send(&self, value: Value) -> Result<(), Error>;
    /// Blocks up to `timeout` for the next inbound message. `Ok(None)`
    /// means the wait elapsed with nothing delivered; the reader loop
    /// polls on this (rather than a plain blocking `recv`) so it can
    /// notice cancellation without depending on the layer beneath it
    /// having already torn itself down (spec §5 suspension points).
    fn recv_timeout(&self, timeout: std::time::Duration) -> Result<Option<Value>, Error>;
    /// Drops a proxy table entry (spec §6 `sys.unproxy`). Channels with
    /// no proxy table of their own (none in this crate, but the trait is
    /// the seam per §9) can leave this a no-op.
    fn unproxy(&self, _name: &str) -> Result<(), Error> {
        Ok(())
    }
}

impl MessageChannel for crate::reliable::ReliableLayer {
    fn send(&self, value: Value) -> Result<(), Error> {
        self.send(value).map_err(|_| Error::Closed)
    }
    fn recv_timeout(&self, timeout: std::time::Duration) -> Result<Option<Value>, Error> {
        self.recv_timeout(timeout).map_err(|_| Error::Closed)
    }
    fn unproxy(&self, name: &str) -> Result<(), Error> {
        self.unproxy(name).map_err(|_| Error::Closed)
    }
}

/// A loss-free channel: the codec sitting directly on the framed-message
/// layer, with no ARQ in between (spec §4.3 intro, for transports that
/// don't need §4.3's sliding window).
pub struct DirectChannel {
    frames: Arc<crate::frame::FrameStream>,
    table: Mutex<ProxyTable>,
}

impl DirectChannel {
    pub fn new(frames: Arc<crate::frame::FrameStream>, table: ProxyTable) -> Self {
        DirectChannel { frames, table: Mutex::new(table) }
    }
}

impl MessageChannel for DirectChannel {
    fn send(&self, value: Value) -> Result<(), Error> {
        let mut table = self.table.lock().unwrap();
        let bytes = codec::encode_bytes(&value, &mut table).map_err(|e| Error::Encode(e.to_string()))?;
        self.frames.send(&bytes).map_err(|_| Error::Closed)
    }

    fn recv_timeout(&self, timeout: std::time::Duration) -> Result<Option<Value>, Error> {
        let bytes = match self.frames.recv_timeout(timeout) {
            Ok(bytes) => bytes,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => return Ok(None),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return Err(Error::Closed),
        };
        let mut table = self.table.lock().unwrap();
        codec::decode_bytes(&bytes, &mut table).map(Some).map_err(|_| Error::Closed)
    }

    fn unproxy(&self, name: &str) -> Result<(), Error> {
        self.table.lock().unwrap().unproxy(name);
        Ok(())
    }
}

enum Outcome {
    Data(Value),
    Error(Value),
}

struct PendingRequest {
    done: Sender<Outcome>,
}

struct Inner {
    channel: Arc<dyn MessageChannel>,
    dispatch: DispatchSlot,
    reply: Mutex<HashMap<i64, PendingRequest>>,
    next_seq: Mutex<i64>,
}

impl Inner {
    fn route(&self, action: &Action, data: Value) -> Result<Value, dispatch::Error> {
        self.dispatch.read().unwrap().route(action, data)
    }
}

impl Inner {
    /// Allocates a fresh request id. Wraps when it exceeds
    /// `10 * (|reply| + 5)`, then skips ids still live in `reply` (spec
    /// §4.4, testable property in spec §8: "request uniqueness").
    fn alloc_id(&self) -> i64 {
        let reply = self.reply.lock().unwrap();
        let mut seq = self.next_seq.lock().unwrap();
        let ceiling = 10 * (reply.len() as i64 + 5);
        if *seq > ceiling {
            *seq = 0;
        }
        while reply.contains_key(&*seq) {
            *seq += 1;
            if *seq > ceiling {
                *seq = 0;
            }
        }
        let id = *seq;
        *seq += 1;
        id
    }
}

/// The request/response layer for one connection.
pub struct RequestLayer {
    inner: Arc<Inner>,
    _group: TaskGroup,
}

impl RequestLayer {
    pub fn new(channel: Arc<dyn MessageChannel>, dispatch: DispatchSlot) -> Arc<Self> {
        let inner = Arc::new(Inner {
            channel,
            dispatch,
            reply: Mutex::new(HashMap::new()),
            next_seq: Mutex::new(0),
        });

        let mut group = TaskGroup::new("request");
        let token = group.token();
        let reader_inner = inner.clone();
        group.spawn("request-reader", move || {
            while !token.is_cancelled() {
                match reader_inner.channel.recv_timeout(std::time::Duration::from_millis(200)) {
                    Ok(Some(value)) => dispatch_incoming(&reader_inner, value),
                    Ok(None) => {}
                    Err(_) => break,
                }
            }
            teardown(&reader_inner);
        });

        Arc::new(RequestLayer { inner, _group: group })
    }

    /// `send(action, payload) -> reply` (spec §4.4): allocates an id,
    /// writes `{a,i,d}`, and blocks for the matching reply.
    pub fn send(&self, action: impl Into<Action>, data: Value) -> Result<Value, Error> {
        let id = self.inner.alloc_id();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        self.inner.reply.lock().unwrap().insert(id, PendingRequest { done: done_tx });

        let frame = RequestFrame::Request { action: action.into(), id, data };
        if let Err(e) = self.inner.channel.send(frame.to_value()) {
            self.inner.reply.lock().unwrap().remove(&id);
            return Err(e);
        }

        match done_rx.recv() {
            Ok(Outcome::Data(v)) => Ok(v),
            Ok(Outcome::Error(e)) => Err(classify_error(e)),
            Err(_) => Err(Error::Closed),
        }
    }

    /// `send_nr(action, payload)` (spec §4.4): fire-and-forget, returns
    /// once the transport accepts the bytes.
    pub fn send_nr(&self, action: impl Into<Action>, data: Value) -> Result<(), Error> {
        let frame = RequestFrame::Notification { action: action.into(), data };
        self.inner.channel.send(frame.to_value())
    }

    /// Drops a proxy table entry (spec §6 `sys.unproxy`).
    pub fn unproxy(&self, name: &str) -> Result<(), Error> {
        self.inner.channel.unproxy(name)
    }
}

// `E:`/`T:`-prefixed strings never indicate the silent error class.
// Only a locally registered `SilentRemote` error does, and that never
// crosses the wire as a plain string (spec §4.4, §6, §7), so any
// error reply arriving over the wire classifies as a plain `Remote`.
fn classify_error(value: Value) -> Error {
    Error::Remote(value)
}

fn teardown(inner: &Inner) {
    let mut reply = inner.reply.lock().unwrap();
    for (_, pending) in reply.drain() {
        // Waiters are told "channel closed" by the `Receiver` side
        // observing a disconnected sender; dropping `done` does that.
        drop(pending);
    }
}

fn dispatch_incoming(inner: &Arc<Inner>, value: Value) {
    match RequestFrame::parse(&value) {
        Ok(RequestFrame::Request { action, id, data }) => {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("request-handler".to_string())
                .spawn(move || handle_incoming_request(&inner, action, id, data))
                .ok();
        }
        Ok(RequestFrame::Notification { action, data }) => {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("request-notification".to_string())
                .spawn(move || {
                    let _ = inner.route(&action, data);
                })
                .ok();
        }
        Ok(RequestFrame::Reply { id, data }) => complete(inner, id, Outcome::Data(data)),
        Ok(RequestFrame::ReplyError { id, error }) => complete(inner, id, Outcome::Error(error)),
        Err(_) => {
            crate::logging::log("satlink::request: dropped malformed request frame");
        }
    }
}

fn complete(inner: &Arc<Inner>, id: i64, outcome: Outcome) {
    let pending = inner.reply.lock().unwrap().remove(&id);
    match pending {
        Some(pending) => {
            // A late `send` on `done` for an id nobody awaits any more
            // (the caller cancelled) is simply dropped by the closed
            // receiver, matching "cancelling a send ... is safe: a late
            // reply is dropped" (spec §5).
            let _ = pending.done.send(outcome);
        }
        None => {
            crate::logging::log(&format!(
                "satlink::request: duplicate or unknown reply for request {id}"
            ));
        }
    }
}

fn handle_incoming_request(inner: &Arc<Inner>, action: Action, id: i64, data: Value) {
    let result = inner.route(&action, data);
    let reply = match result {
        Ok(value) => RequestFrame::Reply { id, data: value },
        Err(err) => {
            let error_value = error_to_wire(&err);
            if !matches!(err, dispatch::Error::Silent(_)) {
                crate::logging::log_handler_error(&action_label(&action), &err);
            }
            RequestFrame::ReplyError { id, error: error_value }
        }
    };
    // The reply value itself may fail to encode (a handler returned
    // something the codec can't represent). That is a send-time type
    // error, not a handler error, so it gets its own `T:` prefix instead
    // of being folded into `error_to_wire`'s `E:` path (spec §6, §7).
    if let Err(Error::Encode(msg)) = inner.channel.send(reply.to_value()) {
        let fallback = RequestFrame::ReplyError { id, error: Value::str(format!("T:{msg}")) };
        let _ = inner.channel.send(fallback.to_value());
    }
}

/// Encodes a dispatch error for the wire (spec §6): known-type errors
/// would cross as tag-5 constructs via the proxy table (left to callers
/// that raise a `Proxied` error type through the payload directly),
/// anything else is stringified with the `E:` prefix. A `T:`-prefixed
/// reply is never produced here: it is built by `handle_incoming_request`
/// as a fallback when sending this function's own result fails to encode.
fn error_to_wire(err: &dispatch::Error) -> Value {
    match err {
        dispatch::Error::Silent(msg) => Value::str(format!("E:{msg}")),
        other => Value::str(format!("E:{other}")),
    }
}

fn action_label(action: &Action) -> String {
    match action {
        Action::Name(s) => s.clone(),
        Action::Path(p) => p.join("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::StaticHandler;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex as StdMutex;

    /// An in-process channel pair sharing one queue per direction, for
    /// exercising `RequestLayer` without a real transport underneath.
    struct PairChannel {
        outbox: Sender<Value>,
        inbox: StdMutex<Receiver<Value>>,
    }

    impl MessageChannel for PairChannel {
        fn send(&self, value: Value) -> Result<(), Error> {
            self.outbox.send(value).map_err(|_| Error::Closed)
        }
        fn recv_timeout(&self, timeout: std::time::Duration) -> Result<Option<Value>, Error> {
            match self.inbox.lock().unwrap().recv_timeout(timeout) {
                Ok(v) => Ok(Some(v)),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Ok(None),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(Error::Closed),
            }
        }
    }

    fn pair() -> (Arc<PairChannel>, Arc<PairChannel>) {
        let (tx_ab, rx_ab) = std::sync::mpsc::channel();
        let (tx_ba, rx_ba) = std::sync::mpsc::channel();
        (
            Arc::new(PairChannel { outbox: tx_ab, inbox: StdMutex::new(rx_ba) }),
            Arc::new(PairChannel { outbox: tx_ba, inbox: StdMutex::new(rx_ab) }),
        )
    }

    /// A channel whose first attempt to send a successful `Reply` fails
    /// as if the codec could not encode the handler's result, so the
    /// send-time type-error fallback in `handle_incoming_request` has
    /// something to react to.
    struct EncodeFailChannel {
        outbox: Sender<Value>,
        inbox: StdMutex<Receiver<Value>>,
    }

    impl MessageChannel for EncodeFailChannel {
        fn send(&self, value: Value) -> Result<(), Error> {
            if let Ok(RequestFrame::Reply { .. }) = RequestFrame::parse(&value) {
                return Err(Error::Encode("unsupported value".to_string()));
            }
            self.outbox.send(value).map_err(|_| Error::Closed)
        }
        fn recv_timeout(&self, timeout: std::time::Duration) -> Result<Option<Value>, Error> {
            match self.inbox.lock().unwrap().recv_timeout(timeout) {
                Ok(v) => Ok(Some(v)),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Ok(None),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(Error::Closed),
            }
        }
    }

    #[test]
    fn send_time_type_error_falls_back_to_t_prefix() {
        let (tx_ab, rx_ab) = std::sync::mpsc::channel();
        let (tx_ba, rx_ba) = std::sync::mpsc::channel();
        let client_chan = Arc::new(PairChannel { outbox: tx_ab, inbox: StdMutex::new(rx_ba) });
        let server_chan = Arc::new(EncodeFailChannel { outbox: tx_ba, inbox: StdMutex::new(rx_ab) });

        let server_tree = slot(Tree::new(
            StaticHandler::builder().simple_command("echo", |data| Ok(data)).build_arc(),
        ));
        let client_tree = slot(Tree::new(StaticHandler::builder().build_arc()));

        let _server = RequestLayer::new(server_chan, server_tree);
        let client = RequestLayer::new(client_chan, client_tree);

        match client.send("echo", Value::str("hi")).unwrap_err() {
            Error::Remote(Value::Str(s)) => assert!(s.starts_with("T:"), "got {s:?}"),
            other => panic!("expected a T:-prefixed remote error, got {other:?}"),
        }
    }

    fn slot(tree: Tree) -> DispatchSlot {
        Arc::new(RwLock::new(Arc::new(tree)))
    }

    #[test]
    fn ping_round_trips_through_dispatch() {
        let (client_chan, server_chan) = pair();
        let server_tree = slot(Tree::new(
            StaticHandler::builder()
                .simple_command("ping", |data| Ok(data))
                .build_arc(),
        ));
        let client_tree = slot(Tree::new(StaticHandler::builder().build_arc()));

        let _server = RequestLayer::new(server_chan, server_tree);
        let client = RequestLayer::new(client_chan, client_tree);

        let reply = client.send("ping", Value::str("hello")).unwrap();
        assert_eq!(reply, Value::str("hello"));
    }

    #[test]
    fn request_ids_are_unique_while_pending() {
        let (client_chan, _server_chan) = pair();
        let tree = slot(Tree::new(StaticHandler::builder().build_arc()));
        let client = RequestLayer::new(client_chan, tree);

        let first_id = client.inner.alloc_id();
        client
            .inner
            .reply
            .lock()
            .unwrap()
            .insert(first_id, PendingRequest { done: std::sync::mpsc::channel().0 });
        let second_id = client.inner.alloc_id();
        assert_ne!(first_id, second_id);
    }

    #[test]
    fn notification_gets_no_reply() {
        let (client_chan, server_chan) = pair();
        let calls = Arc::new(AtomicI64::new(0));
        let calls2 = calls.clone();
        let server_tree = slot(Tree::new(
            StaticHandler::builder()
                .command("note", move |_data, _rest| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Nil)
                })
                .build_arc(),
        ));
        let client_tree = slot(Tree::new(StaticHandler::builder().build_arc()));
        let _server = RequestLayer::new(server_chan, server_tree);
        let client = RequestLayer::new(client_chan, client_tree);

        client.send_nr("note", Value::Nil).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
