//! Sliding-window ARQ with a three-phase reset handshake (spec §4.3, "the
//! hardest subcomponent"). Upgrades the framed-message layer below
//! (which may lose, reorder, or duplicate whole frames) into an
//! in-order, lossless, duplicate-free channel for the request layer
//! above.
//!
//! This layer is the one place in the stack that owns the connection's
//! `ProxyTable` (spec §5: "shared mutable state... each owned by exactly
//! one layer, mutated from its own task"), since it sits directly on framed
//! bytes, so it is the layer that calls the codec.

use crate::codec::{self, ProxyTable, Value};
use crate::frame::FrameStream;
use crate::message::{ReliableFrame, ResetConfig};
use crate::task_group::TaskGroup;
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("channel closed")]
    Closed,
}

/// `between(a, b, c)` mod `w`: true iff `b` lies in the half-open window
/// starting at `a` and extending no further than `c` does (spec §4.3).
/// All three are absolute (unwrapped) sequence counters. The worker does
/// its window-membership tests directly against absolute counters, which
/// is equivalent to this for non-wrapping `u32` math; kept as a named
/// primitive since the modular form is what the protocol actually
/// specifies, and it is easier to reason about at the wire-seq boundary.
#[allow(dead_code)]
fn between(a: u32, b: u32, c: u32, w: u32) -> bool {
    let rel_b = b.wrapping_sub(a) % w.max(1);
    let rel_c = c.wrapping_sub(a) % w.max(1);
    rel_b <= rel_c
}

/// Recovers an absolute sequence counter from a wire value known modulo
/// `w`, choosing the representative nearest `near` (spec gives only
/// mod-`W` wire fields; the layer keeps its own absolute bookkeeping so
/// window arithmetic never has to reason about wraparound of the wire
/// field itself).
fn unwrap_seq(near: u32, wire: u8, w: u32) -> u32 {
    let w = w.max(1) as i64;
    let near = near as i64;
    let wire = wire as i64;
    let mut diff = (wire - (near % w) + w) % w;
    if diff > w / 2 {
        diff -= w;
    }
    (near + diff).max(0) as u32
}

struct InFlight {
    payload: Value,
    deadline: Instant,
    done: Sender<Result<(), Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetState {
    Resetting,
    Up,
}

enum Event {
    Incoming(Vec<u8>),
    Outgoing(Value, Sender<Result<(), Error>>),
    /// Drops a proxy table entry (spec §6 `sys.unproxy`). The table is
    /// owned by this worker thread, so the request goes through the
    /// event queue like everything else that touches it.
    Unproxy(String),
    /// The frame layer's reader thread gave up on the transport (read
    /// error or EOF). There is nothing to reset into, so the worker tears
    /// down exactly as it would on an explicit close: every waiter fails
    /// with "channel closed" instead of retrying forever against a dead
    /// link (spec §8 scenario 6, "drop the transport mid-call").
    TransportClosed,
}

struct Worker {
    frames: Arc<FrameStream>,
    table: ProxyTable,
    window: u32,
    timeout: Duration,
    our_config: ResetConfig,
    negotiated: ResetConfig,
    state: ResetState,
    last_reset_send: Instant,

    send_next: u32,
    send_base: u32,
    send_table: HashMap<u32, InFlight>,
    pending_send: std::collections::VecDeque<(Value, Sender<Result<(), Error>>)>,

    recv_tail: u32,
    recv_buf: HashMap<u32, Value>,
    pend_ack: bool,
    last_ack_sent: Instant,

    deliver: SyncSender<Value>,
}

impl Worker {
    fn encode_and_send(&mut self, frame: &ReliableFrame) {
        let value = frame.to_value();
        if let Ok(bytes) = codec::encode_bytes(&value, &mut self.table) {
            let _ = self.frames.send(&bytes);
        }
    }

    fn send_reset(&mut self, n: u8) {
        self.encode_and_send(&ReliableFrame::Control {
            n,
            config: Some(self.our_config),
            error: None,
        });
        self.last_reset_send = Instant::now();
    }

    fn adopt_config(&mut self, peer: Option<ResetConfig>) {
        if let Some(peer) = peer {
            self.negotiated = ResetConfig {
                timeout_ms: self.our_config.timeout_ms.max(peer.timeout_ms),
                window: self.our_config.window.min(peer.window).max(4),
            };
            self.window = self.negotiated.window as u32;
            self.timeout = Duration::from_millis(self.negotiated.timeout_ms);
        }
    }

    fn mark_up(&mut self) {
        if self.state != ResetState::Up {
            self.send_next = 0;
            self.send_base = 0;
            self.recv_tail = 0;
            self.send_table.clear();
            self.recv_buf.clear();
            self.state = ResetState::Up;
        }
    }

    fn handle_control(&mut self, n: u8, config: Option<ResetConfig>, _error: Option<String>) {
        match n {
            0 => {
                self.state = ResetState::Resetting;
                self.send_reset(1);
            }
            1 => {
                self.adopt_config(config);
                self.encode_and_send(&ReliableFrame::Control {
                    n: 2,
                    config: Some(self.negotiated),
                    error: None,
                });
            }
            2 => {
                self.adopt_config(config);
                self.encode_and_send(&ReliableFrame::Control {
                    n: 3,
                    config: Some(self.negotiated),
                    error: None,
                });
                self.mark_up();
            }
            3 => {
                if self.state == ResetState::Resetting {
                    self.adopt_config(config);
                    self.mark_up();
                }
            }
            _ => {}
        }
    }

    fn handle_data_ack(
        &mut self,
        seq: Option<u8>,
        recv_tail_wire: u8,
        sacks: Vec<u8>,
        payload: Option<Value>,
    ) {
        if self.state != ResetState::Up {
            // Data traffic received while resetting is discarded (spec §4.3).
            return;
        }

        let peer_ack_tail = unwrap_seq(self.send_base, recv_tail_wire, self.window);
        self.send_table.retain(|&k, inflight| {
            let acked = k < peer_ack_tail;
            if acked {
                let _ = inflight.done.send(Ok(()));
            }
            !acked
        });
        if peer_ack_tail > self.send_base {
            self.send_base = peer_ack_tail;
        }
        for sack in sacks {
            let abs = unwrap_seq(self.send_base, sack, self.window);
            if let Some(inflight) = self.send_table.remove(&abs) {
                let _ = inflight.done.send(Ok(()));
            }
        }

        if let (Some(seq), Some(payload)) = (seq, payload) {
            let abs_seq = unwrap_seq(self.recv_tail, seq, self.window);
            if abs_seq >= self.recv_tail && abs_seq < self.recv_tail + self.window / 2 {
                self.recv_buf.entry(abs_seq).or_insert(payload);
            }
            // duplicates (abs_seq < recv_tail) and out-of-window seqs are
            // silently dropped, per spec.
            while let Some(next) = self.recv_buf.remove(&self.recv_tail) {
                match self.deliver.try_send(next) {
                    Ok(()) => self.recv_tail += 1,
                    Err(TrySendError::Full(value)) => {
                        // Upper layer isn't draining fast enough (spec §5,
                        // bounded receive queue). Put it back and stop; the
                        // peer keeps retransmitting anything past this
                        // point until there's room again.
                        self.recv_buf.insert(self.recv_tail, value);
                        break;
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            self.pend_ack = true;
        }
    }

    fn handle_frame_bytes(&mut self, bytes: Vec<u8>) {
        let value = match codec::decode_bytes(&bytes, &mut self.table) {
            Ok(v) => v,
            Err(_) => return,
        };
        let frame = match ReliableFrame::parse(&value) {
            Ok(f) => f,
            Err(_) => return,
        };
        match frame {
            ReliableFrame::Control { n, config, error } => self.handle_control(n, config, error),
            ReliableFrame::DataAck { seq, recv_tail, sacks, payload } => {
                self.handle_data_ack(seq, recv_tail, sacks, payload)
            }
        }
    }

    /// In-flight capacity is `W/2`, not `W` (spec §3 invariant, GLOSSARY
    /// "Window (W)"): wire sequence numbers are only `W` values wide, so
    /// letting more than half the modulus stay unacknowledged at once
    /// would make `unwrap_seq`'s nearest-representative resolution
    /// ambiguous between an old and a new in-flight message.
    fn pump_sends(&mut self) {
        if self.state != ResetState::Up {
            return;
        }
        while self.send_next.wrapping_sub(self.send_base) < self.window / 2 {
            let Some((payload, done)) = self.pending_send.pop_front() else { break };
            let seq = self.send_next;
            self.send_next += 1;
            let wire_seq = (seq % self.window) as u8;
            let sacks = self.out_of_order_wire();
            let recv_tail_wire = (self.recv_tail % self.window) as u8;
            self.encode_and_send(&ReliableFrame::DataAck {
                seq: Some(wire_seq),
                recv_tail: recv_tail_wire,
                sacks,
                payload: Some(payload.clone()),
            });
            self.send_table.insert(
                seq,
                InFlight { payload, deadline: Instant::now() + self.timeout, done },
            );
        }
    }

    fn out_of_order_wire(&self) -> Vec<u8> {
        self.recv_buf.keys().map(|k| (k % self.window) as u8).collect()
    }

    fn retransmit_expired(&mut self) {
        if self.state != ResetState::Up {
            return;
        }
        let now = Instant::now();
        let recv_tail_wire = (self.recv_tail % self.window) as u8;
        let sacks = self.out_of_order_wire();
        let mut expired: Vec<u32> = self
            .send_table
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        expired.sort_unstable();
        for seq in expired {
            let payload = self.send_table.get(&seq).map(|f| f.payload.clone());
            if let Some(payload) = payload {
                self.encode_and_send(&ReliableFrame::DataAck {
                    seq: Some((seq % self.window) as u8),
                    recv_tail: recv_tail_wire,
                    sacks: sacks.clone(),
                    payload: Some(payload),
                });
                if let Some(inflight) = self.send_table.get_mut(&seq) {
                    inflight.deadline = now + self.timeout;
                }
            }
        }
    }

    fn flush_pending_ack(&mut self) {
        if self.state != ResetState::Up {
            return;
        }
        let now = Instant::now();
        let quiet = now.duration_since(self.last_ack_sent) >= self.timeout;
        if self.pend_ack || quiet {
            let recv_tail_wire = (self.recv_tail % self.window) as u8;
            let sacks = self.out_of_order_wire();
            self.encode_and_send(&ReliableFrame::DataAck {
                seq: None,
                recv_tail: recv_tail_wire,
                sacks,
                payload: None,
            });
            self.pend_ack = false;
            self.last_ack_sent = now;
        }
    }

    fn maybe_resend_reset(&mut self) {
        if self.state == ResetState::Resetting
            && Instant::now().duration_since(self.last_reset_send) >= self.timeout
        {
            self.send_reset(1);
        }
    }

    fn teardown(&mut self) {
        for (_, inflight) in self.send_table.drain() {
            let _ = inflight.done.send(Err(Error::Closed));
        }
        for (_, done) in self.pending_send.drain(..) {
            let _ = done.send(Err(Error::Closed));
        }
        self.encode_and_send(&ReliableFrame::Control { n: 0, config: None, error: None });
    }

    fn next_wait(&self) -> Duration {
        let mut wait = self.timeout;
        if self.state == ResetState::Resetting {
            let elapsed = Instant::now().duration_since(self.last_reset_send);
            wait = wait.min(self.timeout.saturating_sub(elapsed).max(Duration::from_millis(1)));
        }
        if let Some(earliest) = self.send_table.values().map(|f| f.deadline).min() {
            let now = Instant::now();
            if earliest > now {
                wait = wait.min(earliest - now);
            } else {
                wait = Duration::from_millis(1);
            }
        }
        wait.min(Duration::from_millis(200))
    }

    fn run(mut self, rx: Receiver<Event>, token: crate::task_group::CancellationToken) {
        self.send_reset(1);
        loop {
            if token.is_cancelled() {
                break;
            }
            match rx.recv_timeout(self.next_wait()) {
                Ok(Event::Incoming(bytes)) => self.handle_frame_bytes(bytes),
                Ok(Event::Outgoing(payload, done)) => self.pending_send.push_back((payload, done)),
                Ok(Event::Unproxy(name)) => self.table.unproxy(&name),
                Ok(Event::TransportClosed) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.maybe_resend_reset();
            self.pump_sends();
            self.retransmit_expired();
            self.flush_pending_ack();
        }
        self.teardown();
    }
}

/// The reliable layer for one connection. Carries opaque `Value`
/// payloads produced and consumed by the request layer above; never
/// inspects their contents.
pub struct ReliableLayer {
    send_tx: Sender<Event>,
    deliver_rx: Mutex<Receiver<Value>>,
    _group: TaskGroup,
}

impl ReliableLayer {
    pub fn new(
        frames: Arc<FrameStream>,
        table: ProxyTable,
        window: u8,
        timeout_ms: u64,
        recv_queue_len: usize,
    ) -> Self {
        let (event_tx, event_rx) = std::sync::mpsc::channel();
        let (deliver_tx, deliver_rx) = std::sync::mpsc::sync_channel(recv_queue_len.max(1));

        let mut group = TaskGroup::new("reliable");
        let token = group.token();

        let bridge_frames = frames.clone();
        let bridge_tx = event_tx.clone();
        let bridge_token = token.clone();
        group.spawn("reliable-bridge", move || {
            while !bridge_token.is_cancelled() {
                match bridge_frames.recv_timeout(Duration::from_millis(200)) {
                    Ok(bytes) => {
                        if bridge_tx.send(Event::Incoming(bytes)).is_err() {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        let _ = bridge_tx.send(Event::TransportClosed);
                        break;
                    }
                }
            }
        });

        let window_u32 = window.max(4) as u32;
        let worker = Worker {
            frames,
            table,
            window: window_u32,
            timeout: Duration::from_millis(timeout_ms),
            our_config: ResetConfig { timeout_ms, window },
            negotiated: ResetConfig { timeout_ms, window },
            state: ResetState::Resetting,
            last_reset_send: Instant::now(),
            send_next: 0,
            send_base: 0,
            send_table: HashMap::new(),
            pending_send: std::collections::VecDeque::new(),
            recv_tail: 0,
            recv_buf: HashMap::new(),
            pend_ack: false,
            last_ack_sent: Instant::now(),
            deliver: deliver_tx,
        };
        let worker_token = token.clone();
        group.spawn("reliable-worker", move || worker.run(event_rx, worker_token));

        ReliableLayer { send_tx: event_tx, deliver_rx: Mutex::new(deliver_rx), _group: group }
    }

    /// Enqueues `payload` for reliable delivery; blocks until it is
    /// acknowledged by the peer or the connection is torn down.
    pub fn send(&self, payload: Value) -> Result<(), Error> {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        self.send_tx
            .send(Event::Outgoing(payload, done_tx))
            .map_err(|_| Error::Closed)?;
        done_rx.recv().map_err(|_| Error::Closed)?
    }

    /// Blocks until the next in-order payload is delivered.
    pub fn recv(&self) -> Result<Value, Error> {
        self.deliver_rx.lock().unwrap().recv().map_err(|_| Error::Closed)
    }

    /// Blocks up to `timeout` for the next in-order payload. `Ok(None)`
    /// means the wait elapsed with nothing delivered.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Value>, Error> {
        match self.deliver_rx.lock().unwrap().recv_timeout(timeout) {
            Ok(v) => Ok(Some(v)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Closed),
        }
    }

    /// Drops a proxy table entry (spec §6 `sys.unproxy`).
    pub fn unproxy(&self, name: &str) -> Result<(), Error> {
        self.send_tx.send(Event::Unproxy(name.to_string())).map_err(|_| Error::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn between_wraps_correctly() {
        assert!(between(0, 1, 3, 8));
        assert!(!between(0, 5, 3, 8));
        assert!(between(6, 7, 1, 8)); // wraps past the modulus
    }

    #[test]
    fn unwrap_seq_picks_nearest_representative() {
        assert_eq!(unwrap_seq(10, 2, 8), 10);
        // wire=0 is one step ahead of near=9 (mod 8), not 7 steps behind.
        assert_eq!(unwrap_seq(9, 0, 8), 8);
    }

    /// Spec §3/§8 "window safety": in-flight capacity is `W/2`, never `W`,
    /// since wire sequence numbers only have `W` distinct values. A
    /// worker with a full pending-send queue and no acks from the peer
    /// must never let `send_table` grow past `window / 2`.
    #[test]
    fn pump_sends_never_exceeds_half_window() {
        let ((_a_read, a_write), (b_read, _b_write)) =
            crate::transport::loopback::pair(crate::transport::loopback::AdversaryConfig::perfect());
        let framer: Arc<dyn crate::frame::Framer> =
            Arc::new(crate::frame::prefix::PrefixFramer::default());
        let frames = Arc::new(FrameStream::new(b_read, a_write, framer, Box::new(|_| {})));
        let (deliver_tx, _deliver_rx) = std::sync::mpsc::sync_channel(8);

        let window = 8u32;
        let mut worker = Worker {
            frames,
            table: ProxyTable::new(),
            window,
            timeout: Duration::from_secs(10),
            our_config: ResetConfig { timeout_ms: 10_000, window: window as u8 },
            negotiated: ResetConfig { timeout_ms: 10_000, window: window as u8 },
            state: ResetState::Up,
            last_reset_send: Instant::now(),
            send_next: 0,
            send_base: 0,
            send_table: HashMap::new(),
            pending_send: std::collections::VecDeque::new(),
            recv_tail: 0,
            recv_buf: HashMap::new(),
            pend_ack: false,
            last_ack_sent: Instant::now(),
            deliver: deliver_tx,
        };

        let total = window as i64 * 2;
        for i in 0..total {
            let (done_tx, _done_rx) = std::sync::mpsc::channel();
            worker.pending_send.push_back((Value::Int(i), done_tx));
        }
        worker.pump_sends();
        assert_eq!(worker.send_table.len(), (window / 2) as usize);
        assert_eq!(worker.pending_send.len(), total as usize - (window / 2) as usize);
    }
}
