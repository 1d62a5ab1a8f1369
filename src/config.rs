//! Supervisor configuration.
//!
//! Plain `serde`-derived structs with `Default` impls, the way the teacher
//! configures its proxy (no external config-file crate, YAML loading is
//! explicitly out of scope, spec §1).

use serde::{Deserialize, Serialize};

/// Which frame-layer implementation to use under the codec (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Framing {
    /// Prefix-framed stream: one sentinel byte before each codec-encoded
    /// value. For reliable byte transports that may multiplex a console
    /// (TCP, USB-CDC).
    Prefix { sentinel: u8 },
    /// Packet-framed stream: start byte, 16-bit length, payload, 16-bit
    /// CRC. For lossy links (UART).
    Packet { start: u8 },
}

impl Default for Framing {
    fn default() -> Self {
        Framing::Prefix { sentinel: 0xC1 }
    }
}

/// Full configuration for one connection's stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Whether the link can lose or reorder frames. When `true`, the
    /// reliable layer (§4.3) is inserted between the codec and request
    /// layers; when `false`, the request layer sits directly on the
    /// codec.
    pub lossy: bool,
    /// Whether this side requires the reliable layer's reset handshake to
    /// complete before user traffic is accepted, even on a link that
    /// isn't `lossy` (a "guarded" loss-free link that still wants
    /// explicit connect/disconnect detection).
    pub guarded: bool,
    /// Frame layer selection.
    pub framing: Framing,
    /// Reliable-layer window size `W`, must be `>= 4`.
    pub window: u8,
    /// Reliable-layer per-message retry timeout, in milliseconds.
    pub timeout_ms: u64,
    /// Bound on the receive queue delivered to the upper layer
    /// (spec §5, backpressure). Defaults to `window`.
    pub recv_queue_len: Option<usize>,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            lossy: false,
            guarded: false,
            framing: Framing::default(),
            window: 8,
            timeout_ms: 1000,
            recv_queue_len: None,
        }
    }
}

impl StackConfig {
    /// The effective bound on the upper layer's receive queue.
    pub fn recv_queue_len(&self) -> usize {
        self.recv_queue_len.unwrap_or(self.window as usize)
    }
}
