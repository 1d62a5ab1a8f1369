//! Stream framing: recovering message boundaries inside a byte stream
//! that may also carry a debug console (spec §4.1).
//!
//! Two interchangeable `Framer` implementations are provided: `prefix`
//! (for reliable transports that multiplex a text console) and `packet`
//! (for lossy links, the "SerialPacker" framing the original system
//! uses). Both are driven by the same `FrameStream`, which owns the
//! background reader thread and the write-side lock, generalising the
//! single-holder write lock and dedicated reader thread the teacher uses
//! in `bidirectional_proxy.rs`.

pub mod packet;
pub mod prefix;
pub mod transport;

pub use transport::{ReadTransport, WriteTransport};

use crate::task_group::{CancellationToken, TaskGroup};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long a `read_frame` poll waits between idle reads before rechecking
/// cancellation. Same shape as every other background loop's poll tick in
/// this crate (`CancellationToken::wait_timeout`).
pub(crate) const READ_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error("frame layer closed")]
    Closed,
}

/// A console byte sink: every byte read outside a message is delivered
/// here, in order (spec §4.1, testable in §8 under frame transparency).
pub type ConsoleSink = Box<dyn FnMut(u8) + Send>;

/// A frame-layer implementation. Both halves are stateless across calls
/// (a `read_frame` call polls until it has assembled exactly one complete
/// frame, or decides the stream is unrecoverable); the shared state that
/// matters, the write lock and the reader thread, lives in `FrameStream`,
/// not here.
pub trait Framer: Send + Sync + 'static {
    /// Wraps `payload` (one codec-encoded bytestring) in this framer's
    /// on-wire envelope.
    fn encode_frame(&self, payload: &[u8]) -> Vec<u8>;

    /// Reads from `transport` until exactly one frame's payload has been
    /// assembled, delivering any byte that is not part of a frame to
    /// `console` in order. Corrupt frames (bad CRC, truncated prefix
    /// value) are retried internally, they are never surfaced to the
    /// caller, per spec §7 ("spurious data / bad frame ... swallowed and
    /// counted").
    ///
    /// `transport` is non-blocking (spec §5): an idle read returns `Ok(0)`
    /// rather than suspending, so implementations must poll it and check
    /// `token` for cancellation between attempts instead of assuming
    /// forward progress on every call.
    fn read_frame(
        &self,
        transport: &mut dyn ReadTransport,
        console: &mut dyn FnMut(u8),
        token: &CancellationToken,
    ) -> Result<Vec<u8>, Error>;
}

/// Owns one connection's byte transport split into a framed message
/// channel plus a console byte sink.
pub struct FrameStream {
    write: Mutex<Box<dyn WriteTransport>>,
    framer: Arc<dyn Framer>,
    // Held behind a `Mutex` (rather than bare `Receiver`) so `FrameStream`
    // is `Sync` and can be shared via `Arc` across the reliable layer's
    // reader and worker tasks.
    frame_rx: Mutex<Receiver<Vec<u8>>>,
    _group: TaskGroup,
}

impl FrameStream {
    pub fn new(
        mut read: Box<dyn ReadTransport>,
        write: Box<dyn WriteTransport>,
        framer: Arc<dyn Framer>,
        mut console: ConsoleSink,
    ) -> Self {
        let (tx, rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = std::sync::mpsc::channel();
        let mut group = TaskGroup::new("frame");
        let reader_framer = framer.clone();
        let token = group.token();
        group.spawn("reader", move || {
            while !token.is_cancelled() {
                match reader_framer.read_frame(read.as_mut(), &mut *console, &token) {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        FrameStream { write: Mutex::new(write), framer, frame_rx: Mutex::new(rx), _group: group }
    }

    /// Sends one message. Serialised by a single-holder lock so the
    /// envelope and payload are never interleaved with another `send`
    /// (spec §4.1, §5).
    pub fn send(&self, payload: &[u8]) -> Result<(), Error> {
        let mut guard = self.write.lock().unwrap();
        let framed = self.framer.encode_frame(payload);
        guard.write(&framed)?;
        guard.flush()?;
        Ok(())
    }

    /// Blocks until the next frame arrives.
    pub fn recv(&self) -> Result<Vec<u8>, Error> {
        self.frame_rx.lock().unwrap().recv().map_err(|_| Error::Closed)
    }

    /// Blocks until the next frame arrives or `timeout` elapses. Used by
    /// the reliable layer to share one suspension point between incoming
    /// frames and its retry timer (spec §5).
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Vec<u8>, RecvTimeoutError> {
        self.frame_rx.lock().unwrap().recv_timeout(timeout)
    }
}
