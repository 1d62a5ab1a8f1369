//! In-process loopback transport pair, for tests (SPEC_FULL §8 ambient
//! tool). Two endpoints exchange whole frames over channels; an
//! `AdversaryConfig` can drop or reorder frames to exercise the reliable
//! layer's retransmission and in-order delivery guarantees (spec §8,
//! scenario 5: "lossy channel").

use super::{Error, ReadTransport, WriteTransport};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

/// How long one `recv` blocks before reporting idle. Matches the poll
/// cadence the frame reader loop already uses elsewhere in this crate.
const POLL: Duration = Duration::from_millis(20);

/// Deterministic, seedable loss/reorder behavior for one direction of a
/// loopback pair. Not cryptographic, just enough variation to exercise
/// the reliable layer without pulling in a `rand`-family dependency the
/// rest of this crate has no other use for.
#[derive(Clone)]
pub struct AdversaryConfig {
    /// 0..=100, percent chance a frame is dropped outright.
    pub loss_percent: u8,
    /// When true, every other surviving frame is held back one step and
    /// swapped with its successor, a simple, deterministic reordering.
    pub reorder: bool,
    state: Arc<AtomicU64>,
}

impl AdversaryConfig {
    pub fn new(seed: u64, loss_percent: u8, reorder: bool) -> Self {
        AdversaryConfig { loss_percent, reorder, state: Arc::new(AtomicU64::new(seed | 1)) }
    }

    pub fn perfect() -> Self {
        AdversaryConfig::new(1, 0, false)
    }

    fn next_u32(&self) -> u32 {
        // xorshift64*
        let mut x = self.state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state.store(x, Ordering::Relaxed);
        (x >> 32) as u32
    }

    fn should_drop(&self) -> bool {
        self.loss_percent > 0 && (self.next_u32() % 100) < self.loss_percent as u32
    }
}

struct WriteHalf {
    tx: Sender<Vec<u8>>,
    adversary: AdversaryConfig,
    held: Option<Vec<u8>>,
}

impl std::fmt::Debug for WriteHalf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("loopback::WriteHalf").finish()
    }
}

impl WriteTransport for WriteHalf {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.adversary.should_drop() {
            return Ok(());
        }
        if self.adversary.reorder {
            if let Some(prev) = self.held.take() {
                let _ = self.tx.send(data.to_vec());
                let _ = self.tx.send(prev);
                return Ok(());
            } else {
                self.held = Some(data.to_vec());
                return Ok(());
            }
        }
        let _ = self.tx.send(data.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        if let Some(held) = self.held.take() {
            let _ = self.tx.send(held);
        }
        Ok(())
    }
}

struct ReadHalf {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl std::fmt::Debug for ReadHalf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("loopback::ReadHalf").finish()
    }
}

impl ReadTransport for ReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(POLL) {
                Ok(frame) => self.pending.extend(frame),
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Closed),
            }
        }
        let mut n = 0;
        while n < buf.len() {
            match self.pending.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

/// Builds a connected pair of `(read, write)` halves, `a` and `b`, such
/// that bytes written to `a`'s write half arrive at `b`'s read half and
/// vice versa, each direction independently subject to `adversary`.
pub fn pair(
    adversary: AdversaryConfig,
) -> (
    (Box<dyn ReadTransport>, Box<dyn WriteTransport>),
    (Box<dyn ReadTransport>, Box<dyn WriteTransport>),
) {
    let (tx_ab, rx_ab) = std::sync::mpsc::channel();
    let (tx_ba, rx_ba) = std::sync::mpsc::channel();

    let a_read: Box<dyn ReadTransport> = Box::new(ReadHalf { rx: rx_ba, pending: VecDeque::new() });
    let a_write: Box<dyn WriteTransport> =
        Box::new(WriteHalf { tx: tx_ab, adversary: adversary.clone(), held: None });

    let b_read: Box<dyn ReadTransport> = Box::new(ReadHalf { rx: rx_ab, pending: VecDeque::new() });
    let b_write: Box<dyn WriteTransport> = Box::new(WriteHalf { tx: tx_ba, adversary, held: None });

    ((a_read, a_write), (b_read, b_write))
}
