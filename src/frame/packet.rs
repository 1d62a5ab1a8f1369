//! Packet-framed stream: start byte, 16-bit length, payload, 16-bit CRC
//! (spec §4.1b, the "SerialPacker" framing). Used for lossy links such
//! as UART, where the reliable layer above retransmits anything this
//! layer silently drops.

use super::{Error, Framer, ReadTransport, READ_POLL};
use crate::task_group::CancellationToken;
use crc::{Crc, CRC_16_IBM_3740};

/// CRC-CCITT (poly 0x1021, init 0xFFFF, no reflection; the "CCITT-FALSE"
/// parameterisation), computed over `len || payload` (spec §4.1b, §6).
static CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

pub const DEFAULT_START: u8 = 0x85;

pub struct PacketFramer {
    start: u8,
}

impl PacketFramer {
    pub fn new(start: u8) -> Self {
        PacketFramer { start }
    }
}

impl Default for PacketFramer {
    fn default() -> Self {
        PacketFramer::new(DEFAULT_START)
    }
}

/// Reads one byte, polling `transport` until data arrives, cancellation is
/// requested, or the transport reports a real close (spec §5).
fn read_byte(transport: &mut dyn ReadTransport, token: &CancellationToken) -> Result<u8, Error> {
    let mut byte = [0u8; 1];
    loop {
        let n = transport.read(&mut byte)?;
        if n > 0 {
            return Ok(byte[0]);
        }
        if token.is_cancelled() {
            return Err(Error::Closed);
        }
        token.wait_timeout(READ_POLL);
    }
}

fn read_exact(
    transport: &mut dyn ReadTransport,
    buf: &mut [u8],
    token: &CancellationToken,
) -> Result<(), Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = transport.read(&mut buf[filled..])?;
        if n == 0 {
            if token.is_cancelled() {
                return Err(Error::Closed);
            }
            token.wait_timeout(READ_POLL);
            continue;
        }
        filled += n;
    }
    Ok(())
}

impl Framer for PacketFramer {
    fn encode_frame(&self, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u16;
        let len_bytes = len.to_be_bytes();
        let mut digest = CRC.digest();
        digest.update(&len_bytes);
        digest.update(payload);
        let crc = digest.finalize();

        let mut out = Vec::with_capacity(payload.len() + 5);
        out.push(self.start);
        out.extend_from_slice(&len_bytes);
        out.extend_from_slice(payload);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    fn read_frame(
        &self,
        transport: &mut dyn ReadTransport,
        console: &mut dyn FnMut(u8),
        token: &CancellationToken,
    ) -> Result<Vec<u8>, Error> {
        loop {
            let byte = read_byte(transport, token)?;
            if byte != self.start {
                console(byte);
                continue;
            }

            let mut len_bytes = [0u8; 2];
            read_exact(transport, &mut len_bytes, token)?;
            let len = u16::from_be_bytes(len_bytes) as usize;

            let mut payload = vec![0u8; len];
            read_exact(transport, &mut payload, token)?;

            let mut crc_bytes = [0u8; 2];
            read_exact(transport, &mut crc_bytes, token)?;
            let received_crc = u16::from_be_bytes(crc_bytes);

            let mut digest = CRC.digest();
            digest.update(&len_bytes);
            digest.update(&payload);
            if digest.finalize() != received_crc {
                // Corrupt frame: dropped silently, reliable layer above
                // retransmits (spec §4.1b, §7).
                crate::logging::log("satlink::frame::packet: dropped frame with bad CRC");
                continue;
            }
            return Ok(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::transport;

    #[derive(Debug)]
    struct SliceTransport {
        data: std::collections::VecDeque<u8>,
    }
    impl ReadTransport for SliceTransport {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, transport::Error> {
            if self.data.is_empty() {
                return Err(transport::Error::Closed);
            }
            let mut n = 0;
            while n < buf.len() {
                if let Some(b) = self.data.pop_front() {
                    buf[n] = b;
                    n += 1;
                } else {
                    break;
                }
            }
            Ok(n)
        }
    }

    #[test]
    fn round_trips_and_drops_corrupt_frames() {
        let framer = PacketFramer::default();
        let good = framer.encode_frame(b"hello");
        let mut corrupt = framer.encode_frame(b"world");
        // flip a payload byte to break the CRC
        let flip_at = 3 + 1;
        corrupt[flip_at] ^= 0xFF;

        let mut stream = Vec::new();
        stream.extend_from_slice(&corrupt);
        stream.extend_from_slice(&good);

        let mut transport = SliceTransport { data: stream.into_iter().collect() };
        let mut console = |_b: u8| panic!("no console bytes expected");
        let token = CancellationToken::new();
        let frame = framer.read_frame(&mut transport, &mut console, &token).unwrap();
        assert_eq!(frame, b"hello");
    }
}
