//! Prefix-framed stream: one sentinel byte before each codec-encoded
//! value (spec §4.1a). Used for reliable byte transports (TCP,
//! USB-CDC) that may multiplex a text console outside message
//! boundaries.

use super::{Error, Framer, ReadTransport, READ_POLL};
use crate::task_group::CancellationToken;

/// Default sentinel byte: an illegal MessagePack lead byte (`0xC1` is
/// reserved/never used by the format), so it can never be confused with
/// the start of a console line (spec §4.1).
pub const DEFAULT_SENTINEL: u8 = 0xC1;

pub struct PrefixFramer {
    sentinel: u8,
}

impl PrefixFramer {
    pub fn new(sentinel: u8) -> Self {
        PrefixFramer { sentinel }
    }
}

impl Default for PrefixFramer {
    fn default() -> Self {
        PrefixFramer::new(DEFAULT_SENTINEL)
    }
}

/// Adapts a `&mut dyn ReadTransport` into `std::io::Read`, capturing
/// every byte it hands out. Since MessagePack values are self-delimiting,
/// letting `rmpv` consume exactly the bytes of one value and keeping a
/// copy of what it read is how this framer recovers the message boundary
/// without re-implementing the wire format itself.
///
/// `transport` is non-blocking, so an idle read (`Ok(0)`) is not EOF here:
/// it polls with `token` until either bytes arrive, cancellation is
/// requested, or the transport reports a real close.
struct CapturingReader<'a> {
    transport: &'a mut dyn ReadTransport,
    token: &'a CancellationToken,
    captured: Vec<u8>,
}

impl<'a> std::io::Read for CapturingReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let n = self
                .transport
                .read(buf)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            if n > 0 {
                self.captured.extend_from_slice(&buf[..n]);
                return Ok(n);
            }
            if self.token.is_cancelled() {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            self.token.wait_timeout(READ_POLL);
        }
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

impl Framer for PrefixFramer {
    fn encode_frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(self.sentinel);
        out.extend_from_slice(payload);
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
            if byte != self.sentinel {
                console(byte);
                continue;
            }
            let mut reader = CapturingReader { transport, token, captured: Vec::new() };
            match rmpv::decode::read_value(&mut reader) {
                Ok(_) => return Ok(reader.captured),
                Err(_) => {
                    // Spurious/corrupt data inside what looked like a
                    // message: swallowed per spec §7, resume hunting.
                    crate::logging::log("satlink::frame::prefix: dropped malformed frame");
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::transport::{self, ReadTransport as _, WriteTransport as _};

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
    fn recovers_frame_and_console_bytes() {
        let framer = PrefixFramer::default();
        let payload = rmpv::Value::String("hi".into());
        let mut encoded = Vec::new();
        rmpv::encode::write_value(&mut encoded, &payload).unwrap();
        let mut stream_bytes = vec![b'x', b'y'];
        stream_bytes.extend(framer.encode_frame(&encoded));
        stream_bytes.push(b'z');

        let mut transport = SliceTransport { data: stream_bytes.into_iter().collect() };
        let mut console_bytes = Vec::new();
        let mut console = |b: u8| console_bytes.push(b);
        let token = CancellationToken::new();
        let frame = framer.read_frame(&mut transport, &mut console, &token).unwrap();
        assert_eq!(frame, encoded);
        assert_eq!(console_bytes, vec![b'x', b'y']);
    }
}
