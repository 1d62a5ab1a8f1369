//! Byte transport traits.
//!
//! Generalised from the teacher crate's `WriteTransport`/`ReadTransport`
//! traits (`bidirectional_proxy.rs`), which abstracted TCP and WebSocket
//! byte streams behind a small thread-safe interface. Here the same shape
//! abstracts over UART, TCP, Unix sockets, and stdio (spec §6). The byte
//! transport itself stays external to the core per spec §1/§2; these
//! traits are the seam the frame layer is built against.

use std::fmt::Debug;

/// Errors a byte transport can report.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A transport half that accepts bytes.
///
/// Implementations must ensure that either all of `data` is written or an
/// error is returned. Partial writes are a transport bug, not something
/// callers above this trait are expected to handle.
pub trait WriteTransport: Send + 'static + Debug {
    fn write(&mut self, data: &[u8]) -> Result<(), Error>;
    fn flush(&mut self) -> Result<(), Error>;
}

/// A transport half that produces bytes.
///
/// Mirrors the teacher's `ReadTransport::read_nonblock` (`bidirectional_proxy.rs`):
/// `read` must not block waiting for data. No data available right now
/// returns `Ok(0)`, same as `WouldBlock`, so a reader loop above this trait
/// can poll it and still observe cancellation between calls (spec §5). Use
/// `Err` only for an actual transport failure or a confirmed disconnect.
pub trait ReadTransport: Send + 'static + Debug {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
}

impl WriteTransport for std::net::TcpStream {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        std::io::Write::write_all(self, data)?;
        Ok(())
    }
    fn flush(&mut self) -> Result<(), Error> {
        std::io::Write::flush(self)?;
        Ok(())
    }
}

impl ReadTransport for std::net::TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.set_nonblocking(true)?;
        match std::io::Read::read(self, buf) {
            Ok(size) => Ok(size),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
impl WriteTransport for std::os::unix::net::UnixStream {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        std::io::Write::write_all(self, data)?;
        Ok(())
    }
    fn flush(&mut self) -> Result<(), Error> {
        std::io::Write::flush(self)?;
        Ok(())
    }
}

#[cfg(unix)]
impl ReadTransport for std::os::unix::net::UnixStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.set_nonblocking(true)?;
        match std::io::Read::read(self, buf) {
            Ok(size) => Ok(size),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
