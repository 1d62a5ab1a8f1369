//! TCP byte transport (spec §6: default host `0.0.0.0`, port from
//! config; client port 27587 for control).

use super::{ReadTransport, WriteTransport};
use std::net::TcpStream;

/// The well-known client control port (spec §6).
pub const CONTROL_PORT: u16 = 27587;

/// Splits a connected `TcpStream` into independent read/write halves via
/// `try_clone`, the same way the teacher's `internal_proxy.rs` keeps a
/// `TcpStream` as both its `ReadStream` and `WriteStream` type.
pub fn split(stream: TcpStream) -> std::io::Result<(Box<dyn ReadTransport>, Box<dyn WriteTransport>)> {
    let write_half = stream.try_clone()?;
    Ok((Box::new(stream), Box::new(write_half)))
}

#[derive(Debug)]
pub struct Listener {
    inner: std::net::TcpListener,
}

impl Listener {
    pub fn bind<A: std::net::ToSocketAddrs>(addr: A) -> std::io::Result<Self> {
        Ok(Listener { inner: std::net::TcpListener::bind(addr)? })
    }

    pub fn accept(&self) -> std::io::Result<(TcpStream, std::net::SocketAddr)> {
        self.inner.accept()
    }
}
