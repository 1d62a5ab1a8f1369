//! UART byte transport (spec §6: vendor-specific baud rate).
//!
//! The satellite's serial port is necessarily vendor/board-specific, so
//! this crate does not pull in a particular serial port crate. Instead
//! it accepts anything implementing `std::io::Read`/`std::io::Write`
//! (which every serial port crate's handle already does, the same way
//! `std::net::TcpStream` does), and adapts it to
//! `ReadTransport`/`WriteTransport`. An embedder wires in their own
//! opened, already-configured port.

use super::{Error, ReadTransport, WriteTransport};
use std::fmt::Debug;
use std::io::{Read, Write};

/// Wraps any `Read + Write + Send` serial port handle as a UART
/// transport. Splitting into independent read/write halves is left to
/// the caller (most serial port crates offer `try_clone`, mirroring
/// `std::net::TcpStream`).
pub struct Uart<T> {
    inner: T,
}

impl<T> Uart<T> {
    pub fn new(inner: T) -> Self {
        Uart { inner }
    }
}

impl<T: Debug> Debug for Uart<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uart").field("inner", &self.inner).finish()
    }
}

impl<T: Read + Send + Debug + 'static> ReadTransport for Uart<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        Ok(self.inner.read(buf)?)
    }
}

impl<T: Write + Send + Debug + 'static> WriteTransport for Uart<T> {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.inner.write_all(data)?;
        Ok(())
    }
    fn flush(&mut self) -> Result<(), Error> {
        self.inner.flush()?;
        Ok(())
    }
}
