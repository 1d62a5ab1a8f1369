//! Concrete byte transports (spec §6): UART, TCP, Unix domain socket,
//! stdio, plus an in-process loopback used by the test suite. Each one
//! only has to implement `frame::ReadTransport`/`frame::WriteTransport`;
//! the frame layer above does not know or care which of these it is
//! driving.

pub mod loopback;
pub mod stdio;
pub mod tcp;
pub mod unix;
#[cfg(feature = "uart")]
pub mod uart;

pub use crate::frame::transport::{Error, ReadTransport, WriteTransport};
