//! Stdio byte transport (spec §6: console-prefix mode on
//! microcontrollers, and the usual way a host-side CLI talks to a
//! subprocess).
//!
//! Grounded on the teacher's `transit/stdio.rs`, but reading/writing raw
//! bytes rather than newline-delimited JSON: framing is this crate's
//! job, not the transport's.

use super::{Error, ReadTransport, WriteTransport};
use std::io::{Read, Write};

#[derive(Debug)]
pub struct Stdin(std::io::Stdin);

impl Stdin {
    pub fn new() -> Self {
        Stdin(std::io::stdin())
    }
}

impl Default for Stdin {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadTransport for Stdin {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        Ok(self.0.lock().read(buf)?)
    }
}

#[derive(Debug)]
pub struct Stdout(std::io::Stdout);

impl Stdout {
    pub fn new() -> Self {
        Stdout(std::io::stdout())
    }
}

impl Default for Stdout {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteTransport for Stdout {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.0.lock().write_all(data)?;
        Ok(())
    }
    fn flush(&mut self) -> Result<(), Error> {
        self.0.lock().flush()?;
        Ok(())
    }
}

pub fn split() -> (Box<dyn ReadTransport>, Box<dyn WriteTransport>) {
    (Box::new(Stdin::new()), Box::new(Stdout::new()))
}
