//! Unix domain socket byte transport (spec §6: path from config or
//! `$XDG_RUNTIME_DIR`).

#![cfg(unix)]

use super::{ReadTransport, WriteTransport};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Resolves the default socket path: `$XDG_RUNTIME_DIR/satlink.sock`,
/// falling back to `/tmp/satlink.sock` when the variable is unset (spec
/// §6).
pub fn default_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => Path::new(&dir).join("satlink.sock"),
        None => PathBuf::from("/tmp/satlink.sock"),
    }
}

pub fn split(stream: UnixStream) -> std::io::Result<(Box<dyn ReadTransport>, Box<dyn WriteTransport>)> {
    let write_half = stream.try_clone()?;
    Ok((Box::new(stream), Box::new(write_half)))
}

#[derive(Debug)]
pub struct Listener {
    inner: std::os::unix::net::UnixListener,
}

impl Listener {
    pub fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let _ = std::fs::remove_file(path);
        Ok(Listener { inner: std::os::unix::net::UnixListener::bind(path)? })
    }

    pub fn accept(&self) -> std::io::Result<UnixStream> {
        Ok(self.inner.accept()?.0)
    }
}
