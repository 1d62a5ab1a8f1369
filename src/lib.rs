//! Transport and dispatch core for host <-> satellite remote procedure
//! calls over lossy byte links.
//!
//! Layers, bottom to top: byte [`transport`], [`frame`], [`codec`], the
//! optional [`reliable`] sliding-window ARQ, [`request`]/response
//! correlation, and the [`dispatch`] tree. [`stack`] assembles one
//! connection's full pipeline from a [`config::StackConfig`].

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod logging;
pub mod message;
pub mod reliable;
pub mod request;
pub mod stack;
pub mod task_group;
pub mod transport;

pub use error::Error;
pub use stack::Stack;
