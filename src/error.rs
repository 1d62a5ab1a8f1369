//! Crate-wide error type.
//!
//! Each layer defines its own small `thiserror` enum (see `codec::Error`,
//! `reliable::Error`, `request::Error`, `dispatch::Error`) the way the
//! teacher crate keeps `jrpc::Error` and `transit_proxy::Error` separate;
//! this module composes them into one `Error` for callers that cross layer
//! boundaries, plus the handful of variants surfaced directly at the
//! request boundary in spec §7.

/// Errors surfaced to callers of the transport/dispatch core.
///
/// Variants line up with the error kinds in spec §7: recoverable conditions
/// (bad frames, spurious data, duplicate replies) never reach this type;
/// they are absorbed and counted where they occur. Only the kinds listed
/// there as externally visible appear here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying stack was torn down while a request was in flight.
    #[error("channel closed")]
    ChannelClosed,
    /// The peer (or a local handler) returned an error for this request.
    #[error("remote error: {0}")]
    Remote(String),
    /// Same as `Remote`, but the caller should not log it (spec §4.4).
    #[error("silent remote error: {0}")]
    SilentRemote(String),
    /// Dispatch could not find a handler for the action path.
    #[error("no such command: {0}")]
    NoSuchCommand(String),
    /// A codec-level failure (malformed value, unknown proxy class, ...).
    #[error(transparent)]
    Codec(#[from] crate::codec::Error),
    /// A reliable-layer failure. In practice this only ever wraps
    /// `ChannelClosed`; everything else is absorbed internally per §4.3.
    #[error(transparent)]
    Reliable(#[from] crate::reliable::Error),
    /// A dispatch-tree routing failure.
    #[error(transparent)]
    Dispatch(#[from] crate::dispatch::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
