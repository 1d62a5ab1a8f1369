//! Diagnostic logging for recoverable, otherwise-invisible events.
//!
//! Per spec §7, recoverable conditions (a dropped frame, a retransmit, a
//! discarded duplicate) leave no externally visible trace beyond counters
//! and logs. This module is the plain stderr sink used for that; with
//! `feature = "logwise"` enabled, the request layer additionally reaches
//! for `logwise`'s structured spans when logging a server-side exception
//! with its stack trace (spec §4.4).

/// Logs a diagnostic line to stderr.
///
/// Not for use on hot paths carrying application data, only for the
/// occasional recoverable-event notice (frame drop, reset restart, stale
/// retransmit) that spec §7 says must not otherwise surface.
pub fn log(msg: &str) {
    eprintln!("{msg}");
}

/// Logs a server-side handler error before it is sent back to the caller.
///
/// All exceptions except "silent remote error" are logged this way (spec
/// §4.4). With `feature = "logwise"` this captures a structured record;
/// otherwise it falls back to the plain stderr sink above.
pub fn log_handler_error(action: &str, err: &dyn std::fmt::Display) {
    #[cfg(feature = "logwise")]
    {
        logwise::error_sync!("handler error in {action}: {err}", action = action, err = logwise::privacy::LogIt(err.to_string()));
    }
    #[cfg(not(feature = "logwise"))]
    {
        log(&format!("handler error in {action}: {err}"));
    }
}
