//! Error types for the tunnel server.
//!
//! Per-session and per-connection failures are logged and simply end that
//! task (spec §7: a transient I/O error never propagates to siblings) --
//! `control.rs` and `http.rs` report those failures to the peer directly
//! (REJECT, an HTTP status line) rather than bubbling a typed error up to a
//! caller that has nothing to do with it. `ServerError` only covers the one
//! case that does have a caller: startup, when a listener fails to bind.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
