//! Server error types.
//!
//! Protocol failures inside a request never surface here: they become error
//! headers sent to the requester. [`ServerError`] covers what stops the
//! server itself.

use msl_core::MslError;
use thiserror::Error;

/// Errors that can occur in the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error (unreadable file, inconsistent policy, bad keys).
    ///
    /// Fatal at startup. Fix configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport/network error (bind failure, connection reset, oversized
    /// frame).
    ///
    /// Fatal for that connection; the server keeps serving others.
    #[error("transport error: {0}")]
    Transport(String),

    /// Protocol error the server could not even report to the peer.
    ///
    /// Raised when encoding an error header fails.
    #[error("protocol error: {0}")]
    Protocol(#[from] MslError),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
