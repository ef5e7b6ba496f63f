//! Transport seam between the client and the network.
//!
//! The client hands the transport one encoded request and expects the
//! encoded response back. Framing, connections and timeouts belong to the
//! transport; everything it carries is already protected.

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Stream error.
    #[error("stream error: {0}")]
    Stream(String),

    /// Peer violated the framing.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Stream(err.to_string())
    }
}

/// Request/response exchange with a responder.
///
/// Implementations must be cancellation safe: dropping the returned future
/// abandons the exchange without corrupting later ones.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and wait for the response.
    async fn exchange(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}
