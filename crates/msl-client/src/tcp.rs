//! TCP transport with length-prefixed frames.
//!
//! Speaks the framing of the `msl-server` binary: a big-endian `u32` length
//! followed by the message. One connection is kept open and reused; it is
//! dropped after any failure and re-established by the next exchange.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
};

use crate::transport::{Transport, TransportError};

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Client side of the TCP transport.
#[derive(Debug)]
pub struct TcpTransport {
    address: SocketAddr,
    connection: Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    /// Transport to `address`. Connects lazily on the first exchange.
    ///
    /// # Errors
    ///
    /// - `Connection` if the address does not parse
    pub fn new(address: &str) -> Result<Self, TransportError> {
        let address = address
            .parse()
            .map_err(|e| TransportError::Connection(format!("invalid address '{address}': {e}")))?;
        Ok(Self { address, connection: Mutex::new(None) })
    }

    /// Remote address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    async fn round_trip(stream: &mut TcpStream, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        if request.len() > MAX_FRAME_LEN {
            return Err(TransportError::Protocol(format!(
                "request of {} bytes exceeds {MAX_FRAME_LEN}",
                request.len()
            )));
        }
        stream.write_u32(request.len() as u32).await?;
        stream.write_all(request).await?;
        stream.flush().await?;

        let len = stream.read_u32().await? as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::Protocol(format!("response of {len} bytes exceeds {MAX_FRAME_LEN}")));
        }
        let mut response = vec![0u8; len];
        stream.read_exact(&mut response).await?;
        Ok(response)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn exchange(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let mut connection = self.connection.lock().await;

        // Taken out while in use so a dropped exchange never leaves a
        // half-written frame on a reused stream.
        let mut stream = match connection.take() {
            Some(stream) => stream,
            None => {
                let stream = TcpStream::connect(self.address)
                    .await
                    .map_err(|e| TransportError::Connection(format!("connect to {} failed: {e}", self.address)))?;
                tracing::debug!(address = %self.address, "connected");
                stream
            },
        };

        let response = Self::round_trip(&mut stream, &request).await?;
        *connection = Some(stream);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn invalid_address_rejected() {
        assert!(matches!(TcpTransport::new("not an address"), Err(TransportError::Connection(_))));
    }

    #[tokio::test]
    async fn connection_reused_across_exchanges() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for _ in 0..2 {
                let len = stream.read_u32().await.unwrap() as usize;
                let mut frame = vec![0u8; len];
                stream.read_exact(&mut frame).await.unwrap();
                frame.reverse();
                stream.write_u32(frame.len() as u32).await.unwrap();
                stream.write_all(&frame).await.unwrap();
            }
        });

        let transport = TcpTransport::new(&address.to_string()).unwrap();
        assert_eq!(transport.exchange(b"abc".to_vec()).await.unwrap(), b"cba");
        assert_eq!(transport.exchange(b"xy".to_vec()).await.unwrap(), b"yx");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let transport = TcpTransport::new(&address.to_string()).unwrap();
        assert!(matches!(transport.exchange(b"hi".to_vec()).await, Err(TransportError::Connection(_))));
    }
}
