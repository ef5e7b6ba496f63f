//! TCP transport with length-prefixed frames.
//!
//! Each message travels as one frame:
//!
//! ```text
//! ┌────────────────┬──────────────────────┐
//! │ length (u32 BE)│ message (length bytes)│
//! └────────────────┴──────────────────────┘
//! ```
//!
//! A connection carries any number of request/response pairs in order. The
//! transport adds no security of its own; everything it moves is already a
//! protected message.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    error::ServerError,
    server::{Handler, MslServer},
};

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Read one frame. Returns `None` when the peer closed cleanly between
/// frames.
///
/// # Errors
///
/// - `Transport` on I/O failure or a frame longer than [`MAX_FRAME_LEN`]
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, ServerError> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(ServerError::Transport(format!("frame of {len} bytes exceeds {MAX_FRAME_LEN}")));
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Write one frame.
///
/// # Errors
///
/// - `Transport` on I/O failure or a frame longer than [`MAX_FRAME_LEN`]
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<(), ServerError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(ServerError::Transport(format!("frame of {} bytes exceeds {MAX_FRAME_LEN}", frame.len())));
    }
    writer.write_u32(frame.len() as u32).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Listening TCP endpoint.
#[derive(Debug)]
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind to `address`.
    ///
    /// # Errors
    ///
    /// - `Config` if the address does not parse
    /// - `Transport` if binding fails
    pub async fn bind(address: &str) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("failed to bind {addr}: {e}")))?;

        tracing::info!("TCP transport bound to {}", addr);
        Ok(Self { listener })
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }

    /// Accept connections forever, answering each frame through `server`.
    ///
    /// Each connection runs on its own task; a failing connection is logged
    /// and closed without affecting the others.
    ///
    /// # Errors
    ///
    /// - `Transport` if accepting fails
    pub async fn run(self, server: Arc<MslServer>, handler: Handler) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let server = Arc::clone(&server);
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                match serve_connection(stream, &server, &handler).await {
                    Ok(()) => tracing::debug!(%peer, "connection closed"),
                    Err(e) => tracing::warn!(%peer, "connection failed: {}", e),
                }
            });
        }
    }
}

/// Answer frames on `stream` until the peer closes it.
///
/// # Errors
///
/// - `Transport` on I/O failure
/// - `Protocol` if an error header cannot be built
pub async fn serve_connection(mut stream: TcpStream, server: &MslServer, handler: &Handler) -> Result<(), ServerError> {
    while let Some(request) = read_frame(&mut stream).await? {
        let response = server.handle(&request, handler.as_ref())?;
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap().as_deref(), Some(&b"first"[..]));
        assert_eq!(read_frame(&mut b).await.unwrap().as_deref(), Some(&b""[..]));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();

        assert!(matches!(read_frame(&mut b).await, Err(ServerError::Transport(_))));
    }

    #[tokio::test]
    async fn transport_rejects_invalid_address() {
        let result = TcpTransport::bind("invalid:address:format").await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn transport_binds_ephemeral_port() {
        let transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(transport.local_addr().unwrap().port(), 0);
    }
}
