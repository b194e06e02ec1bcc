//! Connection abstraction the media sessions run over
//!
//! A QUIC/WebTransport connection offers bidirectional streams (the control
//! stream), unidirectional streams with a send priority, and unreliable
//! datagrams. Sessions only depend on this trait.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::NetworkError;

/// Sending half of a stream
pub type SendStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Receiving half of a stream
pub type RecvStream = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a bidirectional stream
    async fn open_bi(&self) -> Result<(SendStream, RecvStream), NetworkError>;

    /// Wait for the peer to open a bidirectional stream
    async fn accept_bi(&self) -> Result<(SendStream, RecvStream), NetworkError>;

    /// Open a unidirectional stream; higher `send_order` is scheduled first
    async fn open_uni(&self, send_order: u64) -> Result<SendStream, NetworkError>;

    /// Wait for the peer to open a unidirectional stream
    async fn accept_uni(&self) -> Result<RecvStream, NetworkError>;

    /// Send an unreliable datagram
    async fn send_datagram(&self, data: Bytes) -> Result<(), NetworkError>;

    async fn recv_datagram(&self) -> Result<Bytes, NetworkError>;

    /// Largest datagram payload accepted by `send_datagram`
    fn max_datagram_size(&self) -> usize;

    /// Close the connection; pending and future calls fail with `TransportClosed`
    fn close(&self, code: u32, reason: &str);
}
