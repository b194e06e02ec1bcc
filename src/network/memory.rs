//! In-process transport connecting two peers
//!
//! Streams are tokio duplex pipes with a bounded buffer, so a peer that stops
//! reading applies real backpressure to the writer. Datagrams go through a
//! bounded channel and are silently lost when it is full.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use tokio::io::{duplex, split, DuplexStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::transport::{RecvStream, SendStream, Transport};
use crate::error::NetworkError;

/// Default buffer of each stream pipe
pub const DEFAULT_STREAM_BUFFER: usize = 64 * 1024;

/// Datagram size limit, in line with a typical QUIC path MTU
pub const MAX_DATAGRAM_SIZE: usize = 1200;

const PENDING_STREAMS: usize = 256;
const PENDING_DATAGRAMS: usize = 1024;

struct Incoming {
    bi: Mutex<mpsc::Receiver<DuplexStream>>,
    uni: Mutex<mpsc::Receiver<DuplexStream>>,
    datagrams: Mutex<mpsc::Receiver<Bytes>>,
}

struct Outgoing {
    bi: mpsc::Sender<DuplexStream>,
    uni: mpsc::Sender<DuplexStream>,
    datagrams: mpsc::Sender<Bytes>,
}

/// One endpoint of an in-memory connection
pub struct MemoryTransport {
    incoming: Incoming,
    outgoing: Outgoing,
    stream_buffer: usize,
    /// Shared by both endpoints: closing either side closes the connection
    closed: CancellationToken,
    close_reason: Arc<SyncMutex<Option<String>>>,
}

impl MemoryTransport {
    /// Create a connected pair of endpoints
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(DEFAULT_STREAM_BUFFER)
    }

    /// Create a connected pair whose stream pipes buffer `stream_buffer` bytes
    pub fn pair_with_capacity(stream_buffer: usize) -> (Self, Self) {
        let (a_bi_tx, b_bi_rx) = mpsc::channel(PENDING_STREAMS);
        let (b_bi_tx, a_bi_rx) = mpsc::channel(PENDING_STREAMS);
        let (a_uni_tx, b_uni_rx) = mpsc::channel(PENDING_STREAMS);
        let (b_uni_tx, a_uni_rx) = mpsc::channel(PENDING_STREAMS);
        let (a_dg_tx, b_dg_rx) = mpsc::channel(PENDING_DATAGRAMS);
        let (b_dg_tx, a_dg_rx) = mpsc::channel(PENDING_DATAGRAMS);

        let closed = CancellationToken::new();
        let close_reason = Arc::new(SyncMutex::new(None));
        let stream_buffer = stream_buffer.max(1);

        let a = Self {
            incoming: Incoming {
                bi: Mutex::new(a_bi_rx),
                uni: Mutex::new(a_uni_rx),
                datagrams: Mutex::new(a_dg_rx),
            },
            outgoing: Outgoing {
                bi: a_bi_tx,
                uni: a_uni_tx,
                datagrams: a_dg_tx,
            },
            stream_buffer,
            closed: closed.clone(),
            close_reason: close_reason.clone(),
        };
        let b = Self {
            incoming: Incoming {
                bi: Mutex::new(b_bi_rx),
                uni: Mutex::new(b_uni_rx),
                datagrams: Mutex::new(b_dg_rx),
            },
            outgoing: Outgoing {
                bi: b_bi_tx,
                uni: b_uni_tx,
                datagrams: b_dg_tx,
            },
            stream_buffer,
            closed,
            close_reason,
        };
        (a, b)
    }

    fn closed_error(&self) -> NetworkError {
        let reason = self
            .close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        NetworkError::TransportClosed(reason)
    }

    fn check_open(&self) -> Result<(), NetworkError> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    async fn hand_over(
        &self,
        tx: &mpsc::Sender<DuplexStream>,
        stream: DuplexStream,
    ) -> Result<(), NetworkError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(self.closed_error()),
            sent = tx.send(stream) => sent.map_err(|_| self.closed_error()),
        }
    }

    async fn receive<T>(&self, rx: &Mutex<mpsc::Receiver<T>>) -> Result<T, NetworkError> {
        let mut rx = rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(self.closed_error()),
            item = rx.recv() => item.ok_or_else(|| self.closed_error()),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_bi(&self) -> Result<(SendStream, RecvStream), NetworkError> {
        self.check_open()?;
        let (local, remote) = duplex(self.stream_buffer);
        self.hand_over(&self.outgoing.bi, remote).await?;
        let (read, write) = split(local);
        Ok((Box::new(write), Box::new(read)))
    }

    async fn accept_bi(&self) -> Result<(SendStream, RecvStream), NetworkError> {
        let stream = self.receive(&self.incoming.bi).await?;
        let (read, write) = split(stream);
        Ok((Box::new(write), Box::new(read)))
    }

    async fn open_uni(&self, _send_order: u64) -> Result<SendStream, NetworkError> {
        self.check_open()?;
        let (local, remote) = duplex(self.stream_buffer);
        self.hand_over(&self.outgoing.uni, remote).await?;
        Ok(Box::new(local))
    }

    async fn accept_uni(&self) -> Result<RecvStream, NetworkError> {
        let stream = self.receive(&self.incoming.uni).await?;
        Ok(Box::new(stream))
    }

    async fn send_datagram(&self, data: Bytes) -> Result<(), NetworkError> {
        self.check_open()?;
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(NetworkError::DatagramTooLarge(data.len()));
        }
        match self.outgoing.datagrams.try_send(data) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!("Datagram queue full, datagram lost");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.closed_error()),
        }
    }

    async fn recv_datagram(&self) -> Result<Bytes, NetworkError> {
        self.receive(&self.incoming.datagrams).await
    }

    fn max_datagram_size(&self) -> usize {
        MAX_DATAGRAM_SIZE
    }

    fn close(&self, code: u32, reason: &str) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(format!("{} ({})", reason, code));
            }
        }
        tracing::debug!(code, reason, "Memory transport closed");
        self.closed.cancel();
    }
}
