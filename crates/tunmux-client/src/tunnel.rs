//! Logical tunnel: one duplex byte stream carried over the shared connection
//!
//! A tunnel owns two bounded queues. The outbound queue is filled by `write`
//! and drained by exactly one pump (see `TunnelRegistry`); the inbound queue is
//! filled by the demux loop through `deliver` and drained by `read`.
//!
//! Closing a tunnel cancels a token that every blocking operation selects on,
//! so blocked readers and writers return `TunnelError::Eof` instead of hanging.

use bytes::{Buf, Bytes};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tunmux_proto::{SessionId, TunnelId};

/// Tunnel errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Tunnel {0} is already open")]
    AlreadyOpen(TunnelId),

    #[error("EOF: tunnel {0} is not open")]
    Eof(TunnelId),
}

/// Why an inbound message could not be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverError {
    /// The tunnel closed while the message was waiting
    Closed,
    /// The reader did not make room within the deliver timeout
    TimedOut,
}

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelState {
    /// Created but never opened
    Idle = 0,
    Open = 1,
    /// Terminal
    Closed = 2,
}

impl TunnelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TunnelState::Idle,
            1 => TunnelState::Open,
            _ => TunnelState::Closed,
        }
    }
}

/// Byte counters for a tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

struct Inbound {
    rx: mpsc::Receiver<Bytes>,
    /// Unread remainder of the last message
    pending: Bytes,
}

/// Logical duplex tunnel
pub struct LogicalTunnel {
    id: TunnelId,
    session_id: SessionId,
    state: AtomicU8,
    closed: CancellationToken,
    closed_by_peer: AtomicBool,
    outbound_tx: mpsc::Sender<Bytes>,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound: Mutex<Inbound>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Consumer end of a tunnel's outbound queue
///
/// Owned by the single task that forwards the tunnel's writes to the stream.
pub struct OutboundQueue {
    rx: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
}

impl OutboundQueue {
    /// Next message written to the tunnel
    ///
    /// Once the tunnel is closed, messages already queued are still returned;
    /// after that this yields `None`.
    pub async fn next(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            message = self.rx.recv() => message,
            _ = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }
}

impl LogicalTunnel {
    /// Create a tunnel in the `Idle` state
    ///
    /// `queue_depth` bounds each direction; a full queue blocks the producer.
    pub fn new(
        id: TunnelId,
        session_id: impl Into<SessionId>,
        queue_depth: usize,
    ) -> (Self, OutboundQueue) {
        let queue_depth = queue_depth.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_depth);
        let (inbound_tx, inbound_rx) = mpsc::channel(queue_depth);
        let closed = CancellationToken::new();

        let tunnel = Self {
            id,
            session_id: session_id.into(),
            state: AtomicU8::new(TunnelState::Idle as u8),
            closed: closed.clone(),
            closed_by_peer: AtomicBool::new(false),
            outbound_tx,
            inbound_tx,
            inbound: Mutex::new(Inbound {
                rx: inbound_rx,
                pending: Bytes::new(),
            }),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        };

        let outbound = OutboundQueue {
            rx: outbound_rx,
            closed,
        };

        (tunnel, outbound)
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> TunnelState {
        TunnelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == TunnelState::Open
    }

    /// Whether the close was initiated by the remote side
    pub fn closed_by_peer(&self) -> bool {
        self.closed_by_peer.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TunnelStats {
        TunnelStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Transition `Idle -> Open`
    pub fn open(&self) -> Result<(), TunnelError> {
        match self.state.compare_exchange(
            TunnelState::Idle as u8,
            TunnelState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(current) if current == TunnelState::Open as u8 => {
                Err(TunnelError::AlreadyOpen(self.id))
            }
            Err(_) => Err(TunnelError::Eof(self.id)),
        }
    }

    /// Close the tunnel
    ///
    /// Idempotent. Returns true only for the call that performed the close.
    pub fn close(&self) -> bool {
        let previous = self.state.swap(TunnelState::Closed as u8, Ordering::AcqRel);
        if previous == TunnelState::Closed as u8 {
            return false;
        }
        self.closed.cancel();
        true
    }

    /// Close on behalf of the remote side
    ///
    /// Messages already delivered stay readable until drained.
    pub(crate) fn close_by_peer(&self) -> bool {
        self.closed_by_peer.store(true, Ordering::Release);
        self.close()
    }

    /// Wait until the tunnel is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Queue a copy of `buf` for the remote side
    ///
    /// Blocks while the outbound queue is full.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, TunnelError> {
        if !self.is_open() {
            return Err(TunnelError::Eof(self.id));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let data = Bytes::copy_from_slice(buf);
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TunnelError::Eof(self.id)),
            result = self.outbound_tx.send(data) => {
                result.map_err(|_| TunnelError::Eof(self.id))?;
            }
        }

        self.bytes_sent
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len())
    }

    /// Read inbound bytes into `buf`
    ///
    /// Each call returns bytes from at most one message. When a message is
    /// larger than `buf`, the remainder is returned by the following calls
    /// before the next message is taken.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        match self.state() {
            TunnelState::Open => {}
            TunnelState::Closed if self.closed_by_peer() => {}
            _ => return Err(TunnelError::Eof(self.id)),
        }

        let mut inbound = self.inbound.lock().await;

        if inbound.pending.is_empty() {
            let next = tokio::select! {
                biased;
                message = inbound.rx.recv() => message,
                _ = self.closed.cancelled() => None,
            };

            let next = match next {
                Some(message) => Some(message),
                None if self.closed_by_peer() => inbound.rx.try_recv().ok(),
                None => None,
            };

            match next {
                Some(message) => inbound.pending = message,
                None => return Err(TunnelError::Eof(self.id)),
            }
        }

        if buf.is_empty() {
            return Ok(0);
        }

        let n = buf.len().min(inbound.pending.len());
        buf[..n].copy_from_slice(&inbound.pending[..n]);
        inbound.pending.advance(n);

        Ok(n)
    }

    /// Hand one inbound message to the reader
    ///
    /// Blocks while the inbound queue is full, bounded by `timeout` if given.
    pub async fn deliver(
        &self,
        data: Bytes,
        timeout: Option<Duration>,
    ) -> Result<(), DeliverError> {
        let len = data.len() as u64;
        let send = async {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => Err(DeliverError::Closed),
                result = self.inbound_tx.send(data) => result.map_err(|_| DeliverError::Closed),
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, send)
                .await
                .unwrap_or(Err(DeliverError::TimedOut))?,
            None => send.await?,
        }

        self.bytes_received.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for LogicalTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalTunnel")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}
