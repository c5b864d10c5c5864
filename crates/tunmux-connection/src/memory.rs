//! In-memory frame transport
//!
//! Two connected `DuplexStream`s backed by bounded channels. Used to stand in
//! for the RPC stream in tests and local wiring.

use crate::duplex::DuplexStream;
use crate::transport::{FrameSink, FrameSource, TransportError};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Sending half of an in-memory transport
pub struct MemorySink<F> {
    tx: Option<mpsc::Sender<F>>,
}

#[async_trait]
impl<F: Send + 'static> FrameSink<F> for MemorySink<F> {
    async fn send(&mut self, frame: F) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

/// Receiving half of an in-memory transport
pub struct MemorySource<F> {
    rx: mpsc::Receiver<F>,
}

#[async_trait]
impl<F: Send + 'static> FrameSource<F> for MemorySource<F> {
    async fn recv(&mut self) -> Result<Option<F>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// A single one-directional in-memory channel
pub fn channel<F: Send + 'static>(capacity: usize) -> (MemorySink<F>, MemorySource<F>) {
    let (tx, rx) = mpsc::channel(capacity);
    (MemorySink { tx: Some(tx) }, MemorySource { rx })
}

/// Two connected duplex streams: what one sends, the other receives
pub fn pair<F: Send + 'static>(capacity: usize) -> (DuplexStream<F>, DuplexStream<F>) {
    let (a_sink, b_source) = channel(capacity);
    let (b_sink, a_source) = channel(capacity);
    (
        DuplexStream::new(a_sink, a_source),
        DuplexStream::new(b_sink, b_source),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (left, right) = pair::<u32>(4);

        left.send(1).await.unwrap();
        right.send(2).await.unwrap();

        assert_eq!(right.recv().await.unwrap(), Some(1));
        assert_eq!(left.recv().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (left, right) = pair::<u32>(4);

        left.send(7).await.unwrap();
        left.close().await.unwrap();

        assert_eq!(right.recv().await.unwrap(), Some(7));
        assert_eq!(right.recv().await.unwrap(), None);
        assert!(matches!(
            left.send(8).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
