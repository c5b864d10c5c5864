//! Duplex frame stream shared by every tunnel

use crate::framed::{FramedSink, FramedSource};
use crate::transport::{FrameSink, FrameSource, TransportError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::trace;

/// The single physical, ordered, bidirectional frame stream
///
/// Sends are mutually exclusive: the underlying stream does not support
/// concurrent writers, so every sender waits on the sink lock. The source has
/// its own lock so a pending `recv` never holds up senders.
pub struct DuplexStream<F: Send + 'static> {
    sink: Mutex<Box<dyn FrameSink<F>>>,
    source: Mutex<Box<dyn FrameSource<F>>>,
}

impl<F: Send + 'static> DuplexStream<F> {
    /// Build a duplex stream from a sending and a receiving half
    pub fn new(sink: impl FrameSink<F> + 'static, source: impl FrameSource<F> + 'static) -> Self {
        Self {
            sink: Mutex::new(Box::new(sink)),
            source: Mutex::new(Box::new(source)),
        }
    }

    /// Send a frame, waiting for any in-flight send to finish first
    pub async fn send(&self, frame: F) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.send(frame).await
    }

    /// Receive the next frame
    ///
    /// Returns Ok(None) when the peer closed the stream.
    pub async fn recv(&self) -> Result<Option<F>, TransportError> {
        let mut source = self.source.lock().await;
        let frame = source.recv().await?;
        if frame.is_none() {
            trace!("Duplex stream reached end of stream");
        }
        Ok(frame)
    }

    /// Close the sending half
    pub async fn close(&self) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.close().await
    }
}

impl<F> DuplexStream<F>
where
    F: Serialize + DeserializeOwned + Send + 'static,
{
    /// Length-prefixed frame stream over a byte stream
    pub fn framed<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(io);
        Self::new(FramedSink::new(write), FramedSource::new(read))
    }
}
