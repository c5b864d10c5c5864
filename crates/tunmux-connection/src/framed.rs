//! Length-prefixed frame transport over a byte stream

use crate::transport::{FrameSink, FrameSource, TransportError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tunmux_proto::FrameCodec;

/// Sending half encoding frames with `FrameCodec`
pub struct FramedSink<W, F> {
    inner: FramedWrite<W, FrameCodec<F>>,
}

impl<W: AsyncWrite, F> FramedSink<W, F> {
    pub fn new(write: W) -> Self {
        Self {
            inner: FramedWrite::new(write, FrameCodec::new()),
        }
    }
}

#[async_trait]
impl<W, F> FrameSink<F> for FramedSink<W, F>
where
    W: AsyncWrite + Send + Unpin,
    F: Serialize + Send + 'static,
{
    async fn send(&mut self, frame: F) -> Result<(), TransportError> {
        self.inner.send(frame).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::<F>::close(&mut self.inner).await?;
        Ok(())
    }
}

/// Receiving half decoding frames with `FrameCodec`
pub struct FramedSource<R, F> {
    inner: FramedRead<R, FrameCodec<F>>,
}

impl<R: AsyncRead, F> FramedSource<R, F> {
    pub fn new(read: R) -> Self {
        Self {
            inner: FramedRead::new(read, FrameCodec::new()),
        }
    }
}

#[async_trait]
impl<R, F> FrameSource<F> for FramedSource<R, F>
where
    R: AsyncRead + Send + Unpin,
    F: DeserializeOwned + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<F>, TransportError> {
        match self.inner.next().await {
            Some(frame) => Ok(Some(frame?)),
            None => Ok(None),
        }
    }
}
