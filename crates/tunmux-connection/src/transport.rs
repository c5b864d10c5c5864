//! Transport traits for the physical frame stream

use async_trait::async_trait;
use thiserror::Error;
use tunmux_proto::CodecError;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    CodecError(#[from] CodecError),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

/// Sending half of a frame transport
#[async_trait]
pub trait FrameSink<F: Send + 'static>: Send {
    /// Send one frame
    async fn send(&mut self, frame: F) -> Result<(), TransportError>;

    /// Flush and close the sending half
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Receiving half of a frame transport
#[async_trait]
pub trait FrameSource<F: Send + 'static>: Send {
    /// Receive the next frame
    ///
    /// Returns Ok(None) once the peer has cleanly closed the stream.
    async fn recv(&mut self) -> Result<Option<F>, TransportError>;
}
