//! Physical stream plumbing for the tunnel multiplexer
//!
//! Provides the transport traits a duplex frame stream is built from, the
//! `DuplexStream` wrapper that serializes concurrent senders, and two
//! implementations: an in-memory pair and a length-prefixed stream over any
//! `AsyncRead + AsyncWrite`.

pub mod duplex;
pub mod framed;
pub mod memory;
pub mod transport;

pub use duplex::DuplexStream;
pub use transport::{FrameSink, FrameSource, TransportError};
