//! Tunnel multiplexing protocol definitions
//!
//! This crate defines the frames carried over the single physical duplex stream
//! and the length-prefixed codec used to put them on the wire.

pub mod codec;
pub mod frame;

pub use codec::{CodecError, FrameCodec};
pub use frame::{SocksFrame, TunnelFrame};

/// Tunnel identifier, assigned by the remote side
pub type TunnelId = u64;

/// Remote agent session identifier
pub type SessionId = String;

/// Forwarder identifier, allocated locally
pub type ForwarderId = u64;

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
