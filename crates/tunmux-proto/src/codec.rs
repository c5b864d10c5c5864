//! Codec for encoding/decoding frames

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Length-prefixed bincode codec
///
/// Format: [length: u32 big-endian][payload: bincode serialized frame]
pub struct FrameCodec<F> {
    _frame: PhantomData<fn() -> F>,
}

impl<F> FrameCodec<F> {
    /// Length header size
    pub const HEADER_SIZE: usize = 4;

    pub fn new() -> Self {
        Self {
            _frame: PhantomData,
        }
    }
}

impl<F> Default for FrameCodec<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Serialize> FrameCodec<F> {
    /// Encode a frame into `dst`
    pub fn encode_into(frame: &F, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(frame)?;

        if payload.len() > crate::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        dst.reserve(Self::HEADER_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

impl<F: DeserializeOwned> FrameCodec<F> {
    /// Decode one frame from the front of `src`
    ///
    /// Returns Ok(None) if more data is needed.
    pub fn decode_from(src: &mut BytesMut) -> Result<Option<F>, CodecError> {
        if src.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..Self::HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > crate::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        if src.len() < Self::HEADER_SIZE + length {
            src.reserve(Self::HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(Self::HEADER_SIZE);
        let payload = src.split_to(length);

        Ok(Some(bincode::deserialize(&payload)?))
    }
}

impl<F: Serialize> Encoder<F> for FrameCodec<F> {
    type Error = CodecError;

    fn encode(&mut self, item: F, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Self::encode_into(&item, dst)
    }
}

impl<F: DeserializeOwned> Decoder for FrameCodec<F> {
    type Item = F;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::decode_from(src)
    }
}
