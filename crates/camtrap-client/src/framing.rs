//! Length-prefixed framing shared by plugin sockets and the bus hub.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Length header size
pub const HEADER_LEN: usize = 4;

/// Maximum frame size (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame length {len} exceeds maximum {max}")]
    TooLarge { len: usize, max: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// `tokio_util` codec for length-prefixed frames
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, buffer: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; HEADER_LEN];
        length_bytes.copy_from_slice(&buffer[..HEADER_LEN]);
        let frame_length = u32::from_be_bytes(length_bytes) as usize;

        if frame_length > self.max_frame_size {
            return Err(FrameError::TooLarge {
                len: frame_length,
                max: self.max_frame_size,
            });
        }

        if buffer.len() < HEADER_LEN + frame_length {
            buffer.reserve(HEADER_LEN + frame_length - buffer.len());
            return Ok(None);
        }

        buffer.advance(HEADER_LEN);
        Ok(Some(buffer.split_to(frame_length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.len() > self.max_frame_size {
            return Err(FrameError::TooLarge {
                len: frame.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(HEADER_LEN + frame.len());
        dst.put_u32(frame.len() as u32);
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
