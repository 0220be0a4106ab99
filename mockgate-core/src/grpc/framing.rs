//! gRPC length-prefixed message framing.
//!
//! ```text
//! +------------+----------------------+-----------------+
//! | flag (1B)  | length (4B, BE u32)  | payload (length)|
//! +------------+----------------------+-----------------+
//! ```
//!
//! HTTP/2 DATA chunks do not line up with message boundaries, so
//! [`FrameDecoder`] buffers partial input until a whole frame is available.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the message prefix.
pub const FRAME_HEADER_LEN: usize = 5;

/// Default upper bound for a single message (matches the common gRPC default).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Errors raised while splitting a byte stream into frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Declared message length is above the configured limit.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    /// Compressed flag was neither 0 nor 1.
    #[error("invalid compressed flag {0}")]
    InvalidFlag(u8),

    /// The stream ended in the middle of a frame.
    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
}

/// One gRPC message as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcFrame {
    pub compressed: bool,
    pub payload: Bytes,
}

impl GrpcFrame {
    /// An uncompressed frame around `payload`.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            compressed: false,
            payload: payload.into(),
        }
    }

    /// Serialize prefix and payload into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u8(u8::from(self.compressed));
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Encode a single uncompressed frame.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    GrpcFrame::new(Bytes::copy_from_slice(payload)).encode()
}

/// Incremental frame splitter.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_bytes,
        }
    }

    /// Append a chunk of body data.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<GrpcFrame>, FrameError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let flag = self.buf[0];
        if flag > 1 {
            return Err(FrameError::InvalidFlag(flag));
        }
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(FRAME_HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(GrpcFrame {
            compressed: flag == 1,
            payload,
        }))
    }

    /// Check that end-of-stream fell on a frame boundary.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FrameError::Truncated {
                buffered: self.buf.len(),
            })
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

/// Split a fully collected body into frames.
pub fn decode_frames(body: &[u8], max_frame_bytes: usize) -> Result<Vec<GrpcFrame>, FrameError> {
    let mut decoder = FrameDecoder::new(max_frame_bytes);
    decoder.push(body);
    let mut frames = Vec::new();
    while let Some(frame) = decoder.next_frame()? {
        frames.push(frame);
    }
    decoder.finish()?;
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefix() {
        let bytes = encode_frame(b"abc");
        assert_eq!(&bytes[..], &[0, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut wire = encode_frame(b"hello").to_vec();
        wire.extend_from_slice(&encode_frame(b"")[..]);

        let mut decoder = FrameDecoder::default();
        decoder.push(&wire[..3]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(&wire[3..]);

        let first = decoder.next_frame().unwrap().unwrap();
        assert_eq!(&first.payload[..], b"hello");
        assert!(!first.compressed);

        let second = decoder.next_frame().unwrap().unwrap();
        assert!(second.payload.is_empty());
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_decoder_rejects_oversized_frame() {
        let mut decoder = FrameDecoder::new(4);
        decoder.push(&encode_frame(b"too long"));
        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::TooLarge { len: 8, max: 4 })
        );
    }

    #[test]
    fn test_decoder_rejects_bad_flag() {
        let mut decoder = FrameDecoder::default();
        decoder.push(&[7, 0, 0, 0, 0]);
        assert_eq!(decoder.next_frame(), Err(FrameError::InvalidFlag(7)));
    }

    #[test]
    fn test_truncated_stream() {
        let wire = encode_frame(b"hello");
        let result = decode_frames(&wire[..6], DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(result, Err(FrameError::Truncated { buffered: 6 }));
    }

    #[test]
    fn test_compressed_flag_round_trips() {
        let frame = GrpcFrame {
            compressed: true,
            payload: Bytes::from_static(b"z"),
        };
        let frames = decode_frames(&frame.encode(), DEFAULT_MAX_FRAME_BYTES).unwrap();
        assert_eq!(frames, vec![frame]);
    }
}
