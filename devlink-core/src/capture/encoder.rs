//! Frame encoders.
//!
//! [`FrameEncoder`] turns raw frames into byte chunks for the wire.
//! Encoders are created lazily through an [`EncoderFactory`] the first
//! time a frame must go to a remote viewer.
//!
//! [`ZstdFrameEncoder`] emits one chunk per frame:
//!
//! ```text
//! sequence: u64 (LE)
//! width:    u32 (LE)
//! height:   u32 (LE)
//! format:   u8
//! data:     zstd-compressed pixels
//! ```

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::capture::types::{PixelFormat, RawFrame};
use crate::error::{DevlinkError, Result};

/// Builds a fresh encoder; fails with `ResourceUnavailable` when no
/// encoder can be acquired.
pub type EncoderFactory = Arc<dyn Fn() -> Result<Box<dyn FrameEncoder>> + Send + Sync>;

/// Encoder collaborator.
pub trait FrameEncoder: Send {
    /// Encode one frame into zero or more chunks.
    fn encode(&mut self, frame: &RawFrame) -> Result<Vec<Bytes>>;

    /// Terminate the encode session. Pending output is discarded.
    fn end(&mut self);
}

// ── ZstdFrameEncoder ─────────────────────────────────────────────

/// Size of the per-chunk header.
pub const CHUNK_HEADER_SIZE: usize = 17;

/// Whole-frame zstd encoder.
pub struct ZstdFrameEncoder {
    /// 1 = fastest, 19 = smallest.
    compression_level: i32,
    frame_count: u64,
}

impl ZstdFrameEncoder {
    pub fn new(compression_level: i32) -> Self {
        Self {
            compression_level: compression_level.clamp(1, 19),
            frame_count: 0,
        }
    }

    /// Factory producing encoders at `compression_level`.
    pub fn factory(compression_level: i32) -> EncoderFactory {
        Arc::new(move || Ok(Box::new(ZstdFrameEncoder::new(compression_level)) as Box<dyn FrameEncoder>))
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frame_count
    }

    /// Reverse of [`encode`](FrameEncoder::encode) for a single chunk.
    pub fn decode(chunk: &[u8]) -> Result<RawFrame> {
        if chunk.len() < CHUNK_HEADER_SIZE {
            return Err(DevlinkError::Decode(format!(
                "chunk too short: {} < {CHUNK_HEADER_SIZE}",
                chunk.len()
            )));
        }
        let (header, body) = chunk.split_at(CHUNK_HEADER_SIZE);
        let sequence = u64::from_le_bytes(le_bytes(&header[0..8])?);
        let width = u32::from_le_bytes(le_bytes(&header[8..12])?);
        let height = u32::from_le_bytes(le_bytes(&header[12..16])?);
        let format = PixelFormat::from_u8(header[16])
            .ok_or_else(|| DevlinkError::Decode(format!("unknown pixel format {}", header[16])))?;

        let data = zstd::decode_all(body)
            .map_err(|e| DevlinkError::Decode(format!("zstd decode failed: {e}")))?;
        if data.len() != format.frame_len(width, height) {
            return Err(DevlinkError::Decode(format!(
                "frame size mismatch: {} bytes for {width}x{height}",
                data.len()
            )));
        }

        Ok(RawFrame {
            sequence,
            width,
            height,
            format,
            data,
            timestamp: std::time::Instant::now(),
        })
    }
}

impl FrameEncoder for ZstdFrameEncoder {
    fn encode(&mut self, frame: &RawFrame) -> Result<Vec<Bytes>> {
        let compressed = zstd::encode_all(frame.data.as_slice(), self.compression_level)
            .map_err(|e| DevlinkError::Other(format!("zstd encode failed: {e}")))?;

        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + compressed.len());
        buf.put_u64_le(frame.sequence);
        buf.put_u32_le(frame.width);
        buf.put_u32_le(frame.height);
        buf.put_u8(frame.format.to_u8());
        buf.put_slice(&compressed);

        self.frame_count += 1;
        Ok(vec![buf.freeze()])
    }

    fn end(&mut self) {
        self.frame_count = 0;
    }
}

fn le_bytes<const N: usize>(slice: &[u8]) -> Result<[u8; N]> {
    slice
        .try_into()
        .map_err(|_| DevlinkError::Decode("truncated chunk header".into()))
}
