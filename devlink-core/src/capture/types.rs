//! Frame types and sinks shared across the capture pipeline.

use std::time::Instant;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
    /// 12 bits per pixel, luma plane followed by interleaved chroma.
    Nv12,
}

impl PixelFormat {
    /// Byte size of a `width` x `height` image in this format.
    pub const fn frame_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Bgra8 => pixels * 4,
            PixelFormat::Nv12 => pixels * 3 / 2,
        }
    }

    pub const fn to_u8(self) -> u8 {
        match self {
            PixelFormat::Bgra8 => 0,
            PixelFormat::Nv12 => 1,
        }
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PixelFormat::Bgra8),
            1 => Some(PixelFormat::Nv12),
            _ => None,
        }
    }
}

// ── RawFrame ─────────────────────────────────────────────────────

/// An uncompressed frame as produced by the capture source.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Sequential number assigned by the source.
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Tightly packed pixel data.
    pub data: Vec<u8>,
    /// Monotonic capture timestamp.
    pub timestamp: Instant,
}

impl RawFrame {
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

// ── Sinks ────────────────────────────────────────────────────────

/// Local preview consumer. Called from the capture thread.
pub trait FrameSink: Send + Sync {
    /// Whether the sink can take another frame right now.
    fn is_ready(&self) -> bool {
        true
    }

    fn enqueue(&self, frame: &RawFrame);
}

/// Consumer of a remote peer's encoded stream.
pub trait ChunkSink: Send + Sync {
    fn push(&self, chunk: &[u8]);
}
