//! Length-delimited stream framing for the TCP transport.
//!
//! ```text
//! length: u32 (big-endian, added by LengthDelimitedCodec)
//! kind:   u8  (0 = Hello, 1 = Message, 2 = Media, 3 = Goodbye)
//! body:   [u8]
//! ```
//!
//! `Hello` carries the sender's peer id as UTF-8, `Message` a JSON
//! control payload, `Media` one encoded chunk.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::DevlinkError;
use crate::state::PeerId;

/// Largest frame accepted from a peer (header + body).
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

const KIND_HELLO: u8 = 0;
const KIND_MESSAGE: u8 = 1;
const KIND_MEDIA: u8 = 2;
const KIND_GOODBYE: u8 = 3;

/// One unit on a peer stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    /// First frame on every connection, identifies the sender.
    Hello(PeerId),
    /// A control message payload.
    Message(String),
    /// An encoded media chunk.
    Media(Bytes),
    /// Graceful close.
    Goodbye,
}

/// `tokio_util` codec turning a byte stream into [`WireFrame`]s.
#[derive(Debug)]
pub struct PeerCodec {
    inner: LengthDelimitedCodec,
}

impl PeerCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
        }
    }
}

impl Default for PeerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PeerCodec {
    type Item = WireFrame;
    type Error = DevlinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(mut frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if frame.is_empty() {
            return Err(DevlinkError::Decode("empty frame".into()));
        }

        let kind = frame.get_u8();
        let body = frame.freeze();
        let item = match kind {
            KIND_HELLO => WireFrame::Hello(PeerId::new(utf8(body)?)),
            KIND_MESSAGE => WireFrame::Message(utf8(body)?),
            KIND_MEDIA => WireFrame::Media(body),
            KIND_GOODBYE => WireFrame::Goodbye,
            other => {
                return Err(DevlinkError::UnknownVariant {
                    type_name: "WireFrame",
                    value: other.to_string(),
                });
            }
        };
        Ok(Some(item))
    }
}

impl Encoder<WireFrame> for PeerCodec {
    type Error = DevlinkError;

    fn encode(&mut self, item: WireFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut buf = BytesMut::new();
        match item {
            WireFrame::Hello(peer) => {
                buf.put_u8(KIND_HELLO);
                buf.put_slice(peer.as_str().as_bytes());
            }
            WireFrame::Message(text) => {
                buf.put_u8(KIND_MESSAGE);
                buf.put_slice(text.as_bytes());
            }
            WireFrame::Media(data) => {
                buf.put_u8(KIND_MEDIA);
                buf.put_slice(&data);
            }
            WireFrame::Goodbye => buf.put_u8(KIND_GOODBYE),
        }
        self.inner.encode(buf.freeze(), dst)?;
        Ok(())
    }
}

fn utf8(body: Bytes) -> Result<String, DevlinkError> {
    String::from_utf8(body.to_vec()).map_err(|e| DevlinkError::Decode(e.to_string()))
}
