//! Domain-specific error types for the devlink protocol.
//!
//! All fallible operations return `Result<T, DevlinkError>`.
//! Per-peer broadcast failures are logged by the caller and never
//! propagated; directed commands surface these errors directly.

use std::time::Duration;
use thiserror::Error;

use crate::state::PeerId;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, DevlinkError>;

/// The canonical error type for the devlink protocol.
#[derive(Debug, Error)]
pub enum DevlinkError {
    // ── Peer / Delivery Errors ───────────────────────────────────
    /// The target peer is not Connected; nothing was sent.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(PeerId),

    /// The transport accepted the attempt but delivery failed.
    #[error("delivery to {peer} failed: {reason}")]
    Delivery { peer: PeerId, reason: String },

    // ── Protocol Errors ──────────────────────────────────────────
    /// The payload could not be parsed.
    #[error("decode error: {0}")]
    Decode(String),

    /// A discriminator did not map to any known variant.
    #[error("unknown {type_name}: {value}")]
    UnknownVariant {
        type_name: &'static str,
        value: String,
    },

    // ── Request Errors ───────────────────────────────────────────
    /// No status reply arrived before the deadline.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The pending request was replaced by a newer one.
    #[error("request superseded by a newer query")]
    Superseded,

    // ── Resource Errors ──────────────────────────────────────────
    /// Capture or encoder hardware could not be acquired.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    // ── Infrastructure Errors ────────────────────────────────────
    /// An internal channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// The socket layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl DevlinkError {
    /// Returns `true` for errors raised before anything was sent.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, DevlinkError::PeerUnreachable(_))
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for DevlinkError {
    fn from(s: String) -> Self {
        DevlinkError::Other(s)
    }
}

impl From<&str> for DevlinkError {
    fn from(s: &str) -> Self {
        DevlinkError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for DevlinkError {
    fn from(e: serde_json::Error) -> Self {
        DevlinkError::Decode(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DevlinkError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        DevlinkError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for DevlinkError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        DevlinkError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = DevlinkError::PeerUnreachable(PeerId::from("kitchen"));
        assert!(e.to_string().contains("kitchen"));

        let e = DevlinkError::Delivery {
            peer: PeerId::from("hall"),
            reason: "socket closed".into(),
        };
        assert!(e.to_string().contains("hall"));
        assert!(e.to_string().contains("socket closed"));
    }

    #[test]
    fn from_json_error_is_decode() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let e: DevlinkError = err.into();
        assert!(matches!(e, DevlinkError::Decode(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: DevlinkError = io_err.into();
        assert!(matches!(e, DevlinkError::Io(_)));
    }

    #[test]
    fn unreachable_predicate() {
        assert!(DevlinkError::PeerUnreachable(PeerId::from("a")).is_unreachable());
        assert!(!DevlinkError::Superseded.is_unreachable());
    }
}
