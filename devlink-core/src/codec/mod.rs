//! Payload and stream codecs.
//!
//! - [`encode`] / [`decode`] convert [`ControlMessage`]s to and from the
//!   transport's opaque UTF-8 JSON string payload.
//! - [`frame`] holds the length-delimited stream codec used by the TCP
//!   transport to carry those payloads plus media chunks.

pub mod frame;

pub use frame::{PeerCodec, WireFrame};

use serde_json::Value;

use crate::error::{DevlinkError, Result};
use crate::message::{ControlMessage, MessageType};

/// Serialize a message into its wire payload.
pub fn encode(message: &ControlMessage) -> Result<String> {
    serde_json::to_string(message).map_err(|e| DevlinkError::Other(format!("encode failed: {e}")))
}

/// Parse a wire payload.
///
/// Malformed JSON or a missing `type` yield [`DevlinkError::Decode`];
/// an unrecognised `type` yields [`DevlinkError::UnknownVariant`].
/// Unknown keys and wrongly typed known keys are ignored.
pub fn decode(payload: &str) -> Result<ControlMessage> {
    let value: Value = serde_json::from_str(payload)?;
    let kind = value
        .as_object()
        .ok_or_else(|| DevlinkError::Decode("payload is not a JSON object".into()))?
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DevlinkError::Decode("missing `type` field".into()))?;

    // Reject unknown kinds before serde reports them as a generic error.
    MessageType::try_from(kind)?;

    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StatePatch;

    #[test]
    fn encodes_query() {
        assert_eq!(encode(&ControlMessage::Query).unwrap(), r#"{"type":"query"}"#);
    }

    #[test]
    fn encodes_only_changed_keys() {
        let text = encode(&ControlMessage::Sync(StatePatch::bulb(true))).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "sync");
        assert_eq!(value["bulb"], true);
        assert_eq!(value.as_object().unwrap().len(), 2);
    }

    #[test]
    fn decodes_modify_and_ignores_unknown_keys() {
        let msg = decode(r#"{"type":"modify","bulb":true,"colour":"red"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Modify(StatePatch::bulb(true)));
    }

    #[test]
    fn decodes_query_with_extra_keys() {
        let msg = decode(r#"{"type":"query","nonce":7}"#).unwrap();
        assert_eq!(msg, ControlMessage::Query);
    }

    #[test]
    fn decodes_full_status() {
        let msg = decode(
            r#"{"type":"status","bulb":false,"torch":"off","brightness":0.8,"audioPlay":false,"volume":1.0}"#,
        )
        .unwrap();
        let ControlMessage::Status(p) = msg else {
            panic!("expected status");
        };
        assert_eq!(p.bulb, Some(false));
        assert_eq!(p.torch, Some(false));
        assert_eq!(p.brightness, Some(0.8));
        assert_eq!(p.ring, Some(false));
        assert_eq!(p.volume, Some(1.0));
    }

    #[test]
    fn malformed_payload_is_decode_error() {
        assert!(matches!(decode("{{{"), Err(DevlinkError::Decode(_))));
        assert!(matches!(decode("[1,2]"), Err(DevlinkError::Decode(_))));
        assert!(matches!(decode(r#"{"bulb":true}"#), Err(DevlinkError::Decode(_))));
    }

    #[test]
    fn mistyped_key_keeps_the_rest_of_the_message() {
        let msg = decode(r#"{"type":"modify","bulb":true,"volume":"loud"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Modify(StatePatch::bulb(true)));
    }

    #[test]
    fn unknown_kind_is_reported() {
        let err = decode(r#"{"type":"reboot"}"#).unwrap_err();
        assert!(matches!(err, DevlinkError::UnknownVariant { .. }));
    }
}
