//! Control message types exchanged between peers.
//!
//! Every payload is a JSON object with a `type` discriminator and a
//! subset of the device state keys. Uses proper enums with `TryFrom`,
//! no panics on unknown values.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::DevlinkError;

// ── MessageType ──────────────────────────────────────────────────

/// The four message kinds understood by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Request for the receiver's full state.
    Query,
    /// Full-state snapshot, normally the reply to a `Query`.
    Status,
    /// Unsolicited broadcast of changed keys.
    Sync,
    /// Command to change the receiver's own state.
    Modify,
}

impl MessageType {
    /// The wire value of the `type` field.
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageType::Query => "query",
            MessageType::Status => "status",
            MessageType::Sync => "sync",
            MessageType::Modify => "modify",
        }
    }
}

impl TryFrom<&str> for MessageType {
    type Error = DevlinkError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "query" => Ok(MessageType::Query),
            "status" => Ok(MessageType::Status),
            "sync" => Ok(MessageType::Sync),
            "modify" => Ok(MessageType::Modify),
            other => Err(DevlinkError::UnknownVariant {
                type_name: "MessageType",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── StatePatch ───────────────────────────────────────────────────

/// A partial view of a device's controllable state.
///
/// Used both as message body and as the cached remote snapshot of a
/// peer: absent keys are simply unknown (or unchanged). Unknown JSON
/// keys are ignored on decode, and a known key with a value of the
/// wrong type is dropped on its own without failing the others.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient"
    )]
    pub bulb: Option<bool>,

    /// Torch on/off. Also accepts the legacy `"on"` / `"off"` / `"none"`
    /// strings; `"none"` means the device has no torch.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "torch_flag"
    )]
    pub torch: Option<bool>,

    /// Screen brightness, 0.0..=1.0.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient"
    )]
    pub brightness: Option<f32>,

    /// Audio alert playing.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient",
        alias = "audioPlay"
    )]
    pub ring: Option<bool>,

    /// Audio volume, 0.0..=1.0.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient"
    )]
    pub volume: Option<f32>,

    /// Camera streaming.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient",
        alias = "videoPlay"
    )]
    pub camera: Option<bool>,
}

impl StatePatch {
    pub fn bulb(on: bool) -> Self {
        Self {
            bulb: Some(on),
            ..Default::default()
        }
    }

    pub fn torch(on: bool) -> Self {
        Self {
            torch: Some(on),
            ..Default::default()
        }
    }

    pub fn brightness(level: f32) -> Self {
        Self {
            brightness: Some(level),
            ..Default::default()
        }
    }

    pub fn ring(playing: bool) -> Self {
        Self {
            ring: Some(playing),
            ..Default::default()
        }
    }

    pub fn volume(level: f32) -> Self {
        Self {
            volume: Some(level),
            ..Default::default()
        }
    }

    pub fn camera(on: bool) -> Self {
        Self {
            camera: Some(on),
            ..Default::default()
        }
    }

    /// `true` if no key is set.
    pub fn is_empty(&self) -> bool {
        self.bulb.is_none()
            && self.torch.is_none()
            && self.brightness.is_none()
            && self.ring.is_none()
            && self.volume.is_none()
            && self.camera.is_none()
    }

    /// Last-write-wins merge: every key present in `other` overwrites
    /// the corresponding key here; keys absent in `other` are untouched.
    pub fn merge(&mut self, other: &StatePatch) {
        if other.bulb.is_some() {
            self.bulb = other.bulb;
        }
        if other.torch.is_some() {
            self.torch = other.torch;
        }
        if other.brightness.is_some() {
            self.brightness = other.brightness;
        }
        if other.ring.is_some() {
            self.ring = other.ring;
        }
        if other.volume.is_some() {
            self.volume = other.volume;
        }
        if other.camera.is_some() {
            self.camera = other.camera;
        }
    }
}

/// A value of the wrong type reads as an absent key.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        value => match serde_json::from_value(value) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!("ignoring state key: {e}");
                Ok(None)
            }
        },
    }
}

fn torch_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(on) => Some(on),
        Value::String(mode) if mode == "on" => Some(true),
        Value::String(mode) if mode == "off" => Some(false),
        Value::Null => None,
        Value::String(mode) if mode == "none" => None,
        other => {
            warn!("ignoring torch value {other}");
            None
        }
    })
}

// ── ControlMessage ───────────────────────────────────────────────

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Query,
    Status(StatePatch),
    Sync(StatePatch),
    Modify(StatePatch),
}

impl ControlMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            ControlMessage::Query => MessageType::Query,
            ControlMessage::Status(_) => MessageType::Status,
            ControlMessage::Sync(_) => MessageType::Sync,
            ControlMessage::Modify(_) => MessageType::Modify,
        }
    }
}
