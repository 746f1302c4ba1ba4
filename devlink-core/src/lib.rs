//! # devlink-core
//!
//! Core library for remotely controlling a set of peer devices.
//!
//! This crate contains:
//! - **Messages**: `ControlMessage` (`query` / `status` / `sync` / `modify`) and `StatePatch`
//! - **Codec**: JSON payload `encode` / `decode`, and `PeerCodec` for framed TCP I/O via `tokio_util`
//! - **State**: `PeerRoster`, `LocalDeviceState`, and the single-slot `PendingSlot` for queries
//! - **Engine**: `Controller`, the single-writer protocol engine, and its `ControllerHandle`
//! - **Capture**: `CaptureArbiter` (lazy acquire / release of the shared camera), `FramePipeline` and chunk fan-out
//! - **Network**: `TcpTransport`, one framed connection per peer
//! - **Events**: `EventBus` for UI / observer consumption
//! - **Error**: `DevlinkError`, a typed, `thiserror`-based error hierarchy

pub mod capture;
pub mod codec;
pub mod engine;
pub mod error;
pub mod events;
pub mod message;
pub mod network;
pub mod platform;
pub mod state;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{
    CaptureArbiter, CaptureSignal, CaptureSource, ChunkSink, EncoderFactory, FrameEncoder,
    FrameSink, PatternCapture, PixelFormat, RawFrame, ZstdFrameEncoder,
};
pub use codec::{PeerCodec, WireFrame, decode, encode};
pub use engine::{
    Collaborators, Command, ControlEvent, ControlReceiver, Controller, ControllerConfig,
    ControllerHandle,
};
pub use error::{DevlinkError, Result};
pub use events::{DeviceEvent, EventBus};
pub use message::{ControlMessage, MessageType, StatePatch};
pub use network::{PeerAddr, TcpTransport, TcpTransportConfig};
pub use platform::{DevicePlatform, PlatformEvent, SimulatedPlatform};
pub use state::{
    LocalDeviceState, Peer, PeerId, PeerInfo, PeerRoster, PeerStatus, PendingSlot, QueryCallback,
    QueryResult,
};
pub use transport::{SessionHandler, Transport, TransportEvent};
