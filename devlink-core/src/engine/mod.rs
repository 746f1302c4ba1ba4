//! Message protocol engine.
//!
//! All roster, device-state and pending-request mutation happens on one
//! control-plane task that owns the [`Controller`] and drains a single
//! inbox of [`ControlEvent`]s:
//!
//! ```text
//!  transport ──TransportEvent──┐
//!  platform  ──PlatformEvent───┤
//!  handle    ──Command─────────┼──► inbox ──► Controller::handle_event
//!  timers    ──QueryDeadline───┤
//!  capture   ──CaptureSignal───┘
//! ```
//!
//! Nothing on this task ever blocks: sends are enqueued by the
//! transport, timers are separate tasks, frames are produced on the
//! capture thread.

mod controller;
mod handle;

pub use controller::{Collaborators, Controller};
pub use handle::{ControlReceiver, ControllerHandle};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::capture::{CaptureSignal, ChunkSink, FrameSink};
use crate::error::Result;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::message::StatePatch;
use crate::platform::PlatformEvent;
use crate::state::{PeerId, PeerInfo, QueryResult};
use crate::transport::TransportEvent;

/// Default deadline for a `query`.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Platform brightness changes smaller than this are sensor noise.
pub const DEFAULT_BRIGHTNESS_TOLERANCE: f32 = 0.05;

// ── ControllerConfig ─────────────────────────────────────────────

/// Tunables for the [`Controller`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub query_timeout: Duration,
    pub brightness_tolerance: f32,
    /// Answer to every incoming friend request.
    pub accept_friend_requests: bool,
    /// Display name used on `Ready` when the transport has none.
    /// Empty means "use the platform's device name".
    pub self_name: String,
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            brightness_tolerance: DEFAULT_BRIGHTNESS_TOLERANCE,
            accept_friend_requests: true,
            self_name: String::new(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

// ── ControlEvent ─────────────────────────────────────────────────

/// Everything the control plane reacts to.
#[derive(Debug)]
pub enum ControlEvent {
    Transport(TransportEvent),
    Command(Command),
    /// The deadline of pending request `id` elapsed.
    QueryDeadline(u64),
    Capture(CaptureSignal),
    Platform(PlatformEvent),
}

/// Requests posted through a [`ControllerHandle`].
pub enum Command {
    SetBulb(bool),
    SetTorch(bool),
    SetBrightness(f32),
    SetRing(bool),
    SetVolume(f32),
    Query {
        peer: PeerId,
        timeout: Option<Duration>,
        reply: oneshot::Sender<QueryResult>,
    },
    Modify {
        peer: PeerId,
        patch: StatePatch,
        reply: oneshot::Sender<Result<()>>,
    },
    StartRemoteView {
        peer: PeerId,
        sink: Arc<dyn ChunkSink>,
        reply: oneshot::Sender<Result<()>>,
    },
    StopRemoteView {
        peer: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    StartPreview {
        sink: Arc<dyn FrameSink>,
        reply: oneshot::Sender<Result<()>>,
    },
    StopPreview,
    LocalState {
        reply: oneshot::Sender<StatePatch>,
    },
    PeerSnapshot {
        peer: PeerId,
        reply: oneshot::Sender<Option<StatePatch>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetBulb(on) => write!(f, "SetBulb({on})"),
            Command::SetTorch(on) => write!(f, "SetTorch({on})"),
            Command::SetBrightness(level) => write!(f, "SetBrightness({level})"),
            Command::SetRing(on) => write!(f, "SetRing({on})"),
            Command::SetVolume(level) => write!(f, "SetVolume({level})"),
            Command::Query { peer, timeout, .. } => write!(f, "Query({peer}, {timeout:?})"),
            Command::Modify { peer, patch, .. } => write!(f, "Modify({peer}, {patch:?})"),
            Command::StartRemoteView { peer, .. } => write!(f, "StartRemoteView({peer})"),
            Command::StopRemoteView { peer, .. } => write!(f, "StopRemoteView({peer})"),
            Command::StartPreview { .. } => write!(f, "StartPreview"),
            Command::StopPreview => write!(f, "StopPreview"),
            Command::LocalState { .. } => write!(f, "LocalState"),
            Command::PeerSnapshot { peer, .. } => write!(f, "PeerSnapshot({peer})"),
            Command::Peers { .. } => write!(f, "Peers"),
            Command::Shutdown => write!(f, "Shutdown"),
        }
    }
}
