//! Transport and media-session collaborator interfaces.
//!
//! The P2P layer is treated as a unicast send primitive keyed by peer
//! identity plus a stream of [`TransportEvent`]s. Sending must never
//! block the caller: implementations enqueue and report failures
//! through the returned `Result` or their own logs.

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::state::{PeerId, PeerInfo, PeerStatus};

/// Unicast message transport.
pub trait Transport: Send + Sync {
    /// Enqueue `payload` for `peer`.
    ///
    /// Fails with `PeerUnreachable` when no link to the peer exists and
    /// with `Delivery` when the link rejected the payload.
    fn send(&self, peer: &PeerId, payload: String) -> Result<()>;

    /// Our own display name as known to the network.
    fn self_name(&self) -> String;

    fn set_self_name(&self, name: String) -> Result<()>;
}

/// Per-peer media session capability.
///
/// Dispatch is by peer identity: the implementation owns whatever
/// per-peer session objects it needs.
pub trait SessionHandler: Send + Sync {
    /// Write one encoded chunk to the peer's outbound media session.
    fn write_media(&self, peer: &PeerId, chunk: Bytes) -> Result<()>;

    /// Prepare to receive the peer's stream.
    fn open_playback(&self, peer: &PeerId) -> Result<()>;

    /// Stop receiving the peer's stream. Our outbound stream to the
    /// peer, if any, is left alone.
    fn close_playback(&self, peer: &PeerId);

    /// Tear down every media session with the peer. Other peers are
    /// unaffected.
    fn close_session(&self, peer: &PeerId);
}

/// Callbacks from the transport, delivered to the control plane.
#[derive(Debug)]
pub enum TransportEvent {
    /// The transport finished bootstrapping.
    Ready,
    /// Global connection status of the transport.
    ConnectionStatusChanged(PeerStatus),
    /// Full roster (initial population or resync).
    PeerListChanged(Vec<PeerInfo>),
    PeerAdded(PeerInfo),
    PeerRemoved(PeerId),
    PeerStatusChanged { peer: PeerId, status: PeerStatus },
    /// A control payload. `from` may carry a `@node` suffix.
    MessageReceived { from: String, payload: String },
    /// An encoded media chunk from a peer we are watching.
    MediaReceived { from: PeerId, chunk: Bytes },
    /// An unknown identity asks to become a peer.
    FriendRequest {
        from: PeerId,
        name: String,
        reply: oneshot::Sender<bool>,
    },
}
