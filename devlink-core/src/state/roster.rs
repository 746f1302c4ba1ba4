//! Peer roster driven by transport presence callbacks.
//!
//! Every known peer has a [`PeerStatus`], a lazily populated cache of
//! its last reported state, and the two viewing flags used by the
//! capture arbiter.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capture::ChunkSink;
use crate::message::StatePatch;

// ── PeerId ───────────────────────────────────────────────────────

const NODE_SEPARATOR: char = '@';

/// Opaque, stable peer identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Strip a transport node suffix (`user@node` → `user`).
    pub fn from_address(address: &str) -> Self {
        let user = address.split(NODE_SEPARATOR).next().unwrap_or(address);
        Self(user.to_string())
    }

    /// Non-empty and free of a node suffix, so it survives
    /// [`from_address`](Self::from_address) unchanged.
    pub fn is_bare(&self) -> bool {
        !self.0.is_empty() && !self.0.contains(NODE_SEPARATOR)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── PeerStatus ───────────────────────────────────────────────────

/// Connection status of a single peer, or of the transport as a whole.
///
/// ```text
///  Disconnected ──► Connecting ──► Connected
///       ▲                │              │
///       └────────────────┴──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl PeerStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

// ── Peer ─────────────────────────────────────────────────────────

/// What the transport reports about a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
    pub status: PeerStatus,
}

impl PeerInfo {
    pub fn new(id: impl Into<PeerId>, status: PeerStatus) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            status,
        }
    }
}

/// A roster entry.
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    status: PeerStatus,

    /// Last known remote state, merged key by key.
    pub snapshot: StatePatch,

    /// The peer is receiving our encoded video.
    pub viewing: bool,

    /// We want to watch this peer's video; chunks go to this sink.
    /// Kept across disconnects so playback resumes on reconnect.
    pub playback: Option<Arc<dyn ChunkSink>>,
}

impl Peer {
    pub fn new(info: PeerInfo) -> Self {
        let mut peer = Self {
            id: info.id,
            name: info.name,
            status: PeerStatus::Disconnected,
            snapshot: StatePatch::default(),
            viewing: false,
            playback: None,
        };
        peer.set_status(info.status);
        peer
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Update the status, returning the previous one.
    pub fn set_status(&mut self, status: PeerStatus) -> PeerStatus {
        let previous = self.status;
        self.status = status;
        previous
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("snapshot", &self.snapshot)
            .field("viewing", &self.viewing)
            .field("playback", &self.playback.is_some())
            .finish()
    }
}

// ── PeerRoster ───────────────────────────────────────────────────

/// Known peers in discovery order.
#[derive(Debug, Default)]
pub struct PeerRoster {
    peers: Vec<Peer>,
}

impl PeerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole roster (initial population / full resync).
    ///
    /// Cached snapshots and playback intents of peers that survive the
    /// resync are kept.
    pub fn replace_all(&mut self, infos: Vec<PeerInfo>) -> Vec<Peer> {
        let mut old = std::mem::take(&mut self.peers);
        for info in infos {
            match old.iter().position(|p| p.id == info.id) {
                Some(idx) => {
                    let mut peer = old.swap_remove(idx);
                    peer.name = info.name;
                    peer.set_status(info.status);
                    self.peers.push(peer);
                }
                None => self.peers.push(Peer::new(info)),
            }
        }
        old
    }

    /// Add a peer. Returns `false` if the id was already known.
    pub fn insert(&mut self, info: PeerInfo) -> bool {
        if self.contains(&info.id) {
            return false;
        }
        self.peers.push(Peer::new(info));
        true
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<Peer> {
        let idx = self.peers.iter().position(|p| &p.id == id)?;
        Some(self.peers.remove(idx))
    }

    pub fn clear(&mut self) -> Vec<Peer> {
        std::mem::take(&mut self.peers)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.iter().any(|p| &p.id == id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.id == id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| &p.id == id)
    }

    /// `true` only when the peer is known and Connected.
    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.get(id).is_some_and(Peer::is_connected)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.iter_mut()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(id: &str) -> PeerInfo {
        PeerInfo::new(id, PeerStatus::Connected)
    }

    #[test]
    fn peer_id_strips_node_suffix() {
        assert_eq!(PeerId::from_address("alice@node-7"), PeerId::from("alice"));
        assert_eq!(PeerId::from_address("bob"), PeerId::from("bob"));
        assert!(PeerId::from("bob").is_bare());
        assert!(!PeerId::from("bob@node").is_bare());
        assert!(!PeerId::from("").is_bare());
    }

    #[test]
    fn set_status_returns_previous() {
        let mut peer = Peer::new(PeerInfo::new("a", PeerStatus::Connecting));

        assert_eq!(peer.set_status(PeerStatus::Connected), PeerStatus::Connecting);
        assert!(peer.is_connected());

        assert_eq!(peer.set_status(PeerStatus::Disconnected), PeerStatus::Connected);
        assert!(!peer.is_connected());
    }

    #[test]
    fn insert_is_idempotent() {
        let mut roster = PeerRoster::new();
        assert!(roster.insert(connected("a")));
        assert!(!roster.insert(connected("a")));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn replace_all_keeps_cached_snapshot() {
        let mut roster = PeerRoster::new();
        roster.insert(connected("a"));
        roster.insert(connected("b"));
        roster.get_mut(&"a".into()).unwrap().snapshot = StatePatch::bulb(true);

        let dropped = roster.replace_all(vec![
            PeerInfo::new("a", PeerStatus::Disconnected),
            connected("c"),
        ]);

        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, PeerId::from("b"));
        let a = roster.get(&"a".into()).unwrap();
        assert_eq!(a.snapshot.bulb, Some(true));
        assert_eq!(a.status(), PeerStatus::Disconnected);
        assert_eq!(roster.ids(), vec![PeerId::from("a"), PeerId::from("c")]);
    }

    #[test]
    fn unknown_peer_is_not_connected() {
        let roster = PeerRoster::new();
        assert!(!roster.is_connected(&"ghost".into()));
    }
}
