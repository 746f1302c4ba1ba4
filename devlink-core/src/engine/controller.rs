//! The single-writer protocol engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::capture::{
    CaptureArbiter, CaptureSignal, CaptureSource, ChunkSink, EncoderFactory, FrameSink,
};
use crate::codec;
use crate::engine::{Command, ControlEvent, ControlReceiver, ControllerConfig, ControllerHandle};
use crate::error::{DevlinkError, Result};
use crate::events::{DeviceEvent, EventBus};
use crate::message::{ControlMessage, StatePatch};
use crate::platform::{DevicePlatform, PlatformEvent};
use crate::state::{
    LocalDeviceState, PeerId, PeerInfo, PeerRoster, PeerStatus, PendingSlot, QueryCallback,
    clamp_level,
};
use crate::transport::{SessionHandler, Transport, TransportEvent};

/// External collaborators the controller drives.
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub sessions: Arc<dyn SessionHandler>,
    pub platform: Box<dyn DevicePlatform>,
    pub capture: Box<dyn CaptureSource>,
    pub encoder: EncoderFactory,
}

/// Owns the roster, local device state, pending query and capture
/// arbiter. Must live on a tokio runtime (deadline timers are tasks).
pub struct Controller {
    config: ControllerConfig,
    transport: Arc<dyn Transport>,
    sessions: Arc<dyn SessionHandler>,
    platform: Box<dyn DevicePlatform>,
    arbiter: CaptureArbiter,

    roster: PeerRoster,
    local: LocalDeviceState,
    pending: PendingSlot,
    events: EventBus,

    /// Global transport status.
    link: PeerStatus,
    /// Last brightness value that went out in a `sync`.
    broadcast_brightness: f32,

    inbox: mpsc::UnboundedSender<ControlEvent>,
}

impl Controller {
    pub fn new(config: ControllerConfig, parts: Collaborators, handle: &ControllerHandle) -> Self {
        let inbox = handle.sender();
        let local = LocalDeviceState::from_platform(parts.platform.as_ref());
        let arbiter = CaptureArbiter::new(
            parts.capture,
            parts.encoder,
            Arc::clone(&parts.sessions),
            inbox.clone(),
        );
        Self {
            events: EventBus::new(config.event_capacity),
            broadcast_brightness: local.brightness,
            config,
            transport: parts.transport,
            sessions: parts.sessions,
            platform: parts.platform,
            arbiter,
            roster: PeerRoster::new(),
            local,
            pending: PendingSlot::new(),
            link: PeerStatus::Disconnected,
            inbox,
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn local_state(&self) -> &LocalDeviceState {
        &self.local
    }

    pub fn roster(&self) -> &PeerRoster {
        &self.roster
    }

    pub fn link_status(&self) -> PeerStatus {
        self.link
    }

    pub fn is_capturing(&self) -> bool {
        self.arbiter.is_active()
    }

    pub fn has_pending_query(&self) -> bool {
        self.pending.is_pending()
    }

    // ── Event loop ───────────────────────────────────────────────

    /// Drain the inbox until [`Command::Shutdown`] or every handle is gone.
    pub async fn run(mut self, mut inbox: ControlReceiver) {
        info!("controller started");
        while let Some(event) = inbox.recv().await {
            if matches!(event, ControlEvent::Command(Command::Shutdown)) {
                break;
            }
            self.handle_event(event);
        }
        self.shutdown();
        info!("controller stopped");
    }

    pub fn handle_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Transport(event) => self.on_transport(event),
            ControlEvent::Command(command) => self.on_command(command),
            ControlEvent::QueryDeadline(id) => self.on_query_deadline(id),
            ControlEvent::Capture(signal) => self.on_capture_signal(signal),
            ControlEvent::Platform(event) => self.on_platform(event),
        }
    }

    fn shutdown(&mut self) {
        if let Some(request) = self.pending.take() {
            request.complete(Err(DevlinkError::ChannelClosed));
        }
        self.arbiter.clear_viewers();
        self.arbiter.clear_preview();
        for peer in self.roster.iter_mut() {
            peer.viewing = false;
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SetBulb(on) => self.set_bulb(on),
            Command::SetTorch(on) => log_local("torch", self.set_torch(on)),
            Command::SetBrightness(level) => log_local("brightness", self.set_brightness(level)),
            Command::SetRing(on) => log_local("ring", self.set_ring(on)),
            Command::SetVolume(level) => log_local("volume", self.set_volume(level)),
            Command::Query {
                peer,
                timeout,
                reply,
            } => {
                let timeout = timeout.unwrap_or(self.config.query_timeout);
                match self.dispatch_query(&peer) {
                    Ok(()) => self.track_query(
                        peer,
                        timeout,
                        Box::new(move |result| {
                            let _ = reply.send(result);
                        }),
                    ),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Modify { peer, patch, reply } => {
                let _ = reply.send(self.send_modify(&peer, &patch));
            }
            Command::StartRemoteView { peer, sink, reply } => {
                let _ = reply.send(self.start_remote_view(&peer, sink));
            }
            Command::StopRemoteView { peer, reply } => {
                let _ = reply.send(self.stop_remote_view(&peer));
            }
            Command::StartPreview { sink, reply } => {
                let _ = reply.send(self.start_preview(sink));
            }
            Command::StopPreview => self.stop_preview(),
            Command::LocalState { reply } => {
                let _ = reply.send(self.local.snapshot());
            }
            Command::PeerSnapshot { peer, reply } => {
                let _ = reply.send(self.roster.get(&peer).map(|p| p.snapshot.clone()));
            }
            Command::Peers { reply } => {
                let peers = self
                    .roster
                    .iter()
                    .map(|p| PeerInfo {
                        id: p.id.clone(),
                        name: p.name.clone(),
                        status: p.status(),
                    })
                    .collect();
                let _ = reply.send(peers);
            }
            Command::Shutdown => self.shutdown(),
        }
    }

    // ── Incoming messages ────────────────────────────────────────

    /// Decode and dispatch one payload. Malformed payloads are logged
    /// and dropped.
    pub fn handle_incoming(&mut self, from: &str, payload: &str) {
        let peer = PeerId::from_address(from);
        let message = match codec::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer, "dropping payload: {e}");
                return;
            }
        };
        debug!(%peer, kind = %message.kind(), "message received");

        match message {
            ControlMessage::Query => self.reply_status(&peer),
            ControlMessage::Status(patch) => self.on_status(&peer, patch),
            ControlMessage::Sync(patch) => self.on_sync(&peer, patch),
            ControlMessage::Modify(patch) => self.on_modify(&peer, &patch),
        }
    }

    fn reply_status(&self, peer: &PeerId) {
        let status = ControlMessage::Status(self.local.snapshot());
        if let Err(e) = self.send_message(peer, &status) {
            warn!(%peer, "status reply failed: {e}");
        }
    }

    fn on_status(&mut self, peer: &PeerId, patch: StatePatch) {
        self.cache_remote(peer, &patch);
        match self.pending.take_for_peer(peer) {
            Some(request) => {
                debug!(%peer, elapsed = ?request.elapsed(), "query answered");
                request.complete(Ok(patch.clone()));
            }
            None => debug!(%peer, "unsolicited status merged"),
        }
        self.events.emit(DeviceEvent::DeviceStatusChanged {
            peer: Some(peer.clone()),
            patch,
        });
    }

    fn on_sync(&mut self, peer: &PeerId, patch: StatePatch) {
        self.cache_remote(peer, &patch);
        self.events.emit(DeviceEvent::DeviceStatusChanged {
            peer: Some(peer.clone()),
            patch,
        });
    }

    /// Apply every recognised key independently; one failing key does
    /// not stop the others.
    fn on_modify(&mut self, peer: &PeerId, patch: &StatePatch) {
        if let Some(on) = patch.bulb {
            self.set_bulb(on);
        }
        if let Some(on) = patch.torch {
            log_remote(peer, "torch", self.set_torch(on));
        }
        if let Some(level) = patch.brightness {
            log_remote(peer, "brightness", self.set_brightness(level));
        }
        if let Some(playing) = patch.ring {
            log_remote(peer, "ring", self.set_ring(playing));
        }
        if let Some(level) = patch.volume {
            log_remote(peer, "volume", self.set_volume(level));
        }
        match patch.camera {
            Some(true) => log_remote(peer, "camera", self.add_viewer(peer)),
            Some(false) => self.remove_viewer(peer),
            None => {}
        }
    }

    fn cache_remote(&mut self, peer: &PeerId, patch: &StatePatch) {
        match self.roster.get_mut(peer) {
            Some(entry) => entry.snapshot.merge(patch),
            None => trace!(%peer, "state from unknown peer not cached"),
        }
    }

    // ── Query / response ─────────────────────────────────────────

    /// Send a `query` to `peer` and arm the deadline.
    ///
    /// Fails with `PeerUnreachable` (nothing sent) unless the peer is
    /// Connected. A query that was still pending is completed with
    /// `Superseded`. On deadline `on_complete` gets `RequestTimeout`.
    pub fn send_query(
        &mut self,
        peer: &PeerId,
        timeout: Duration,
        on_complete: QueryCallback,
    ) -> Result<()> {
        self.dispatch_query(peer)?;
        self.track_query(peer.clone(), timeout, on_complete);
        Ok(())
    }

    /// Reachability check plus the actual send.
    fn dispatch_query(&self, peer: &PeerId) -> Result<()> {
        if !self.roster.is_connected(peer) {
            return Err(DevlinkError::PeerUnreachable(peer.clone()));
        }
        self.send_message(peer, &ControlMessage::Query)
    }

    /// Install the request in the pending slot and arm its deadline.
    fn track_query(&mut self, peer: PeerId, timeout: Duration, on_complete: QueryCallback) {
        let (id, superseded) = self.pending.begin(peer, timeout, on_complete);
        if let Some(old) = superseded {
            debug!(peer = %old.peer(), "pending query superseded");
            old.complete(Err(DevlinkError::Superseded));
        }

        let inbox = self.inbox.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = inbox.send(ControlEvent::QueryDeadline(id));
        });
        self.pending.arm(id, timer);
    }

    fn on_query_deadline(&mut self, id: u64) {
        match self.pending.take_by_id(id) {
            Some(request) => {
                warn!(peer = %request.peer(), "query timed out");
                let deadline = request.deadline();
                request.complete(Err(DevlinkError::RequestTimeout(deadline)));
            }
            None => trace!(id, "stale query deadline ignored"),
        }
    }

    /// Ask one Connected peer to change its own state.
    pub fn send_modify(&self, peer: &PeerId, patch: &StatePatch) -> Result<()> {
        if !self.roster.is_connected(peer) {
            return Err(DevlinkError::PeerUnreachable(peer.clone()));
        }
        self.send_message(peer, &ControlMessage::Modify(patch.clone()))
    }

    // ── Local mutators ───────────────────────────────────────────

    pub fn set_bulb(&mut self, on: bool) {
        self.local.bulb = on;
        self.local_changed(StatePatch::bulb(on));
    }

    pub fn set_torch(&mut self, on: bool) -> Result<()> {
        self.platform.set_torch(on)?;
        self.local.torch = Some(on);
        self.local_changed(StatePatch::torch(on));
        Ok(())
    }

    pub fn set_brightness(&mut self, level: f32) -> Result<()> {
        let level = clamp_level(level);
        self.platform.set_brightness(level)?;
        self.local.brightness = level;
        if self.local_changed(StatePatch::brightness(level)) {
            self.broadcast_brightness = level;
        }
        Ok(())
    }

    pub fn set_ring(&mut self, playing: bool) -> Result<()> {
        self.platform.set_ringing(playing)?;
        self.local.ring = playing;
        self.local_changed(StatePatch::ring(playing));
        Ok(())
    }

    pub fn set_volume(&mut self, level: f32) -> Result<()> {
        let level = clamp_level(level);
        self.platform.set_volume(level)?;
        self.local.volume = level;
        self.local_changed(StatePatch::volume(level));
        Ok(())
    }

    /// Raise the local event and, while the transport is Connected,
    /// broadcast the changed keys. Returns whether a sync went out.
    fn local_changed(&mut self, patch: StatePatch) -> bool {
        self.events.emit(DeviceEvent::DeviceStatusChanged {
            peer: None,
            patch: patch.clone(),
        });
        if !self.link.is_connected() {
            return false;
        }
        self.broadcast_sync(patch);
        true
    }

    /// Best effort: a failing peer is logged and skipped.
    fn broadcast_sync(&self, patch: StatePatch) {
        let payload = match codec::encode(&ControlMessage::Sync(patch)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("sync not encoded: {e}");
                return;
            }
        };
        for peer in self.roster.iter() {
            if let Err(e) = self.transport.send(&peer.id, payload.clone()) {
                warn!(peer = %peer.id, "sync failed: {e}");
            }
        }
    }

    fn send_message(&self, peer: &PeerId, message: &ControlMessage) -> Result<()> {
        let payload = codec::encode(message)?;
        self.transport.send(peer, payload)
    }

    // ── Platform events ──────────────────────────────────────────

    fn on_platform(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::BrightnessChanged(level) => self.on_platform_brightness(level),
            PlatformEvent::AudioInterrupted => {
                if self.local.ring {
                    self.local.ring = false;
                    self.local_changed(StatePatch::ring(false));
                }
            }
            PlatformEvent::EnteredBackground => {
                if self.local.torch == Some(true) {
                    log_local("torch", self.set_torch(false));
                }
            }
        }
    }

    /// Track a brightness change made outside the controller. Moves
    /// within the tolerance of the last broadcast value stay local.
    pub fn on_platform_brightness(&mut self, level: f32) {
        let level = clamp_level(level);
        self.local.brightness = level;
        let moved = (level - self.broadcast_brightness).abs();
        if moved + LEVEL_EPSILON < self.config.brightness_tolerance {
            trace!(level, "brightness jitter ignored");
            return;
        }
        if self.local_changed(StatePatch::brightness(level)) {
            self.broadcast_brightness = level;
        }
    }

    // ── Capture demand ───────────────────────────────────────────

    pub fn start_preview(&mut self, sink: Arc<dyn FrameSink>) -> Result<()> {
        self.arbiter.set_preview(sink)?;
        self.sync_camera_flag();
        Ok(())
    }

    pub fn stop_preview(&mut self) {
        self.arbiter.clear_preview();
        self.sync_camera_flag();
    }

    /// Put a Connected peer into the viewing set.
    fn add_viewer(&mut self, peer: &PeerId) -> Result<()> {
        if !self.roster.is_connected(peer) {
            return Err(DevlinkError::PeerUnreachable(peer.clone()));
        }
        self.arbiter.add_viewer(peer.clone())?;
        if let Some(entry) = self.roster.get_mut(peer) {
            entry.viewing = true;
        }
        self.sync_camera_flag();
        Ok(())
    }

    fn remove_viewer(&mut self, peer: &PeerId) {
        if let Some(entry) = self.roster.get_mut(peer) {
            entry.viewing = false;
        }
        self.arbiter.remove_viewer(peer);
        self.sync_camera_flag();
    }

    fn on_capture_signal(&mut self, signal: CaptureSignal) {
        let Some(dropped) = self.arbiter.on_signal(&signal) else {
            return;
        };
        for peer in &dropped {
            if let Some(entry) = self.roster.get_mut(peer) {
                entry.viewing = false;
            }
            self.sessions.close_session(peer);
        }
        self.sync_camera_flag();
    }

    /// Keep `camera` equal to the arbiter state, announcing changes.
    fn sync_camera_flag(&mut self) {
        let active = self.arbiter.is_active();
        if self.local.camera != active {
            self.local.camera = active;
            self.local_changed(StatePatch::camera(active));
        }
    }

    // ── Remote viewing ───────────────────────────────────────────

    /// Start watching `peer`: record the intent, open playback and ask
    /// the peer to stream. The intent survives disconnects.
    pub fn start_remote_view(&mut self, peer: &PeerId, sink: Arc<dyn ChunkSink>) -> Result<()> {
        if !self.roster.is_connected(peer) {
            return Err(DevlinkError::PeerUnreachable(peer.clone()));
        }
        self.sessions.open_playback(peer)?;
        if let Some(entry) = self.roster.get_mut(peer) {
            entry.playback = Some(sink);
        }
        self.send_modify(peer, &StatePatch::camera(true))
    }

    pub fn stop_remote_view(&mut self, peer: &PeerId) -> Result<()> {
        let had_intent = self
            .roster
            .get_mut(peer)
            .and_then(|entry| entry.playback.take())
            .is_some();
        if had_intent {
            self.sessions.close_playback(peer);
        }
        if self.roster.is_connected(peer) {
            self.send_modify(peer, &StatePatch::camera(false))?;
        }
        Ok(())
    }

    // ── Transport events ─────────────────────────────────────────

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Ready => self.on_ready(),
            TransportEvent::ConnectionStatusChanged(status) => self.on_link_status(status),
            TransportEvent::PeerListChanged(infos) => self.on_peer_list(infos),
            TransportEvent::PeerAdded(info) => {
                let (id, status) = (info.id.clone(), info.status);
                if self.roster.insert(info) {
                    self.on_peer_transition(&id, PeerStatus::Disconnected, status);
                    self.events.emit(DeviceEvent::DeviceListChanged);
                }
            }
            TransportEvent::PeerRemoved(id) => {
                if let Some(peer) = self.roster.remove(&id) {
                    self.peer_gone(&id, peer.status());
                    self.events.emit(DeviceEvent::DeviceListChanged);
                }
            }
            TransportEvent::PeerStatusChanged { peer, status } => {
                self.on_peer_status(&peer, status);
            }
            TransportEvent::MessageReceived { from, payload } => {
                self.handle_incoming(&from, &payload);
            }
            TransportEvent::MediaReceived { from, chunk } => {
                match self.roster.get(&from).and_then(|p| p.playback.as_ref()) {
                    Some(sink) => sink.push(&chunk),
                    None => trace!(peer = %from, "media chunk without playback dropped"),
                }
            }
            TransportEvent::FriendRequest { from, name, reply } => {
                let accept = self.config.accept_friend_requests;
                info!(peer = %from, %name, accept, "friend request");
                if reply.send(accept).is_err() {
                    debug!(peer = %from, "friend request withdrawn");
                    return;
                }
                if accept
                    && self.roster.insert(PeerInfo {
                        id: from,
                        name,
                        status: PeerStatus::Connecting,
                    })
                {
                    self.events.emit(DeviceEvent::DeviceListChanged);
                }
            }
        }
    }

    fn on_ready(&mut self) {
        if self.transport.self_name().is_empty() {
            let name = if self.config.self_name.is_empty() {
                self.platform.device_name()
            } else {
                self.config.self_name.clone()
            };
            if let Err(e) = self.transport.set_self_name(name) {
                warn!("self name not set: {e}");
            }
        }
        let name = self.transport.self_name();
        info!(%name, "transport ready");
        self.events.emit(DeviceEvent::SelfInfoChanged { name });
    }

    /// A transport-level disconnect drops every peer relationship.
    fn on_link_status(&mut self, status: PeerStatus) {
        let previous = std::mem::replace(&mut self.link, status);
        if previous != status {
            info!(%previous, %status, "transport status changed");
        }
        if status != PeerStatus::Disconnected {
            return;
        }
        let dropped = self.roster.clear();
        for peer in &dropped {
            if peer.is_connected() {
                self.sessions.close_session(&peer.id);
            }
        }
        self.arbiter.clear_viewers();
        self.sync_camera_flag();
        if !dropped.is_empty() {
            self.events.emit(DeviceEvent::DeviceListChanged);
        }
    }

    fn on_peer_list(&mut self, infos: Vec<PeerInfo>) {
        let before: Vec<(PeerId, PeerStatus)> =
            self.roster.iter().map(|p| (p.id.clone(), p.status())).collect();

        for peer in self.roster.replace_all(infos) {
            self.peer_gone(&peer.id, peer.status());
        }

        let after: Vec<(PeerId, PeerStatus)> =
            self.roster.iter().map(|p| (p.id.clone(), p.status())).collect();
        for (id, status) in after {
            let previous = before
                .iter()
                .find(|(known, _)| *known == id)
                .map(|(_, s)| *s)
                .unwrap_or_default();
            self.on_peer_transition(&id, previous, status);
        }
        self.events.emit(DeviceEvent::DeviceListChanged);
    }

    fn on_peer_status(&mut self, peer: &PeerId, status: PeerStatus) {
        let previous = match self.roster.get_mut(peer) {
            Some(entry) => entry.set_status(status),
            None => {
                self.roster.insert(PeerInfo::new(peer.clone(), status));
                self.on_peer_transition(peer, PeerStatus::Disconnected, status);
                self.events.emit(DeviceEvent::DeviceListChanged);
                return;
            }
        };
        if previous == status {
            return;
        }
        debug!(%peer, %previous, %status, "peer status changed");
        self.on_peer_transition(peer, previous, status);
        self.events.emit(DeviceEvent::DeviceListChanged);
    }

    fn on_peer_transition(&mut self, peer: &PeerId, previous: PeerStatus, status: PeerStatus) {
        if previous.is_connected() && !status.is_connected() {
            self.sessions.close_session(peer);
            self.remove_viewer(peer);
        } else if !previous.is_connected() && status.is_connected() {
            self.resume_playback(peer);
        }
    }

    /// Re-request the stream of a peer we were watching before it dropped.
    fn resume_playback(&mut self, peer: &PeerId) {
        let wants_video = self.roster.get(peer).is_some_and(|p| p.playback.is_some());
        if !wants_video {
            return;
        }
        info!(%peer, "resuming remote view");
        let resumed = self
            .sessions
            .open_playback(peer)
            .and_then(|()| self.send_modify(peer, &StatePatch::camera(true)));
        if let Err(e) = resumed {
            warn!(%peer, "remote view not resumed: {e}");
        }
    }

    fn peer_gone(&mut self, peer: &PeerId, last_status: PeerStatus) {
        if last_status.is_connected() {
            self.sessions.close_session(peer);
        }
        self.arbiter.remove_viewer(peer);
        self.sync_camera_flag();
    }
}

/// Slack for `f32` rounding when comparing level steps.
const LEVEL_EPSILON: f32 = 1e-4;

fn log_local(key: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!(key, "local change failed: {e}");
    }
}

fn log_remote(peer: &PeerId, key: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!(%peer, key, "modify not applied: {e}");
    }
}
