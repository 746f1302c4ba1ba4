use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::capture::{ChunkSink, FrameSink};
use crate::engine::{Command, ControlEvent};
use crate::error::Result;
use crate::message::StatePatch;
use crate::platform::PlatformEvent;
use crate::state::{PeerId, PeerInfo};
use crate::transport::TransportEvent;

/// Receiving end of the control-plane inbox.
pub type ControlReceiver = mpsc::UnboundedReceiver<ControlEvent>;

/// Cloneable front-end to a running [`Controller`](super::Controller).
///
/// Every method only enqueues; fire-and-forget setters return as soon
/// as the command is posted, request-style methods await the reply.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl ControllerHandle {
    /// Create the inbox. The receiver goes to [`Controller::run`](super::Controller::run).
    pub fn channel() -> (Self, ControlReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<ControlEvent> {
        self.tx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn post(&self, event: ControlEvent) -> Result<()> {
        self.tx.send(event)?;
        Ok(())
    }

    /// Entry point for transport callbacks.
    pub fn transport_event(&self, event: TransportEvent) -> Result<()> {
        self.post(ControlEvent::Transport(event))
    }

    /// Entry point for platform notifications.
    pub fn platform_event(&self, event: PlatformEvent) -> Result<()> {
        self.post(ControlEvent::Platform(event))
    }

    fn command(&self, command: Command) -> Result<()> {
        self.post(ControlEvent::Command(command))
    }

    // ── Local mutators ───────────────────────────────────────────

    pub fn set_bulb(&self, on: bool) -> Result<()> {
        self.command(Command::SetBulb(on))
    }

    pub fn set_torch(&self, on: bool) -> Result<()> {
        self.command(Command::SetTorch(on))
    }

    pub fn set_brightness(&self, level: f32) -> Result<()> {
        self.command(Command::SetBrightness(level))
    }

    pub fn set_ring(&self, playing: bool) -> Result<()> {
        self.command(Command::SetRing(playing))
    }

    pub fn set_volume(&self, level: f32) -> Result<()> {
        self.command(Command::SetVolume(level))
    }

    // ── Directed commands ────────────────────────────────────────

    /// Query `peer` for its full state with the configured deadline.
    pub async fn query(&self, peer: PeerId) -> Result<StatePatch> {
        self.query_inner(peer, None).await
    }

    pub async fn query_with_timeout(&self, peer: PeerId, timeout: Duration) -> Result<StatePatch> {
        self.query_inner(peer, Some(timeout)).await
    }

    async fn query_inner(&self, peer: PeerId, timeout: Option<Duration>) -> Result<StatePatch> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Query {
            peer,
            timeout,
            reply,
        })?;
        rx.await?
    }

    /// Ask `peer` to change its own state.
    pub async fn send_modify(&self, peer: PeerId, patch: StatePatch) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Modify { peer, patch, reply })?;
        rx.await?
    }

    pub async fn start_remote_view(&self, peer: PeerId, sink: Arc<dyn ChunkSink>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::StartRemoteView { peer, sink, reply })?;
        rx.await?
    }

    pub async fn stop_remote_view(&self, peer: PeerId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::StopRemoteView { peer, reply })?;
        rx.await?
    }

    // ── Local preview ────────────────────────────────────────────

    pub async fn start_preview(&self, sink: Arc<dyn FrameSink>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::StartPreview { sink, reply })?;
        rx.await?
    }

    pub fn stop_preview(&self) -> Result<()> {
        self.command(Command::StopPreview)
    }

    // ── Inspection ───────────────────────────────────────────────

    /// Full snapshot of this device's state.
    pub async fn local_state(&self) -> Result<StatePatch> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::LocalState { reply })?;
        Ok(rx.await?)
    }

    /// Cached snapshot of `peer`, `None` if the peer is unknown.
    pub async fn peer_snapshot(&self, peer: PeerId) -> Result<Option<StatePatch>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::PeerSnapshot { peer, reply })?;
        Ok(rx.await?)
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Peers { reply })?;
        Ok(rx.await?)
    }

    /// Stop the control plane. Pending work is failed, capture released.
    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DevlinkError;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn query_waits_for_the_control_plane() {
        let (handle, mut inbox) = ControllerHandle::channel();
        let mut query = task::spawn(handle.query("bravo".into()));
        assert_pending!(query.poll());

        let reply = match inbox.try_recv() {
            Ok(ControlEvent::Command(Command::Query {
                peer,
                timeout: None,
                reply,
            })) => {
                assert_eq!(peer.as_str(), "bravo");
                reply
            }
            other => panic!("unexpected inbox entry: {other:?}"),
        };
        reply.send(Ok(StatePatch::bulb(true))).unwrap();

        assert!(query.is_woken());
        let state = assert_ready!(query.poll()).unwrap();
        assert_eq!(state.bulb, Some(true));
    }

    #[test]
    fn dropped_reply_is_channel_closed() {
        let (handle, mut inbox) = ControllerHandle::channel();
        let mut peers = task::spawn(handle.peers());
        assert_pending!(peers.poll());

        drop(inbox.try_recv().unwrap());

        assert!(matches!(
            assert_ready!(peers.poll()),
            Err(DevlinkError::ChannelClosed)
        ));
    }

    #[test]
    fn setters_fail_once_the_inbox_is_gone() {
        let (handle, inbox) = ControllerHandle::channel();
        drop(inbox);
        assert!(handle.is_closed());
        assert!(handle.set_bulb(true).is_err());
    }
}
