//! TCP implementation of [`Transport`] and [`SessionHandler`].
//!
//! One connection per peer carries both control payloads and media
//! chunks. Configured peers are dialed (and re-dialed) in the
//! background; inbound connections from unknown identities raise a
//! friend request and are dropped unless it is accepted.
//!
//! If both sides dial at once, the connection opened by the lower
//! peer id wins and the other one is closed with `Goodbye`.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::WireFrame;
use crate::engine::ControllerHandle;
use crate::error::{DevlinkError, Result};
use crate::network::connection::{
    self, Direction, FramedStream, LINK_QUEUE_DEPTH, LinkSender,
};
use crate::state::{PeerId, PeerInfo, PeerStatus};
use crate::transport::{SessionHandler, Transport, TransportEvent};

/// Default delay between dial attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

const GOODBYE_GRACE: Duration = Duration::from_millis(200);

/// A peer to dial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub id: PeerId,
    pub addr: String,
}

#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    pub id: PeerId,
    pub name: String,
    pub listen_addr: String,
    pub peers: Vec<PeerAddr>,
    pub retry_interval: Duration,
}

impl TcpTransportConfig {
    pub fn new(id: impl Into<PeerId>, listen_addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            listen_addr: listen_addr.into(),
            peers: Vec::new(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────

struct Link {
    tx: LinkSender,
    direction: Direction,
}

struct Shared {
    id: PeerId,
    name: Mutex<String>,
    links: Mutex<HashMap<PeerId, Link>>,
    friends: Mutex<HashSet<PeerId>>,
    playback: Mutex<HashSet<PeerId>>,
    events: ControllerHandle,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if self.events.transport_event(event).is_err() {
            debug!("controller gone; transport event dropped");
        }
    }

    fn link(&self, peer: &PeerId) -> Option<LinkSender> {
        lock(&self.links).get(peer).map(|l| l.tx.clone())
    }

    fn is_linked(&self, peer: &PeerId) -> bool {
        lock(&self.links).get(peer).is_some_and(|l| !l.tx.is_closed())
    }

    fn is_friend(&self, peer: &PeerId) -> bool {
        lock(&self.friends).contains(peer)
    }

    /// Connections opened by the lower id take precedence.
    fn preferred_direction(&self, remote: &PeerId) -> Direction {
        if self.id < *remote {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }

    /// Install a link. Returns `false` when an existing live link wins.
    fn register(&self, remote: &PeerId, direction: Direction, tx: LinkSender) -> bool {
        let mut links = lock(&self.links);
        if let Some(existing) = links.get(remote) {
            if !existing.tx.is_closed() {
                if direction != self.preferred_direction(remote) {
                    return false;
                }
                debug!(%remote, old = ?existing.direction, "replacing duplicate link");
                let _ = existing.tx.try_send(WireFrame::Goodbye);
            }
        }
        links.insert(remote.clone(), Link { tx, direction });
        true
    }

    /// Remove the link if it is still `tx`. Returns `true` if removed.
    fn unregister(&self, remote: &PeerId, tx: &LinkSender) -> bool {
        let mut links = lock(&self.links);
        if links.get(remote).is_some_and(|l| l.tx.same_channel(tx)) {
            links.remove(remote);
            true
        } else {
            false
        }
    }

    async fn ask_friend(&self, remote: &PeerId) -> bool {
        let (reply, answer) = oneshot::channel();
        self.emit(TransportEvent::FriendRequest {
            from: remote.clone(),
            name: remote.to_string(),
            reply,
        });
        let accepted = tokio::select! {
            _ = self.shutdown.cancelled() => false,
            answer = answer => answer.unwrap_or(false),
        };
        if accepted {
            lock(&self.friends).insert(remote.clone());
        }
        accepted
    }
}

// ── TcpTransport ─────────────────────────────────────────────────

/// TCP transport. Cheap to share behind an `Arc`.
pub struct TcpTransport {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind, announce the configured roster, and start dialing.
    pub async fn start(config: TcpTransportConfig, events: ControllerHandle) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(id = %config.id, %local_addr, "transport listening");

        let shared = Arc::new(Shared {
            id: config.id,
            name: Mutex::new(config.name),
            links: Mutex::new(HashMap::new()),
            friends: Mutex::new(config.peers.iter().map(|p| p.id.clone()).collect()),
            playback: Mutex::new(HashSet::new()),
            events,
            shutdown: CancellationToken::new(),
        });

        shared.emit(TransportEvent::ConnectionStatusChanged(PeerStatus::Connected));
        shared.emit(TransportEvent::PeerListChanged(
            config
                .peers
                .iter()
                .map(|p| PeerInfo::new(p.id.clone(), PeerStatus::Disconnected))
                .collect(),
        ));
        shared.emit(TransportEvent::Ready);

        let mut tasks = vec![tokio::spawn(accept_loop(Arc::clone(&shared), listener))];
        for peer in config.peers {
            tasks.push(tokio::spawn(dial_loop(
                Arc::clone(&shared),
                peer,
                config.retry_interval,
            )));
        }

        Ok(Arc::new(Self {
            shared,
            local_addr,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn id(&self) -> &PeerId {
        &self.shared.id
    }

    pub fn is_linked(&self, peer: &PeerId) -> bool {
        self.shared.is_linked(peer)
    }

    /// Say goodbye to every peer and stop all background work.
    pub fn shutdown(&self) {
        for (peer, link) in lock(&self.shared.links).iter() {
            if link.tx.try_send(WireFrame::Goodbye).is_err() {
                trace!(%peer, "goodbye not queued");
            }
        }
        self.shared.shutdown.cancel();
        self.shared
            .emit(TransportEvent::ConnectionStatusChanged(PeerStatus::Disconnected));
        info!("transport stopped");
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Transport for TcpTransport {
    fn send(&self, peer: &PeerId, payload: String) -> Result<()> {
        let link = self
            .shared
            .link(peer)
            .ok_or_else(|| DevlinkError::PeerUnreachable(peer.clone()))?;
        connection::enqueue(&link, peer, WireFrame::Message(payload))
    }

    fn self_name(&self) -> String {
        lock(&self.shared.name).clone()
    }

    fn set_self_name(&self, name: String) -> Result<()> {
        *lock(&self.shared.name) = name;
        Ok(())
    }
}

impl SessionHandler for TcpTransport {
    fn write_media(&self, peer: &PeerId, chunk: Bytes) -> Result<()> {
        let link = self
            .shared
            .link(peer)
            .ok_or_else(|| DevlinkError::PeerUnreachable(peer.clone()))?;
        connection::enqueue(&link, peer, WireFrame::Media(chunk))
    }

    fn open_playback(&self, peer: &PeerId) -> Result<()> {
        lock(&self.shared.playback).insert(peer.clone());
        Ok(())
    }

    fn close_playback(&self, peer: &PeerId) {
        lock(&self.shared.playback).remove(peer);
    }

    fn close_session(&self, peer: &PeerId) {
        if lock(&self.shared.playback).remove(peer) {
            debug!(%peer, "playback session closed");
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                trace!(%addr, "inbound connection");
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = serve_link(shared, stream, Direction::Inbound, None).await {
                        debug!(%addr, "inbound link ended: {e}");
                    }
                });
            }
            Err(e) => {
                warn!("accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn dial_loop(shared: Arc<Shared>, peer: PeerAddr, retry: Duration) {
    loop {
        if !shared.is_linked(&peer.id) {
            match TcpStream::connect(&peer.addr).await {
                Ok(stream) => {
                    let outcome =
                        serve_link(Arc::clone(&shared), stream, Direction::Outbound, Some(&peer.id))
                            .await;
                    if let Err(e) = outcome {
                        debug!(peer = %peer.id, "outbound link ended: {e}");
                    }
                }
                Err(e) => trace!(peer = %peer.id, addr = %peer.addr, "dial failed: {e}"),
            }
        }
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = tokio::time::sleep(retry) => {}
        }
    }
}

/// Run one connection from handshake to close.
async fn serve_link(
    shared: Arc<Shared>,
    stream: TcpStream,
    direction: Direction,
    expected: Option<&PeerId>,
) -> Result<()> {
    let mut framed = connection::frame(stream);
    let remote = connection::handshake(&mut framed, &shared.id).await?;

    if remote == shared.id {
        return Err(DevlinkError::Other("connected to self".into()));
    }
    if let Some(expected) = expected.filter(|e| **e != remote) {
        warn!(%expected, %remote, "dialed peer answered with another identity");
    }
    if direction == Direction::Inbound && !shared.is_friend(&remote) && !shared.ask_friend(&remote).await
    {
        info!(%remote, "friend request rejected");
        framed.send(WireFrame::Goodbye).await?;
        return Ok(());
    }

    let (tx, rx) = mpsc::channel(LINK_QUEUE_DEPTH);
    if !shared.register(&remote, direction, tx.clone()) {
        debug!(%remote, ?direction, "duplicate link dropped");
        framed.send(WireFrame::Goodbye).await?;
        return Ok(());
    }
    info!(%remote, ?direction, "link up");
    shared.emit(TransportEvent::PeerStatusChanged {
        peer: remote.clone(),
        status: PeerStatus::Connected,
    });

    let outcome = pump(&shared, &remote, framed, rx).await;

    if shared.unregister(&remote, &tx) {
        info!(%remote, "link down");
        shared.emit(TransportEvent::PeerStatusChanged {
            peer: remote,
            status: PeerStatus::Disconnected,
        });
    }
    outcome
}

/// Shuttle frames until either side closes.
async fn pump(
    shared: &Shared,
    remote: &PeerId,
    framed: FramedStream,
    mut rx: mpsc::Receiver<WireFrame>,
) -> Result<()> {
    let (mut sink, mut stream) = framed.split();

    // Writer: queued frames -> socket. Ends after sending Goodbye.
    let writer = async move {
        while let Some(frame) = rx.recv().await {
            let last = frame == WireFrame::Goodbye;
            sink.send(frame).await?;
            if last {
                break;
            }
        }
        sink.close().await
    };

    // Reader: socket -> controller.
    let reader = async {
        while let Some(frame) = stream.next().await {
            match frame? {
                WireFrame::Message(payload) => shared.emit(TransportEvent::MessageReceived {
                    from: remote.to_string(),
                    payload,
                }),
                WireFrame::Media(chunk) => {
                    if lock(&shared.playback).contains(remote) {
                        shared.emit(TransportEvent::MediaReceived {
                            from: remote.clone(),
                            chunk,
                        });
                    }
                }
                WireFrame::Goodbye => break,
                WireFrame::Hello(_) => trace!(%remote, "late hello ignored"),
            }
        }
        Ok::<(), DevlinkError>(())
    };

    tokio::pin!(writer);
    tokio::pin!(reader);
    tokio::select! {
        _ = shared.shutdown.cancelled() => {
            // Let a queued Goodbye reach the socket.
            let _ = tokio::time::timeout(GOODBYE_GRACE, &mut writer).await;
            Ok(())
        }
        written = &mut writer => written,
        read = &mut reader => read,
    }
}
