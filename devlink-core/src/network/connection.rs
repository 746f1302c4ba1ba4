use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::codec::{PeerCodec, WireFrame};
use crate::error::{DevlinkError, Result};
use crate::state::PeerId;

/// How long the remote has to answer our `Hello`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames queued per link before sends start failing.
pub const LINK_QUEUE_DEPTH: usize = 256;

pub(crate) type FramedStream = Framed<TcpStream, PeerCodec>;

/// Writer half of a link, as seen by everyone except the link task.
pub(crate) type LinkSender = mpsc::Sender<WireFrame>;

/// Which side opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

pub(crate) fn frame(stream: TcpStream) -> FramedStream {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed: {e}");
    }
    Framed::new(stream, PeerCodec::new())
}

/// Exchange `Hello`s. Returns the remote identity.
pub(crate) async fn handshake(framed: &mut FramedStream, local: &PeerId) -> Result<PeerId> {
    framed.send(WireFrame::Hello(local.clone())).await?;

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(WireFrame::Hello(remote)))) if remote.is_bare() => Ok(remote),
        Ok(Some(Ok(WireFrame::Hello(remote)))) => Err(DevlinkError::Decode(format!(
            "invalid peer id {remote:?}"
        ))),
        Ok(Some(Ok(other))) => Err(DevlinkError::Decode(format!(
            "expected hello, got {other:?}"
        ))),
        Ok(Some(Err(e))) => Err(e),
        Ok(None) => Err(DevlinkError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "closed during handshake",
        ))),
        Err(_) => Err(DevlinkError::RequestTimeout(HANDSHAKE_TIMEOUT)),
    }
}

/// Non-blocking enqueue on a link.
pub(crate) fn enqueue(link: &LinkSender, peer: &PeerId, frame: WireFrame) -> Result<()> {
    link.try_send(frame).map_err(|e| {
        let reason = match e {
            mpsc::error::TrySendError::Full(_) => "send queue full",
            mpsc::error::TrySendError::Closed(_) => "link closed",
        };
        DevlinkError::Delivery {
            peer: peer.clone(),
            reason: reason.into(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn handshake_exchanges_identities() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = frame(stream);
            handshake(&mut framed, &"server".into()).await.unwrap()
        });

        let mut client = frame(TcpStream::connect(addr).await.unwrap());
        let remote = handshake(&mut client, &"client".into()).await.unwrap();

        assert_eq!(remote.as_str(), "server");
        assert_eq!(server.await.unwrap().as_str(), "client");
    }

    #[tokio::test]
    async fn handshake_rejects_non_hello() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = frame(stream);
            framed.send(WireFrame::Goodbye).await.unwrap();
            // Keep the socket open until the client has read.
            let _ = framed.next().await;
        });

        let mut client = frame(TcpStream::connect(addr).await.unwrap());
        assert!(matches!(
            handshake(&mut client, &"client".into()).await,
            Err(DevlinkError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn handshake_rejects_suffixed_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = frame(stream);
            let _ = handshake(&mut framed, &"alice@home".into()).await;
        });

        let mut client = frame(TcpStream::connect(addr).await.unwrap());
        assert!(matches!(
            handshake(&mut client, &"client".into()).await,
            Err(DevlinkError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn full_queue_is_a_delivery_error() {
        let (tx, _rx) = mpsc::channel(1);
        let peer = PeerId::from("p");
        enqueue(&tx, &peer, WireFrame::Goodbye).unwrap();
        assert!(matches!(
            enqueue(&tx, &peer, WireFrame::Goodbye),
            Err(DevlinkError::Delivery { .. })
        ));
    }
}
