pub mod connection;
pub mod tcp;

pub use connection::{Direction, HANDSHAKE_TIMEOUT, LINK_QUEUE_DEPTH};
pub use tcp::{DEFAULT_RETRY_INTERVAL, PeerAddr, TcpTransport, TcpTransportConfig};
