mod device;
mod pending;
pub mod roster;

pub use device::{LocalDeviceState, clamp_level};
pub use pending::{PendingRequest, PendingSlot, QueryCallback, QueryResult};
pub use roster::{Peer, PeerId, PeerInfo, PeerRoster, PeerStatus};
