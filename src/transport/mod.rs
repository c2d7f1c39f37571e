pub mod base_station;
pub mod heartbeat;
pub mod interface;
pub mod listener;
pub mod peer;
pub mod peer_manager;

pub use base_station::BaseStation;
pub use heartbeat::HeartBeat;
pub use listener::Listener;
pub use peer::{Peer, PeerInfo};
pub use peer_manager::PeerManager;

/// Which channel a raw inbound message arrived on. Only broadcast (UDP)
/// arrivals trigger automatic peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Tcp,
    Udp,
}

/// A raw byte message handed up to the object layer.
#[derive(Debug)]
pub struct InboundMessage {
    pub source_ip: String,
    pub channel: Channel,
    pub payload: Vec<u8>,
}
