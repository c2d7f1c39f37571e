use crate::object::{BObject, Metadata};
use crate::transport::PeerInfo;

/// Direction of a file transfer progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Sending a file
    Send,
    /// Receiving a file
    Receive,
}

/// Snapshot of one transfer's position, carried by progress events.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// The other endpoint of the transfer.
    pub remote_ip: String,
    pub file_name: String,
    /// Original path on the sending side, used as part of the transfer key.
    pub file_path: String,
    /// 1-based number of the part just sent or written.
    pub part_num: u64,
    pub total_parts: u64,
}

impl TransferProgress {
    /// Fraction of the transfer completed, in percent.
    pub fn percent_complete(&self) -> f32 {
        (self.part_num as f32 / self.total_parts as f32) * 100.0
    }
}

/// Events emitted by the stack, one per state transition, in transition
/// order. Delivered on the channel returned by
/// [`FileManager::new`](crate::file::FileManager::new).
#[derive(Debug, Clone)]
pub enum P2pEvent {
    /// The peer registry changed (a peer was added or removed). Carries the
    /// full current snapshot.
    PeerChange { peers: Vec<PeerInfo> },
    /// A decoded application object arrived.
    ObjReceived { object: BObject, metadata: Metadata },
    /// A new inbound file transfer began (part 1 observed).
    FileReceived {
        source_ip: String,
        file_name: String,
        total_parts: u64,
    },
    /// A file part was sent or received.
    FileProgUpdate {
        direction: TransferDirection,
        progress: TransferProgress,
    },
}
