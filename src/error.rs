use thiserror::Error;

/// Errors surfaced by the networking stack.
///
/// "Not found" conditions (an unmatched ack, a send to an unknown address)
/// are routine outcomes in a live protocol and are returned as values, never
/// panics. No operation retries automatically; a failed send or connect is
/// terminal for that operation and must be retried by the caller if desired.
#[derive(Debug, Error)]
pub enum Error {
    /// A named file cannot be opened for sending, or an inbound ack/part
    /// cannot be matched against any registered transfer.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// A unicast TCP send targeted the local address, or an address that
    /// could not be reached with an on-demand connect.
    #[error("peer not known: {0}")]
    PeerNotKnown(String),

    /// No connected network interface was available at start-up.
    #[error("no connected network interface found")]
    NoNetworkInterface,

    /// A transfer stalled waiting for an acknowledgment.
    #[error("transfer timed out: {0}")]
    Timeout(String),

    /// An inbound frame did not match the envelope format.
    #[error("malformed message envelope: {0}")]
    Envelope(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("object codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
