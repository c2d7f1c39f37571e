use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Gives a payload type the string tag it is identified by on the wire.
/// The receiver uses the tag to pick a concrete type for decoding.
pub trait ObjectType {
    const OBJECT_TYPE: &'static str;
}

/// Envelope accompanying every application message.
///
/// Created fresh per outbound message and consumed once per inbound
/// message; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Tag identifying the payload kind.
    pub object_type: String,
    /// Declared payload length. Tells the receiver where the message ends,
    /// and in two-way mode lets it reject the message on size alone.
    pub total_msg_size_bytes: u64,
    /// When set, the sender expects the receiver to accept or reject the
    /// message based on the declared size before decoding the body.
    pub is_two_way: bool,
    /// Address of the sending peer. Filled in by the receiving side from
    /// the connection; never trusted from the wire.
    #[serde(skip)]
    pub source_ip: String,
}

impl Metadata {
    pub(crate) fn outbound(object_type: &str, payload_len: usize, is_two_way: bool) -> Self {
        Self {
            object_type: object_type.to_string(),
            total_msg_size_bytes: payload_len as u64,
            is_two_way,
            source_ip: String::new(),
        }
    }
}

/// A decoded inbound payload paired with its type tag and raw bytes. The
/// consumer requests a typed decode with [`get_object`](Self::get_object).
#[derive(Debug, Clone)]
pub struct BObject {
    object_type: String,
    payload: Vec<u8>,
}

impl BObject {
    pub(crate) fn new(object_type: String, payload: Vec<u8>) -> Self {
        Self {
            object_type,
            payload,
        }
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload as `T`.
    pub fn get_object<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }
}
