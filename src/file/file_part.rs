use crate::object::ObjectType;
use serde::{Deserialize, Serialize};

/// One chunk of a file in flight. Immutable once constructed; every part
/// except possibly the last carries exactly the sender's buffer size worth
/// of data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePartObj {
    pub file_name: String,
    /// Original path on the sending side. Used as part of the transfer
    /// identity, never as a filesystem path on the receiver.
    pub file_path: String,
    /// 1-based part number.
    pub part_num: u64,
    pub total_parts: u64,
    pub data: Vec<u8>,
}

impl ObjectType for FilePartObj {
    const OBJECT_TYPE: &'static str = "FilePartObj";
}

/// Acknowledgment for one received part, sent back to the file's source.
/// The sender matches it against its open transfers to release the next
/// part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMessage {
    pub file_name: String,
    pub file_path: String,
    pub part_num: u64,
}

impl AckMessage {
    pub fn new(part: &FilePartObj) -> Self {
        Self {
            file_name: part.file_name.clone(),
            file_path: part.file_path.clone(),
            part_num: part.part_num,
        }
    }
}

impl ObjectType for AckMessage {
    const OBJECT_TYPE: &'static str = "AckMessage";
}
