pub mod file_part;
pub mod manager;
pub(crate) mod transfer;

pub use file_part::{AckMessage, FilePartObj};
pub use manager::{FileManager, FileManagerConfig};
