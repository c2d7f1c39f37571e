//! Serverless peer-to-peer networking for local networks.
//!
//! The stack has three layers, each built on the one below:
//!
//! - [`transport`] — peer discovery over UDP broadcast, a registry of live
//!   TCP connections, and reliable point-to-point byte delivery.
//! - [`object`] — framing of typed payloads with a metadata envelope so a
//!   receiver can decode heterogeneous message types from one stream.
//! - [`file`] — a stop-and-wait chunked file transfer protocol with
//!   per-part acknowledgment and progress reporting.
//!
//! Most applications only interact with [`file::FileManager`], which
//! composes the whole stack and surfaces everything that happens as
//! [`P2pEvent`]s on a channel:
//!
//! ```no_run
//! use lanlink::file::{FileManager, FileManagerConfig};
//!
//! # async fn run() -> lanlink::Result<()> {
//! let (manager, mut events) = FileManager::new(FileManagerConfig::default());
//! manager.enable_automatic_discovery(std::time::Duration::from_secs(1));
//! manager.start().await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod events;
pub mod file;
pub mod object;
pub mod transport;

pub use error::{Error, Result};
pub use events::{P2pEvent, TransferDirection, TransferProgress};
pub use file::{FileManager, FileManagerConfig};
pub use object::{BObject, Metadata, ObjectType};
pub use transport::PeerInfo;
