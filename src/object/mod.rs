pub mod manager;
pub mod metadata;

pub use manager::ObjectManager;
pub use metadata::{BObject, Metadata, ObjectType};
