#![warn(missing_docs)]

//! SnapMesh coordination subsystem: CAS-capable key/value store with watch and prefix read

pub mod error;
pub mod etcd;
pub mod keys;
pub mod memory;
pub mod store;

pub use error::StoreError;
pub use etcd::EtcdStore;
pub use keys::{KeySpace, ParsedKey, DEFAULT_PREFIX};
pub use memory::MemoryStore;
pub use store::{CoordinationStore, KeyValue, Precondition, StoreExt, WatchEvent, WatchStream};
