#![warn(missing_docs)]

//! SnapMesh storage subsystem: ZFS dataset lifecycle, snapshot discovery, send/receive streams

pub mod backend;
pub mod cli;
pub mod error;
pub mod layout;
pub mod memory;
pub mod send;
pub mod types;

pub use backend::{ByteReader, SendStream, ZfsBackend};
pub use cli::ZfsCli;
pub use error::ZfsError;
pub use layout::DatasetLayout;
pub use memory::MemoryZfs;
pub use send::{parse_predicted_size, FromSnapshot, SendRange};
pub use types::{DirtyInfo, Filesystem, Origin, Snapshot, SnapshotMeta};
