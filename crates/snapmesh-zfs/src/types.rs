//! Filesystem and snapshot records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Free-form snapshot metadata (author, message, timestamp, ...).
pub type SnapshotMeta = BTreeMap<String, String>;

/// A point-in-time snapshot of a filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id, unique within its filesystem.
    pub id: String,
    /// Metadata attached when the snapshot was taken.
    #[serde(default)]
    pub metadata: SnapshotMeta,
}

impl Snapshot {
    /// A snapshot without metadata.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: SnapshotMeta::new(),
        }
    }

    /// Adds one metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Where a clone was taken from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    /// Parent filesystem id.
    pub filesystem_id: String,
    /// Parent snapshot id.
    pub snapshot_id: String,
}

impl Origin {
    /// Builds an origin.
    pub fn new(filesystem_id: impl Into<String>, snapshot_id: impl Into<String>) -> Self {
        Self {
            filesystem_id: filesystem_id.into(),
            snapshot_id: snapshot_id.into(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.filesystem_id, self.snapshot_id)
    }
}

/// Locally discovered state of one filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    /// Filesystem id.
    pub id: String,
    /// Whether the dataset exists on this node.
    pub exists: bool,
    /// Whether it is mounted at its mount point.
    pub mounted: bool,
    /// Snapshots in creation order.
    pub snapshots: Vec<Snapshot>,
    /// Set when the filesystem is a clone.
    pub origin: Option<Origin>,
}

impl Filesystem {
    /// Record for a filesystem that is not present locally.
    pub fn missing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            exists: false,
            mounted: false,
            snapshots: Vec::new(),
            origin: None,
        }
    }

    /// Most recent snapshot, if any.
    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    /// Whether a snapshot with this id exists.
    pub fn has_snapshot(&self, snapshot_id: &str) -> bool {
        self.snapshots.iter().any(|s| s.id == snapshot_id)
    }
}

/// Uncommitted-change accounting for a mounted filesystem.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyInfo {
    /// Bytes written since the latest snapshot.
    pub dirty_bytes: u64,
    /// Bytes referenced by the filesystem.
    pub size_bytes: u64,
}
