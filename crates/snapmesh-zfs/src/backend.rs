//! The seam between the state machines and the storage layer.

use std::pin::Pin;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::AsyncRead;

use crate::error::ZfsError;
use crate::send::SendRange;
use crate::types::{DirtyInfo, Filesystem, Origin, Snapshot};

/// Owned byte stream.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// A running send: read `reader` to the end, then await `completion` for the
/// subprocess outcome.
pub struct SendStream {
    /// Stream bytes.
    pub reader: ByteReader,
    /// Resolves once the producer has exited.
    pub completion: BoxFuture<'static, Result<(), ZfsError>>,
}

/// Local dataset operations needed by a node.
#[async_trait]
pub trait ZfsBackend: Send + Sync {
    /// Reads existence, mount state, snapshots and origin of a filesystem.
    async fn discover(&self, filesystem_id: &str) -> Result<Filesystem, ZfsError>;

    /// Ids of every managed filesystem present on this node.
    async fn list_filesystems(&self) -> Result<Vec<String>, ZfsError>;

    /// Creates an empty filesystem.
    async fn create(&self, filesystem_id: &str) -> Result<(), ZfsError>;

    /// Mounts a filesystem at its mount point.
    async fn mount(&self, filesystem_id: &str) -> Result<(), ZfsError>;

    /// Unmounts a filesystem.
    async fn unmount(&self, filesystem_id: &str) -> Result<(), ZfsError>;

    /// Takes a snapshot carrying `snapshot.metadata`.
    async fn snapshot(&self, filesystem_id: &str, snapshot: &Snapshot) -> Result<(), ZfsError>;

    /// Rolls back to a snapshot, destroying every later one.
    async fn rollback(&self, filesystem_id: &str, snapshot_id: &str) -> Result<(), ZfsError>;

    /// Creates `new_filesystem_id` as a clone of `origin`.
    async fn clone_snapshot(&self, origin: &Origin, new_filesystem_id: &str) -> Result<(), ZfsError>;

    /// Estimated stream size in bytes.
    async fn predict_size(&self, range: &SendRange) -> Result<u64, ZfsError>;

    /// Starts producing a send stream.
    async fn send(&self, range: &SendRange) -> Result<SendStream, ZfsError>;

    /// Consumes a send stream into `filesystem_id`.
    async fn receive(
        &self,
        filesystem_id: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), ZfsError>;

    /// Re-applies snapshot metadata lost in transit.
    async fn apply_metadata(
        &self,
        filesystem_id: &str,
        snapshots: &[Snapshot],
    ) -> Result<(), ZfsError>;

    /// Bytes written since the latest snapshot, and total size.
    async fn dirty(&self, filesystem_id: &str) -> Result<DirtyInfo, ZfsError>;
}
