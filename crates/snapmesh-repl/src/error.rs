//! Error types for the replication subsystem.

use snapmesh_store::StoreError;
use snapmesh_zfs::ZfsError;
use thiserror::Error;

/// Errors that can occur while replicating between nodes.
#[derive(Debug, Error)]
pub enum ReplError {
    /// HTTP transport error talking to a peer.
    #[error("peer request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Peer answered with an unexpected HTTP status.
    #[error("peer {url} answered {status}: {body}")]
    PeerStatus {
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body, if readable.
        body: String,
    },

    /// Peer answered an RPC with a typed error.
    #[error("{name}: {message}")]
    Rpc {
        /// Stable kebab-case error name.
        name: String,
        /// Human-readable detail.
        message: String,
    },

    /// Stream prelude is missing or malformed.
    #[error("invalid prelude: {msg}")]
    Prelude {
        /// What was wrong with it.
        msg: String,
    },

    /// Requested snapshot is not part of the filesystem.
    #[error("no such snapshot: {snapshot_id}")]
    NoSuchSnapshot {
        /// Snapshot id.
        snapshot_id: String,
    },

    /// JSON encoding or decoding error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local ZFS operation failed.
    #[error(transparent)]
    Zfs(#[from] ZfsError),

    /// Coordination store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplError {
    /// Stable name of the error, used when it crosses the wire.
    pub fn name(&self) -> &str {
        match self {
            ReplError::Rpc { name, .. } => name,
            ReplError::NoSuchSnapshot { .. } => "no-such-snapshot",
            ReplError::PeerStatus { .. } | ReplError::Http(_) => "peer-error",
            ReplError::Prelude { .. } => "invalid-prelude",
            _ => "error",
        }
    }
}
