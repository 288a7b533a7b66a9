#![warn(missing_docs)]

//! SnapMesh replication subsystem: Snapshot reconciliation, stream prelude, transfer ledger, peer HTTP client

pub mod client;
pub mod error;
pub mod ledger;
pub mod path;
pub mod prelude;
pub mod progress;
pub mod reconcile;
pub mod retry;
pub mod transfer;
pub mod wire;

pub use client::{PeerClient, DEFAULT_PORT};
pub use error::ReplError;
pub use ledger::{LedgerEntry, TransferLedger};
pub use path::{
    is_top_level_clone_name, CloneWithName, FilesystemClone, PathSegment, PathToTopLevelFilesystem,
    VolumeName, DEFAULT_NAMESPACE,
};
pub use prelude::Prelude;
pub use progress::{format_progress, ByteCounter, ProgressReader};
pub use reconcile::{can_apply, restrict_snapshots, Reconciliation};
pub use retry::RetryPolicy;
pub use transfer::{TransferDirection, TransferPollResult, TransferRequest, TransferStatus};
pub use wire::{FilesystemSummary, RpcError, RpcRequest, RpcResponse};
