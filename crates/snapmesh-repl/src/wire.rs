//! JSON RPC envelope shared by nodes and clients.
//!
//! Requests are tagged by method name:
//!
//! ```json
//! {"method": "SnapshotsById", "params": {"filesystem_id": "..."}}
//! ```
//!
//! Responses carry either a `result` or an `error` with a stable name.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snapmesh_zfs::{FromSnapshot, SnapshotMeta};

use crate::error::ReplError;
use crate::path::{PathToTopLevelFilesystem, VolumeName};
use crate::transfer::{TransferPollResult, TransferRequest};

/// One RPC call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RpcRequest {
    /// Creates a top-level filesystem; result: filesystem id.
    Create {
        /// Name to register.
        name: VolumeName,
    },
    /// Result: filesystem id, or null when unknown.
    Exists {
        /// Top-level name.
        name: VolumeName,
        /// Clone name, empty for the top level.
        #[serde(default)]
        clone_name: String,
    },
    /// Result: filesystem id; error when unknown.
    Lookup {
        /// Top-level name.
        name: VolumeName,
        /// Clone name, empty for the top level.
        #[serde(default)]
        clone_name: String,
    },
    /// Result: every top-level filesystem with its master.
    List,
    /// Result: clones of a top-level filesystem.
    Clones {
        /// Top-level name.
        name: VolumeName,
    },
    /// Result: snapshots of a named filesystem, from its master.
    Snapshots {
        /// Top-level name.
        name: VolumeName,
        /// Clone name, empty for the top level.
        #[serde(default)]
        clone_name: String,
    },
    /// Result: snapshots of a filesystem as seen by its master.
    SnapshotsById {
        /// Filesystem id.
        filesystem_id: String,
    },
    /// Takes a snapshot; result: snapshot id.
    Snapshot {
        /// Top-level name.
        name: VolumeName,
        /// Clone name, empty for the top level.
        #[serde(default)]
        clone_name: String,
        /// Metadata (message, author, ...).
        #[serde(default)]
        metadata: SnapshotMeta,
    },
    /// Rolls back to a snapshot.
    Rollback {
        /// Top-level name.
        name: VolumeName,
        /// Clone name, empty for the top level.
        #[serde(default)]
        clone_name: String,
        /// Snapshot to roll back to.
        snapshot_id: String,
    },
    /// Clones a snapshot into a new named clone; result: filesystem id.
    #[serde(rename = "Clone")]
    Branch {
        /// Top-level name.
        name: VolumeName,
        /// Clone holding the origin snapshot, empty for the top level.
        #[serde(default)]
        source_clone_name: String,
        /// Origin snapshot.
        snapshot_id: String,
        /// Name of the new clone.
        new_clone_name: String,
    },
    /// Moves mastership of a filesystem to the called node; result: filesystem id.
    Procure {
        /// Top-level name.
        name: VolumeName,
        /// Clone name, empty for the top level.
        #[serde(default)]
        clone_name: String,
    },
    /// Starts a push or pull; result: transfer id.
    Transfer {
        /// What to transfer.
        request: TransferRequest,
    },
    /// Announces an incoming transfer to its peer.
    RegisterTransfer {
        /// Initial record of the transfer.
        poll: TransferPollResult,
    },
    /// Result: the transfer record.
    GetTransfer {
        /// Transfer id.
        transfer_id: String,
    },
    /// Result: the clone ancestry of a named filesystem.
    DeducePathToTopLevelFilesystem {
        /// Top-level name.
        name: VolumeName,
        /// Clone name, empty for the top level.
        #[serde(default)]
        clone_name: String,
    },
    /// Registers a path received from another cluster.
    RegisterFilesystem {
        /// Path to register.
        path: PathToTopLevelFilesystem,
        /// Claim mastership of every filesystem on the path that has none.
        #[serde(default)]
        become_master_if_not_exists: bool,
    },
    /// Result: predicted stream size in bytes.
    PredictSize {
        /// Filesystem to send.
        filesystem_id: String,
        /// Base of the stream.
        from: FromSnapshot,
        /// Last snapshot to send.
        to_snapshot: String,
    },
}

impl RpcRequest {
    /// Method name as it appears on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::Create { .. } => "Create",
            RpcRequest::Exists { .. } => "Exists",
            RpcRequest::Lookup { .. } => "Lookup",
            RpcRequest::List => "List",
            RpcRequest::Clones { .. } => "Clones",
            RpcRequest::Snapshots { .. } => "Snapshots",
            RpcRequest::SnapshotsById { .. } => "SnapshotsById",
            RpcRequest::Snapshot { .. } => "Snapshot",
            RpcRequest::Rollback { .. } => "Rollback",
            RpcRequest::Branch { .. } => "Clone",
            RpcRequest::Procure { .. } => "Procure",
            RpcRequest::Transfer { .. } => "Transfer",
            RpcRequest::RegisterTransfer { .. } => "RegisterTransfer",
            RpcRequest::GetTransfer { .. } => "GetTransfer",
            RpcRequest::DeducePathToTopLevelFilesystem { .. } => "DeducePathToTopLevelFilesystem",
            RpcRequest::RegisterFilesystem { .. } => "RegisterFilesystem",
            RpcRequest::PredictSize { .. } => "PredictSize",
        }
    }
}

/// Typed error carried in a response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    /// Stable kebab-case name.
    pub name: String,
    /// Detail for humans.
    pub message: String,
}

/// Envelope of an RPC answer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Success value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Successful answer.
    pub fn ok<T: Serialize>(value: &T) -> Result<Self, ReplError> {
        Ok(Self {
            result: Some(serde_json::to_value(value)?),
            error: None,
        })
    }

    /// Failed answer.
    pub fn err(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(RpcError {
                name: name.into(),
                message: message.into(),
            }),
        }
    }

    /// Decodes the result, or turns the error into [`ReplError::Rpc`].
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, ReplError> {
        if let Some(RpcError { name, message }) = self.error {
            return Err(ReplError::Rpc { name, message });
        }
        Ok(serde_json::from_value(self.result.unwrap_or(Value::Null))?)
    }
}

/// A top-level filesystem as listed by [`RpcRequest::List`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemSummary {
    /// Registered name.
    pub name: VolumeName,
    /// Filesystem id.
    pub filesystem_id: String,
    /// Current master node, if any.
    pub master: Option<String>,
}
