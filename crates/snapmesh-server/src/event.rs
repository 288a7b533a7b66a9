//! Commands accepted by filesystem state machines and the replies they produce.
//!
//! Every command travels with a [`Responder`]; the state that consumes the
//! request answers it exactly once.

use serde::{Deserialize, Serialize};
use snapmesh_repl::{TransferPollResult, TransferRequest};
use snapmesh_zfs::SnapshotMeta;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Inbound command for one filesystem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum Command {
    /// Provision the filesystem and mount it.
    Create,
    /// Mount the filesystem.
    Mount,
    /// Unmount the filesystem.
    Unmount,
    /// Take a snapshot.
    Snapshot {
        /// Metadata to attach.
        #[serde(default)]
        metadata: SnapshotMeta,
    },
    /// Roll back to a snapshot.
    Rollback {
        /// Snapshot to keep as the latest.
        snapshot_id: String,
    },
    /// Clone a snapshot of this filesystem.
    Clone {
        /// Top-level filesystem the clone belongs to.
        top_level_filesystem_id: String,
        /// Snapshot to clone.
        origin_snapshot_id: String,
        /// Name of the new clone.
        clone_name: String,
    },
    /// Hand mastership to another node.
    Move {
        /// Node taking over.
        target: String,
    },
    /// Push to or pull from another cluster, initiated here.
    Transfer {
        /// Transfer id.
        transfer_id: String,
        /// What to transfer.
        request: TransferRequest,
    },
    /// Take part in a transfer initiated by another cluster.
    PeerTransfer {
        /// The initiator's record of the transfer.
        transfer: TransferPollResult,
    },
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Create => "create",
            Command::Mount => "mount",
            Command::Unmount => "unmount",
            Command::Snapshot { .. } => "snapshot",
            Command::Rollback { .. } => "rollback",
            Command::Clone { .. } => "clone",
            Command::Move { .. } => "move",
            Command::Transfer { .. } => "transfer",
            Command::PeerTransfer { .. } => "peer-transfer",
        }
    }

    /// Whether the command may run for as long as a transfer takes.
    pub fn is_long_running(&self) -> bool {
        matches!(self, Command::Transfer { .. } | Command::PeerTransfer { .. })
    }
}

/// Successful reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum Outcome {
    /// Filesystem provisioned and mounted.
    Created,
    /// Filesystem mounted.
    Mounted,
    /// Filesystem unmounted.
    Unmounted,
    /// Snapshot taken.
    Snapshotted {
        /// New snapshot id.
        snapshot_id: String,
    },
    /// Rolled back.
    RolledBack,
    /// Clone created.
    Cloned {
        /// New filesystem id.
        filesystem_id: String,
    },
    /// Mastership handed over.
    Moved,
    /// Every segment was pushed.
    FinishedPush,
    /// Every segment was pulled.
    FinishedPull,
    /// Nothing needed sending.
    PeerUpToDate,
    /// A push from another cluster landed here.
    ReceivingPushComplete,
    /// Ready to serve a pull to another cluster.
    ProvidingPull,
}

/// Typed failure reply.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum FsmError {
    /// Containers are using the filesystem.
    #[error("cannot move while containers are running: {containers:?}")]
    CannotMoveWhileContainersRunning {
        /// Attached containers.
        containers: Vec<String>,
    },
    /// Containers are using the filesystem.
    #[error("cannot unmount while containers are running: {containers:?}")]
    CannotUnmountWhileContainersRunning {
        /// Attached containers.
        containers: Vec<String>,
    },
    /// Containers are using the filesystem.
    #[error("cannot pull while containers are running: {containers:?}")]
    CannotPullWhileContainersRunning {
        /// Attached containers.
        containers: Vec<String>,
    },
    /// Containers are using the filesystem.
    #[error("cannot receive a push while containers are running: {containers:?}")]
    CannotReceivePushWhileContainersRunning {
        /// Attached containers.
        containers: Vec<String>,
    },
    /// The machine is handing mastership off.
    #[error("busy handing off mastership")]
    BusyHandoff,
    /// Nothing to push from.
    #[error("cannot push a filesystem that is not present on this node")]
    CantPushWhileMissing,
    /// Nothing to serve.
    #[error("cannot provide a pull for a filesystem that is not present on this node")]
    CantProvidePullWhileMissing,
    /// Unknown snapshot.
    #[error("no such snapshot: {snapshot_id}")]
    NoSuchSnapshot {
        /// Requested snapshot.
        snapshot_id: String,
    },
    /// The current state does not accept the command.
    #[error("{event} is not handled in state {state}")]
    Unhandled {
        /// State that received the command.
        state: String,
        /// Command name.
        event: String,
    },
    /// An expected pushed snapshot never arrived.
    #[error("timed out waiting for snapshot {snapshot_id} to be pushed")]
    TimedOutExternalSnaps {
        /// Awaited snapshot.
        snapshot_id: String,
    },
    /// The handoff target did not catch up in time.
    #[error("timed out handing off to {target}")]
    HandoffTimedOut {
        /// Node that was to take over.
        target: String,
    },
    /// The receiving side lacks the snapshot a clone was taken from.
    #[error("clone origin {filesystem_id}@{snapshot_id} is not present on the receiving side")]
    CloneOriginMissing {
        /// Origin filesystem.
        filesystem_id: String,
        /// Origin snapshot.
        snapshot_id: String,
    },
    /// Source has no snapshots.
    #[error("{filesystem_id} has no snapshots to transfer")]
    NothingToTransfer {
        /// Filesystem id.
        filesystem_id: String,
    },
    /// The two histories cannot be reconciled by a fast-forward.
    #[error("cannot fast-forward {filesystem_id}: {outcome}")]
    HistoriesDiverged {
        /// Filesystem id.
        filesystem_id: String,
        /// Reconciliation outcome name.
        outcome: String,
    },
    /// A transfer attempt failed.
    #[error("transfer failed: {message}")]
    Transfer {
        /// Detail.
        message: String,
    },
    /// Retries are exhausted.
    #[error("maximum retry attempts exceeded: {last_error}")]
    MaximumRetryAttemptsExceeded {
        /// Error of the final attempt.
        last_error: String,
    },
    /// A local operation failed.
    #[error("{operation} failed: {message}")]
    Failed {
        /// Operation name.
        operation: String,
        /// Detail.
        message: String,
    },
}

impl FsmError {
    /// Stable kebab-case name, as carried on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            FsmError::CannotMoveWhileContainersRunning { .. } => {
                "cannot-move-while-containers-running"
            }
            FsmError::CannotUnmountWhileContainersRunning { .. } => {
                "cannot-unmount-while-containers-running"
            }
            FsmError::CannotPullWhileContainersRunning { .. } => {
                "cannot-pull-while-containers-running"
            }
            FsmError::CannotReceivePushWhileContainersRunning { .. } => {
                "cannot-receive-push-while-containers-running"
            }
            FsmError::BusyHandoff => "busy-handoff",
            FsmError::CantPushWhileMissing => "cant-push-while-missing",
            FsmError::CantProvidePullWhileMissing => "cant-provide-pull-while-missing",
            FsmError::NoSuchSnapshot { .. } => "no-such-snapshot",
            FsmError::Unhandled { .. } => "unhandled",
            FsmError::TimedOutExternalSnaps { .. } => "timed-out-external-snaps",
            FsmError::HandoffTimedOut { .. } => "handoff-timed-out",
            FsmError::CloneOriginMissing { .. } => "clone-origin-missing",
            FsmError::NothingToTransfer { .. } => "nothing-to-transfer",
            FsmError::HistoriesDiverged { .. } => "histories-diverged",
            FsmError::Transfer { .. } => "transfer",
            FsmError::MaximumRetryAttemptsExceeded { .. } => "maximum-retry-attempts-exceeded",
            FsmError::Failed { .. } => "failed",
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FsmError::Transfer { .. } | FsmError::Failed { .. })
    }

    /// Wraps a lower-level error from `operation`.
    pub fn failed(operation: &str, err: impl std::fmt::Display) -> Self {
        FsmError::Failed {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }
}

/// What a state machine answers.
pub type Reply = Result<Outcome, FsmError>;

/// Single-use completion handle for one request.
#[derive(Debug)]
pub struct Responder(oneshot::Sender<Reply>);

impl Responder {
    /// Handle and the receiver its reply will arrive on.
    pub fn channel() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Answers the request.
    pub fn respond(self, reply: Reply) {
        if self.0.send(reply).is_err() {
            debug!("requester went away before the reply");
        }
    }
}

/// A command with its completion handle.
#[derive(Debug)]
pub struct Request {
    /// What to do.
    pub command: Command,
    /// Where the answer goes.
    pub responder: Responder,
}
