//! Error types for the node server.

use snapmesh_repl::ReplError;
use snapmesh_store::StoreError;
use snapmesh_zfs::ZfsError;
use thiserror::Error;

use crate::event::FsmError;

/// Errors raised by node operations outside the state machines.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Named entity does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// Named entity is already registered.
    #[error("already exists: {what}")]
    AlreadyExists {
        /// What clashed.
        what: String,
    },

    /// Request was rejected before doing anything.
    #[error("invalid request: {msg}")]
    Invalid {
        /// Why.
        msg: String,
    },

    /// A wait gave up.
    #[error("timed out: {what}")]
    Timeout {
        /// What was awaited.
        what: String,
    },

    /// The filesystem changed master while a forwarded command was waiting.
    #[error("master of {filesystem_id} is no longer {master}")]
    MasterChanged {
        /// Filesystem the command was for.
        filesystem_id: String,
        /// Node the command was forwarded to.
        master: String,
    },

    /// A state machine answered with an error.
    #[error(transparent)]
    Fsm(#[from] FsmError),

    /// A state machine answered with an unexpected success.
    #[error("unexpected reply to {command}: {outcome}")]
    UnexpectedReply {
        /// Command sent.
        command: String,
        /// Outcome received.
        outcome: String,
    },

    /// Coordination store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Local ZFS failure.
    #[error(transparent)]
    Zfs(#[from] ZfsError),

    /// Replication or peer failure.
    #[error(transparent)]
    Repl(#[from] ReplError),

    /// Container runtime failure.
    #[error("container runtime: {msg}")]
    Containers {
        /// Detail.
        msg: String,
    },

    /// JSON encoding or decoding error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Stable kebab-case name used in RPC error replies.
    pub fn name(&self) -> &str {
        match self {
            ServerError::NotFound { .. } => "not-found",
            ServerError::AlreadyExists { .. } => "already-exists",
            ServerError::Invalid { .. } => "invalid-request",
            ServerError::Timeout { .. } => "timeout",
            ServerError::MasterChanged { .. } => "master-changed",
            ServerError::Fsm(e) => e.event_name(),
            ServerError::UnexpectedReply { .. } => "unexpected-reply",
            ServerError::Repl(e) => e.name(),
            ServerError::Store(_) => "store-error",
            ServerError::Zfs(_) => "zfs-error",
            ServerError::Containers { .. } => "container-error",
            ServerError::Json(_) | ServerError::Io(_) => "internal-error",
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        ServerError::NotFound { what: what.into() }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ServerError::Invalid { msg: msg.into() }
    }
}
