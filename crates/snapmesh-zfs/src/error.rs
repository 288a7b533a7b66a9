//! Error types for the ZFS subsystem.

use thiserror::Error;

/// Errors raised while driving ZFS.
#[derive(Debug, Error)]
pub enum ZfsError {
    /// A `zfs` (or mount) command exited unsuccessfully.
    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        /// Command line that was run.
        command: String,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The named dataset does not exist.
    #[error("no such filesystem: {filesystem_id}")]
    NoSuchFilesystem {
        /// Filesystem id.
        filesystem_id: String,
    },

    /// The named snapshot does not exist.
    #[error("no such snapshot: {filesystem_id}@{snapshot_id}")]
    NoSuchSnapshot {
        /// Filesystem id.
        filesystem_id: String,
        /// Snapshot id.
        snapshot_id: String,
    },

    /// A receive could not be applied on top of the local dataset.
    #[error("cannot receive into {filesystem_id}: {reason}")]
    ReceiveRejected {
        /// Filesystem id.
        filesystem_id: String,
        /// Why the stream was refused.
        reason: String,
    },

    /// Command output could not be understood.
    #[error("unexpected output from {command}: {output}")]
    Parse {
        /// Command whose output was parsed.
        command: String,
        /// Offending output.
        output: String,
    },

    /// I/O error while spawning or piping a subprocess.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
