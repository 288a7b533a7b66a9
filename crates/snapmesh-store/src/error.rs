//! Error types for the coordination store.

use thiserror::Error;

/// Errors returned by a [`crate::CoordinationStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional write lost because the key did not hold the expected value.
    #[error("precondition failed for key {key}")]
    PreconditionFailed {
        /// Key whose precondition did not hold.
        key: String,
    },

    /// The backing service could not be reached or refused the request.
    #[error("coordination store unavailable: {msg}")]
    Unavailable {
        /// Description of the failure.
        msg: String,
    },

    /// A watch stream ended or fell too far behind to be trusted.
    #[error("watch on {prefix} interrupted: {msg}")]
    WatchInterrupted {
        /// Prefix being watched.
        prefix: String,
        /// Why the watch stopped.
        msg: String,
    },

    /// A stored value could not be decoded.
    #[error("malformed value at {key}: {source}")]
    Decode {
        /// Key holding the malformed value.
        key: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be encoded for storage.
    #[error("encoding value: {0}")]
    Encode(#[source] serde_json::Error),

    /// Error reported by the etcd client.
    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),
}

impl StoreError {
    /// True when a conditional write lost its race.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, StoreError::PreconditionFailed { .. })
    }
}
