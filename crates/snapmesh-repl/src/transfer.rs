//! Transfer requests and their persisted progress records.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which way snapshots flow relative to the initiating node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// Local snapshots are sent to the peer.
    Push,
    /// Peer snapshots are fetched to this node.
    Pull,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Push => f.write_str("push"),
            TransferDirection::Pull => f.write_str("pull"),
        }
    }
}

/// A user's request to push to or pull from another cluster.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Peer hostname, optionally with `:port`.
    pub peer: String,
    /// User on the peer.
    pub user: String,
    /// API key on the peer.
    pub api_key: String,
    /// Push or pull.
    pub direction: TransferDirection,
    /// Local volume namespace.
    pub local_namespace: String,
    /// Local volume name.
    pub local_name: String,
    /// Local clone name; empty for the top-level filesystem.
    #[serde(default)]
    pub local_clone_name: String,
    /// Remote volume namespace.
    pub remote_namespace: String,
    /// Remote volume name.
    pub remote_name: String,
    /// Remote clone name; empty for the top-level filesystem.
    #[serde(default)]
    pub remote_clone_name: String,
    /// Snapshot to stop at; empty for the latest.
    #[serde(default)]
    pub target_snapshot: String,
}

// Keeps the api key out of logs.
impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("peer", &self.peer)
            .field("user", &self.user)
            .field("api_key", &"<redacted>")
            .field("direction", &self.direction)
            .field("local_namespace", &self.local_namespace)
            .field("local_name", &self.local_name)
            .field("local_clone_name", &self.local_clone_name)
            .field("remote_namespace", &self.remote_namespace)
            .field("remote_name", &self.remote_name)
            .field("remote_clone_name", &self.remote_clone_name)
            .field("target_snapshot", &self.target_snapshot)
            .finish()
    }
}

/// Phase of a transfer as shown to users.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransferStatus {
    /// Resolving paths and registering with the peer.
    SyncingMetadata,
    /// Estimating the stream size.
    CalculatingSize,
    /// Streaming to the peer.
    Pushing,
    /// Streaming from the peer.
    Pulling,
    /// Every segment landed.
    Finished,
    /// Attempt `n` failed and is being retried.
    Retry(u32),
    /// Transfer gave up.
    Failed,
}

impl TransferStatus {
    /// Whether no further progress will be recorded.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Finished | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::SyncingMetadata => f.write_str("syncing metadata"),
            TransferStatus::CalculatingSize => f.write_str("calculating size"),
            TransferStatus::Pushing => f.write_str("pushing"),
            TransferStatus::Pulling => f.write_str("pulling"),
            TransferStatus::Finished => f.write_str("finished"),
            TransferStatus::Retry(n) => write!(f, "retry {n}"),
            TransferStatus::Failed => f.write_str("error"),
        }
    }
}

impl TryFrom<String> for TransferStatus {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, String> {
        Ok(match raw.as_str() {
            "syncing metadata" => TransferStatus::SyncingMetadata,
            "calculating size" => TransferStatus::CalculatingSize,
            "pushing" => TransferStatus::Pushing,
            "pulling" => TransferStatus::Pulling,
            "finished" => TransferStatus::Finished,
            "error" => TransferStatus::Failed,
            other => match other.strip_prefix("retry ").map(str::parse::<u32>) {
                Some(Ok(n)) => TransferStatus::Retry(n),
                _ => return Err(format!("unknown transfer status {other:?}")),
            },
        })
    }
}

impl From<TransferStatus> for String {
    fn from(status: TransferStatus) -> Self {
        status.to_string()
    }
}

/// Progress record of one transfer, stored under its transfer id.
///
/// Written by the initiating node and read by anyone polling the transfer.
/// The api key of the originating request is never copied in here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPollResult {
    /// Transfer id.
    pub transfer_request_id: String,
    /// Peer hostname.
    pub peer: String,
    /// User on the peer.
    pub user: String,
    /// Push or pull.
    pub direction: TransferDirection,
    /// Local volume namespace.
    pub local_namespace: String,
    /// Local volume name.
    pub local_name: String,
    /// Local clone name.
    pub local_clone_name: String,
    /// Remote volume namespace.
    pub remote_namespace: String,
    /// Remote volume name.
    pub remote_name: String,
    /// Remote clone name.
    pub remote_clone_name: String,
    /// Filesystem of the segment in flight.
    pub filesystem_id: String,
    /// Node driving the transfer.
    pub initiator_node: String,
    /// Node on the other side, once known.
    pub peer_node: String,
    /// Base of the segment in flight (`START`, a snapshot, or `fs@snap`).
    pub starting_snapshot: String,
    /// Last snapshot of the segment in flight.
    pub target_snapshot: String,
    /// Segments completed so far.
    pub index: usize,
    /// Total segments.
    pub total: usize,
    /// Current phase.
    pub status: TransferStatus,
    /// Time spent streaming the segment in flight.
    pub nanoseconds_elapsed: u64,
    /// Predicted size of the segment in flight.
    pub size: u64,
    /// Bytes of the segment in flight sent so far.
    pub sent: u64,
    /// Free-form progress or error text.
    pub message: String,
}

impl TransferPollResult {
    /// Initial record for a transfer of `total` segments.
    pub fn new(
        transfer_id: impl Into<String>,
        request: &TransferRequest,
        initiator_node: impl Into<String>,
        total: usize,
    ) -> Self {
        Self {
            transfer_request_id: transfer_id.into(),
            peer: request.peer.clone(),
            user: request.user.clone(),
            direction: request.direction,
            local_namespace: request.local_namespace.clone(),
            local_name: request.local_name.clone(),
            local_clone_name: request.local_clone_name.clone(),
            remote_namespace: request.remote_namespace.clone(),
            remote_name: request.remote_name.clone(),
            remote_clone_name: request.remote_clone_name.clone(),
            filesystem_id: String::new(),
            initiator_node: initiator_node.into(),
            peer_node: String::new(),
            starting_snapshot: String::new(),
            target_snapshot: String::new(),
            index: 0,
            total,
            status: TransferStatus::SyncingMetadata,
            nanoseconds_elapsed: 0,
            size: 0,
            sent: 0,
            message: String::new(),
        }
    }

    /// Resets per-segment fields for the next hop.
    pub fn start_segment(
        &mut self,
        filesystem_id: impl Into<String>,
        starting_snapshot: impl Into<String>,
        target_snapshot: impl Into<String>,
    ) {
        self.filesystem_id = filesystem_id.into();
        self.starting_snapshot = starting_snapshot.into();
        self.target_snapshot = target_snapshot.into();
        self.size = 0;
        self.sent = 0;
        self.nanoseconds_elapsed = 0;
    }
}
