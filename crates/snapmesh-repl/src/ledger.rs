//! Transfer poll ledger: progress records written through the coordination store.

use std::sync::Arc;

use dashmap::DashMap;
use snapmesh_store::{CoordinationStore, KeySpace, Precondition, StoreExt};
use tracing::{debug, warn};

use crate::error::ReplError;
use crate::transfer::{TransferPollResult, TransferStatus};

/// Cache of live transfer records, kept current by local writes and the store
/// watcher. Finished and failed transfers are served from the store.
pub struct TransferLedger {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    cache: DashMap<String, TransferPollResult>,
}

impl TransferLedger {
    /// Ledger writing under `keys`.
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace) -> Self {
        Self {
            store,
            keys,
            cache: DashMap::new(),
        }
    }

    /// Persists a record; last writer wins.
    pub async fn record(&self, poll: &TransferPollResult) -> Result<(), ReplError> {
        let key = self.keys.transfer(&poll.transfer_request_id);
        self.store.set_json(&key, poll, Precondition::None).await?;
        self.remember(poll.clone());
        Ok(())
    }

    /// Feeds a record seen on the store watch.
    pub fn observe(&self, poll: TransferPollResult) {
        debug!(transfer_id = %poll.transfer_request_id, status = %poll.status, "transfer updated");
        self.remember(poll);
    }

    fn remember(&self, poll: TransferPollResult) {
        if poll.status.is_terminal() {
            self.cache.remove(&poll.transfer_request_id);
        } else {
            self.cache.insert(poll.transfer_request_id.clone(), poll);
        }
    }

    /// Number of transfers held in the cache.
    pub fn live(&self) -> usize {
        self.cache.len()
    }

    /// Cached record, if any.
    pub fn cached(&self, transfer_id: &str) -> Option<TransferPollResult> {
        self.cache.get(transfer_id).map(|p| p.clone())
    }

    /// Record from the cache, falling back to the store.
    pub async fn get(&self, transfer_id: &str) -> Result<Option<TransferPollResult>, ReplError> {
        if let Some(poll) = self.cached(transfer_id) {
            return Ok(Some(poll));
        }
        let poll: Option<TransferPollResult> =
            self.store.get_json(&self.keys.transfer(transfer_id)).await?;
        if let Some(poll) = &poll {
            self.remember(poll.clone());
        }
        Ok(poll)
    }

    /// Starts tracking a transfer owned by this node.
    pub fn entry(self: &Arc<Self>, poll: TransferPollResult) -> LedgerEntry {
        LedgerEntry {
            ledger: Arc::clone(self),
            poll,
        }
    }
}

/// A transfer record owned by the task driving it.
///
/// Updates are written through immediately. A failed write is logged and the
/// transfer carries on, since the record is informational.
pub struct LedgerEntry {
    ledger: Arc<TransferLedger>,
    poll: TransferPollResult,
}

impl LedgerEntry {
    /// Current record.
    pub fn poll(&self) -> &TransferPollResult {
        &self.poll
    }

    /// Mutates the record and writes it.
    pub async fn update<F>(&mut self, f: F)
    where
        F: FnOnce(&mut TransferPollResult),
    {
        f(&mut self.poll);
        if let Err(e) = self.ledger.record(&self.poll).await {
            warn!(
                transfer_id = %self.poll.transfer_request_id,
                error = %e,
                "failed to record transfer progress"
            );
        }
    }

    /// Sets status and message.
    pub async fn set_status(&mut self, status: TransferStatus, message: impl Into<String>) {
        let message = message.into();
        self.update(|poll| {
            poll.status = status;
            poll.message = message;
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{TransferDirection, TransferRequest};
    use snapmesh_store::MemoryStore;

    fn poll(id: &str) -> TransferPollResult {
        let request = TransferRequest {
            peer: "peer".into(),
            user: "admin".into(),
            api_key: "key".into(),
            direction: TransferDirection::Pull,
            local_namespace: "admin".into(),
            local_name: "vol".into(),
            local_clone_name: String::new(),
            remote_namespace: "admin".into(),
            remote_name: "vol".into(),
            remote_clone_name: String::new(),
            target_snapshot: String::new(),
        };
        TransferPollResult::new(id, &request, "node-a", 1)
    }

    #[tokio::test]
    async fn test_entry_writes_through_to_store() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeySpace::default();
        let ledger = Arc::new(TransferLedger::new(store.clone(), keys.clone()));

        let mut entry = ledger.entry(poll("t1"));
        entry.set_status(TransferStatus::Pulling, "starting").await;

        let stored: TransferPollResult = store
            .get_json(&keys.transfer("t1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TransferStatus::Pulling);
        assert_eq!(ledger.cached("t1").unwrap().message, "starting");
    }

    #[tokio::test]
    async fn test_get_falls_back_to_store() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeySpace::default();
        store
            .set_json(&keys.transfer("t2"), &poll("t2"), Precondition::None)
            .await
            .unwrap();

        let ledger = TransferLedger::new(store, keys);
        assert!(ledger.cached("t2").is_none());
        assert_eq!(ledger.get("t2").await.unwrap().unwrap().transfer_request_id, "t2");
        assert!(ledger.cached("t2").is_some());
        assert!(ledger.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_transfers_leave_the_cache() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeySpace::default();
        let ledger = Arc::new(TransferLedger::new(store.clone(), keys.clone()));

        let mut done = ledger.entry(poll("t3"));
        done.set_status(TransferStatus::Pushing, "").await;
        let mut failed = ledger.entry(poll("t4"));
        failed.set_status(TransferStatus::Pulling, "").await;
        assert_eq!(ledger.live(), 2);

        done.set_status(TransferStatus::Finished, "").await;
        failed.set_status(TransferStatus::Failed, "broken pipe").await;
        assert_eq!(ledger.live(), 0);

        // Still readable, and reading does not re-cache them.
        let stored = ledger.get("t4").await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Failed);
        assert_eq!(stored.message, "broken pipe");
        assert!(ledger.cached("t3").is_none());
        assert_eq!(ledger.live(), 0);

        let mut seen = poll("t5");
        seen.status = TransferStatus::Finished;
        ledger.observe(seen);
        assert_eq!(ledger.live(), 0);
    }
}
