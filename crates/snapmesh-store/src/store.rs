//! The coordination store contract.
//!
//! Every node of a cluster shares one store. It is the authority for
//! mastership, the registry and transfer progress; nodes keep cached copies
//! refreshed by a prefix watch.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// A key with its current value and the revision that last modified it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    /// Full key, including the cluster prefix.
    pub key: String,
    /// Raw value (JSON or a bare string).
    pub value: String,
    /// Store revision of the last modification.
    pub revision: i64,
}

/// Condition attached to a write.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Precondition {
    /// Unconditional write.
    #[default]
    None,
    /// Write only if the key does not exist yet.
    Absent,
    /// Write only if the key currently holds exactly this value.
    Equals(String),
}

/// A change observed by a prefix watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// Key created or overwritten.
    Put(KeyValue),
    /// Key removed.
    Delete {
        /// Removed key.
        key: String,
        /// Revision of the removal.
        revision: i64,
    },
}

impl WatchEvent {
    /// Key the event refers to.
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(kv) => &kv.key,
            WatchEvent::Delete { key, .. } => key,
        }
    }

    /// Revision the event happened at.
    pub fn revision(&self) -> i64 {
        match self {
            WatchEvent::Put(kv) => kv.revision,
            WatchEvent::Delete { revision, .. } => *revision,
        }
    }
}

/// Stream of watch events. An `Err` item means the watch must be re-established.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// CAS-capable key/value store with recursive prefix reads and prefix watches.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    /// Read every key under `prefix`, sorted by key, plus the store revision
    /// the read was served at.
    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, i64), StoreError>;

    /// Write `value` at `key` if `precondition` holds; returns the new revision.
    async fn set(
        &self,
        key: &str,
        value: &str,
        precondition: Precondition,
    ) -> Result<i64, StoreError>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Watch every key under `prefix`, starting at `start_revision`
    /// (0 means "from now").
    async fn watch_prefix(&self, prefix: &str, start_revision: i64)
        -> Result<WatchStream, StoreError>;
}

/// JSON helpers available on every store.
#[async_trait]
pub trait StoreExt: CoordinationStore {
    /// Read and decode a JSON value.
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(kv) => serde_json::from_str(&kv.value)
                .map(Some)
                .map_err(|source| StoreError::Decode {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Encode a value as JSON and write it.
    async fn set_json<T>(
        &self,
        key: &str,
        value: &T,
        precondition: Precondition,
    ) -> Result<i64, StoreError>
    where
        T: Serialize + Sync,
    {
        let encoded = serde_json::to_string(value).map_err(StoreError::Encode)?;
        self.set(key, &encoded, precondition).await
    }
}

impl<S: CoordinationStore + ?Sized> StoreExt for S {}
