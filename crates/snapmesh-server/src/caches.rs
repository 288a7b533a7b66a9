//! Watch-fed caches of cluster state.

use std::hash::Hash;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use snapmesh_zfs::Snapshot;

/// Concurrent map whose reads hand out clones.
pub struct Cache<K: Eq + Hash, V: Clone> {
    map: DashMap<K, V>,
}

impl<K: Eq + Hash, V: Clone> Default for Cache<K, V> {
    fn default() -> Self {
        Self {
            map: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Cache<K, V> {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the value under `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|v| v.value().clone())
    }

    /// Stores a value, returning the previous one.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    /// Drops a value.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(_, v)| v)
    }

    /// Copy of every entry.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// `(node id, filesystem id)`
pub type NodeFilesystem = (String, String);

/// Filesystem id to master node id.
pub type MasterCache = Cache<String, String>;

/// Snapshot lists reported by each node.
pub type SnapshotCache = Cache<NodeFilesystem, Vec<Snapshot>>;

/// Machine state reported by each node.
pub type StateCache = Cache<NodeFilesystem, StateRecord>;

/// Latest dirty report per filesystem.
pub type DirtyCache = Cache<String, DirtyRecord>;

/// Advertised addresses per node.
pub type AddressCache = Cache<String, Vec<String>>;

/// State of one machine, as published under `servers/states/{node}/{fs}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// State name.
    pub state: String,
    /// Free-form status within the state.
    pub status: String,
}

/// Uncommitted changes of a filesystem on its master.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyRecord {
    /// Reporting node.
    pub server: String,
    /// Bytes written since the latest snapshot.
    pub dirty_bytes: u64,
    /// Total referenced bytes.
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hands_out_copies() {
        let cache: SnapshotCache = Cache::new();
        let key = ("node-a".to_string(), "fs1".to_string());
        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), vec![Snapshot::new("s1")]);
        let mut copy = cache.get(&key).unwrap();
        copy.push(Snapshot::new("s2"));
        assert_eq!(cache.get(&key).unwrap().len(), 1);
        assert_eq!(cache.entries().len(), 1);
        assert!(cache.remove(&key).is_some());
        assert!(cache.is_empty());
    }
}
