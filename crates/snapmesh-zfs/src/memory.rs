//! In-memory ZFS stand-in for tests and dry runs.
//!
//! Send streams are JSON documents listing the snapshot ids they carry.
//! Receives enforce the same base rules as `zfs recv`: a full stream needs
//! the filesystem to be absent, an incremental one needs the base to be the
//! latest local snapshot, and a clone stream needs the origin snapshot.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::backend::{SendStream, ZfsBackend};
use crate::error::ZfsError;
use crate::send::{FromSnapshot, SendRange};
use crate::types::{DirtyInfo, Filesystem, Origin, Snapshot};

#[derive(Clone, Debug, Default)]
struct Dataset {
    mounted: bool,
    snapshots: Vec<Snapshot>,
    origin: Option<Origin>,
    dirty: DirtyInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamPayload {
    filesystem_id: String,
    from: FromSnapshot,
    snapshots: Vec<String>,
}

/// Thread-safe in-memory [`ZfsBackend`].
#[derive(Clone, Debug, Default)]
pub struct MemoryZfs {
    datasets: Arc<Mutex<HashMap<String, Dataset>>>,
    failing_sends: Arc<AtomicU32>,
}

impl MemoryZfs {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Dataset>> {
        // A panic while holding the lock leaves the map consistent.
        self.datasets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn exists_error(command: &str, filesystem_id: &str) -> ZfsError {
        ZfsError::Command {
            command: format!("{} {}", command, filesystem_id),
            status: "exit status: 1".to_string(),
            stderr: "dataset already exists".to_string(),
        }
    }

    fn rejected(filesystem_id: &str, reason: impl Into<String>) -> ZfsError {
        ZfsError::ReceiveRejected {
            filesystem_id: filesystem_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Seeds a filesystem with the given snapshot ids.
    pub fn insert_filesystem(&self, filesystem_id: &str, snapshot_ids: &[&str]) {
        let snapshots = snapshot_ids.iter().map(|id| Snapshot::new(*id)).collect();
        self.lock().insert(
            filesystem_id.to_string(),
            Dataset {
                snapshots,
                ..Default::default()
            },
        );
    }

    /// Snapshot ids of a filesystem, empty when it does not exist.
    pub fn snapshot_ids(&self, filesystem_id: &str) -> Vec<String> {
        self.lock()
            .get(filesystem_id)
            .map(|d| d.snapshots.iter().map(|s| s.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether the filesystem is mounted.
    pub fn is_mounted(&self, filesystem_id: &str) -> bool {
        self.lock().get(filesystem_id).is_some_and(|d| d.mounted)
    }

    /// Sets the dirty accounting reported for a filesystem.
    pub fn set_dirty(&self, filesystem_id: &str, dirty: DirtyInfo) {
        if let Some(dataset) = self.lock().get_mut(filesystem_id) {
            dataset.dirty = dirty;
        }
    }

    /// Makes the next `count` sends fail with a command error.
    pub fn fail_next_sends(&self, count: u32) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    fn take_send_failure(&self) -> bool {
        self.failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn payload_for(&self, range: &SendRange) -> Result<StreamPayload, ZfsError> {
        let datasets = self.lock();
        let dataset =
            datasets
                .get(&range.filesystem_id)
                .ok_or_else(|| ZfsError::NoSuchFilesystem {
                    filesystem_id: range.filesystem_id.clone(),
                })?;
        let position = |id: &str| dataset.snapshots.iter().position(|s| s.id == id);
        let no_such = |id: &str| ZfsError::NoSuchSnapshot {
            filesystem_id: range.filesystem_id.clone(),
            snapshot_id: id.to_string(),
        };
        let end = position(&range.to_snapshot).ok_or_else(|| no_such(&range.to_snapshot))?;
        let start = match &range.from {
            FromSnapshot::Start | FromSnapshot::CloneOrigin(_) => 0,
            FromSnapshot::Snapshot(from) => position(from).ok_or_else(|| no_such(from))? + 1,
        };
        let snapshots = dataset
            .snapshots
            .get(start..=end)
            .unwrap_or_default()
            .iter()
            .map(|s| s.id.clone())
            .collect();
        Ok(StreamPayload {
            filesystem_id: range.filesystem_id.clone(),
            from: range.from.clone(),
            snapshots,
        })
    }
}

#[async_trait]
impl ZfsBackend for MemoryZfs {
    async fn discover(&self, filesystem_id: &str) -> Result<Filesystem, ZfsError> {
        Ok(match self.lock().get(filesystem_id) {
            Some(dataset) => Filesystem {
                id: filesystem_id.to_string(),
                exists: true,
                mounted: dataset.mounted,
                snapshots: dataset.snapshots.clone(),
                origin: dataset.origin.clone(),
            },
            None => Filesystem::missing(filesystem_id),
        })
    }

    async fn list_filesystems(&self) -> Result<Vec<String>, ZfsError> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn create(&self, filesystem_id: &str) -> Result<(), ZfsError> {
        let mut datasets = self.lock();
        if datasets.contains_key(filesystem_id) {
            return Err(Self::exists_error("zfs create", filesystem_id));
        }
        datasets.insert(filesystem_id.to_string(), Dataset::default());
        Ok(())
    }

    async fn mount(&self, filesystem_id: &str) -> Result<(), ZfsError> {
        let mut datasets = self.lock();
        let dataset = datasets
            .get_mut(filesystem_id)
            .ok_or_else(|| ZfsError::NoSuchFilesystem {
                filesystem_id: filesystem_id.to_string(),
            })?;
        dataset.mounted = true;
        Ok(())
    }

    async fn unmount(&self, filesystem_id: &str) -> Result<(), ZfsError> {
        if let Some(dataset) = self.lock().get_mut(filesystem_id) {
            dataset.mounted = false;
        }
        Ok(())
    }

    async fn snapshot(&self, filesystem_id: &str, snapshot: &Snapshot) -> Result<(), ZfsError> {
        let mut datasets = self.lock();
        let dataset = datasets
            .get_mut(filesystem_id)
            .ok_or_else(|| ZfsError::NoSuchFilesystem {
                filesystem_id: filesystem_id.to_string(),
            })?;
        if dataset.snapshots.iter().any(|s| s.id == snapshot.id) {
            return Err(Self::exists_error("zfs snapshot", &snapshot.id));
        }
        dataset.snapshots.push(snapshot.clone());
        dataset.dirty.dirty_bytes = 0;
        Ok(())
    }

    async fn rollback(&self, filesystem_id: &str, snapshot_id: &str) -> Result<(), ZfsError> {
        let mut datasets = self.lock();
        let dataset = datasets
            .get_mut(filesystem_id)
            .ok_or_else(|| ZfsError::NoSuchFilesystem {
                filesystem_id: filesystem_id.to_string(),
            })?;
        let index = dataset
            .snapshots
            .iter()
            .position(|s| s.id == snapshot_id)
            .ok_or_else(|| ZfsError::NoSuchSnapshot {
                filesystem_id: filesystem_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
            })?;
        dataset.snapshots.truncate(index + 1);
        dataset.dirty.dirty_bytes = 0;
        Ok(())
    }

    async fn clone_snapshot(&self, origin: &Origin, new_filesystem_id: &str) -> Result<(), ZfsError> {
        let mut datasets = self.lock();
        let has_origin = datasets
            .get(&origin.filesystem_id)
            .is_some_and(|d| d.snapshots.iter().any(|s| s.id == origin.snapshot_id));
        if !has_origin {
            return Err(ZfsError::NoSuchSnapshot {
                filesystem_id: origin.filesystem_id.clone(),
                snapshot_id: origin.snapshot_id.clone(),
            });
        }
        if datasets.contains_key(new_filesystem_id) {
            return Err(Self::exists_error("zfs clone", new_filesystem_id));
        }
        datasets.insert(
            new_filesystem_id.to_string(),
            Dataset {
                origin: Some(origin.clone()),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn predict_size(&self, range: &SendRange) -> Result<u64, ZfsError> {
        let payload = self.payload_for(range)?;
        let encoded = serde_json::to_vec(&payload).map_err(|e| ZfsError::Parse {
            command: "predict".to_string(),
            output: e.to_string(),
        })?;
        Ok(encoded.len() as u64)
    }

    async fn send(&self, range: &SendRange) -> Result<SendStream, ZfsError> {
        if self.take_send_failure() {
            return Err(ZfsError::Command {
                command: format!("zfs send {}", range.filesystem_id),
                status: "exit status: 1".to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        let payload = self.payload_for(range)?;
        let encoded = serde_json::to_vec(&payload).map_err(|e| ZfsError::Parse {
            command: "send".to_string(),
            output: e.to_string(),
        })?;
        debug!(filesystem_id = %range.filesystem_id, bytes = encoded.len(), "memory send");
        Ok(SendStream {
            reader: Box::pin(Cursor::new(encoded)),
            completion: futures::future::ready(Ok(())).boxed(),
        })
    }

    async fn receive(
        &self,
        filesystem_id: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), ZfsError> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await?;
        let payload: StreamPayload = serde_json::from_slice(&raw)
            .map_err(|e| Self::rejected(filesystem_id, format!("invalid stream: {e}")))?;

        let mut datasets = self.lock();
        match &payload.from {
            FromSnapshot::Start => {
                if datasets.contains_key(filesystem_id) {
                    return Err(Self::rejected(filesystem_id, "destination exists"));
                }
                datasets.insert(filesystem_id.to_string(), Dataset::default());
            }
            FromSnapshot::CloneOrigin(origin) => {
                let has_origin = datasets
                    .get(&origin.filesystem_id)
                    .is_some_and(|d| d.snapshots.iter().any(|s| s.id == origin.snapshot_id));
                if !has_origin {
                    return Err(Self::rejected(
                        filesystem_id,
                        format!("origin {origin} is not present"),
                    ));
                }
                if datasets.contains_key(filesystem_id) {
                    return Err(Self::rejected(filesystem_id, "destination exists"));
                }
                datasets.insert(
                    filesystem_id.to_string(),
                    Dataset {
                        origin: Some(origin.clone()),
                        ..Default::default()
                    },
                );
            }
            FromSnapshot::Snapshot(from) => {
                let latest = datasets
                    .get(filesystem_id)
                    .and_then(|d| d.snapshots.last())
                    .map(|s| s.id.as_str());
                if latest != Some(from.as_str()) {
                    return Err(Self::rejected(
                        filesystem_id,
                        format!("most recent snapshot does not match incremental source {from}"),
                    ));
                }
            }
        }

        let dataset = datasets
            .get_mut(filesystem_id)
            .ok_or_else(|| ZfsError::NoSuchFilesystem {
                filesystem_id: filesystem_id.to_string(),
            })?;
        for id in payload.snapshots {
            if !dataset.snapshots.iter().any(|s| s.id == id) {
                dataset.snapshots.push(Snapshot::new(id));
            }
        }
        Ok(())
    }

    async fn apply_metadata(
        &self,
        filesystem_id: &str,
        snapshots: &[Snapshot],
    ) -> Result<(), ZfsError> {
        let mut datasets = self.lock();
        let Some(dataset) = datasets.get_mut(filesystem_id) else {
            return Err(ZfsError::NoSuchFilesystem {
                filesystem_id: filesystem_id.to_string(),
            });
        };
        for incoming in snapshots {
            if let Some(local) = dataset.snapshots.iter_mut().find(|s| s.id == incoming.id) {
                local.metadata.extend(incoming.metadata.clone());
            }
        }
        Ok(())
    }

    async fn dirty(&self, filesystem_id: &str) -> Result<DirtyInfo, ZfsError> {
        self.lock()
            .get(filesystem_id)
            .map(|d| d.dirty)
            .ok_or_else(|| ZfsError::NoSuchFilesystem {
                filesystem_id: filesystem_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn transfer(
        source: &MemoryZfs,
        dest: &MemoryZfs,
        range: SendRange,
    ) -> Result<(), ZfsError> {
        let mut stream = source.send(&range).await?;
        dest.receive(&range.filesystem_id, &mut stream.reader).await?;
        stream.completion.await
    }

    #[tokio::test]
    async fn test_full_then_incremental_receive() {
        let a = MemoryZfs::new();
        let b = MemoryZfs::new();
        a.insert_filesystem("fs1", &["s1", "s2"]);

        transfer(&a, &b, SendRange::new("fs1", FromSnapshot::Start, "s1"))
            .await
            .unwrap();
        assert_eq!(b.snapshot_ids("fs1"), vec!["s1"]);

        transfer(
            &a,
            &b,
            SendRange::new("fs1", FromSnapshot::Snapshot("s1".into()), "s2"),
        )
        .await
        .unwrap();
        assert_eq!(b.snapshot_ids("fs1"), vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_incremental_requires_matching_base() {
        let a = MemoryZfs::new();
        let b = MemoryZfs::new();
        a.insert_filesystem("fs1", &["s1", "s2", "s3"]);
        b.insert_filesystem("fs1", &["s1"]);

        let err = transfer(
            &a,
            &b,
            SendRange::new("fs1", FromSnapshot::Snapshot("s2".into()), "s3"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ZfsError::ReceiveRejected { .. }));
        assert_eq!(b.snapshot_ids("fs1"), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_clone_stream_needs_origin() {
        let a = MemoryZfs::new();
        let b = MemoryZfs::new();
        a.insert_filesystem("parent", &["p1"]);
        a.clone_snapshot(&Origin::new("parent", "p1"), "child").await.unwrap();
        a.snapshot("child", &Snapshot::new("c1")).await.unwrap();
        let range = SendRange::new(
            "child",
            FromSnapshot::CloneOrigin(Origin::new("parent", "p1")),
            "c1",
        );

        let err = transfer(&a, &b, range.clone()).await.unwrap_err();
        assert!(matches!(err, ZfsError::ReceiveRejected { .. }));

        b.insert_filesystem("parent", &["p1"]);
        transfer(&a, &b, range).await.unwrap();
        let child = b.discover("child").await.unwrap();
        assert_eq!(child.origin, Some(Origin::new("parent", "p1")));
        assert_eq!(b.snapshot_ids("child"), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_rollback_truncates_later_snapshots() {
        let zfs = MemoryZfs::new();
        zfs.insert_filesystem("fs1", &["s1", "s2", "s3"]);
        zfs.rollback("fs1", "s1").await.unwrap();
        assert_eq!(zfs.snapshot_ids("fs1"), vec!["s1"]);
        assert!(matches!(
            zfs.rollback("fs1", "s9").await,
            Err(ZfsError::NoSuchSnapshot { .. })
        ));
    }

    #[tokio::test]
    async fn test_metadata_is_reapplied_after_receive() {
        let a = MemoryZfs::new();
        let b = MemoryZfs::new();
        a.create("fs1").await.unwrap();
        let snap = Snapshot::new("s1").with_meta("message", "first");
        a.snapshot("fs1", &snap).await.unwrap();

        transfer(&a, &b, SendRange::new("fs1", FromSnapshot::Start, "s1"))
            .await
            .unwrap();
        assert!(b.discover("fs1").await.unwrap().snapshots[0].metadata.is_empty());

        b.apply_metadata("fs1", &[snap.clone()]).await.unwrap();
        assert_eq!(b.discover("fs1").await.unwrap().snapshots[0], snap);
    }

    #[tokio::test]
    async fn test_injected_send_failures_are_consumed() {
        let zfs = MemoryZfs::new();
        zfs.insert_filesystem("fs1", &["s1"]);
        zfs.fail_next_sends(1);
        let range = SendRange::new("fs1", FromSnapshot::Start, "s1");
        assert!(zfs.send(&range).await.is_err());
        assert!(zfs.send(&range).await.is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_clears_dirty_bytes() {
        let zfs = MemoryZfs::new();
        zfs.create("fs1").await.unwrap();
        zfs.set_dirty(
            "fs1",
            DirtyInfo {
                dirty_bytes: 10,
                size_bytes: 100,
            },
        );
        zfs.snapshot("fs1", &Snapshot::new("s1")).await.unwrap();
        let dirty = zfs.dirty("fs1").await.unwrap();
        assert_eq!(dirty.dirty_bytes, 0);
        assert_eq!(dirty.size_bytes, 100);
    }
}
