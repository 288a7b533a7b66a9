//! Keeps the node's caches in step with the coordination store.
//!
//! A full prefix read primes every cache, then a watch from the next revision
//! applies changes as they happen. A broken watch is re-established from a
//! fresh read after the backoff delay.

use std::sync::Arc;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use snapmesh_repl::{FilesystemClone, TransferPollResult, VolumeName};
use snapmesh_store::{KeyValue, ParsedKey, WatchEvent};
use snapmesh_zfs::Snapshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::caches::{DirtyRecord, StateRecord};
use crate::context::NodeContext;
use crate::dispatch::{self, RemoteRequest};
use crate::error::ServerError;
use crate::event::Reply;
use crate::notify::ServerSnapshots;
use crate::registry::TopLevelRecord;

fn decode<T: DeserializeOwned>(kv: &KeyValue) -> Option<T> {
    match serde_json::from_str(&kv.value) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %kv.key, error = %e, "undecodable value");
            None
        }
    }
}

/// Reads every key once and applies it; returns the revision read at.
pub(crate) async fn prime(ctx: &Arc<NodeContext>) -> Result<i64, ServerError> {
    let (entries, revision) = ctx.store.get_prefix(&ctx.keys.root()).await?;
    debug!(keys = entries.len(), revision, "priming caches");
    for kv in entries {
        apply_put(ctx, kv).await;
    }
    Ok(revision)
}

/// Follows the store from `revision` onwards for as long as the node runs.
pub(crate) fn spawn(ctx: Arc<NodeContext>, revision: i64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let root = ctx.keys.root();
        let mut revision = revision;
        loop {
            match ctx.store.watch_prefix(&root, revision + 1).await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        match event {
                            Ok(event) => {
                                revision = revision.max(event.revision());
                                apply(&ctx, event).await;
                            }
                            Err(e) => {
                                warn!(error = %e, "watch interrupted");
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "cannot watch store"),
            }
            tokio::time::sleep(ctx.config.timing.backoff()).await;
            match prime(&ctx).await {
                Ok(current) => {
                    info!(revision = current, "watch re-established");
                    revision = current;
                }
                Err(e) => warn!(error = %e, "re-reading store failed"),
            }
        }
    })
}

async fn apply(ctx: &Arc<NodeContext>, event: WatchEvent) {
    match event {
        WatchEvent::Put(kv) => apply_put(ctx, kv).await,
        WatchEvent::Delete { key, .. } => apply_delete(ctx, &key),
    }
}

async fn apply_put(ctx: &Arc<NodeContext>, kv: KeyValue) {
    let Some(parsed) = ctx.keys.parse(&kv.key) else {
        return;
    };
    match parsed {
        ParsedKey::Master { filesystem_id } => {
            let master = kv.value.clone();
            debug!(filesystem_id, master, "master updated");
            ctx.masters.insert(filesystem_id.clone(), master.clone());
            ctx.init_machine(&filesystem_id);
            if let Some(snapshots) = ctx.snapshots.get(&(master, filesystem_id.clone())) {
                ctx.notifications
                    .master_snapshots
                    .publish(&filesystem_id, snapshots);
            }
        }
        ParsedKey::Transfer { .. } => {
            if let Some(poll) = decode::<TransferPollResult>(&kv) {
                ctx.ledger.observe(poll);
            }
        }
        ParsedKey::Dirty { filesystem_id } => {
            if let Some(record) = decode::<DirtyRecord>(&kv) {
                ctx.dirty.insert(filesystem_id, record);
            }
        }
        ParsedKey::ServerState {
            node_id,
            filesystem_id,
        } => {
            if let Some(record) = decode::<StateRecord>(&kv) {
                ctx.states.insert((node_id, filesystem_id), record);
            }
        }
        ParsedKey::ServerAddresses { node_id } => {
            if let Some(addresses) = decode::<Vec<String>>(&kv) {
                ctx.addresses.insert(node_id, addresses);
            }
        }
        ParsedKey::ServerSnapshots {
            node_id,
            filesystem_id,
        } => {
            let Some(snapshots) = decode::<Vec<Snapshot>>(&kv) else {
                return;
            };
            ctx.snapshots
                .insert((node_id.clone(), filesystem_id.clone()), snapshots.clone());
            if ctx.master_of(&filesystem_id).as_deref() == Some(node_id.as_str()) {
                ctx.notifications
                    .master_snapshots
                    .publish(&filesystem_id, snapshots.clone());
            }
            ctx.notifications.server_snapshots.publish(
                &filesystem_id,
                ServerSnapshots {
                    server: node_id,
                    snapshots,
                },
            );
        }
        ParsedKey::Request {
            filesystem_id,
            request_id,
        } => {
            if !ctx.is_master(&filesystem_id) {
                return;
            }
            let Some(request) = decode::<RemoteRequest>(&kv) else {
                return;
            };
            if !ctx.begin_serving(&filesystem_id, &request_id) {
                debug!(filesystem_id, request_id, "request already running");
                return;
            }
            tokio::spawn(dispatch::serve_remote(
                Arc::clone(ctx),
                filesystem_id,
                request_id,
                request,
            ));
        }
        ParsedKey::Response {
            filesystem_id,
            request_id,
        } => {
            let Some(reply) = decode::<Reply>(&kv) else {
                return;
            };
            if ctx.complete_pending(&request_id, reply) {
                if let Err(e) = ctx.store.delete(&kv.key).await {
                    warn!(filesystem_id, request_id, error = %e, "failed to remove response");
                }
            }
        }
        ParsedKey::RegistryFilesystem { namespace, name } => {
            if let Some(record) = decode::<TopLevelRecord>(&kv) {
                ctx.registry
                    .observe_filesystem(VolumeName::new(namespace, name), record.filesystem_id);
            }
        }
        ParsedKey::RegistryClone {
            top_level_filesystem_id,
            name,
        } => {
            if let Some(clone) = decode::<FilesystemClone>(&kv) {
                ctx.registry
                    .observe_clone(&top_level_filesystem_id, &name, clone);
            }
        }
    }
}

fn apply_delete(ctx: &NodeContext, key: &str) {
    match ctx.keys.parse(key) {
        Some(ParsedKey::Master { filesystem_id }) => {
            ctx.masters.remove(&filesystem_id);
        }
        Some(ParsedKey::RegistryFilesystem { namespace, name }) => {
            ctx.registry
                .forget_filesystem(&VolumeName::new(namespace, name));
        }
        Some(ParsedKey::RegistryClone {
            top_level_filesystem_id,
            name,
        }) => ctx.registry.forget_clone(&top_level_filesystem_id, &name),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::containers::StaticInventory;
    use crate::event::Command;
    use snapmesh_store::{MemoryStore, Precondition, StoreExt};
    use snapmesh_zfs::MemoryZfs;
    use std::time::Duration;

    async fn mastered_filesystem(store: &Arc<MemoryStore>) -> Arc<NodeContext> {
        let mut config = NodeConfig::default();
        config.node_id = "node-a".to_string();
        let ctx = Arc::new(NodeContext::new(
            config,
            store.clone(),
            Arc::new(MemoryZfs::new()),
            Arc::new(StaticInventory::new()),
        ));
        assert!(ctx.claim_master_if_absent("fs1").await.unwrap());
        dispatch::dispatch(&ctx, "fs1", Command::Create).await.unwrap();
        ctx
    }

    async fn snapshot_count(ctx: &NodeContext) -> usize {
        ctx.zfs.discover("fs1").await.unwrap().snapshots.len()
    }

    #[tokio::test]
    async fn test_reprime_does_not_rerun_a_request_in_flight() {
        let store = Arc::new(MemoryStore::new());
        let ctx = mastered_filesystem(&store).await;
        let request = RemoteRequest {
            origin_node: "node-b".to_string(),
            command: Command::Snapshot {
                metadata: Default::default(),
            },
        };
        let request_key = ctx.keys.request("fs1", "r1");
        store
            .set_json(&request_key, &request, Precondition::Absent)
            .await
            .unwrap();

        // A broken watch re-reads everything while the first read's request
        // is still being served.
        prime(&ctx).await.unwrap();
        prime(&ctx).await.unwrap();

        let response_key = ctx.keys.response("fs1", "r1");
        for _ in 0..500 {
            let served = store.get_json::<Reply>(&response_key).await.unwrap().is_some()
                && store.get_json::<RemoteRequest>(&request_key).await.unwrap().is_none();
            if served {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.get_json::<RemoteRequest>(&request_key).await.unwrap().is_none());
        assert_eq!(snapshot_count(&ctx).await, 1);

        prime(&ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(snapshot_count(&ctx).await, 1);
    }

    #[tokio::test]
    async fn test_requests_for_other_masters_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let ctx = mastered_filesystem(&store).await;
        ctx.masters.insert("fs2".to_string(), "node-b".to_string());
        let request = RemoteRequest {
            origin_node: "node-c".to_string(),
            command: Command::Mount,
        };
        store
            .set_json(&ctx.keys.request("fs2", "r2"), &request, Precondition::Absent)
            .await
            .unwrap();

        prime(&ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.machine("fs2").is_none());
        assert!(ctx.begin_serving("fs2", "r2"));
    }
}
