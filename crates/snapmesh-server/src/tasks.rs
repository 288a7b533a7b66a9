//! Background tasks running next to each state machine, plus the node-wide
//! address heartbeat.

use std::sync::Arc;

use snapmesh_store::{Precondition, StoreExt};
use snapmesh_zfs::DirtyInfo;
use tracing::{debug, warn};

use crate::caches::DirtyRecord;
use crate::context::NodeContext;
use crate::error::ServerError;
use crate::machine::MachineShared;

/// Polls uncommitted bytes of a mounted filesystem and publishes changes.
pub(crate) fn spawn_dirty_poller(ctx: Arc<NodeContext>, filesystem_id: &str, shared: Arc<MachineShared>) {
    let filesystem_id = filesystem_id.to_string();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ctx.config.timing.dirty_poll_interval());
        let mut last: Option<DirtyInfo> = None;
        loop {
            interval.tick().await;
            if !shared.filesystem().mounted {
                continue;
            }
            let info = match ctx.zfs.dirty(&filesystem_id).await {
                Ok(info) => info,
                Err(e) => {
                    debug!(filesystem_id, error = %e, "dirty poll failed");
                    continue;
                }
            };
            if last == Some(info) {
                continue;
            }
            let record = DirtyRecord {
                server: ctx.node_id.clone(),
                dirty_bytes: info.dirty_bytes,
                size_bytes: info.size_bytes,
            };
            let key = ctx.keys.dirty(&filesystem_id);
            match ctx.store.set_json(&key, &record, Precondition::None).await {
                Ok(_) => {
                    ctx.dirty.insert(filesystem_id.clone(), record);
                    last = Some(info);
                }
                Err(e) => warn!(filesystem_id, error = %e, "failed to publish dirty bytes"),
            }
        }
    });
}

/// Publishes the local snapshot list every time it changes.
pub(crate) fn spawn_snapshot_relay(ctx: Arc<NodeContext>, filesystem_id: &str, shared: Arc<MachineShared>) {
    let filesystem_id = filesystem_id.to_string();
    tokio::spawn(async move {
        let cache_key = (ctx.node_id.clone(), filesystem_id.clone());
        let key = ctx.keys.server_snapshots(&ctx.node_id, &filesystem_id);
        loop {
            shared.snapshots_modified.notified().await;
            let snapshots = shared.snapshots();
            debug!(filesystem_id, count = snapshots.len(), "relaying snapshots");
            ctx.snapshots.insert(cache_key.clone(), snapshots.clone());
            if let Err(e) = ctx.store.set_json(&key, &snapshots, Precondition::None).await {
                warn!(filesystem_id, error = %e, "failed to publish snapshots");
            }
        }
    });
}

/// Writes this node's addresses once.
pub(crate) async fn publish_addresses(ctx: &NodeContext) -> Result<(), ServerError> {
    let addresses = ctx.config.effective_addresses();
    ctx.store
        .set_json(
            &ctx.keys.server_addresses(&ctx.node_id),
            &addresses,
            Precondition::None,
        )
        .await?;
    ctx.addresses.insert(ctx.node_id.clone(), addresses);
    Ok(())
}

/// Keeps this node's addresses fresh.
pub(crate) fn spawn_address_heartbeat(ctx: Arc<NodeContext>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ctx.config.timing.address_refresh());
        // The first tick fires at once; the caller has just published.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = publish_addresses(&ctx).await {
                warn!(error = %e, "failed to publish addresses");
            }
        }
    });
}
