//! Routing commands to the machine of a filesystem's master, wherever it runs.
//!
//! Commands for filesystems mastered here go straight to the local machine.
//! Anything else is written under `filesystems/requests/{fs}/{id}`; the
//! master's watcher runs it and answers under `filesystems/responses/{fs}/{id}`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snapmesh_store::{Precondition, StoreExt};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::NodeContext;
use crate::error::ServerError;
use crate::event::{Command, Outcome, Reply};

/// A command forwarded through the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// Node waiting for the reply.
    pub origin_node: String,
    /// What to run.
    pub command: Command,
}

/// Runs `command` on the machine of the filesystem's master.
pub async fn dispatch(
    ctx: &Arc<NodeContext>,
    filesystem_id: &str,
    command: Command,
) -> Result<Outcome, ServerError> {
    match ctx.master_of(filesystem_id) {
        Some(master) if master != ctx.node_id => {
            forward(ctx, filesystem_id, &master, command).await
        }
        _ => Ok(ctx.init_machine(filesystem_id).submit(command).await?),
    }
}

async fn forward(
    ctx: &Arc<NodeContext>,
    filesystem_id: &str,
    master: &str,
    command: Command,
) -> Result<Outcome, ServerError> {
    let request_id = Uuid::new_v4().to_string();
    let name = command.name();
    let long_running = command.is_long_running();
    debug!(filesystem_id, master, request_id, command = name, "forwarding request");

    let reply = ctx.register_pending(&request_id);
    let request = RemoteRequest {
        origin_node: ctx.node_id.clone(),
        command,
    };
    let key = ctx.keys.request(filesystem_id, &request_id);
    if let Err(e) = ctx.store.set_json(&key, &request, Precondition::Absent).await {
        ctx.abandon_pending(&request_id);
        return Err(e.into());
    }

    match await_reply(ctx, filesystem_id, master, name, long_running, reply).await {
        Ok(reply) => Ok(reply?),
        Err(e) => {
            warn!(filesystem_id, master, request_id, error = %e, "abandoning forwarded request");
            ctx.abandon_pending(&request_id);
            if let Err(err) = ctx.store.delete(&key).await {
                warn!(filesystem_id, request_id, error = %err, "failed to withdraw request");
            }
            Err(e)
        }
    }
}

/// Waits for the master's reply.
///
/// Short commands get `remote_request_timeout`. Transfers get
/// `long_request_timeout` and stop early once the filesystem has a new master,
/// since the old one will never answer.
async fn await_reply(
    ctx: &NodeContext,
    filesystem_id: &str,
    master: &str,
    name: &str,
    long_running: bool,
    mut reply: oneshot::Receiver<Reply>,
) -> Result<Reply, ServerError> {
    let timing = &ctx.config.timing;
    let timed_out = || ServerError::Timeout {
        what: format!("{name} on {filesystem_id} at {master}"),
    };
    if !long_running {
        return match tokio::time::timeout(timing.remote_request_timeout(), reply).await {
            Ok(Ok(reply)) => Ok(reply),
            _ => Err(timed_out()),
        };
    }

    let deadline = tokio::time::sleep(timing.long_request_timeout());
    tokio::pin!(deadline);
    let mut check = tokio::time::interval(timing.backoff().max(Duration::from_millis(1)));
    loop {
        tokio::select! {
            result = &mut reply => return result.map_err(|_| timed_out()),
            _ = &mut deadline => return Err(timed_out()),
            _ = check.tick() => {
                if ctx.master_of(filesystem_id).as_deref() != Some(master) {
                    return Err(ServerError::MasterChanged {
                        filesystem_id: filesystem_id.to_string(),
                        master: master.to_string(),
                    });
                }
            }
        }
    }
}

/// Runs a forwarded request on this node and writes the reply.
///
/// The caller must have claimed the request with
/// [`NodeContext::begin_serving`]; it is released once the reply is written.
pub(crate) async fn serve_remote(
    ctx: Arc<NodeContext>,
    filesystem_id: String,
    request_id: String,
    request: RemoteRequest,
) {
    let request_key = ctx.keys.request(&filesystem_id, &request_id);
    serve(&ctx, &filesystem_id, &request_id, &request_key, request).await;
    if let Err(e) = ctx.store.delete(&request_key).await {
        warn!(filesystem_id, request_id, error = %e, "failed to remove served request");
    }
    ctx.finish_serving(&filesystem_id, &request_id);
}

async fn serve(
    ctx: &Arc<NodeContext>,
    filesystem_id: &str,
    request_id: &str,
    request_key: &str,
    request: RemoteRequest,
) {
    // A re-read of the store may hand over a request that was already served
    // or withdrawn.
    match ctx.store.get(request_key).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            debug!(filesystem_id, request_id, "request gone before it ran");
            return;
        }
        Err(e) => {
            warn!(filesystem_id, request_id, error = %e, "cannot confirm request");
            return;
        }
    }

    debug!(
        filesystem_id,
        request_id,
        origin = %request.origin_node,
        command = request.command.name(),
        "running forwarded request"
    );
    let reply: Reply = ctx.init_machine(filesystem_id).submit(request.command).await;

    match ctx.store.get(request_key).await {
        Ok(None) => {
            debug!(filesystem_id, request_id, "caller stopped waiting, dropping reply");
            return;
        }
        Ok(Some(_)) => {}
        Err(e) => warn!(filesystem_id, request_id, error = %e, "cannot confirm request"),
    }
    let response_key = ctx.keys.response(filesystem_id, request_id);
    if let Err(e) = ctx
        .store
        .set_json(&response_key, &reply, Precondition::None)
        .await
    {
        warn!(filesystem_id, request_id, error = %e, "failed to write response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, TimingConfig};
    use crate::containers::StaticInventory;
    use snapmesh_repl::{TransferDirection, TransferRequest};
    use snapmesh_store::{CoordinationStore, KeyValue, MemoryStore};
    use snapmesh_zfs::MemoryZfs;

    fn context(store: &Arc<MemoryStore>, tune: impl FnOnce(&mut TimingConfig)) -> Arc<NodeContext> {
        let mut config = NodeConfig::default();
        config.node_id = "node-a".to_string();
        config.timing.backoff_ms = 10;
        config.timing.remote_request_timeout_ms = 50;
        config.timing.long_request_timeout_ms = 10_000;
        tune(&mut config.timing);
        Arc::new(NodeContext::new(
            config,
            store.clone(),
            Arc::new(MemoryZfs::new()),
            Arc::new(StaticInventory::new()),
        ))
    }

    async fn requests(store: &MemoryStore, ctx: &NodeContext) -> Vec<KeyValue> {
        let prefix = format!("{}/filesystems/requests/", ctx.keys.prefix());
        store.get_prefix(&prefix).await.unwrap().0
    }

    fn transfer() -> Command {
        Command::Transfer {
            transfer_id: "t1".to_string(),
            request: TransferRequest {
                peer: "peer".into(),
                user: "admin".into(),
                api_key: "key".into(),
                direction: TransferDirection::Pull,
                local_namespace: "alice".into(),
                local_name: "db".into(),
                local_clone_name: String::new(),
                remote_namespace: "alice".into(),
                remote_name: "db".into(),
                remote_clone_name: String::new(),
                target_snapshot: String::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_short_request_times_out_and_is_withdrawn() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(&store, |_| {});
        ctx.masters.insert("fs1".to_string(), "node-b".to_string());

        let err = dispatch(&ctx, "fs1", Command::Mount).await.unwrap_err();
        assert!(matches!(err, ServerError::Timeout { .. }), "{err}");
        assert!(requests(&store, &ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_transfer_stops_waiting_when_master_changes() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(&store, |_| {});
        ctx.masters.insert("fs1".to_string(), "node-b".to_string());

        let waiting = tokio::spawn({
            let ctx = Arc::clone(&ctx);
            async move { dispatch(&ctx, "fs1", transfer()).await }
        });
        for _ in 0..500 {
            if !requests(&store, &ctx).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(requests(&store, &ctx).await.len(), 1);

        // Outlives the short-command timeout.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        ctx.masters.insert("fs1".to_string(), "node-c".to_string());
        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(err.name(), "master-changed");
        assert!(requests(&store, &ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_transfer_wait_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(&store, |t| t.long_request_timeout_ms = 50);
        ctx.masters.insert("fs1".to_string(), "node-b".to_string());

        let err = dispatch(&ctx, "fs1", transfer()).await.unwrap_err();
        assert!(matches!(err, ServerError::Timeout { .. }), "{err}");
        assert!(requests(&store, &ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_served_request_gets_a_response() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(&store, |_| {});
        assert!(ctx.claim_master_if_absent("fs1").await.unwrap());
        let request = RemoteRequest {
            origin_node: "node-b".to_string(),
            command: Command::Create,
        };
        store
            .set_json(&ctx.keys.request("fs1", "r1"), &request, Precondition::Absent)
            .await
            .unwrap();

        assert!(ctx.begin_serving("fs1", "r1"));
        serve_remote(Arc::clone(&ctx), "fs1".into(), "r1".into(), request).await;

        let reply: Reply = store
            .get_json(&ctx.keys.response("fs1", "r1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Ok(Outcome::Created));
        assert!(requests(&store, &ctx).await.is_empty());
        assert!(ctx.begin_serving("fs1", "r1"));
    }

    #[tokio::test]
    async fn test_withdrawn_request_is_not_run() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(&store, |_| {});
        assert!(ctx.claim_master_if_absent("fs1").await.unwrap());
        let request = RemoteRequest {
            origin_node: "node-b".to_string(),
            command: Command::Create,
        };

        assert!(ctx.begin_serving("fs1", "r2"));
        serve_remote(Arc::clone(&ctx), "fs1".into(), "r2".into(), request).await;

        let reply: Option<Reply> = store
            .get_json(&ctx.keys.response("fs1", "r2"))
            .await
            .unwrap();
        assert!(reply.is_none());
        assert!(ctx.machine("fs1").is_none());
        assert!(ctx.begin_serving("fs1", "r2"));
    }
}
