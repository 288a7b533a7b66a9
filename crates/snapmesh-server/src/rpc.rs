//! The RPC service behind `POST /rpc`.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use snapmesh_repl::{
    is_top_level_clone_name, FilesystemSummary, PeerClient, PathToTopLevelFilesystem, RpcRequest,
    RpcResponse, TransferDirection, TransferPollResult, TransferRequest, VolumeName,
};
use snapmesh_zfs::{SendRange, Snapshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::NodeContext;
use crate::dispatch::dispatch;
use crate::error::ServerError;
use crate::event::{Command, FsmError, Outcome};

fn to_value<T: Serialize>(value: &T) -> Result<Value, ServerError> {
    Ok(serde_json::to_value(value)?)
}

fn unexpected(command: &str, outcome: Outcome) -> ServerError {
    ServerError::UnexpectedReply {
        command: command.to_string(),
        outcome: format!("{outcome:?}"),
    }
}

/// Runs one RPC on behalf of `user` and wraps the answer.
pub async fn handle(ctx: &Arc<NodeContext>, request: RpcRequest, user: &str) -> RpcResponse {
    let method = request.method();
    match execute(ctx, request, user).await {
        Ok(value) => RpcResponse {
            result: Some(value),
            error: None,
        },
        Err(e) => {
            warn!(method, error = %e, "rpc failed");
            RpcResponse::err(e.name(), e.to_string())
        }
    }
}

async fn execute(
    ctx: &Arc<NodeContext>,
    request: RpcRequest,
    user: &str,
) -> Result<Value, ServerError> {
    match request {
        RpcRequest::Create { name } => to_value(&create(ctx, &name).await?),
        RpcRequest::Exists { name, clone_name } => {
            to_value(&ctx.registry.resolve(&name, &clone_name))
        }
        RpcRequest::Lookup { name, clone_name } => {
            to_value(&ctx.registry.require(&name, &clone_name)?)
        }
        RpcRequest::List => {
            let summaries: Vec<FilesystemSummary> = ctx
                .registry
                .filesystems()
                .into_iter()
                .map(|(name, filesystem_id)| FilesystemSummary {
                    master: ctx.master_of(&filesystem_id),
                    name,
                    filesystem_id,
                })
                .collect();
            to_value(&summaries)
        }
        RpcRequest::Clones { name } => {
            let top_level = ctx.registry.require(&name, "")?;
            to_value(&ctx.registry.clones_for(&top_level))
        }
        RpcRequest::Snapshots { name, clone_name } => {
            let filesystem_id = ctx.registry.require(&name, &clone_name)?;
            to_value(&snapshots_by_id(ctx, &filesystem_id).await?)
        }
        RpcRequest::SnapshotsById { filesystem_id } => {
            to_value(&snapshots_by_id(ctx, &filesystem_id).await?)
        }
        RpcRequest::Snapshot {
            name,
            clone_name,
            mut metadata,
        } => {
            let filesystem_id = ctx.registry.require(&name, &clone_name)?;
            metadata
                .entry("author".to_string())
                .or_insert_with(|| user.to_string());
            match dispatch(ctx, &filesystem_id, Command::Snapshot { metadata }).await? {
                Outcome::Snapshotted { snapshot_id } => to_value(&snapshot_id),
                other => Err(unexpected("snapshot", other)),
            }
        }
        RpcRequest::Rollback {
            name,
            clone_name,
            snapshot_id,
        } => {
            let filesystem_id = ctx.registry.require(&name, &clone_name)?;
            match dispatch(ctx, &filesystem_id, Command::Rollback { snapshot_id }).await? {
                Outcome::RolledBack => Ok(Value::Bool(true)),
                other => Err(unexpected("rollback", other)),
            }
        }
        RpcRequest::Branch {
            name,
            source_clone_name,
            snapshot_id,
            new_clone_name,
        } => {
            let top_level = ctx.registry.require(&name, "")?;
            let source = ctx.registry.require(&name, &source_clone_name)?;
            if is_top_level_clone_name(&new_clone_name) {
                return Err(ServerError::invalid(format!(
                    "{new_clone_name:?} is not a valid clone name"
                )));
            }
            if ctx.registry.lookup_clone(&top_level, &new_clone_name).is_some() {
                return Err(ServerError::AlreadyExists {
                    what: format!("clone {new_clone_name} of {name}"),
                });
            }
            let command = Command::Clone {
                top_level_filesystem_id: top_level,
                origin_snapshot_id: snapshot_id,
                clone_name: new_clone_name,
            };
            match dispatch(ctx, &source, command).await? {
                Outcome::Cloned { filesystem_id } => to_value(&filesystem_id),
                other => Err(unexpected("clone", other)),
            }
        }
        RpcRequest::Procure { name, clone_name } => {
            let filesystem_id = ctx.registry.require(&name, &clone_name)?;
            procure(ctx, &filesystem_id).await?;
            to_value(&filesystem_id)
        }
        RpcRequest::Transfer { request } => to_value(&start_transfer(ctx, request).await?),
        RpcRequest::RegisterTransfer { poll } => {
            register_transfer(ctx, poll).await?;
            Ok(Value::Null)
        }
        RpcRequest::GetTransfer { transfer_id } => {
            let poll = ctx
                .ledger
                .get(&transfer_id)
                .await?
                .ok_or_else(|| ServerError::not_found(format!("transfer {transfer_id}")))?;
            to_value(&poll)
        }
        RpcRequest::DeducePathToTopLevelFilesystem { name, clone_name } => {
            let filesystem_id = ctx.registry.require(&name, &clone_name)?;
            to_value(&ctx.registry.deduce_path_to_top_level(&filesystem_id)?)
        }
        RpcRequest::RegisterFilesystem {
            path,
            become_master_if_not_exists,
        } => {
            register_filesystem(ctx, &path, become_master_if_not_exists).await?;
            Ok(Value::Null)
        }
        RpcRequest::PredictSize {
            filesystem_id,
            from,
            to_snapshot,
        } => {
            let range = SendRange::new(filesystem_id, from, to_snapshot);
            to_value(&ctx.zfs.predict_size(&range).await?)
        }
    }
}

/// Creates a top-level filesystem mastered here; returns its id.
async fn create(ctx: &Arc<NodeContext>, name: &VolumeName) -> Result<String, ServerError> {
    if ctx.registry.lookup(name).is_some() {
        return Err(ServerError::AlreadyExists {
            what: format!("filesystem {name}"),
        });
    }
    let filesystem_id = Uuid::new_v4().to_string();
    ctx.registry.register_filesystem(name, &filesystem_id).await?;
    ctx.claim_master_if_absent(&filesystem_id).await?;
    match dispatch(ctx, &filesystem_id, Command::Create).await? {
        Outcome::Created => {
            info!(%name, filesystem_id, "filesystem created");
            Ok(filesystem_id)
        }
        other => Err(unexpected("create", other)),
    }
}

/// Snapshots of a filesystem as its master sees them; empty when unknown.
async fn snapshots_by_id(
    ctx: &Arc<NodeContext>,
    filesystem_id: &str,
) -> Result<Vec<Snapshot>, ServerError> {
    match ctx.master_of(filesystem_id) {
        Some(master) if master != ctx.node_id => Ok(ctx
            .snapshots
            .get(&(master, filesystem_id.to_string()))
            .unwrap_or_default()),
        _ => Ok(ctx.zfs.discover(filesystem_id).await?.snapshots),
    }
}

/// Moves mastership of a filesystem to this node and mounts it here.
async fn procure(ctx: &Arc<NodeContext>, filesystem_id: &str) -> Result<(), ServerError> {
    let timeout = ctx.config.timing.procure_timeout();
    let what = || ServerError::Timeout {
        what: format!("procuring {filesystem_id}"),
    };
    match ctx.master_of(filesystem_id) {
        Some(master) if master != ctx.node_id => {
            let command = Command::Move {
                target: ctx.node_id.clone(),
            };
            match tokio::time::timeout(timeout, dispatch(ctx, filesystem_id, command))
                .await
                .map_err(|_| what())??
            {
                Outcome::Moved => {}
                other => return Err(unexpected("move", other)),
            }
            ctx.masters
                .insert(filesystem_id.to_string(), ctx.node_id.clone());
        }
        Some(_) => {}
        None => {
            ctx.claim_master_if_absent(filesystem_id).await?;
        }
    }
    let mounted = tokio::time::timeout(
        timeout,
        ctx.init_machine(filesystem_id).submit(Command::Mount),
    )
    .await
    .map_err(|_| what())??;
    match mounted {
        Outcome::Mounted => {
            info!(filesystem_id, "procured");
            Ok(())
        }
        other => Err(unexpected("mount", other)),
    }
}

/// Validates a transfer and registers the volume on whichever side lacks it, then starts it.
async fn start_transfer(
    ctx: &Arc<NodeContext>,
    request: TransferRequest,
) -> Result<String, ServerError> {
    let local_name = VolumeName::new(&request.local_namespace, &request.local_name);
    let remote_name = VolumeName::new(&request.remote_namespace, &request.remote_name);
    let client = PeerClient::new(&request.peer, &request.user, &request.api_key)?;

    let remote_id: Option<String> = client
        .call(&RpcRequest::Exists {
            name: remote_name.clone(),
            clone_name: request.remote_clone_name.clone(),
        })
        .await?;
    let local_id = ctx.registry.resolve(&local_name, &request.local_clone_name);

    let (filesystem_id, register_remote, register_local) =
        match (request.direction, local_id, remote_id) {
            (_, None, None) => {
                return Err(ServerError::not_found(format!(
                    "{local_name} locally and {remote_name} on {}",
                    request.peer
                )))
            }
            (TransferDirection::Push, None, Some(_)) => {
                return Err(ServerError::not_found(format!("{local_name} locally")))
            }
            (TransferDirection::Pull, Some(_), None) => {
                return Err(ServerError::not_found(format!(
                    "{remote_name} on {}",
                    request.peer
                )))
            }
            (TransferDirection::Push, Some(local), None) => (local, true, false),
            (TransferDirection::Pull, None, Some(remote)) => (remote, false, true),
            (_, Some(local), Some(remote)) => {
                if local != remote {
                    return Err(ServerError::invalid(format!(
                        "{local_name} ({local}) and {remote_name} ({remote}) are different filesystems"
                    )));
                }
                (local, false, false)
            }
        };

    match request.direction {
        TransferDirection::Push => {
            if let Some(dirty) = ctx.dirty.get(&filesystem_id) {
                if dirty.dirty_bytes > 0 {
                    return Err(ServerError::invalid(format!(
                        "{local_name} has {} uncommitted bytes on {}; snapshot before pushing",
                        dirty.dirty_bytes, dirty.server
                    )));
                }
            }
        }
        TransferDirection::Pull => {
            let containers = ctx.containers.containers_using(&filesystem_id).await?;
            if !containers.is_empty() {
                return Err(FsmError::CannotPullWhileContainersRunning { containers }.into());
            }
        }
    }

    if register_remote {
        let mut path = ctx.registry.deduce_path_to_top_level(&filesystem_id)?;
        path.top_level_filesystem_name = remote_name.clone();
        client
            .call::<Value>(&RpcRequest::RegisterFilesystem {
                path,
                become_master_if_not_exists: true,
            })
            .await?;
    }
    if register_local {
        let mut path: PathToTopLevelFilesystem = client
            .call(&RpcRequest::DeducePathToTopLevelFilesystem {
                name: remote_name.clone(),
                clone_name: request.remote_clone_name.clone(),
            })
            .await?;
        path.top_level_filesystem_name = local_name.clone();
        register_filesystem(ctx, &path, true).await?;
    }

    let transfer_id = Uuid::new_v4().to_string();
    let mut poll = TransferPollResult::new(&transfer_id, &request, &ctx.node_id, 0);
    poll.filesystem_id = filesystem_id.clone();
    ctx.ledger.record(&poll).await?;
    info!(
        transfer_id,
        filesystem_id,
        direction = %request.direction,
        peer = %request.peer,
        "transfer started"
    );

    let command = Command::Transfer {
        transfer_id: transfer_id.clone(),
        request,
    };
    let ctx = Arc::clone(ctx);
    let id = transfer_id.clone();
    tokio::spawn(async move {
        if let Err(e) = dispatch(&ctx, &filesystem_id, command).await {
            warn!(transfer_id = %id, error = %e, "transfer ended with an error");
        }
    });
    Ok(transfer_id)
}

/// Records a transfer initiated by another cluster and lets the filesystem's
/// machine take part in it.
async fn register_transfer(
    ctx: &Arc<NodeContext>,
    poll: TransferPollResult,
) -> Result<(), ServerError> {
    ctx.ledger.record(&poll).await?;
    let filesystem_id = poll.filesystem_id.clone();
    let transfer_id = poll.transfer_request_id.clone();
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        match dispatch(&ctx, &filesystem_id, Command::PeerTransfer { transfer: poll }).await {
            Ok(outcome) => info!(transfer_id, filesystem_id, ?outcome, "peer side of transfer done"),
            Err(e) => warn!(transfer_id, filesystem_id, error = %e, "peer side of transfer failed"),
        }
    });
    Ok(())
}

async fn register_filesystem(
    ctx: &Arc<NodeContext>,
    path: &PathToTopLevelFilesystem,
    become_master: bool,
) -> Result<(), ServerError> {
    ctx.registry.register_path(path).await?;
    if become_master {
        for filesystem_id in path.filesystem_ids() {
            if ctx.claim_master_if_absent(&filesystem_id).await? {
                ctx.init_machine(&filesystem_id);
            }
        }
    }
    Ok(())
}
