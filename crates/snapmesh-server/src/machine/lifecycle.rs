//! Discovering, missing, inactive and active states.

use std::time::Duration;

use chrono::Utc;
use snapmesh_repl::{FilesystemClone, TransferDirection};
use snapmesh_zfs::{Origin, Snapshot, SnapshotMeta};
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{info, warn};
use uuid::Uuid;

use super::{FsMachine, FsmState};
use crate::event::{Command, FsmError, Outcome, Request};

/// Why an idle state woke up.
enum Wake {
    Request(Request),
    Receive,
    Rediscover,
    Closed,
}

/// Metadata key holding the creation time in nanoseconds.
pub(crate) const TIMESTAMP_KEY: &str = "timestamp";

pub(crate) fn with_timestamp(mut metadata: SnapshotMeta) -> SnapshotMeta {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    metadata.insert(TIMESTAMP_KEY.to_string(), nanos.to_string());
    metadata
}

impl FsMachine {
    pub(super) async fn discovering(&mut self) -> FsmState {
        let filesystem = match self.discover().await {
            Ok(filesystem) => filesystem,
            Err(e) => {
                warn!(filesystem_id = %self.id, error = %e, "discovery failed");
                return FsmState::Backoff;
            }
        };
        if !filesystem.exists {
            return FsmState::Missing;
        }
        if filesystem.mounted {
            return FsmState::Active;
        }
        if self.ctx.is_master(&self.id) {
            // The master keeps its copy mounted.
            match self.mount().await {
                Ok(()) => return FsmState::Active,
                Err(e) => {
                    warn!(filesystem_id = %self.id, error = %e, "mount failed");
                    return FsmState::Backoff;
                }
            }
        }
        FsmState::Inactive
    }

    /// Waits for a request or a feasible receive. A pushed stream landing also wakes it.
    ///
    /// Queued requests win over receiving.
    async fn idle(&mut self) -> Wake {
        let mut master_snapshots = self.ctx.notifications.master_snapshots.subscribe(&self.id);
        let mut external = self
            .ctx
            .notifications
            .external_snapshots_changed
            .subscribe(&self.id);
        let mut recheck = tokio::time::interval(self.ctx.config.timing.backoff().max(Duration::from_millis(10)));
        loop {
            match self.rx.try_recv() {
                Ok(request) => return Wake::Request(request),
                Err(TryRecvError::Disconnected) => return Wake::Closed,
                Err(TryRecvError::Empty) => {}
            }
            if self.can_receive() {
                return Wake::Receive;
            }
            tokio::select! {
                request = self.rx.recv() => {
                    return match request {
                        Some(request) => Wake::Request(request),
                        None => Wake::Closed,
                    };
                }
                Some(_) = master_snapshots.recv() => {}
                Some(()) = external.recv() => return Wake::Rediscover,
                _ = recheck.tick() => {}
            }
        }
    }

    pub(super) async fn missing(&mut self) -> FsmState {
        let request = match self.idle().await {
            Wake::Request(request) => request,
            Wake::Receive => return FsmState::Receiving,
            Wake::Rediscover => return FsmState::Discovering,
            Wake::Closed => return FsmState::Stopped,
        };
        let Request {
            command,
            responder,
        } = request;
        match command {
            Command::Create => {
                let result = async {
                    self.ctx.zfs.create(&self.id).await?;
                    self.ctx.zfs.mount(&self.id).await?;
                    self.discover().await
                }
                .await;
                match result {
                    Ok(_) => {
                        info!(filesystem_id = %self.id, "created filesystem");
                        responder.respond(Ok(Outcome::Created));
                        FsmState::Active
                    }
                    Err(e) => {
                        responder.respond(Err(FsmError::failed("create", e)));
                        FsmState::Backoff
                    }
                }
            }
            Command::Mount => {
                // A pull may have just landed the dataset.
                match self.discover().await {
                    Ok(filesystem) if filesystem.exists => match self.mount().await {
                        Ok(()) => {
                            responder.respond(Ok(Outcome::Mounted));
                            FsmState::Active
                        }
                        Err(e) => {
                            responder.respond(Err(FsmError::failed("mount", e)));
                            FsmState::Backoff
                        }
                    },
                    _ => self.unhandled(
                        "missing",
                        Request {
                            command: Command::Mount,
                            responder,
                        },
                    ),
                }
            }
            Command::Transfer {
                request,
                transfer_id,
            } => match request.direction {
                TransferDirection::Push => {
                    responder.respond(Err(FsmError::CantPushWhileMissing));
                    FsmState::Discovering
                }
                TransferDirection::Pull => FsmState::PullInitiator {
                    transfer_id,
                    request,
                    responder,
                },
            },
            Command::PeerTransfer { transfer } => match transfer.direction {
                TransferDirection::Push => FsmState::PushPeer {
                    transfer,
                    responder,
                },
                TransferDirection::Pull => {
                    responder.respond(Err(FsmError::CantProvidePullWhileMissing));
                    FsmState::Discovering
                }
            },
            command => self.unhandled("missing", Request { command, responder }),
        }
    }

    pub(super) async fn inactive(&mut self) -> FsmState {
        let request = match self.idle().await {
            Wake::Request(request) => request,
            Wake::Receive => return FsmState::Receiving,
            Wake::Rediscover => return FsmState::Discovering,
            Wake::Closed => return FsmState::Stopped,
        };
        let Request {
            command,
            responder,
        } = request;
        match command {
            Command::Mount => match self.mount().await {
                Ok(()) => {
                    responder.respond(Ok(Outcome::Mounted));
                    FsmState::Active
                }
                Err(e) => {
                    responder.respond(Err(FsmError::failed("mount", e)));
                    FsmState::Backoff
                }
            },
            Command::Unmount => {
                responder.respond(Ok(Outcome::Unmounted));
                FsmState::Inactive
            }
            Command::Move { target } => {
                if target == self.ctx.node_id {
                    responder.respond(Ok(Outcome::Moved));
                    FsmState::Inactive
                } else {
                    FsmState::Handoff { target, responder }
                }
            }
            Command::Transfer {
                transfer_id,
                request,
            } => match request.direction {
                TransferDirection::Push => FsmState::PushInitiator {
                    transfer_id,
                    request,
                    responder,
                },
                TransferDirection::Pull => FsmState::PullInitiator {
                    transfer_id,
                    request,
                    responder,
                },
            },
            Command::PeerTransfer { transfer } => match transfer.direction {
                TransferDirection::Push => FsmState::PushPeer {
                    transfer,
                    responder,
                },
                TransferDirection::Pull => FsmState::PullPeer { responder },
            },
            command => self.unhandled("inactive", Request { command, responder }),
        }
    }

    pub(super) async fn active(&mut self) -> FsmState {
        let Some(Request {
            command,
            responder,
        }) = self.rx.recv().await
        else {
            return FsmState::Stopped;
        };
        match command {
            Command::Snapshot { metadata } => match self.take_snapshot(metadata).await {
                Ok(snapshot_id) => {
                    responder.respond(Ok(Outcome::Snapshotted { snapshot_id }));
                    FsmState::Active
                }
                Err(e) => {
                    responder.respond(Err(e));
                    FsmState::Backoff
                }
            },
            Command::Rollback { snapshot_id } => {
                if !self.shared.filesystem().has_snapshot(&snapshot_id) {
                    responder.respond(Err(FsmError::NoSuchSnapshot { snapshot_id }));
                    return FsmState::Active;
                }
                match self.rollback(&snapshot_id).await {
                    Ok(()) => {
                        responder.respond(Ok(Outcome::RolledBack));
                        FsmState::Active
                    }
                    Err(e) => {
                        responder.respond(Err(e));
                        FsmState::Backoff
                    }
                }
            }
            Command::Clone {
                top_level_filesystem_id,
                origin_snapshot_id,
                clone_name,
            } => {
                if !self.shared.filesystem().has_snapshot(&origin_snapshot_id) {
                    responder.respond(Err(FsmError::NoSuchSnapshot {
                        snapshot_id: origin_snapshot_id,
                    }));
                    return FsmState::Active;
                }
                let result = self
                    .branch(&top_level_filesystem_id, &origin_snapshot_id, &clone_name)
                    .await;
                responder.respond(result.map(|filesystem_id| Outcome::Cloned { filesystem_id }));
                FsmState::Active
            }
            Command::Mount => {
                responder.respond(Ok(Outcome::Mounted));
                FsmState::Active
            }
            Command::Unmount => {
                let containers = match self.attached_containers().await {
                    Ok(containers) => containers,
                    Err(e) => {
                        responder.respond(Err(e));
                        return FsmState::Active;
                    }
                };
                if !containers.is_empty() {
                    responder.respond(Err(FsmError::CannotUnmountWhileContainersRunning {
                        containers,
                    }));
                    return FsmState::Active;
                }
                match self.ctx.zfs.unmount(&self.id).await {
                    Ok(()) => {
                        let _ = self.discover().await;
                        responder.respond(Ok(Outcome::Unmounted));
                        FsmState::Inactive
                    }
                    Err(e) => {
                        responder.respond(Err(FsmError::failed("unmount", e)));
                        FsmState::Backoff
                    }
                }
            }
            Command::Move { target } => {
                let containers = match self.attached_containers().await {
                    Ok(containers) => containers,
                    Err(e) => {
                        responder.respond(Err(e));
                        return FsmState::Active;
                    }
                };
                if !containers.is_empty() {
                    responder.respond(Err(FsmError::CannotMoveWhileContainersRunning {
                        containers,
                    }));
                    return FsmState::Active;
                }
                if target == self.ctx.node_id {
                    responder.respond(Ok(Outcome::Moved));
                    return FsmState::Active;
                }
                FsmState::Handoff { target, responder }
            }
            Command::Transfer {
                transfer_id,
                request,
            } => match request.direction {
                TransferDirection::Push => FsmState::PushInitiator {
                    transfer_id,
                    request,
                    responder,
                },
                TransferDirection::Pull => match self.attached_containers().await {
                    Ok(containers) if !containers.is_empty() => {
                        responder.respond(Err(FsmError::CannotPullWhileContainersRunning {
                            containers,
                        }));
                        FsmState::Active
                    }
                    Ok(_) => FsmState::PullInitiator {
                        transfer_id,
                        request,
                        responder,
                    },
                    Err(e) => {
                        responder.respond(Err(e));
                        FsmState::Active
                    }
                },
            },
            Command::PeerTransfer { transfer } => match transfer.direction {
                TransferDirection::Push => match self.attached_containers().await {
                    Ok(containers) if !containers.is_empty() => {
                        responder.respond(Err(
                            FsmError::CannotReceivePushWhileContainersRunning { containers },
                        ));
                        FsmState::Active
                    }
                    Ok(_) => FsmState::PushPeer {
                        transfer,
                        responder,
                    },
                    Err(e) => {
                        responder.respond(Err(e));
                        FsmState::Active
                    }
                },
                TransferDirection::Pull => FsmState::PullPeer { responder },
            },
            command @ Command::Create => self.unhandled("active", Request { command, responder }),
        }
    }

    pub(super) async fn mount(&self) -> Result<(), snapmesh_zfs::ZfsError> {
        self.ctx.zfs.mount(&self.id).await?;
        self.discover().await.map(|_| ())
    }

    pub(super) async fn attached_containers(&self) -> Result<Vec<String>, FsmError> {
        self.ctx
            .containers
            .containers_using(&self.id)
            .await
            .map_err(|e| FsmError::failed("list-containers", e))
    }

    /// Takes a snapshot with a fresh id; returns the id.
    pub(super) async fn take_snapshot(&self, metadata: SnapshotMeta) -> Result<String, FsmError> {
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            metadata: with_timestamp(metadata),
        };
        self.ctx
            .zfs
            .snapshot(&self.id, &snapshot)
            .await
            .map_err(|e| FsmError::failed("snapshot", e))?;
        self.discover()
            .await
            .map_err(|e| FsmError::failed("discover", e))?;
        info!(filesystem_id = %self.id, snapshot_id = %snapshot.id, "snapshot taken");
        Ok(snapshot.id)
    }

    async fn rollback(&self, snapshot_id: &str) -> Result<(), FsmError> {
        let stopped = self
            .ctx
            .containers
            .stop(&self.id)
            .await
            .map_err(|e| FsmError::failed("stop-containers", e))?;
        let rolled_back = self.ctx.zfs.rollback(&self.id, snapshot_id).await;
        let discovered = self.discover().await;
        // Restart containers whatever happened to the dataset.
        let restarted = self.ctx.containers.start(&self.id, &stopped).await;

        rolled_back.map_err(|e| FsmError::failed("rollback", e))?;
        discovered.map_err(|e| FsmError::failed("discover", e))?;
        restarted.map_err(|e| FsmError::failed("start-containers", e))?;
        info!(filesystem_id = %self.id, snapshot_id, "rolled back");
        Ok(())
    }

    async fn branch(
        &self,
        top_level_filesystem_id: &str,
        origin_snapshot_id: &str,
        clone_name: &str,
    ) -> Result<String, FsmError> {
        let filesystem_id = Uuid::new_v4().to_string();
        let origin = Origin::new(self.id.clone(), origin_snapshot_id);
        self.ctx
            .registry
            .register_clone(
                top_level_filesystem_id,
                clone_name,
                FilesystemClone {
                    filesystem_id: filesystem_id.clone(),
                    origin: origin.clone(),
                },
            )
            .await
            .map_err(|e| FsmError::failed("register-clone", e))?;
        self.ctx
            .zfs
            .clone_snapshot(&origin, &filesystem_id)
            .await
            .map_err(|e| FsmError::failed("clone", e))?;
        self.ctx
            .claim_master_if_absent(&filesystem_id)
            .await
            .map_err(|e| FsmError::failed("claim-master", e))?;
        self.ctx.init_machine(&filesystem_id);
        info!(
            filesystem_id = %self.id,
            clone_id = %filesystem_id,
            clone_name,
            origin = %origin,
            "cloned"
        );
        Ok(filesystem_id)
    }
}
