//! Handoff: passing mastership to another node once it has caught up.

use snapmesh_repl::{can_apply, Reconciliation};
use snapmesh_store::Precondition;
use snapmesh_zfs::SnapshotMeta;
use tracing::{info, warn};

use super::{FsMachine, FsmState};
use crate::event::{FsmError, Outcome, Responder};

impl FsMachine {
    pub(super) async fn handoff(&mut self, target: String, responder: Responder) -> FsmState {
        let mut target_snapshots = self.ctx.notifications.server_snapshots.subscribe(&self.id);

        if self.shared.filesystem().mounted {
            if let Err(e) = self.ctx.zfs.unmount(&self.id).await {
                responder.respond(Err(FsmError::failed("unmount", e)));
                return FsmState::Backoff;
            }
        }

        let mut metadata = SnapshotMeta::new();
        metadata.insert("author".to_string(), "system".to_string());
        metadata.insert(
            "message".to_string(),
            format!(
                "Automatic snapshot during migration from {} to {}.",
                self.ctx.node_id, target
            ),
        );
        if let Err(e) = self.take_snapshot(metadata).await {
            responder.respond(Err(e));
            self.remount_after_failed_handoff().await;
            return FsmState::Backoff;
        }
        self.set_status(&format!("waiting for {target} to catch up"))
            .await;

        let deadline = tokio::time::sleep(self.ctx.config.timing.handoff_timeout());
        tokio::pin!(deadline);
        loop {
            let local = self.shared.snapshots();
            let theirs = self
                .ctx
                .snapshots
                .get(&(target.clone(), self.id.clone()))
                .unwrap_or_default();
            if can_apply(&local, &theirs) == Reconciliation::UpToDate {
                break;
            }
            tokio::select! {
                _ = &mut deadline => {
                    warn!(filesystem_id = %self.id, target = %target, "handoff timed out");
                    responder.respond(Err(FsmError::HandoffTimedOut { target }));
                    self.remount_after_failed_handoff().await;
                    return FsmState::Backoff;
                }
                Some(_) = target_snapshots.recv() => {}
                request = self.rx.recv() => match request {
                    Some(request) => request.responder.respond(Err(FsmError::BusyHandoff)),
                    None => return FsmState::Stopped,
                },
            }
        }

        let key = self.ctx.keys.master(&self.id);
        let moved = self
            .ctx
            .store
            .set(&key, &target, Precondition::Equals(self.ctx.node_id.clone()))
            .await;
        match moved {
            Ok(_) => {
                self.ctx.masters.insert(self.id.clone(), target.clone());
                info!(filesystem_id = %self.id, target = %target, "mastership handed off");
                responder.respond(Ok(Outcome::Moved));
                FsmState::Inactive
            }
            Err(e) => {
                responder.respond(Err(FsmError::failed("move-master", e)));
                self.remount_after_failed_handoff().await;
                FsmState::Backoff
            }
        }
    }

    async fn remount_after_failed_handoff(&self) {
        if let Err(e) = self.mount().await {
            warn!(filesystem_id = %self.id, error = %e, "remount after failed handoff failed");
        }
    }
}
