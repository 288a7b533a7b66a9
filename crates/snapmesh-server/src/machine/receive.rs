//! Receiving: fast-forwarding from the master of this filesystem.

use snapmesh_repl::{can_apply, Prelude, Reconciliation};
use tokio::io::BufReader;
use tracing::{info, warn};

use super::{FsMachine, FsmState};
use crate::error::ServerError;

impl FsMachine {
    pub(super) async fn receiving(&mut self) -> FsmState {
        match self.receive_from_master().await {
            Ok(()) => FsmState::Discovering,
            Err(e) => {
                warn!(filesystem_id = %self.id, error = %e, "receive from master failed");
                self.set_status(&format!("receive failed: {e}")).await;
                FsmState::Backoff
            }
        }
    }

    async fn receive_from_master(&self) -> Result<(), ServerError> {
        let Some(master) = self.ctx.master_of(&self.id) else {
            return Ok(());
        };
        let master_snapshots = self.ctx.master_snapshots(&self.id).unwrap_or_default();
        let local = self.shared.snapshots();
        let (from, to) = match can_apply(&master_snapshots, &local) {
            Reconciliation::FastForward { from, to } => (from, to),
            outcome => {
                // No automatic rebase: anything but a fast-forward waits for an operator.
                info!(
                    filesystem_id = %self.id,
                    master = %master,
                    outcome = outcome.name(),
                    "not receiving"
                );
                self.set_status(&format!("cannot receive from {master}: {}", outcome.name()))
                    .await;
                return Ok(());
            }
        };

        let address = self
            .ctx
            .address_of(&master)
            .ok_or_else(|| ServerError::not_found(format!("address of node {master}")))?;
        let base = self.stream_base(from.as_ref());
        self.set_status(&format!("receiving {base}..{} from {master}", to.id))
            .await;

        let client = self.ctx.peer_client(&address)?;
        let stream = client.get_stream(&self.id, &base, &to.id).await?;
        let mut reader = BufReader::new(stream);
        let prelude = Prelude::read_from(&mut reader).await?;
        self.ctx.zfs.receive(&self.id, &mut reader).await?;
        self.ctx
            .zfs
            .apply_metadata(&self.id, &prelude.snapshot_properties)
            .await?;
        info!(
            filesystem_id = %self.id,
            master = %master,
            from = %base,
            to = %to.id,
            "received from master"
        );
        Ok(())
    }
}
