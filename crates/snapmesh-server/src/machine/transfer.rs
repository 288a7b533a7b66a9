//! Transfers between clusters: the initiator states driving the path, and the
//! peer states answering them.

use std::io;
use std::time::Instant;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use snapmesh_repl::{
    can_apply, format_progress, restrict_snapshots, ByteCounter, LedgerEntry, PathSegment,
    PeerClient, Prelude, ProgressReader, Reconciliation, ReplError, RpcRequest,
    TransferDirection, TransferPollResult, TransferRequest, TransferStatus,
};
use snapmesh_zfs::{FromSnapshot, Origin, SendRange, SendStream, Snapshot};
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use super::{FsMachine, FsmState};
use crate::event::{Command, FsmError, Outcome, Responder};

/// What a segment will send once it is known to be a fast-forward.
struct SegmentPlan {
    source: Vec<Snapshot>,
    base: FromSnapshot,
    to: Snapshot,
}

/// A clone can only be sent once the receiver holds the snapshot it branched from.
fn require_origin(origin: &Origin, parent: &[Snapshot]) -> Result<(), FsmError> {
    if parent.iter().any(|s| s.id == origin.snapshot_id) {
        return Ok(());
    }
    Err(FsmError::CloneOriginMissing {
        filesystem_id: origin.filesystem_id.clone(),
        snapshot_id: origin.snapshot_id.clone(),
    })
}

fn transfer_error(err: ReplError) -> FsmError {
    if let ReplError::PeerStatus { body, .. } = &err {
        // Typed refusals from the peer travel as the error's JSON body.
        if let Ok(fsm) = serde_json::from_str::<FsmError>(body) {
            return fsm;
        }
    }
    FsmError::Transfer {
        message: err.to_string(),
    }
}

/// Classifies a segment; `Ok(None)` means the receiving side already has it.
fn plan_segment(
    segment: &PathSegment,
    sender: &[Snapshot],
    receiver: &[Snapshot],
) -> Result<Option<SegmentPlan>, FsmError> {
    let source = match &segment.target_snapshot {
        Some(target) => restrict_snapshots(sender, target).ok_or_else(|| {
            FsmError::NoSuchSnapshot {
                snapshot_id: target.clone(),
            }
        })?,
        None => sender,
    };
    match can_apply(source, receiver) {
        Reconciliation::FastForward { from, to } => {
            let base = match from {
                Some(common) => FromSnapshot::Snapshot(common.id),
                None => FromSnapshot::for_segment(None, segment.origin.as_ref()),
            };
            Ok(Some(SegmentPlan {
                source: source.to_vec(),
                base,
                to,
            }))
        }
        Reconciliation::UpToDate => Ok(None),
        Reconciliation::Ahead if segment.target_snapshot.is_some() => Ok(None),
        Reconciliation::NoFromSnaps => Err(FsmError::NothingToTransfer {
            filesystem_id: segment.filesystem_id.clone(),
        }),
        outcome => Err(FsmError::HistoriesDiverged {
            filesystem_id: segment.filesystem_id.clone(),
            outcome: outcome.name().to_string(),
        }),
    }
}

impl FsMachine {
    pub(super) async fn initiate_transfer(
        &mut self,
        transfer_id: String,
        request: TransferRequest,
        responder: Responder,
    ) -> FsmState {
        let path = match self.ctx.registry.deduce_path_to_top_level(&self.id) {
            Ok(path) => path,
            Err(e) => {
                responder.respond(Err(FsmError::failed("deduce-path", e)));
                return FsmState::Discovering;
            }
        };
        let segments = path.segments(&request.target_snapshot);

        let mut poll = match self.ctx.ledger.get(&transfer_id).await {
            Ok(Some(poll)) => poll,
            _ => TransferPollResult::new(&transfer_id, &request, &self.ctx.node_id, segments.len()),
        };
        poll.total = segments.len();
        poll.filesystem_id = self.id.clone();
        let mut entry = self.ctx.ledger.entry(poll);

        let result = match PeerClient::new(&request.peer, &request.user, &request.api_key) {
            Ok(client) => {
                self.apply_path(&mut entry, &client, request.direction, &segments)
                    .await
            }
            Err(e) => Err(transfer_error(e)),
        };

        match result {
            Ok(outcome) => {
                info!(filesystem_id = %self.id, transfer_id, ?outcome, "transfer finished");
                entry.set_status(TransferStatus::Finished, "").await;
                responder.respond(Ok(outcome));
            }
            Err(e) => {
                warn!(filesystem_id = %self.id, transfer_id, error = %e, "transfer failed");
                entry.set_status(TransferStatus::Failed, e.to_string()).await;
                responder.respond(Err(e));
            }
        }
        FsmState::Discovering
    }

    /// Transfers every segment root first; the first failed hop aborts the rest.
    async fn apply_path(
        &self,
        entry: &mut LedgerEntry,
        client: &PeerClient,
        direction: TransferDirection,
        segments: &[PathSegment],
    ) -> Result<Outcome, FsmError> {
        let mut outcome = Outcome::PeerUpToDate;
        for (index, segment) in segments.iter().enumerate() {
            info!(
                filesystem_id = %self.id,
                segment = %segment.filesystem_id,
                index,
                total = segments.len(),
                %direction,
                "transferring segment"
            );
            let hop = self.segment_with_retry(entry, client, direction, segment).await?;
            if direction == TransferDirection::Pull {
                self.mount_landed(&segment.filesystem_id).await;
            }
            entry.update(|poll| poll.index = index + 1).await;
            if hop != Outcome::PeerUpToDate {
                outcome = hop;
            }
        }
        Ok(outcome)
    }

    async fn segment_with_retry(
        &self,
        entry: &mut LedgerEntry,
        client: &PeerClient,
        direction: TransferDirection,
        segment: &PathSegment,
    ) -> Result<Outcome, FsmError> {
        let policy = self.ctx.config.timing.retry_policy();
        let attempts = policy.attempts.max(1);
        let entry = Mutex::new(entry);
        let result = policy
            .run_if("transfer segment", FsmError::is_retryable, |attempt| {
                let entry = &entry;
                async move {
                    let mut guard = entry.lock().await;
                    let entry: &mut LedgerEntry = &mut **guard;
                    let result = match direction {
                        TransferDirection::Push => self.push_segment(entry, client, segment).await,
                        TransferDirection::Pull => self.pull_segment(entry, client, segment).await,
                    };
                    if let Err(e) = &result {
                        if e.is_retryable() && attempt < attempts {
                            entry
                                .set_status(TransferStatus::Retry(attempt), e.to_string())
                                .await;
                        }
                    }
                    result
                }
            })
            .await;
        match result {
            Err(e) if e.is_retryable() => Err(FsmError::MaximumRetryAttemptsExceeded {
                last_error: e.to_string(),
            }),
            other => other,
        }
    }

    async fn local_snapshots(&self, filesystem_id: &str) -> Result<Vec<Snapshot>, FsmError> {
        self.ctx
            .zfs
            .discover(filesystem_id)
            .await
            .map(|fs| fs.snapshots)
            .map_err(|e| FsmError::failed("discover", e))
    }

    async fn remote_snapshots(
        &self,
        client: &PeerClient,
        filesystem_id: &str,
    ) -> Result<Vec<Snapshot>, FsmError> {
        client
            .call(&RpcRequest::SnapshotsById {
                filesystem_id: filesystem_id.to_string(),
            })
            .await
            .map_err(transfer_error)
    }

    async fn report_up_to_date(&self, entry: &mut LedgerEntry) -> Outcome {
        let message = "remote already up-to-date, nothing to do";
        entry.update(|poll| poll.message = message.to_string()).await;
        self.set_status(message).await;
        Outcome::PeerUpToDate
    }

    async fn report_progress(&self, entry: &mut LedgerEntry, counter: &ByteCounter, started: Instant) {
        let sent = counter.get();
        let elapsed = started.elapsed();
        let message = format_progress(sent, elapsed);
        entry
            .update(|poll| {
                poll.sent = sent;
                poll.nanoseconds_elapsed = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
                poll.message = message.clone();
            })
            .await;
        self.set_status(&message).await;
    }

    async fn register_with_peer(
        &self,
        entry: &mut LedgerEntry,
        client: &PeerClient,
        segment: &PathSegment,
        plan: &SegmentPlan,
    ) -> Result<(), FsmError> {
        entry
            .update(|poll| {
                poll.start_segment(&segment.filesystem_id, plan.base.to_string(), &plan.to.id);
                poll.status = TransferStatus::CalculatingSize;
                poll.message.clear();
            })
            .await;
        client
            .call::<serde_json::Value>(&RpcRequest::RegisterTransfer {
                poll: entry.poll().clone(),
            })
            .await
            .map_err(transfer_error)?;
        Ok(())
    }

    async fn push_segment(
        &self,
        entry: &mut LedgerEntry,
        client: &PeerClient,
        segment: &PathSegment,
    ) -> Result<Outcome, FsmError> {
        let filesystem_id = &segment.filesystem_id;
        entry
            .set_status(TransferStatus::SyncingMetadata, "")
            .await;
        let remote = self.remote_snapshots(client, filesystem_id).await?;
        let local = self.local_snapshots(filesystem_id).await?;
        let Some(plan) = plan_segment(segment, &local, &remote)? else {
            return Ok(self.report_up_to_date(entry).await);
        };

        if let FromSnapshot::CloneOrigin(origin) = &plan.base {
            let parent = self.remote_snapshots(client, &origin.filesystem_id).await?;
            require_origin(origin, &parent)?;
        }

        self.register_with_peer(entry, client, segment, &plan).await?;
        let range = SendRange::new(filesystem_id.clone(), plan.base.clone(), plan.to.id.clone());
        let size = self
            .ctx
            .zfs
            .predict_size(&range)
            .await
            .map_err(|e| FsmError::failed("predict-size", e))?;
        entry
            .update(|poll| {
                poll.size = size;
                poll.status = TransferStatus::Pushing;
            })
            .await;

        let prelude = Prelude::new(plan.source.clone())
            .encode()
            .map_err(transfer_error)?;
        let SendStream { reader, completion } = self
            .ctx
            .zfs
            .send(&range)
            .await
            .map_err(|e| FsmError::failed("send", e))?;

        let counter = ByteCounter::new();
        let (mut tx, rx) = futures::channel::mpsc::channel::<io::Result<Bytes>>(16);
        let mut chunks = ReaderStream::new(ProgressReader::new(reader, counter.clone()));
        let pump = tokio::spawn(async move {
            if tx.send(Ok(Bytes::from(prelude))).await.is_err() {
                return;
            }
            while let Some(chunk) = chunks.next().await {
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    return;
                }
            }
        });

        let started = Instant::now();
        let post = client.post_stream(
            filesystem_id,
            &plan.base,
            &plan.to.id,
            reqwest::Body::wrap_stream(rx),
        );
        tokio::pin!(post);
        let mut ticker = tokio::time::interval(self.ctx.config.timing.progress_interval());
        let posted = loop {
            tokio::select! {
                result = &mut post => break result,
                _ = ticker.tick() => self.report_progress(entry, &counter, started).await,
            }
        };
        if posted.is_err() {
            pump.abort();
        }
        let sent = completion.await;
        posted.map_err(transfer_error)?;
        sent.map_err(|e| FsmError::failed("send", e))?;

        self.report_progress(entry, &counter, started).await;
        info!(
            filesystem_id = %filesystem_id,
            from = %plan.base,
            to = %plan.to.id,
            bytes = counter.get(),
            "pushed segment"
        );
        Ok(Outcome::FinishedPush)
    }

    async fn pull_segment(
        &self,
        entry: &mut LedgerEntry,
        client: &PeerClient,
        segment: &PathSegment,
    ) -> Result<Outcome, FsmError> {
        let filesystem_id = &segment.filesystem_id;
        entry
            .set_status(TransferStatus::SyncingMetadata, "")
            .await;
        let remote = self.remote_snapshots(client, filesystem_id).await?;
        let local = self.local_snapshots(filesystem_id).await?;
        let Some(plan) = plan_segment(segment, &remote, &local)? else {
            return Ok(self.report_up_to_date(entry).await);
        };

        if let FromSnapshot::CloneOrigin(origin) = &plan.base {
            let parent = self.local_snapshots(&origin.filesystem_id).await?;
            require_origin(origin, &parent)?;
        }

        self.register_with_peer(entry, client, segment, &plan).await?;
        let size: u64 = client
            .call(&RpcRequest::PredictSize {
                filesystem_id: filesystem_id.clone(),
                from: plan.base.clone(),
                to_snapshot: plan.to.id.clone(),
            })
            .await
            .map_err(transfer_error)?;
        entry
            .update(|poll| {
                poll.size = size;
                poll.status = TransferStatus::Pulling;
            })
            .await;

        let counter = ByteCounter::new();
        let stream = client
            .get_stream(filesystem_id, &plan.base, &plan.to.id)
            .await
            .map_err(transfer_error)?;
        let mut reader = BufReader::new(ProgressReader::new(stream, counter.clone()));
        let prelude = Prelude::read_from(&mut reader)
            .await
            .map_err(transfer_error)?;

        let started = Instant::now();
        let receive = self.ctx.zfs.receive(filesystem_id, &mut reader);
        tokio::pin!(receive);
        let mut ticker = tokio::time::interval(self.ctx.config.timing.progress_interval());
        let received = loop {
            tokio::select! {
                result = &mut receive => break result,
                _ = ticker.tick() => self.report_progress(entry, &counter, started).await,
            }
        };
        received.map_err(|e| FsmError::failed("receive", e))?;
        self.ctx
            .zfs
            .apply_metadata(filesystem_id, &prelude.snapshot_properties)
            .await
            .map_err(|e| FsmError::failed("apply-metadata", e))?;

        self.report_progress(entry, &counter, started).await;
        info!(
            filesystem_id = %filesystem_id,
            from = %plan.base,
            to = %plan.to.id,
            bytes = counter.get(),
            "pulled segment"
        );
        Ok(Outcome::FinishedPull)
    }

    /// Mounts a pulled filesystem if this node masters it.
    async fn mount_landed(&self, filesystem_id: &str) {
        if !self.ctx.is_master(filesystem_id) {
            return;
        }
        if filesystem_id == self.id {
            if let Err(e) = self.mount().await {
                warn!(filesystem_id, error = %e, "mount after pull failed");
            }
        } else {
            // Answered by that filesystem's own machine; nobody waits for it.
            drop(self.ctx.init_machine(filesystem_id).dispatch(Command::Mount));
        }
    }

    pub(super) async fn push_peer(
        &mut self,
        transfer: TransferPollResult,
        responder: Responder,
    ) -> FsmState {
        let target = transfer.target_snapshot.clone();
        let mut landed = self
            .ctx
            .notifications
            .external_snapshots_changed
            .subscribe(&self.id);
        let mut progress = self.ctx.notifications.receive_progress.subscribe(&self.id);
        let timeout = self.ctx.config.timing.peer_push_timeout();
        self.set_status(&format!(
            "waiting for {} to push {target}",
            transfer.initiator_node
        ))
        .await;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            match self.discover().await {
                Ok(fs) if fs.exists && (target.is_empty() || fs.has_snapshot(&target)) => break,
                Ok(_) => {}
                Err(e) => warn!(filesystem_id = %self.id, error = %e, "discovery failed"),
            }
            tokio::select! {
                _ = &mut deadline => {
                    warn!(filesystem_id = %self.id, snapshot_id = %target, "pushed snapshot never arrived");
                    responder.respond(Err(FsmError::TimedOutExternalSnaps { snapshot_id: target }));
                    return FsmState::Backoff;
                }
                Some(bytes) = progress.recv() => {
                    deadline.as_mut().reset(tokio::time::Instant::now() + timeout);
                    self.set_status(&format!("received {bytes} bytes of {target}")).await;
                }
                Some(()) = landed.recv() => {}
            }
        }

        if self.ctx.is_master(&self.id) && !self.shared.filesystem().mounted {
            if let Err(e) = self.mount().await {
                warn!(filesystem_id = %self.id, error = %e, "mount after push failed");
            }
        }
        info!(filesystem_id = %self.id, snapshot_id = %target, "push received");
        responder.respond(Ok(Outcome::ReceivingPushComplete));
        FsmState::Discovering
    }

    pub(super) async fn pull_peer(&mut self, responder: Responder) -> FsmState {
        responder.respond(Ok(Outcome::ProvidingPull));
        FsmState::Discovering
    }
}
