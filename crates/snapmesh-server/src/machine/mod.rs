//! One actor per filesystem.
//!
//! Each machine owns a request queue and runs a loop of states; every state
//! is an async method returning the next state. Requests carry their own
//! [`Responder`], and the state that takes a request off the queue answers
//! it before moving on, so callers never wait on a dropped request.
//!
//! ```text
//! discovering -> missing | inactive | active
//! missing     -> receiving | active | pull-initiator | push-peer
//! inactive    -> receiving | active | handoff | *-initiator | *-peer
//! active      -> handoff | inactive | *-initiator | *-peer
//! receiving, *-initiator, *-peer -> discovering
//! errors      -> backoff -> discovering
//! ```

mod handoff;
mod lifecycle;
mod receive;
mod transfer;

use std::sync::{Arc, RwLock};

use snapmesh_repl::{can_apply, Reconciliation, TransferPollResult, TransferRequest};
use snapmesh_store::{Precondition, StoreExt};
use snapmesh_zfs::{Filesystem, FromSnapshot, Origin, Snapshot, ZfsError};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::caches::StateRecord;
use crate::context::NodeContext;
use crate::event::{Command, FsmError, Reply, Request, Responder};
use crate::tasks;

/// Machine states.
pub(crate) enum FsmState {
    Discovering,
    Missing,
    Inactive,
    Active,
    Receiving,
    Backoff,
    Handoff {
        target: String,
        responder: Responder,
    },
    PushInitiator {
        transfer_id: String,
        request: TransferRequest,
        responder: Responder,
    },
    PullInitiator {
        transfer_id: String,
        request: TransferRequest,
        responder: Responder,
    },
    PushPeer {
        transfer: TransferPollResult,
        responder: Responder,
    },
    PullPeer {
        responder: Responder,
    },
    Stopped,
}

impl FsmState {
    fn name(&self) -> &'static str {
        match self {
            FsmState::Discovering => "discovering",
            FsmState::Missing => "missing",
            FsmState::Inactive => "inactive",
            FsmState::Active => "active",
            FsmState::Receiving => "receiving",
            FsmState::Backoff => "backoff",
            FsmState::Handoff { .. } => "handoff",
            FsmState::PushInitiator { .. } => "push-initiator",
            FsmState::PullInitiator { .. } => "pull-initiator",
            FsmState::PushPeer { .. } => "push-peer",
            FsmState::PullPeer { .. } => "pull-peer",
            FsmState::Stopped => "stopped",
        }
    }
}

/// State shared between a machine and its helper tasks.
pub struct MachineShared {
    filesystem: RwLock<Filesystem>,
    state: RwLock<StateRecord>,
    /// Signalled whenever the local snapshot list changes.
    pub(crate) snapshots_modified: Notify,
}

impl MachineShared {
    fn new(filesystem_id: &str) -> Self {
        Self {
            filesystem: RwLock::new(Filesystem::missing(filesystem_id)),
            state: RwLock::new(StateRecord::default()),
            snapshots_modified: Notify::new(),
        }
    }

    /// Last discovered filesystem.
    pub fn filesystem(&self) -> Filesystem {
        self.filesystem
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Last discovered snapshots.
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.filesystem
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .snapshots
            .clone()
    }

    /// Current state and status.
    pub fn state(&self) -> StateRecord {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_filesystem(&self, filesystem: Filesystem) -> bool {
        let mut current = self.filesystem.write().unwrap_or_else(|e| e.into_inner());
        let changed = current.snapshots != filesystem.snapshots;
        *current = filesystem;
        changed
    }

    fn set_state(&self, record: StateRecord) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = record;
    }
}

/// Cheap handle for talking to a machine.
#[derive(Clone)]
pub struct MachineHandle {
    filesystem_id: String,
    tx: mpsc::UnboundedSender<Request>,
    shared: Arc<MachineShared>,
}

impl MachineHandle {
    /// Filesystem the machine manages.
    pub fn filesystem_id(&self) -> &str {
        &self.filesystem_id
    }

    /// Queues a command; the reply arrives on the returned receiver.
    pub fn dispatch(&self, command: Command) -> tokio::sync::oneshot::Receiver<Reply> {
        let (responder, rx) = Responder::channel();
        if let Err(mpsc::error::SendError(request)) = self.tx.send(Request { command, responder }) {
            request.responder.respond(Err(FsmError::failed(
                request.command.name(),
                "state machine has stopped",
            )));
        }
        rx
    }

    /// Queues a command and waits for the reply.
    pub async fn submit(&self, command: Command) -> Reply {
        let name = command.name();
        self.dispatch(command)
            .await
            .unwrap_or_else(|_| Err(FsmError::failed(name, "state machine dropped the request")))
    }

    /// Last discovered filesystem.
    pub fn filesystem(&self) -> Filesystem {
        self.shared.filesystem()
    }

    /// Last discovered snapshots.
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.shared.snapshots()
    }

    /// Current state and status.
    pub fn state(&self) -> StateRecord {
        self.shared.state()
    }
}

/// The actor itself.
pub(crate) struct FsMachine {
    ctx: Arc<NodeContext>,
    id: String,
    rx: mpsc::UnboundedReceiver<Request>,
    shared: Arc<MachineShared>,
}

impl FsMachine {
    /// Starts the machine and its helper tasks.
    pub(crate) fn spawn(ctx: Arc<NodeContext>, filesystem_id: &str) -> MachineHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MachineShared::new(filesystem_id));

        tasks::spawn_dirty_poller(Arc::clone(&ctx), filesystem_id, Arc::clone(&shared));
        tasks::spawn_snapshot_relay(Arc::clone(&ctx), filesystem_id, Arc::clone(&shared));

        let machine = FsMachine {
            ctx,
            id: filesystem_id.to_string(),
            rx,
            shared: Arc::clone(&shared),
        };
        tokio::spawn(machine.run());

        MachineHandle {
            filesystem_id: filesystem_id.to_string(),
            tx,
            shared,
        }
    }

    async fn run(mut self) {
        let mut state = FsmState::Discovering;
        loop {
            let name = state.name();
            self.transitioned_to(name, "").await;
            state = match state {
                FsmState::Discovering => self.discovering().await,
                FsmState::Missing => self.missing().await,
                FsmState::Inactive => self.inactive().await,
                FsmState::Active => self.active().await,
                FsmState::Receiving => self.receiving().await,
                FsmState::Backoff => self.backoff().await,
                FsmState::Handoff { target, responder } => self.handoff(target, responder).await,
                FsmState::PushInitiator {
                    transfer_id,
                    request,
                    responder,
                }
                | FsmState::PullInitiator {
                    transfer_id,
                    request,
                    responder,
                } => self.initiate_transfer(transfer_id, request, responder).await,
                FsmState::PushPeer {
                    transfer,
                    responder,
                } => self.push_peer(transfer, responder).await,
                FsmState::PullPeer { responder } => self.pull_peer(responder).await,
                FsmState::Stopped => {
                    info!(filesystem_id = %self.id, "state machine stopped");
                    return;
                }
            };
        }
    }

    /// Publishes the current state locally and to the store.
    async fn transitioned_to(&self, state: &str, status: &str) {
        debug!(filesystem_id = %self.id, state, status, "transition");
        let record = StateRecord {
            state: state.to_string(),
            status: status.to_string(),
        };
        self.shared.set_state(record.clone());
        self.ctx
            .states
            .insert((self.ctx.node_id.clone(), self.id.clone()), record.clone());
        let key = self.ctx.keys.server_state(&self.ctx.node_id, &self.id);
        if let Err(e) = self
            .ctx
            .store
            .set_json(&key, &record, Precondition::None)
            .await
        {
            warn!(filesystem_id = %self.id, error = %e, "failed to publish state");
        }
    }

    /// Updates the status within the current state.
    async fn set_status(&self, status: &str) {
        let state = self.shared.state().state;
        self.transitioned_to(&state, status).await;
    }

    /// Re-reads the filesystem from disk and signals snapshot changes.
    async fn discover(&self) -> Result<Filesystem, ZfsError> {
        let filesystem = self.ctx.zfs.discover(&self.id).await?;
        if self.shared.set_filesystem(filesystem.clone()) {
            self.shared.snapshots_modified.notify_one();
        }
        Ok(filesystem)
    }

    /// Where this filesystem was cloned from, if it is a clone.
    fn clone_origin(&self) -> Option<Origin> {
        self.ctx
            .registry
            .lookup_clone_by_id(&self.id)
            .map(|(_, _, clone)| clone.origin)
            .or_else(|| self.shared.filesystem().origin)
    }

    /// Whether an incremental pull from the current master is possible now.
    fn can_receive(&self) -> bool {
        let Some(master) = self.ctx.master_of(&self.id) else {
            return false;
        };
        if master == self.ctx.node_id {
            return false;
        }
        let Some(master_snapshots) = self.ctx.snapshots.get(&(master, self.id.clone())) else {
            return false;
        };
        let local = self.shared.snapshots();
        match can_apply(&master_snapshots, &local) {
            Reconciliation::FastForward { from: None, .. } => {
                match self.clone_origin() {
                    // The origin snapshot must be here before a clone stream can land.
                    Some(origin) => self.origin_present(&origin),
                    None => true,
                }
            }
            outcome => outcome.is_fast_forward(),
        }
    }

    fn origin_present(&self, origin: &Origin) -> bool {
        self.ctx
            .machine(&origin.filesystem_id)
            .map(|h| h.filesystem().has_snapshot(&origin.snapshot_id))
            .unwrap_or(false)
    }

    /// Base of a stream that brings this filesystem from `common` forward.
    fn stream_base(&self, common: Option<&Snapshot>) -> FromSnapshot {
        let origin = match common {
            Some(_) => None,
            None => self.clone_origin(),
        };
        FromSnapshot::for_segment(common.map(|s| s.id.as_str()), origin.as_ref())
    }

    /// Answers a request the current state does not handle.
    fn unhandled(&self, state: &str, request: Request) -> FsmState {
        warn!(
            filesystem_id = %self.id,
            state,
            event = request.command.name(),
            "unhandled request"
        );
        request.responder.respond(Err(FsmError::Unhandled {
            state: state.to_string(),
            event: request.command.name().to_string(),
        }));
        FsmState::Backoff
    }

    async fn backoff(&mut self) -> FsmState {
        tokio::time::sleep(self.ctx.config.timing.backoff()).await;
        FsmState::Discovering
    }
}
