//! Everything a node shares between its state machines, the watcher and the
//! HTTP surface.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use snapmesh_repl::{PeerClient, TransferLedger};
use snapmesh_store::{CoordinationStore, KeySpace, Precondition};
use snapmesh_zfs::{Snapshot, ZfsBackend};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::caches::{AddressCache, DirtyCache, MasterCache, SnapshotCache, StateCache};
use crate::config::NodeConfig;
use crate::containers::ContainerInventory;
use crate::error::ServerError;
use crate::event::Reply;
use crate::machine::{FsMachine, MachineHandle};
use crate::notify::Notifications;
use crate::registry::Registry;

/// Shared state of one node.
pub struct NodeContext {
    /// This node's id.
    pub node_id: String,
    /// Configuration the node was started with.
    pub config: NodeConfig,
    /// Store key layout.
    pub keys: KeySpace,
    /// Coordination store.
    pub store: Arc<dyn CoordinationStore>,
    /// Local datasets.
    pub zfs: Arc<dyn ZfsBackend>,
    /// Container runtime.
    pub containers: Arc<dyn ContainerInventory>,
    /// Names and clones.
    pub registry: Registry,
    /// Transfer progress records.
    pub ledger: Arc<TransferLedger>,
    /// Filesystem id to master node.
    pub masters: MasterCache,
    /// Snapshots per node and filesystem.
    pub snapshots: SnapshotCache,
    /// Machine states per node and filesystem.
    pub states: StateCache,
    /// Dirty reports per filesystem.
    pub dirty: DirtyCache,
    /// Advertised addresses per node.
    pub addresses: AddressCache,
    /// Wake-ups for waiting machines.
    pub notifications: Notifications,
    machines: DashMap<String, MachineHandle>,
    pending: DashMap<String, oneshot::Sender<Reply>>,
    serving: DashSet<(String, String)>,
}

impl NodeContext {
    /// Context with empty caches.
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn CoordinationStore>,
        zfs: Arc<dyn ZfsBackend>,
        containers: Arc<dyn ContainerInventory>,
    ) -> Self {
        let keys = KeySpace::new(config.store.prefix.clone());
        Self {
            node_id: config.node_id.clone(),
            registry: Registry::new(Arc::clone(&store), keys.clone()),
            ledger: Arc::new(TransferLedger::new(Arc::clone(&store), keys.clone())),
            config,
            keys,
            store,
            zfs,
            containers,
            masters: MasterCache::new(),
            snapshots: SnapshotCache::new(),
            states: StateCache::new(),
            dirty: DirtyCache::new(),
            addresses: AddressCache::new(),
            notifications: Notifications::default(),
            machines: DashMap::new(),
            pending: DashMap::new(),
            serving: DashSet::new(),
        }
    }

    /// Handle of the machine for `filesystem_id`, starting it on first use.
    pub fn init_machine(self: &Arc<Self>, filesystem_id: &str) -> MachineHandle {
        match self.machines.entry(filesystem_id.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                debug!(filesystem_id, "starting state machine");
                let handle = FsMachine::spawn(Arc::clone(self), filesystem_id);
                entry.insert(handle.clone());
                handle
            }
        }
    }

    /// Handle of an already running machine.
    pub fn machine(&self, filesystem_id: &str) -> Option<MachineHandle> {
        self.machines.get(filesystem_id).map(|h| h.clone())
    }

    /// Ids of every filesystem with a running machine, sorted.
    pub fn machine_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.machines.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Current master of a filesystem, as last seen.
    pub fn master_of(&self, filesystem_id: &str) -> Option<String> {
        self.masters.get(&filesystem_id.to_string())
    }

    /// Whether this node masters the filesystem.
    pub fn is_master(&self, filesystem_id: &str) -> bool {
        self.master_of(filesystem_id).as_deref() == Some(self.node_id.as_str())
    }

    /// Snapshots of a filesystem on its master.
    pub fn master_snapshots(&self, filesystem_id: &str) -> Option<Vec<Snapshot>> {
        let master = self.master_of(filesystem_id)?;
        if master == self.node_id {
            if let Some(handle) = self.machine(filesystem_id) {
                return Some(handle.snapshots());
            }
        }
        self.snapshots.get(&(master, filesystem_id.to_string()))
    }

    /// Becomes master of a filesystem unless someone already is.
    ///
    /// Returns whether this node won.
    pub async fn claim_master_if_absent(&self, filesystem_id: &str) -> Result<bool, ServerError> {
        let key = self.keys.master(filesystem_id);
        match self.store.set(&key, &self.node_id, Precondition::Absent).await {
            Ok(_) => {
                info!(filesystem_id, node_id = %self.node_id, "claimed mastership");
                self.masters
                    .insert(filesystem_id.to_string(), self.node_id.clone());
                Ok(true)
            }
            Err(e) if e.is_precondition_failed() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// First advertised address of a node.
    pub fn address_of(&self, node_id: &str) -> Option<String> {
        self.addresses
            .get(&node_id.to_string())
            .and_then(|addresses| addresses.into_iter().next())
    }

    /// Client for another node of this cluster, using the node's own credentials.
    pub fn peer_client(&self, address: &str) -> Result<PeerClient, ServerError> {
        Ok(PeerClient::new(
            address,
            self.config.user.clone(),
            self.config.api_key.clone(),
        )?)
    }

    /// Starts waiting for the reply to a forwarded request.
    pub(crate) fn register_pending(&self, request_id: &str) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.to_string(), tx);
        rx
    }

    /// Hands a reply to whoever forwarded the request; false if nobody here did.
    pub(crate) fn complete_pending(&self, request_id: &str, reply: Reply) -> bool {
        match self.pending.remove(request_id) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Stops waiting for a forwarded request.
    pub(crate) fn abandon_pending(&self, request_id: &str) {
        self.pending.remove(request_id);
    }

    /// Claims a forwarded request for this node to run; false while it already runs.
    pub(crate) fn begin_serving(&self, filesystem_id: &str, request_id: &str) -> bool {
        self.serving
            .insert((filesystem_id.to_string(), request_id.to_string()))
    }

    /// Releases a forwarded request once its response is written.
    pub(crate) fn finish_serving(&self, filesystem_id: &str, request_id: &str) {
        self.serving
            .remove(&(filesystem_id.to_string(), request_id.to_string()));
    }
}
