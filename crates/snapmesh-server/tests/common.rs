//! Nodes on in-memory stores and datasets, with fast timings.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use snapmesh_repl::{RpcRequest, VolumeName};
use snapmesh_server::config::{ContainerBackend, StoreBackend, ZfsBackendKind};
use snapmesh_server::{NodeConfig, NodeContext, Node, StaticInventory, TimingConfig};
use snapmesh_store::MemoryStore;
use snapmesh_zfs::MemoryZfs;
use tokio::net::TcpListener;

pub const USER: &str = "admin";
pub const API_KEY: &str = "test-key";

/// Timings short enough for tests, long enough not to fire spuriously.
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        transfer_attempts: 3,
        retry_stride_ms: 20,
        peer_push_timeout_ms: 10_000,
        backoff_ms: 20,
        procure_timeout_ms: 10_000,
        dirty_poll_interval_ms: 25,
        handoff_timeout_ms: 10_000,
        address_refresh_ms: 1_000,
        remote_request_timeout_ms: 10_000,
        long_request_timeout_ms: 30_000,
        progress_interval_ms: 20,
    }
}

pub fn test_config(node_id: &str, advertise: Option<SocketAddr>) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node_id = node_id.to_string();
    config.user = USER.to_string();
    config.api_key = API_KEY.to_string();
    config.store.backend = StoreBackend::Memory;
    config.zfs.backend = ZfsBackendKind::Memory;
    config.containers.backend = ContainerBackend::None;
    config.timing = fast_timing();
    match advertise {
        Some(addr) => {
            config.bind_addr = addr;
            config.advertise_addresses = vec![addr.to_string()];
        }
        // Unreachable on purpose: such nodes never serve streams.
        None => config.bind_addr = SocketAddr::from(([127, 0, 0, 1], 0)),
    }
    config
}

/// One node with handles on its fakes.
pub struct TestNode {
    pub node: Arc<Node>,
    pub zfs: MemoryZfs,
    pub containers: StaticInventory,
    pub addr: Option<SocketAddr>,
}

impl TestNode {
    /// Node without an HTTP listener.
    pub async fn start(store: &Arc<MemoryStore>, node_id: &str) -> Self {
        Self::start_inner(store, node_id, None, fast_timing()).await
    }

    /// Node without an HTTP listener, on custom timings.
    pub async fn start_with_timing(
        store: &Arc<MemoryStore>,
        node_id: &str,
        timing: TimingConfig,
    ) -> Self {
        Self::start_inner(store, node_id, None, timing).await
    }

    /// Node serving HTTP on an ephemeral localhost port.
    pub async fn start_http(store: &Arc<MemoryStore>, node_id: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let node = Self::start_inner(store, node_id, Some(addr), fast_timing()).await;
        let server = Arc::clone(&node.node);
        tokio::spawn(async move {
            server.serve(listener).await.unwrap();
        });
        node
    }

    async fn start_inner(
        store: &Arc<MemoryStore>,
        node_id: &str,
        addr: Option<SocketAddr>,
        timing: TimingConfig,
    ) -> Self {
        let zfs = MemoryZfs::new();
        let containers = StaticInventory::new();
        let mut config = test_config(node_id, addr);
        config.timing = timing;
        let node = Node::start(
            config,
            store.clone(),
            Arc::new(zfs.clone()),
            Arc::new(containers.clone()),
        )
        .await
        .unwrap();
        Self {
            node: Arc::new(node),
            zfs,
            containers,
            addr,
        }
    }

    pub fn ctx(&self) -> &Arc<NodeContext> {
        self.node.context()
    }

    pub fn peer(&self) -> String {
        self.addr.expect("node has no listener").to_string()
    }

    /// Runs an RPC as `admin` and decodes its result.
    pub async fn call<T: serde::de::DeserializeOwned>(&self, request: RpcRequest) -> T {
        let method = request.method();
        snapmesh_server::rpc::handle(self.ctx(), request, USER)
            .await
            .into_result()
            .unwrap_or_else(|e| panic!("{method} failed: {e}"))
    }

    /// Runs an RPC and returns the error name it failed with.
    pub async fn call_err(&self, request: RpcRequest) -> String {
        let response = snapmesh_server::rpc::handle(self.ctx(), request, USER).await;
        match response.error {
            Some(error) => error.name,
            None => panic!("expected an error, got {:?}", response.result),
        }
    }

    /// Creates a top-level filesystem and returns its id.
    pub async fn create(&self, name: &VolumeName) -> String {
        self.call(RpcRequest::Create { name: name.clone() }).await
    }

    /// Snapshots a filesystem by name and returns the snapshot id.
    pub async fn snapshot(&self, name: &VolumeName, clone_name: &str) -> String {
        self.call(RpcRequest::Snapshot {
            name: name.clone(),
            clone_name: clone_name.to_string(),
            metadata: Default::default(),
        })
        .await
    }
}

pub fn volume(name: &str) -> VolumeName {
    VolumeName::new("alice", name)
}

/// Polls `condition` until it holds, failing the test after ten seconds.
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Async flavour of [`wait_until`].
pub async fn wait_until_async<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
