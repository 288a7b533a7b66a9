//! A running node: context, store watcher, background tasks and HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use snapmesh_store::CoordinationStore;
use snapmesh_zfs::ZfsBackend;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::NodeConfig;
use crate::containers::ContainerInventory;
use crate::context::NodeContext;
use crate::error::ServerError;
use crate::{http, tasks, watcher};

/// Handle on a started node.
pub struct Node {
    ctx: Arc<NodeContext>,
    watcher: JoinHandle<()>,
}

impl Node {
    /// Primes caches from the store, starts the watcher and background tasks,
    /// and starts a machine for every filesystem present locally.
    pub async fn start(
        config: NodeConfig,
        store: Arc<dyn CoordinationStore>,
        zfs: Arc<dyn ZfsBackend>,
        containers: Arc<dyn ContainerInventory>,
    ) -> Result<Self, ServerError> {
        let ctx = Arc::new(NodeContext::new(config, store, zfs, containers));
        info!(node_id = %ctx.node_id, prefix = %ctx.config.store.prefix, "starting node");

        let revision = watcher::prime(&ctx).await?;
        let watcher = watcher::spawn(Arc::clone(&ctx), revision);

        tasks::publish_addresses(&ctx).await?;
        tasks::spawn_address_heartbeat(Arc::clone(&ctx));

        let local = ctx.zfs.list_filesystems().await?;
        info!(count = local.len(), "found local filesystems");
        for filesystem_id in local {
            ctx.init_machine(&filesystem_id);
        }

        Ok(Self { ctx, watcher })
    }

    /// Shared node state.
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Routes served by this node.
    pub fn router(&self) -> Router {
        http::router(Arc::clone(&self.ctx))
    }

    /// Serves HTTP on an already bound listener until the server fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        info!(%addr, node_id = %self.ctx.node_id, "listening");
        axum::serve(listener, self.router().into_make_service()).await?;
        Ok(())
    }

    /// Binds the configured address and serves on it.
    pub async fn bind_and_serve(&self) -> Result<(), ServerError> {
        let addr: SocketAddr = self.ctx.config.bind_addr;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
