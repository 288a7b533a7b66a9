#![warn(missing_docs)]

//! `snapmeshd`: runs one SnapMesh node.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use snapmesh_repl::RetryPolicy;
use snapmesh_server::cli::{Cli, Command};
use snapmesh_server::config::{ContainerBackend, NodeConfig, StoreBackend, ZfsBackendKind};
use snapmesh_server::containers::{ContainerInventory, DockerInventory, StaticInventory};
use snapmesh_server::Node;
use snapmesh_store::{CoordinationStore, EtcdStore, MemoryStore};
use snapmesh_zfs::{MemoryZfs, ZfsBackend, ZfsCli};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(cli.json_logs.then(|| fmt::layer().json()))
        .with((!cli.json_logs).then(fmt::layer))
        .init();

    let mut config = cli.load_config()?;
    cli.command.apply_overrides(&mut config);

    match cli.command {
        Command::PrintConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Serve { .. } => serve(config).await,
    }
}

async fn serve(config: NodeConfig) -> Result<()> {
    let store: Arc<dyn CoordinationStore> = match config.store.backend {
        StoreBackend::Etcd => {
            let endpoints = config.store.endpoints.clone();
            let store = RetryPolicy::default()
                .run("connect to etcd", |_| EtcdStore::connect(&endpoints))
                .await
                .with_context(|| format!("connecting to etcd at {endpoints:?}"))?;
            Arc::new(store)
        }
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory store; state is not shared with other nodes");
            Arc::new(MemoryStore::new())
        }
    };

    let layout = config.zfs.layout();
    let zfs: Arc<dyn ZfsBackend> = match config.zfs.backend {
        ZfsBackendKind::Cli => Arc::new(ZfsCli::new(layout.clone()).with_binary(&config.zfs.zfs_bin)),
        ZfsBackendKind::Memory => Arc::new(MemoryZfs::new()),
    };
    let containers: Arc<dyn ContainerInventory> = match config.containers.backend {
        ContainerBackend::Docker => {
            Arc::new(DockerInventory::new(&config.containers.docker_bin, layout))
        }
        ContainerBackend::None => Arc::new(StaticInventory::new()),
    };

    let node = Node::start(config, store, zfs, containers)
        .await
        .context("starting node")?;

    tokio::select! {
        result = node.bind_and_serve() => result.context("HTTP server")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}
