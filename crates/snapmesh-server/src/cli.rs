//! Command line of the `snapmeshd` binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{NodeConfig, StoreBackend};

/// Top-level arguments.
#[derive(Parser, Debug)]
#[command(name = "snapmeshd")]
#[command(about = "SnapMesh node: clustered ZFS snapshots and replication", long_about = None)]
pub struct Cli {
    /// Config file (TOML or JSON); defaults apply when absent.
    #[arg(short, long, env = "SNAPMESH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long, env = "SNAPMESH_JSON_LOGS")]
    pub json_logs: bool,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the node.
    Serve {
        /// Overrides the node id.
        #[arg(long, env = "SNAPMESH_NODE_ID")]
        node_id: Option<String>,

        /// Overrides the HTTP bind address.
        #[arg(long, env = "SNAPMESH_BIND")]
        bind: Option<SocketAddr>,

        /// Overrides the etcd endpoints (comma separated).
        #[arg(long, env = "SNAPMESH_ETCD_ENDPOINTS", value_delimiter = ',')]
        etcd_endpoints: Vec<String>,
    },
    /// Print the effective configuration as TOML.
    PrintConfig,
}

impl Cli {
    /// Loads the config file, or defaults when none was given.
    pub fn load_config(&self) -> anyhow::Result<NodeConfig> {
        match &self.config {
            Some(path) => NodeConfig::from_file(path),
            None => Ok(NodeConfig::default()),
        }
    }
}

impl Command {
    /// Applies `serve` flags on top of a loaded config.
    pub fn apply_overrides(&self, config: &mut NodeConfig) {
        if let Command::Serve {
            node_id,
            bind,
            etcd_endpoints,
        } = self
        {
            if let Some(node_id) = node_id {
                config.node_id = node_id.clone();
            }
            if let Some(bind) = bind {
                config.bind_addr = *bind;
            }
            if !etcd_endpoints.is_empty() {
                config.store.backend = StoreBackend::Etcd;
                config.store.endpoints = etcd_endpoints.clone();
            }
        }
    }
}
