//! Node configuration, loaded from TOML or JSON.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snapmesh_repl::{RetryPolicy, DEFAULT_PORT};
use snapmesh_store::DEFAULT_PREFIX;
use snapmesh_zfs::DatasetLayout;

/// Which coordination store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// External etcd cluster.
    Etcd,
    /// Process-local store, for single-node trials.
    Memory,
}

/// Coordination store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend.
    pub backend: StoreBackend,
    /// etcd endpoints.
    pub endpoints: Vec<String>,
    /// Key prefix shared by the cluster.
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Etcd,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

/// Which ZFS backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZfsBackendKind {
    /// The `zfs` command line tools.
    Cli,
    /// In-memory datasets, for trials without a pool.
    Memory,
}

/// ZFS settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZfsConfig {
    /// Backend.
    pub backend: ZfsBackendKind,
    /// Pool holding the managed datasets.
    pub pool: String,
    /// Dataset under the pool holding every filesystem.
    pub root: String,
    /// Directory filesystems are mounted under.
    pub mount_prefix: PathBuf,
    /// `zfs` binary.
    pub zfs_bin: String,
}

impl Default for ZfsConfig {
    fn default() -> Self {
        let layout = DatasetLayout::default();
        Self {
            backend: ZfsBackendKind::Cli,
            pool: layout.pool,
            root: layout.root,
            mount_prefix: layout.mount_prefix,
            zfs_bin: "zfs".to_string(),
        }
    }
}

impl ZfsConfig {
    /// Dataset layout described by this section.
    pub fn layout(&self) -> DatasetLayout {
        DatasetLayout::new(&self.pool, &self.root, &self.mount_prefix)
    }
}

/// Which container inventory to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerBackend {
    /// Ask the docker CLI.
    Docker,
    /// Assume nothing is attached.
    None,
}

/// Container runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Backend.
    pub backend: ContainerBackend,
    /// `docker` binary.
    pub docker_bin: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            backend: ContainerBackend::Docker,
            docker_bin: "docker".to_string(),
        }
    }
}

/// Timing constants of the state machines. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Attempts per transfer segment.
    pub transfer_attempts: u32,
    /// Linear backoff stride between segment attempts.
    pub retry_stride_ms: u64,
    /// Idle time after which a push peer gives up.
    pub peer_push_timeout_ms: u64,
    /// Sleep of the backoff state.
    pub backoff_ms: u64,
    /// How long a procure waits for the current master to let go.
    pub procure_timeout_ms: u64,
    /// Dirty-bytes polling interval.
    pub dirty_poll_interval_ms: u64,
    /// How long a handoff waits for the target to catch up.
    pub handoff_timeout_ms: u64,
    /// How often advertised addresses are refreshed.
    pub address_refresh_ms: u64,
    /// How long a command forwarded to another node may take.
    pub remote_request_timeout_ms: u64,
    /// How long a forwarded transfer may take before the caller stops waiting.
    pub long_request_timeout_ms: u64,
    /// Interval between progress updates of a stream in flight.
    pub progress_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            transfer_attempts: 5,
            retry_stride_ms: 1_000,
            peer_push_timeout_ms: 600_000,
            backoff_ms: 1_000,
            procure_timeout_ms: 30_000,
            dirty_poll_interval_ms: 1_000,
            handoff_timeout_ms: 300_000,
            address_refresh_ms: 30_000,
            remote_request_timeout_ms: 30_000,
            long_request_timeout_ms: 86_400_000,
            progress_interval_ms: 1_000,
        }
    }
}

impl TimingConfig {
    /// Retry policy for transfer segments.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.transfer_attempts, ms(self.retry_stride_ms))
    }

    /// See [`TimingConfig::peer_push_timeout_ms`].
    pub fn peer_push_timeout(&self) -> Duration {
        ms(self.peer_push_timeout_ms)
    }

    /// See [`TimingConfig::backoff_ms`].
    pub fn backoff(&self) -> Duration {
        ms(self.backoff_ms)
    }

    /// See [`TimingConfig::procure_timeout_ms`].
    pub fn procure_timeout(&self) -> Duration {
        ms(self.procure_timeout_ms)
    }

    /// See [`TimingConfig::dirty_poll_interval_ms`].
    pub fn dirty_poll_interval(&self) -> Duration {
        ms(self.dirty_poll_interval_ms.max(1))
    }

    /// See [`TimingConfig::handoff_timeout_ms`].
    pub fn handoff_timeout(&self) -> Duration {
        ms(self.handoff_timeout_ms)
    }

    /// See [`TimingConfig::address_refresh_ms`].
    pub fn address_refresh(&self) -> Duration {
        ms(self.address_refresh_ms.max(1))
    }

    /// See [`TimingConfig::remote_request_timeout_ms`].
    pub fn remote_request_timeout(&self) -> Duration {
        ms(self.remote_request_timeout_ms)
    }

    /// See [`TimingConfig::long_request_timeout_ms`].
    pub fn long_request_timeout(&self) -> Duration {
        ms(self.long_request_timeout_ms)
    }

    /// See [`TimingConfig::progress_interval_ms`].
    pub fn progress_interval(&self) -> Duration {
        ms(self.progress_interval_ms.max(1))
    }
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Everything a node needs to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node id; must be unique in the cluster.
    pub node_id: String,
    /// Addresses (`host:port`) other nodes use to reach this one.
    pub advertise_addresses: Vec<String>,
    /// HTTP listen address.
    pub bind_addr: SocketAddr,
    /// User accepted by the HTTP API.
    pub user: String,
    /// API key accepted by the HTTP API.
    pub api_key: String,
    /// Coordination store.
    pub store: StoreConfig,
    /// ZFS.
    pub zfs: ZfsConfig,
    /// Container runtime.
    pub containers: ContainerConfig,
    /// Timing constants.
    pub timing: TimingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: std::env::var("HOSTNAME").unwrap_or_else(|_| "snapmesh-node".to_string()),
            advertise_addresses: Vec::new(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            user: "admin".to_string(),
            api_key: String::new(),
            store: StoreConfig::default(),
            zfs: ZfsConfig::default(),
            containers: ContainerConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Loads a config file; the format follows the extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: NodeConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: NodeConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Advertised addresses, falling back to the bind address.
    pub fn effective_addresses(&self) -> Vec<String> {
        if self.advertise_addresses.is_empty() {
            vec![self.bind_addr.to_string()]
        } else {
            self.advertise_addresses.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = NodeConfig::default();
        assert_eq!(config.bind_addr, SocketAddr::from(([0, 0, 0, 0], 6969)));
        assert_eq!(config.user, "admin");
        assert_eq!(config.store.prefix, "/snapmesh.io");
        assert_eq!(config.timing.transfer_attempts, 5);
        assert_eq!(config.timing.peer_push_timeout(), Duration::from_secs(600));
        assert_eq!(config.timing.backoff(), Duration::from_secs(1));
        assert_eq!(config.timing.long_request_timeout(), Duration::from_secs(86_400));
        assert_eq!(config.zfs.layout(), DatasetLayout::default());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
node_id = "node-a"
advertise_addresses = ["10.0.0.1:6969"]
api_key = "secret"

[store]
backend = "memory"

[zfs]
pool = "tank"

[timing]
backoff_ms = 50
"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.prefix, "/snapmesh.io");
        assert_eq!(config.zfs.pool, "tank");
        assert_eq!(config.zfs.root, "dmfs");
        assert_eq!(config.timing.backoff(), Duration::from_millis(50));
        assert_eq!(config.timing.transfer_attempts, 5);
        assert_eq!(config.effective_addresses(), vec!["10.0.0.1:6969"]);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"node_id": "node-b", "bind_addr": "127.0.0.1:7000", "zfs": {{"backend": "memory"}}}}"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node_id, "node-b");
        assert_eq!(config.zfs.backend, ZfsBackendKind::Memory);
        assert_eq!(config.effective_addresses(), vec!["127.0.0.1:7000"]);
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(NodeConfig::from_file(file.path()).is_err());
    }
}
