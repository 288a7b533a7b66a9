//! Which containers use a filesystem, and stopping/starting them around
//! operations that swap the dataset underneath.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use snapmesh_zfs::DatasetLayout;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ServerError;

/// Container runtime as seen by the state machines.
#[async_trait]
pub trait ContainerInventory: Send + Sync {
    /// Names of running containers that have the filesystem mounted.
    async fn containers_using(&self, filesystem_id: &str) -> Result<Vec<String>, ServerError>;

    /// Stops every container using the filesystem; returns their names.
    async fn stop(&self, filesystem_id: &str) -> Result<Vec<String>, ServerError>;

    /// Starts previously stopped containers.
    async fn start(&self, filesystem_id: &str, containers: &[String]) -> Result<(), ServerError>;
}

/// Asks the docker CLI.
pub struct DockerInventory {
    docker_bin: String,
    layout: DatasetLayout,
}

impl DockerInventory {
    /// Inventory for filesystems mounted according to `layout`.
    pub fn new(docker_bin: impl Into<String>, layout: DatasetLayout) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            layout,
        }
    }

    async fn docker(&self, args: &[&str]) -> Result<String, ServerError> {
        debug!(docker = %self.docker_bin, ?args, "running docker");
        let output = Command::new(&self.docker_bin).args(args).output().await?;
        if !output.status.success() {
            return Err(ServerError::Containers {
                msg: format!(
                    "docker {} exited with {}: {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parses `docker inspect` lines of the form `/name src1 src2 ...` and keeps
/// containers with a mount source under `mount_point`.
fn containers_mounting(inspect: &str, mount_point: &Path) -> Vec<String> {
    inspect
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?.trim_start_matches('/');
            fields
                .any(|source| Path::new(source).starts_with(mount_point))
                .then(|| name.to_string())
        })
        .collect()
}

#[async_trait]
impl ContainerInventory for DockerInventory {
    async fn containers_using(&self, filesystem_id: &str) -> Result<Vec<String>, ServerError> {
        let ids = self.docker(&["ps", "-q"]).await?;
        let ids: Vec<&str> = ids.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec![
            "inspect",
            "--format",
            "{{.Name}}{{range .Mounts}} {{.Source}}{{end}}",
        ];
        args.extend(ids);
        let inspect = self.docker(&args).await?;
        Ok(containers_mounting(
            &inspect,
            &self.layout.mount_point(filesystem_id),
        ))
    }

    async fn stop(&self, filesystem_id: &str) -> Result<Vec<String>, ServerError> {
        let containers = self.containers_using(filesystem_id).await?;
        for name in &containers {
            info!(filesystem_id, container = %name, "stopping container");
            self.docker(&["stop", name]).await?;
        }
        Ok(containers)
    }

    async fn start(&self, filesystem_id: &str, containers: &[String]) -> Result<(), ServerError> {
        for name in containers {
            info!(filesystem_id, container = %name, "starting container");
            self.docker(&["start", name]).await?;
        }
        Ok(())
    }
}

/// Inventory driven by hand, for nodes without a container runtime and tests.
#[derive(Clone, Default)]
pub struct StaticInventory {
    attached: Arc<Mutex<HashMap<String, Vec<String>>>>,
    stopped: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl StaticInventory {
    /// Nothing attached anywhere.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a container as using a filesystem.
    pub fn attach(&self, filesystem_id: &str, container: &str) {
        self.lock_attached()
            .entry(filesystem_id.to_string())
            .or_default()
            .push(container.to_string());
    }

    /// Removes every container from a filesystem.
    pub fn detach_all(&self, filesystem_id: &str) {
        self.lock_attached().remove(filesystem_id);
    }

    /// Containers stopped by the last [`ContainerInventory::stop`] and not restarted.
    pub fn stopped(&self, filesystem_id: &str) -> Vec<String> {
        self.lock_stopped()
            .get(filesystem_id)
            .cloned()
            .unwrap_or_default()
    }

    fn lock_attached(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.attached.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stopped(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.stopped.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ContainerInventory for StaticInventory {
    async fn containers_using(&self, filesystem_id: &str) -> Result<Vec<String>, ServerError> {
        Ok(self
            .lock_attached()
            .get(filesystem_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn stop(&self, filesystem_id: &str) -> Result<Vec<String>, ServerError> {
        let containers = self.lock_attached().remove(filesystem_id).unwrap_or_default();
        self.lock_stopped()
            .insert(filesystem_id.to_string(), containers.clone());
        Ok(containers)
    }

    async fn start(&self, filesystem_id: &str, containers: &[String]) -> Result<(), ServerError> {
        self.lock_stopped().remove(filesystem_id);
        if !containers.is_empty() {
            self.lock_attached()
                .entry(filesystem_id.to_string())
                .or_default()
                .extend(containers.iter().cloned());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_inspect_output_filtered_by_mount_point() {
        let inspect = "/web /var/snapmesh/fs1 /etc/hosts\n/db /var/snapmesh/fs2/data\n/idle\n";
        let mount = PathBuf::from("/var/snapmesh/fs2");
        assert_eq!(containers_mounting(inspect, &mount), vec!["db"]);
        let mount = PathBuf::from("/var/snapmesh/fs1");
        assert_eq!(containers_mounting(inspect, &mount), vec!["web"]);
        // prefixes match whole path components
        let mount = PathBuf::from("/var/snapmesh/fs");
        assert!(containers_mounting(inspect, &mount).is_empty());
    }

    #[tokio::test]
    async fn test_static_stop_then_start_restores_attachment() {
        let inventory = StaticInventory::new();
        inventory.attach("fs1", "web");
        assert_eq!(inventory.containers_using("fs1").await.unwrap(), vec!["web"]);

        let stopped = inventory.stop("fs1").await.unwrap();
        assert_eq!(stopped, vec!["web"]);
        assert!(inventory.containers_using("fs1").await.unwrap().is_empty());
        assert_eq!(inventory.stopped("fs1"), vec!["web"]);

        inventory.start("fs1", &stopped).await.unwrap();
        assert_eq!(inventory.containers_using("fs1").await.unwrap(), vec!["web"]);
        assert!(inventory.stopped("fs1").is_empty());
    }
}
