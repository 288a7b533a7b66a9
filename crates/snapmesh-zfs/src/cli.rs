//! Backend driving the `zfs` command line tools.
//!
//! Snapshot metadata is stored as user properties named
//! `io.snapmesh:meta-{key}` with base64 values, so tabs and newlines survive
//! the tab-separated output of `zfs get -H`.

use std::process::Stdio;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::FutureExt;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backend::{SendStream, ZfsBackend};
use crate::error::ZfsError;
use crate::layout::DatasetLayout;
use crate::send::{parse_predicted_size, SendRange};
use crate::types::{DirtyInfo, Filesystem, Origin, Snapshot, SnapshotMeta};

/// User property prefix under which snapshot metadata is kept.
pub const META_KEY_PREFIX: &str = "io.snapmesh:meta-";

/// [`ZfsBackend`] running `zfs`, `mount` and `umount` subprocesses.
#[derive(Clone, Debug)]
pub struct ZfsCli {
    layout: DatasetLayout,
    zfs_bin: String,
}

impl ZfsCli {
    /// Backend using `zfs` from `PATH`.
    pub fn new(layout: DatasetLayout) -> Self {
        Self {
            layout,
            zfs_bin: "zfs".to_string(),
        }
    }

    /// Overrides the `zfs` binary.
    pub fn with_binary(mut self, zfs_bin: impl Into<String>) -> Self {
        self.zfs_bin = zfs_bin.into();
        self
    }

    /// Dataset layout in use.
    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<String, ZfsError> {
        debug!(program, ?args, "running");
        let output = Command::new(program).args(args).output().await?;
        if !output.status.success() {
            return Err(ZfsError::Command {
                command: format!("{} {}", program, args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn zfs(&self, args: &[&str]) -> Result<String, ZfsError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.run(&self.zfs_bin, &args).await
    }

    fn is_missing(err: &ZfsError) -> bool {
        matches!(err, ZfsError::Command { stderr, .. } if stderr.contains("does not exist"))
    }

    fn meta_property(key: &str, value: &str) -> String {
        format!("{}{}={}", META_KEY_PREFIX, key, STANDARD.encode(value))
    }

    fn parse_origin(&self, raw: &str) -> Option<Origin> {
        let (dataset, snapshot_id) = raw.split_once('@')?;
        let filesystem_id = self.layout.filesystem_id(dataset)?;
        Some(Origin::new(filesystem_id, snapshot_id))
    }

    async fn snapshot_metadata(
        &self,
        dataset: &str,
    ) -> Result<std::collections::HashMap<String, SnapshotMeta>, ZfsError> {
        let out = self
            .zfs(&[
                "get", "-H", "-p", "-d", "1", "-t", "snapshot", "-o", "name,property,value",
                "all", dataset,
            ])
            .await?;
        let mut result: std::collections::HashMap<String, SnapshotMeta> = Default::default();
        for line in out.lines() {
            let mut fields = line.splitn(3, '\t');
            let (Some(name), Some(property), Some(value)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Some(key) = property.strip_prefix(META_KEY_PREFIX) else {
                continue;
            };
            let Some((_, snapshot_id)) = name.split_once('@') else {
                continue;
            };
            let decoded = match STANDARD.decode(value) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(_) => value.to_string(),
            };
            result
                .entry(snapshot_id.to_string())
                .or_default()
                .insert(key.to_string(), decoded);
        }
        Ok(result)
    }
}

#[async_trait]
impl ZfsBackend for ZfsCli {
    async fn discover(&self, filesystem_id: &str) -> Result<Filesystem, ZfsError> {
        let dataset = self.layout.dataset(filesystem_id);
        let out = match self
            .zfs(&["list", "-H", "-p", "-o", "name,mounted,origin", &dataset])
            .await
        {
            Ok(out) => out,
            Err(e) if Self::is_missing(&e) => return Ok(Filesystem::missing(filesystem_id)),
            Err(e) => return Err(e),
        };
        let fields: Vec<&str> = out.trim_end().split('\t').collect();
        if fields.len() < 3 {
            return Err(ZfsError::Parse {
                command: "zfs list".to_string(),
                output: out,
            });
        }
        let mounted = fields[1] == "yes";
        let origin = match fields[2] {
            "-" | "" => None,
            raw => self.parse_origin(raw),
        };

        let listing = self
            .zfs(&[
                "list", "-H", "-p", "-t", "snapshot", "-o", "name", "-s", "creation", "-d", "1",
                &dataset,
            ])
            .await?;
        let mut metadata = self.snapshot_metadata(&dataset).await?;
        let snapshots = listing
            .lines()
            .filter_map(|line| line.split_once('@').map(|(_, id)| id.to_string()))
            .map(|id| Snapshot {
                metadata: metadata.remove(&id).unwrap_or_default(),
                id,
            })
            .collect();

        Ok(Filesystem {
            id: filesystem_id.to_string(),
            exists: true,
            mounted,
            snapshots,
            origin,
        })
    }

    async fn list_filesystems(&self) -> Result<Vec<String>, ZfsError> {
        let root = self.layout.root_dataset();
        let out = match self
            .zfs(&["list", "-H", "-o", "name", "-t", "filesystem", "-r", &root])
            .await
        {
            Ok(out) => out,
            Err(e) if Self::is_missing(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(out
            .lines()
            .filter_map(|line| self.layout.filesystem_id(line.trim()))
            .map(str::to_string)
            .collect())
    }

    async fn create(&self, filesystem_id: &str) -> Result<(), ZfsError> {
        let dataset = self.layout.dataset(filesystem_id);
        self.zfs(&["create", "-p", "-o", "mountpoint=legacy", &dataset])
            .await
            .map(|_| ())
    }

    async fn mount(&self, filesystem_id: &str) -> Result<(), ZfsError> {
        let mount_point = self.layout.mount_point(filesystem_id);
        tokio::fs::create_dir_all(&mount_point).await?;
        let args = vec![
            "-t".to_string(),
            "zfs".to_string(),
            self.layout.dataset(filesystem_id),
            mount_point.to_string_lossy().into_owned(),
        ];
        self.run("mount", &args).await.map(|_| ())
    }

    async fn unmount(&self, filesystem_id: &str) -> Result<(), ZfsError> {
        let mount_point = self.layout.mount_point(filesystem_id);
        let args = vec![mount_point.to_string_lossy().into_owned()];
        self.run("umount", &args).await.map(|_| ())
    }

    async fn snapshot(&self, filesystem_id: &str, snapshot: &Snapshot) -> Result<(), ZfsError> {
        let mut args = vec!["snapshot".to_string()];
        for (key, value) in &snapshot.metadata {
            args.push("-o".to_string());
            args.push(Self::meta_property(key, value));
        }
        args.push(self.layout.snapshot(filesystem_id, &snapshot.id));
        self.run(&self.zfs_bin, &args).await.map(|_| ())
    }

    async fn rollback(&self, filesystem_id: &str, snapshot_id: &str) -> Result<(), ZfsError> {
        let target = self.layout.snapshot(filesystem_id, snapshot_id);
        self.zfs(&["rollback", "-r", &target]).await.map(|_| ())
    }

    async fn clone_snapshot(&self, origin: &Origin, new_filesystem_id: &str) -> Result<(), ZfsError> {
        let source = self
            .layout
            .snapshot(&origin.filesystem_id, &origin.snapshot_id);
        let target = self.layout.dataset(new_filesystem_id);
        self.zfs(&["clone", "-o", "mountpoint=legacy", &source, &target])
            .await
            .map(|_| ())
    }

    async fn predict_size(&self, range: &SendRange) -> Result<u64, ZfsError> {
        let args = range.predict_args(&self.layout);
        debug!(?args, "predicting send size");
        let output = Command::new(&self.zfs_bin).args(&args).output().await?;
        // Older releases print the estimate on stderr.
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(ZfsError::Command {
                command: format!("{} {}", self.zfs_bin, args.join(" ")),
                status: output.status.to_string(),
                stderr: combined,
            });
        }
        parse_predicted_size(&combined)
    }

    async fn send(&self, range: &SendRange) -> Result<SendStream, ZfsError> {
        let args = range.send_args(&self.layout);
        debug!(?args, "starting zfs send");
        let mut child = Command::new(&self.zfs_bin)
            .arg("send")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ZfsError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "zfs send stdout not captured",
            ))
        })?;
        let command = format!("{} send {}", self.zfs_bin, args.join(" "));
        let completion = async move {
            let output = child.wait_with_output().await?;
            if output.status.success() {
                Ok(())
            } else {
                Err(ZfsError::Command {
                    command,
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        }
        .boxed();
        Ok(SendStream {
            reader: Box::pin(stdout),
            completion,
        })
    }

    async fn receive(
        &self,
        filesystem_id: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), ZfsError> {
        let dataset = self.layout.dataset(filesystem_id);
        let mut child = Command::new(&self.zfs_bin)
            .args(["recv", dataset.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let mut stdin = child.stdin.take().ok_or_else(|| {
            ZfsError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "zfs recv stdin not captured",
            ))
        })?;
        let copied = tokio::io::copy(reader, &mut stdin).await;
        drop(stdin);
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ZfsError::Command {
                command: format!("{} recv {}", self.zfs_bin, dataset),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let bytes = copied?;
        debug!(filesystem_id, bytes, "zfs recv finished");
        Ok(())
    }

    async fn apply_metadata(
        &self,
        filesystem_id: &str,
        snapshots: &[Snapshot],
    ) -> Result<(), ZfsError> {
        for snapshot in snapshots.iter().filter(|s| !s.metadata.is_empty()) {
            let mut args = vec!["set".to_string()];
            args.extend(
                snapshot
                    .metadata
                    .iter()
                    .map(|(k, v)| Self::meta_property(k, v)),
            );
            args.push(self.layout.snapshot(filesystem_id, &snapshot.id));
            if let Err(e) = self.run(&self.zfs_bin, &args).await {
                // Snapshots outside the received range are not present yet.
                if Self::is_missing(&e) {
                    warn!(filesystem_id, snapshot_id = %snapshot.id, "metadata for unknown snapshot");
                    continue;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn dirty(&self, filesystem_id: &str) -> Result<DirtyInfo, ZfsError> {
        let dataset = self.layout.dataset(filesystem_id);
        let out = self
            .zfs(&["get", "-H", "-p", "-o", "value", "written,referenced", &dataset])
            .await?;
        let values: Vec<u64> = out
            .lines()
            .map(|l| l.trim().parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|_| ZfsError::Parse {
                command: "zfs get written,referenced".to_string(),
                output: out.clone(),
            })?;
        match values.as_slice() {
            [dirty_bytes, size_bytes] => Ok(DirtyInfo {
                dirty_bytes: *dirty_bytes,
                size_bytes: *size_bytes,
            }),
            _ => Err(ZfsError::Parse {
                command: "zfs get written,referenced".to_string(),
                output: out,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_property_is_base64() {
        let prop = ZfsCli::meta_property("message", "hello\tworld");
        assert_eq!(prop, "io.snapmesh:meta-message=aGVsbG8Jd29ybGQ=");
    }

    #[test]
    fn test_parse_origin() {
        let cli = ZfsCli::new(DatasetLayout::default());
        assert_eq!(
            cli.parse_origin("pool/dmfs/parent@s1"),
            Some(Origin::new("parent", "s1"))
        );
        assert_eq!(cli.parse_origin("elsewhere/x@s1"), None);
        assert_eq!(cli.parse_origin("pool/dmfs/parent"), None);
    }

    #[test]
    fn test_missing_dataset_detection() {
        let err = ZfsError::Command {
            command: "zfs list".into(),
            status: "exit status: 1".into(),
            stderr: "cannot open 'pool/dmfs/x': dataset does not exist".into(),
        };
        assert!(ZfsCli::is_missing(&err));
    }
}
