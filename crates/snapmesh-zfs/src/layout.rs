//! Dataset naming and mount points.

use std::path::PathBuf;

/// Maps filesystem ids onto ZFS dataset names and mount points.
///
/// Datasets live at `{pool}/{root}/{id}` and are mounted at
/// `{mount_prefix}/{id}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetLayout {
    /// Pool name.
    pub pool: String,
    /// Dataset under the pool holding every managed filesystem.
    pub root: String,
    /// Directory under which filesystems are mounted.
    pub mount_prefix: PathBuf,
}

impl DatasetLayout {
    /// Builds a layout.
    pub fn new(
        pool: impl Into<String>,
        root: impl Into<String>,
        mount_prefix: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pool: pool.into(),
            root: root.into(),
            mount_prefix: mount_prefix.into(),
        }
    }

    /// `{pool}/{root}`
    pub fn root_dataset(&self) -> String {
        format!("{}/{}", self.pool, self.root)
    }

    /// Fully qualified dataset name of a filesystem.
    pub fn dataset(&self, filesystem_id: &str) -> String {
        format!("{}/{}/{}", self.pool, self.root, filesystem_id)
    }

    /// Fully qualified snapshot name.
    pub fn snapshot(&self, filesystem_id: &str, snapshot_id: &str) -> String {
        format!("{}@{}", self.dataset(filesystem_id), snapshot_id)
    }

    /// Filesystem id of a fully qualified dataset name, if it is one of ours.
    pub fn filesystem_id<'a>(&self, dataset: &'a str) -> Option<&'a str> {
        let rest = dataset
            .strip_prefix(&self.pool)?
            .strip_prefix('/')?
            .strip_prefix(&self.root)?
            .strip_prefix('/')?;
        if rest.is_empty() || rest.contains('/') || rest.contains('@') {
            None
        } else {
            Some(rest)
        }
    }

    /// Where a filesystem gets mounted.
    pub fn mount_point(&self, filesystem_id: &str) -> PathBuf {
        self.mount_prefix.join(filesystem_id)
    }
}

impl Default for DatasetLayout {
    fn default() -> Self {
        Self::new("pool", "dmfs", "/var/snapmesh")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_names() {
        let layout = DatasetLayout::default();
        assert_eq!(layout.dataset("abc"), "pool/dmfs/abc");
        assert_eq!(layout.snapshot("abc", "s1"), "pool/dmfs/abc@s1");
        assert_eq!(
            layout.mount_point("abc"),
            PathBuf::from("/var/snapmesh/abc")
        );
    }

    #[test]
    fn test_filesystem_id_strips_layout() {
        let layout = DatasetLayout::default();
        assert_eq!(layout.filesystem_id("pool/dmfs/abc"), Some("abc"));
        assert_eq!(layout.filesystem_id("pool/dmfs"), None);
        assert_eq!(layout.filesystem_id("pool/dmfs/abc@s1"), None);
        assert_eq!(layout.filesystem_id("pool/dmfs/abc/child"), None);
        assert_eq!(layout.filesystem_id("other/dmfs/abc"), None);
    }
}
