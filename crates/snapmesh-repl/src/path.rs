//! Volume names and clone ancestry paths.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snapmesh_zfs::Origin;

/// Namespace used when a name is given without one.
pub const DEFAULT_NAMESPACE: &str = "admin";

/// User-facing address of a top-level filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeName {
    /// Owning namespace.
    pub namespace: String,
    /// Name within the namespace.
    pub name: String,
}

impl VolumeName {
    /// Builds a name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for VolumeName {
    type Err = String;

    /// Parses `namespace/name` or a bare `name` in the default namespace.
    fn from_str(raw: &str) -> Result<Self, String> {
        let (namespace, name) = raw.split_once('/').unwrap_or((DEFAULT_NAMESPACE, raw));
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(format!("invalid volume name {raw:?}"));
        }
        Ok(Self::new(namespace, name))
    }
}

/// Clone names that refer to the top-level filesystem itself.
pub fn is_top_level_clone_name(clone_name: &str) -> bool {
    clone_name.is_empty() || clone_name == "master"
}

/// A clone and the snapshot it was taken from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemClone {
    /// Clone filesystem id.
    pub filesystem_id: String,
    /// Parent filesystem and snapshot.
    pub origin: Origin,
}

/// A clone together with its name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneWithName {
    /// Clone name, unique within its top-level filesystem.
    pub name: String,
    /// The clone.
    pub clone: FilesystemClone,
}

/// Ancestry of a filesystem: its top-level filesystem, then every clone down
/// to it, root-most first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathToTopLevelFilesystem {
    /// Top-level filesystem id.
    pub top_level_filesystem_id: String,
    /// Name of the top-level filesystem.
    pub top_level_filesystem_name: VolumeName,
    /// Clones from the top level down to the target.
    pub clones: Vec<CloneWithName>,
}

/// One hop of a multi-segment transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathSegment {
    /// Filesystem sent in this hop.
    pub filesystem_id: String,
    /// Clone origin; `None` for the top-level filesystem.
    pub origin: Option<Origin>,
    /// Snapshot to stop at; `None` for the latest.
    pub target_snapshot: Option<String>,
}

impl PathToTopLevelFilesystem {
    /// Path of a top-level filesystem with no clones.
    pub fn top_level(filesystem_id: impl Into<String>, name: VolumeName) -> Self {
        Self {
            top_level_filesystem_id: filesystem_id.into(),
            top_level_filesystem_name: name,
            clones: Vec::new(),
        }
    }

    /// Filesystem the path leads to.
    pub fn leaf_filesystem_id(&self) -> &str {
        self.clones
            .last()
            .map_or(&self.top_level_filesystem_id, |c| &c.clone.filesystem_id)
    }

    /// Every filesystem id on the path, root first.
    pub fn filesystem_ids(&self) -> Vec<String> {
        std::iter::once(self.top_level_filesystem_id.clone())
            .chain(self.clones.iter().map(|c| c.clone.filesystem_id.clone()))
            .collect()
    }

    /// Hops needed to replicate the leaf, root first.
    ///
    /// Each filesystem is sent up to the snapshot its child was cloned from;
    /// the leaf is sent up to `leaf_target` (latest when empty).
    pub fn segments(&self, leaf_target: &str) -> Vec<PathSegment> {
        let leaf_target = (!leaf_target.is_empty()).then(|| leaf_target.to_string());
        let next_origin = |i: usize| {
            self.clones
                .get(i)
                .map(|c| c.clone.origin.snapshot_id.clone())
        };

        let mut segments = Vec::with_capacity(self.clones.len() + 1);
        segments.push(PathSegment {
            filesystem_id: self.top_level_filesystem_id.clone(),
            origin: None,
            target_snapshot: next_origin(0).or_else(|| leaf_target.clone()),
        });
        for (i, clone) in self.clones.iter().enumerate() {
            segments.push(PathSegment {
                filesystem_id: clone.clone.filesystem_id.clone(),
                origin: Some(clone.clone.origin.clone()),
                target_snapshot: next_origin(i + 1).or_else(|| leaf_target.clone()),
            });
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> PathToTopLevelFilesystem {
        PathToTopLevelFilesystem {
            top_level_filesystem_id: "root".into(),
            top_level_filesystem_name: VolumeName::new("alice", "db"),
            clones: vec![
                CloneWithName {
                    name: "branch1".into(),
                    clone: FilesystemClone {
                        filesystem_id: "b1".into(),
                        origin: Origin::new("root", "r2"),
                    },
                },
                CloneWithName {
                    name: "branch2".into(),
                    clone: FilesystemClone {
                        filesystem_id: "b2".into(),
                        origin: Origin::new("b1", "b1s1"),
                    },
                },
            ],
        }
    }

    #[test]
    fn test_segments_follow_clone_origins() {
        let segments = path().segments("");
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].filesystem_id, "root");
        assert_eq!(segments[0].origin, None);
        assert_eq!(segments[0].target_snapshot.as_deref(), Some("r2"));
        assert_eq!(segments[1].origin, Some(Origin::new("root", "r2")));
        assert_eq!(segments[1].target_snapshot.as_deref(), Some("b1s1"));
        assert_eq!(segments[2].origin, Some(Origin::new("b1", "b1s1")));
        assert_eq!(segments[2].target_snapshot, None);
    }

    #[test]
    fn test_leaf_target_applies_to_last_segment_only() {
        let segments = path().segments("b2s7");
        assert_eq!(segments[0].target_snapshot.as_deref(), Some("r2"));
        assert_eq!(segments[2].target_snapshot.as_deref(), Some("b2s7"));

        let single = PathToTopLevelFilesystem::top_level("root", VolumeName::new("a", "b"));
        let segments = single.segments("r1");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].target_snapshot.as_deref(), Some("r1"));
    }

    #[test]
    fn test_leaf_and_ids() {
        assert_eq!(path().leaf_filesystem_id(), "b2");
        assert_eq!(path().filesystem_ids(), vec!["root", "b1", "b2"]);
    }

    #[test]
    fn test_volume_name_parsing() {
        assert_eq!("alice/db".parse(), Ok(VolumeName::new("alice", "db")));
        assert_eq!("db".parse(), Ok(VolumeName::new("admin", "db")));
        assert!("alice/".parse::<VolumeName>().is_err());
        assert!("a/b/c".parse::<VolumeName>().is_err());
        assert_eq!(VolumeName::new("alice", "db").to_string(), "alice/db");
    }

    #[test]
    fn test_top_level_clone_names() {
        assert!(is_top_level_clone_name(""));
        assert!(is_top_level_clone_name("master"));
        assert!(!is_top_level_clone_name("branch1"));
    }
}
