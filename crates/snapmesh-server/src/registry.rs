//! Name to filesystem id resolution and clone ancestry.
//!
//! Registrations are written to the store first with a set-if-absent
//! precondition; the local maps only change once the write succeeded. Entries
//! registered by other nodes arrive through the store watcher.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use snapmesh_repl::{
    is_top_level_clone_name, CloneWithName, FilesystemClone, PathToTopLevelFilesystem, VolumeName,
};
use snapmesh_store::{CoordinationStore, KeySpace, Precondition, StoreExt};
use tracing::{debug, info};

use crate::error::ServerError;

/// Stored under `registry/filesystems/{namespace}/{name}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopLevelRecord {
    /// Top-level filesystem id.
    pub filesystem_id: String,
}

// Bounds ancestry walks over inconsistent data.
const MAX_CLONE_DEPTH: usize = 1024;

/// Registry of top-level names and clones.
pub struct Registry {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    top_level: RwLock<HashMap<VolumeName, String>>,
    // top-level id -> clone name -> clone
    clones: RwLock<HashMap<String, HashMap<String, FilesystemClone>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl Registry {
    /// Empty registry backed by `store`.
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace) -> Self {
        Self {
            store,
            keys,
            top_level: RwLock::new(HashMap::new()),
            clones: RwLock::new(HashMap::new()),
        }
    }

    /// Binds `name` to a top-level filesystem.
    pub async fn register_filesystem(
        &self,
        name: &VolumeName,
        filesystem_id: &str,
    ) -> Result<(), ServerError> {
        let key = self.keys.registry_filesystem(&name.namespace, &name.name);
        let record = TopLevelRecord {
            filesystem_id: filesystem_id.to_string(),
        };
        match self.store.set_json(&key, &record, Precondition::Absent).await {
            Ok(_) => {}
            Err(e) if e.is_precondition_failed() => {
                return Err(ServerError::AlreadyExists {
                    what: format!("filesystem {name}"),
                })
            }
            Err(e) => return Err(e.into()),
        }
        info!(%name, filesystem_id, "registered filesystem");
        self.observe_filesystem(name.clone(), filesystem_id.to_string());
        Ok(())
    }

    /// Registers a clone of a top-level filesystem under `clone_name`.
    pub async fn register_clone(
        &self,
        top_level_filesystem_id: &str,
        clone_name: &str,
        clone: FilesystemClone,
    ) -> Result<(), ServerError> {
        if is_top_level_clone_name(clone_name) {
            return Err(ServerError::invalid(format!(
                "{clone_name:?} is reserved for the top-level filesystem"
            )));
        }
        let key = self.keys.registry_clone(top_level_filesystem_id, clone_name);
        match self.store.set_json(&key, &clone, Precondition::Absent).await {
            Ok(_) => {}
            Err(e) if e.is_precondition_failed() => {
                return Err(ServerError::AlreadyExists {
                    what: format!("clone {clone_name} of {top_level_filesystem_id}"),
                })
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            top_level_filesystem_id,
            clone_name,
            filesystem_id = %clone.filesystem_id,
            "registered clone"
        );
        self.observe_clone(top_level_filesystem_id, clone_name, clone);
        Ok(())
    }

    /// Records a name binding seen in the store.
    pub fn observe_filesystem(&self, name: VolumeName, filesystem_id: String) {
        debug!(%name, %filesystem_id, "filesystem name cached");
        write(&self.top_level).insert(name, filesystem_id);
    }

    /// Records a clone seen in the store.
    pub fn observe_clone(&self, top_level_filesystem_id: &str, clone_name: &str, clone: FilesystemClone) {
        write(&self.clones)
            .entry(top_level_filesystem_id.to_string())
            .or_default()
            .insert(clone_name.to_string(), clone);
    }

    /// Drops a name binding deleted from the store.
    pub fn forget_filesystem(&self, name: &VolumeName) {
        write(&self.top_level).remove(name);
    }

    /// Drops a clone deleted from the store.
    pub fn forget_clone(&self, top_level_filesystem_id: &str, clone_name: &str) {
        if let Some(clones) = write(&self.clones).get_mut(top_level_filesystem_id) {
            clones.remove(clone_name);
        }
    }

    /// Top-level filesystem id of a name.
    pub fn lookup(&self, name: &VolumeName) -> Option<String> {
        read(&self.top_level).get(name).cloned()
    }

    /// Name of a top-level filesystem id.
    pub fn name_of(&self, top_level_filesystem_id: &str) -> Option<VolumeName> {
        read(&self.top_level)
            .iter()
            .find(|(_, id)| id.as_str() == top_level_filesystem_id)
            .map(|(name, _)| name.clone())
    }

    /// A clone by name.
    pub fn lookup_clone(&self, top_level_filesystem_id: &str, clone_name: &str) -> Option<FilesystemClone> {
        read(&self.clones)
            .get(top_level_filesystem_id)?
            .get(clone_name)
            .cloned()
    }

    /// A clone by its filesystem id: `(top-level id, clone name, clone)`.
    pub fn lookup_clone_by_id(&self, filesystem_id: &str) -> Option<(String, String, FilesystemClone)> {
        read(&self.clones).iter().find_map(|(tlf, clones)| {
            clones
                .iter()
                .find(|(_, c)| c.filesystem_id == filesystem_id)
                .map(|(name, c)| (tlf.clone(), name.clone(), c.clone()))
        })
    }

    /// Filesystem id of `name` plus an optional clone name.
    pub fn resolve(&self, name: &VolumeName, clone_name: &str) -> Option<String> {
        let top_level = self.lookup(name)?;
        if is_top_level_clone_name(clone_name) {
            return Some(top_level);
        }
        self.lookup_clone(&top_level, clone_name)
            .map(|c| c.filesystem_id)
    }

    /// Like [`Registry::resolve`], but unknown names are an error.
    pub fn require(&self, name: &VolumeName, clone_name: &str) -> Result<String, ServerError> {
        self.resolve(name, clone_name).ok_or_else(|| {
            if is_top_level_clone_name(clone_name) {
                ServerError::not_found(format!("filesystem {name}"))
            } else {
                ServerError::not_found(format!("clone {clone_name} of {name}"))
            }
        })
    }

    /// Every top-level filesystem, sorted by name.
    pub fn filesystems(&self) -> Vec<(VolumeName, String)> {
        let mut all: Vec<_> = read(&self.top_level)
            .iter()
            .map(|(name, id)| (name.clone(), id.clone()))
            .collect();
        all.sort();
        all
    }

    /// Clones of a top-level filesystem, sorted by name.
    pub fn clones_for(&self, top_level_filesystem_id: &str) -> Vec<CloneWithName> {
        let mut clones: Vec<CloneWithName> = read(&self.clones)
            .get(top_level_filesystem_id)
            .map(|clones| {
                clones
                    .iter()
                    .map(|(name, clone)| CloneWithName {
                        name: name.clone(),
                        clone: clone.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        clones.sort_by(|a, b| a.name.cmp(&b.name));
        clones
    }

    /// Walks origins from `filesystem_id` back to its top-level filesystem.
    pub fn deduce_path_to_top_level(
        &self,
        filesystem_id: &str,
    ) -> Result<PathToTopLevelFilesystem, ServerError> {
        let mut chain = Vec::new();
        let mut current = filesystem_id.to_string();
        loop {
            if let Some(name) = self.name_of(&current) {
                chain.reverse();
                return Ok(PathToTopLevelFilesystem {
                    top_level_filesystem_id: current,
                    top_level_filesystem_name: name,
                    clones: chain,
                });
            }
            if chain.len() >= MAX_CLONE_DEPTH {
                return Err(ServerError::invalid(format!(
                    "clone ancestry of {filesystem_id} does not terminate"
                )));
            }
            let (_, name, clone) = self
                .lookup_clone_by_id(&current)
                .ok_or_else(|| ServerError::not_found(format!("filesystem {current}")))?;
            current = clone.origin.filesystem_id.clone();
            chain.push(CloneWithName { name, clone });
        }
    }

    /// Registers every name on a path that is not registered yet.
    ///
    /// A name already bound to a different filesystem id is an error.
    pub async fn register_path(&self, path: &PathToTopLevelFilesystem) -> Result<(), ServerError> {
        let name = &path.top_level_filesystem_name;
        match self.lookup(name) {
            Some(existing) if existing != path.top_level_filesystem_id => {
                return Err(ServerError::invalid(format!(
                    "{name} is already bound to {existing}, not {}",
                    path.top_level_filesystem_id
                )));
            }
            Some(_) => {}
            None => self.register_filesystem(name, &path.top_level_filesystem_id).await?,
        }
        for clone in &path.clones {
            match self.lookup_clone(&path.top_level_filesystem_id, &clone.name) {
                Some(existing) if existing.filesystem_id != clone.clone.filesystem_id => {
                    return Err(ServerError::invalid(format!(
                        "clone {} of {name} is already bound to {}",
                        clone.name, existing.filesystem_id
                    )));
                }
                Some(_) => {}
                None => {
                    self.register_clone(&path.top_level_filesystem_id, &clone.name, clone.clone.clone())
                        .await?
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapmesh_store::MemoryStore;
    use snapmesh_zfs::Origin;

    fn registry() -> (Registry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Registry::new(store.clone(), KeySpace::default()), store)
    }

    fn clone_of(id: &str, parent: &str, snap: &str) -> FilesystemClone {
        FilesystemClone {
            filesystem_id: id.into(),
            origin: Origin::new(parent, snap),
        }
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let (registry, store) = registry();
        let name = VolumeName::new("alice", "db");
        registry.register_filesystem(&name, "root").await.unwrap();
        registry
            .register_clone("root", "feature", clone_of("c1", "root", "s1"))
            .await
            .unwrap();

        assert_eq!(registry.resolve(&name, ""), Some("root".into()));
        assert_eq!(registry.resolve(&name, "master"), Some("root".into()));
        assert_eq!(registry.resolve(&name, "feature"), Some("c1".into()));
        assert_eq!(registry.resolve(&name, "nope"), None);

        let stored: Option<TopLevelRecord> = store
            .get_json(&KeySpace::default().registry_filesystem("alice", "db"))
            .await
            .unwrap();
        assert_eq!(stored.unwrap().filesystem_id, "root");
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected_without_touching_cache() {
        let (registry, _) = registry();
        let name = VolumeName::new("alice", "db");
        registry.register_filesystem(&name, "root").await.unwrap();
        let err = registry.register_filesystem(&name, "other").await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyExists { .. }));
        assert_eq!(registry.lookup(&name), Some("root".into()));

        registry
            .register_clone("root", "b", clone_of("c1", "root", "s1"))
            .await
            .unwrap();
        assert!(registry
            .register_clone("root", "b", clone_of("c2", "root", "s1"))
            .await
            .is_err());
        assert!(registry
            .register_clone("root", "master", clone_of("c3", "root", "s1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_deduce_path_walks_origins_root_first() {
        let (registry, _) = registry();
        let name = VolumeName::new("alice", "db");
        registry.register_filesystem(&name, "root").await.unwrap();
        registry
            .register_clone("root", "b1", clone_of("c1", "root", "r2"))
            .await
            .unwrap();
        registry
            .register_clone("root", "b2", clone_of("c2", "c1", "c1s1"))
            .await
            .unwrap();

        let path = registry.deduce_path_to_top_level("c2").unwrap();
        assert_eq!(path.top_level_filesystem_id, "root");
        assert_eq!(path.top_level_filesystem_name, name);
        let names: Vec<_> = path.clones.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["b1", "b2"]);

        let top = registry.deduce_path_to_top_level("root").unwrap();
        assert!(top.clones.is_empty());
        assert!(registry.deduce_path_to_top_level("unknown").is_err());
    }

    #[tokio::test]
    async fn test_register_path_is_idempotent_and_detects_conflicts() {
        let (source, _) = registry();
        let name = VolumeName::new("alice", "db");
        source.register_filesystem(&name, "root").await.unwrap();
        source
            .register_clone("root", "b1", clone_of("c1", "root", "r1"))
            .await
            .unwrap();
        let path = source.deduce_path_to_top_level("c1").unwrap();

        let (target, _) = registry();
        target.register_path(&path).await.unwrap();
        target.register_path(&path).await.unwrap();
        assert_eq!(target.resolve(&name, "b1"), Some("c1".into()));

        let (clashing, _) = registry();
        clashing.register_filesystem(&name, "different").await.unwrap();
        assert!(clashing.register_path(&path).await.is_err());
    }

    #[test]
    fn test_listing_is_sorted() {
        let (registry, _) = registry();
        registry.observe_filesystem(VolumeName::new("b", "x"), "2".into());
        registry.observe_filesystem(VolumeName::new("a", "y"), "1".into());
        let names: Vec<_> = registry.filesystems().into_iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, vec!["a/y", "b/x"]);
        registry.forget_filesystem(&VolumeName::new("a", "y"));
        assert_eq!(registry.filesystems().len(), 1);
    }
}
