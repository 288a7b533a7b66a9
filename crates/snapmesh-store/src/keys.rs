//! Key layout under the cluster prefix.
//!
//! ```text
//! {prefix}/filesystems/masters/{fs}                 node id (bare string)
//! {prefix}/filesystems/transfers/{transfer}         transfer poll result
//! {prefix}/filesystems/dirty/{fs}                   dirty-bytes report
//! {prefix}/filesystems/requests/{fs}/{request}      command for the master
//! {prefix}/filesystems/responses/{fs}/{request}     reply from the master
//! {prefix}/servers/snapshots/{node}/{fs}            snapshot list on a node
//! {prefix}/servers/states/{node}/{fs}               {state, status}
//! {prefix}/servers/addresses/{node}                 advertised addresses
//! {prefix}/registry/filesystems/{namespace}/{name}  top-level filesystem id
//! {prefix}/registry/clones/{top_level_fs}/{name}    clone record
//! ```

/// Default cluster prefix.
pub const DEFAULT_PREFIX: &str = "/snapmesh.io";

/// Builds and parses keys for one cluster prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

/// A key recognised by [`KeySpace::parse`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedKey {
    /// Current master of a filesystem.
    Master {
        /// Filesystem id.
        filesystem_id: String,
    },
    /// Progress record of a transfer.
    Transfer {
        /// Transfer id.
        transfer_id: String,
    },
    /// Dirty-bytes report of a filesystem.
    Dirty {
        /// Filesystem id.
        filesystem_id: String,
    },
    /// Command queued for the master of a filesystem.
    Request {
        /// Filesystem id.
        filesystem_id: String,
        /// Request id.
        request_id: String,
    },
    /// Reply written by the master of a filesystem.
    Response {
        /// Filesystem id.
        filesystem_id: String,
        /// Request id.
        request_id: String,
    },
    /// Snapshots of a filesystem as seen on one node.
    ServerSnapshots {
        /// Reporting node.
        node_id: String,
        /// Filesystem id.
        filesystem_id: String,
    },
    /// State machine state of a filesystem on one node.
    ServerState {
        /// Reporting node.
        node_id: String,
        /// Filesystem id.
        filesystem_id: String,
    },
    /// Addresses a node can be reached at.
    ServerAddresses {
        /// Node id.
        node_id: String,
    },
    /// Top-level filesystem name registration.
    RegistryFilesystem {
        /// Volume namespace.
        namespace: String,
        /// Volume name.
        name: String,
    },
    /// Clone name registration.
    RegistryClone {
        /// Top-level filesystem the clone belongs to.
        top_level_filesystem_id: String,
        /// Clone name.
        name: String,
    },
}

impl KeySpace {
    /// Creates a key space; trailing slashes on `prefix` are ignored.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// The cluster prefix itself.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix covering every key of the cluster.
    pub fn root(&self) -> String {
        format!("{}/", self.prefix)
    }

    /// `filesystems/masters/{fs}`
    pub fn master(&self, filesystem_id: &str) -> String {
        format!("{}/filesystems/masters/{}", self.prefix, filesystem_id)
    }

    /// `filesystems/transfers/{id}`
    pub fn transfer(&self, transfer_id: &str) -> String {
        format!("{}/filesystems/transfers/{}", self.prefix, transfer_id)
    }

    /// `filesystems/dirty/{fs}`
    pub fn dirty(&self, filesystem_id: &str) -> String {
        format!("{}/filesystems/dirty/{}", self.prefix, filesystem_id)
    }

    /// `filesystems/requests/{fs}/{request}`
    pub fn request(&self, filesystem_id: &str, request_id: &str) -> String {
        format!(
            "{}/filesystems/requests/{}/{}",
            self.prefix, filesystem_id, request_id
        )
    }

    /// `filesystems/responses/{fs}/{request}`
    pub fn response(&self, filesystem_id: &str, request_id: &str) -> String {
        format!(
            "{}/filesystems/responses/{}/{}",
            self.prefix, filesystem_id, request_id
        )
    }

    /// `servers/snapshots/{node}/{fs}`
    pub fn server_snapshots(&self, node_id: &str, filesystem_id: &str) -> String {
        format!(
            "{}/servers/snapshots/{}/{}",
            self.prefix, node_id, filesystem_id
        )
    }

    /// `servers/states/{node}/{fs}`
    pub fn server_state(&self, node_id: &str, filesystem_id: &str) -> String {
        format!("{}/servers/states/{}/{}", self.prefix, node_id, filesystem_id)
    }

    /// `servers/addresses/{node}`
    pub fn server_addresses(&self, node_id: &str) -> String {
        format!("{}/servers/addresses/{}", self.prefix, node_id)
    }

    /// `registry/filesystems/{namespace}/{name}`
    pub fn registry_filesystem(&self, namespace: &str, name: &str) -> String {
        format!(
            "{}/registry/filesystems/{}/{}",
            self.prefix, namespace, name
        )
    }

    /// `registry/clones/{top_level_fs}/{name}`
    pub fn registry_clone(&self, top_level_filesystem_id: &str, name: &str) -> String {
        format!(
            "{}/registry/clones/{}/{}",
            self.prefix, top_level_filesystem_id, name
        )
    }

    /// Classifies a full key. Keys outside the prefix or the layout yield `None`.
    pub fn parse(&self, key: &str) -> Option<ParsedKey> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        match parts.as_slice() {
            ["filesystems", "masters", fs] => Some(ParsedKey::Master {
                filesystem_id: fs.to_string(),
            }),
            ["filesystems", "transfers", id] => Some(ParsedKey::Transfer {
                transfer_id: id.to_string(),
            }),
            ["filesystems", "dirty", fs] => Some(ParsedKey::Dirty {
                filesystem_id: fs.to_string(),
            }),
            ["filesystems", "requests", fs, req] => Some(ParsedKey::Request {
                filesystem_id: fs.to_string(),
                request_id: req.to_string(),
            }),
            ["filesystems", "responses", fs, req] => Some(ParsedKey::Response {
                filesystem_id: fs.to_string(),
                request_id: req.to_string(),
            }),
            ["servers", "snapshots", node, fs] => Some(ParsedKey::ServerSnapshots {
                node_id: node.to_string(),
                filesystem_id: fs.to_string(),
            }),
            ["servers", "states", node, fs] => Some(ParsedKey::ServerState {
                node_id: node.to_string(),
                filesystem_id: fs.to_string(),
            }),
            ["servers", "addresses", node] => Some(ParsedKey::ServerAddresses {
                node_id: node.to_string(),
            }),
            ["registry", "filesystems", namespace, name] => Some(ParsedKey::RegistryFilesystem {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            ["registry", "clones", tlf, name] => Some(ParsedKey::RegistryClone {
                top_level_filesystem_id: tlf.to_string(),
                name: name.to_string(),
            }),
            _ => None,
        }
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}
