#![warn(missing_docs)]

//! SnapMesh node: per-filesystem state machines, registry, store watcher, RPC and stream server

pub mod caches;
pub mod cli;
pub mod config;
pub mod containers;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod http;
pub mod machine;
pub mod node;
pub mod notify;
pub mod registry;
pub mod rpc;
mod tasks;
mod watcher;

pub use config::{NodeConfig, TimingConfig};
pub use containers::{ContainerInventory, DockerInventory, StaticInventory};
pub use context::NodeContext;
pub use dispatch::dispatch;
pub use error::ServerError;
pub use event::{Command, FsmError, Outcome, Reply};
pub use machine::MachineHandle;
pub use node::Node;
pub use registry::Registry;
