//! Disposable virtual network testbeds built from Linux namespaces
//!
//! A declarative topology (nodes, bridges, point-to-point and switched links,
//! per-link impairments) is turned into kernel namespaces, bridges and veth
//! pairs. Workloads run inside the nodes as bare processes, containers or
//! virtual machines, all reachable through the same command contract, and the
//! whole testbed is torn down concurrently with per-entity failure isolation.

pub mod addr;
pub mod backend;
pub mod command;
pub mod config;
pub mod intf;
pub mod namespace;
pub mod node;
pub mod rundir;
pub mod shaping;
pub mod supervisor;
pub mod switch;
pub mod teardown;
pub mod topology;

// Re-export commonly used types
pub use command::{Cmd, CmdOutput, Commander, RunOptions, Runner};
pub use config::{Connection, NetworkConfig, NodeConfig, TopologyConfig};
pub use intf::InterfaceTable;
pub use namespace::{Namespace, NamespaceKinds, NamespaceOptions};
pub use node::Node;
pub use shaping::Constraints;
pub use switch::Switch;
pub use topology::{Link, Topology, TopologyOptions};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestbedError {
    #[error("Command error: {0}")]
    Command(#[from] command::CommandError),

    #[error("Namespace error: {0}")]
    Namespace(#[from] namespace::NamespaceError),

    #[error("Interface error: {0}")]
    Interface(#[from] intf::IntfError),

    #[error("Address allocation error: {0}")]
    Addr(#[from] addr::AddrError),

    #[error("Traffic shaping error: {0}")]
    Shaping(#[from] shaping::ShapingError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] backend::BackendError),

    #[error("Topology error: {0}")]
    Topology(#[from] topology::TopologyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call error: {0}")]
    Nix(#[from] nix::Error),
}

impl TestbedError {
    /// Errors after which no partially built topology is safely usable.
    pub fn is_fatal(&self) -> bool {
        match self {
            TestbedError::Namespace(e) => e.is_fatal(),
            TestbedError::Backend(backend::BackendError::StartupTimeout { .. }) => true,
            _ => false,
        }
    }
}
