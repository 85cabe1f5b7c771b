//! Topology description
//!
//! The declarative input of a testbed: switches (`networks`), nodes and the
//! connections each node declares. Loaded from JSON and validated before any
//! kernel object is created.

use crate::intf::{check_ifname, IntfError};
use crate::namespace::NamespaceKinds;
use crate::shaping::{Constraints, ShapingError};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_RUNDIR: &str = "/tmp/netbed";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate name: {0}")]
    Duplicate(String),

    #[error("name {name:?}: {source}")]
    Name {
        name: String,
        #[source]
        source: IntfError,
    },

    #[error("{node}: connection to unknown peer {peer:?}")]
    UnknownPeer { node: String, peer: String },

    #[error("{0}: connection to itself")]
    SelfConnection(String),

    #[error("{node} -> {peer}: {source}")]
    Constraints {
        node: String,
        peer: String,
        #[source]
        source: ShapingError,
    },

    #[error("{node}: {reason}")]
    Invalid { node: String, reason: String },
}

fn default_true() -> bool {
    true
}

fn default_rundir() -> PathBuf {
    PathBuf::from(DEFAULT_RUNDIR)
}

/// A complete testbed declaration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Switches, in declaration order (which fixes their ordinals).
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// Derive addresses from ordinals when none are given.
    #[serde(default = "default_true")]
    pub autonumber: bool,
    /// Build inside a root namespace instead of the host.
    #[serde(default = "default_true")]
    pub isolated: bool,
    #[serde(default = "default_rundir")]
    pub rundir: PathBuf,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            networks: Vec::new(),
            nodes: Vec::new(),
            autonumber: true,
            isolated: true,
            rundir: default_rundir(),
        }
    }
}

/// A switch (bridge).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    /// Bridge address with prefix, making the switch layer 3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Network>,
    /// Masquerade traffic leaving the bridge network.
    #[serde(default)]
    pub nat: bool,
}

impl NetworkConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Guest settings of a VM-backed node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmConfig {
    pub kernel: Option<PathBuf>,
    #[serde(default)]
    pub initrd: Option<PathBuf>,
    #[serde(default)]
    pub cmdline: Option<String>,
    #[serde(default)]
    pub disk: Option<PathBuf>,
    /// MiB
    #[serde(default = "VmConfig::default_memory")]
    pub memory: u32,
    #[serde(default = "VmConfig::default_ncpu")]
    pub ncpu: u32,
    #[serde(default = "VmConfig::default_qemu")]
    pub qemu: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Seconds to wait for the console prompt.
    #[serde(default = "VmConfig::default_console_timeout")]
    pub console_timeout: u64,
}

impl VmConfig {
    fn default_memory() -> u32 {
        512
    }

    fn default_ncpu() -> u32 {
        1
    }

    fn default_qemu() -> String {
        "qemu-system-x86_64".to_string()
    }

    fn default_console_timeout() -> u64 {
        60
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            kernel: None,
            initrd: None,
            cmdline: None,
            disk: None,
            memory: Self::default_memory(),
            ncpu: Self::default_ncpu(),
            qemu: Self::default_qemu(),
            extra_args: Vec::new(),
            console_timeout: Self::default_console_timeout(),
        }
    }
}

/// A node. `image` makes it container-backed, `vm` VM-backed, otherwise it
/// is a bare namespace.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Container engine binary; podman then docker when unset. Only podman
    /// can join the node's network namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm: Option<VmConfig>,
    /// Workload started once links are up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    /// Run once when the node is deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_cmd: Option<String>,
    #[serde(default = "NamespaceKinds::node_default")]
    pub namespaces: NamespaceKinds,
    #[serde(default = "default_true")]
    pub hostname: bool,
    /// `"/path"` for a tmpfs, `"/outer:/inner"` for a bind mount.
    #[serde(default)]
    pub mounts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connections: Vec::new(),
            image: None,
            engine: None,
            vm: None,
            cmd: None,
            cleanup_cmd: None,
            namespaces: NamespaceKinds::node_default(),
            hostname: true,
            mounts: Vec::new(),
            cwd: None,
        }
    }

    pub fn connect(mut self, conn: impl Into<ConnectionSpec>) -> Self {
        self.connections.push(conn.into());
        self
    }

    pub fn with_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.cmd = Some(cmd.into());
        self
    }

    pub fn with_cleanup_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.cleanup_cmd = Some(cmd.into());
        self
    }
}

/// A connection as written: `"peer"`, `"peer:ifname"` or a full record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionSpec {
    Short(String),
    Full(Connection),
}

impl From<&str> for ConnectionSpec {
    fn from(s: &str) -> Self {
        ConnectionSpec::Short(s.to_string())
    }
}

impl From<Connection> for ConnectionSpec {
    fn from(c: Connection) -> Self {
        ConnectionSpec::Full(c)
    }
}

impl ConnectionSpec {
    pub fn normalize(&self) -> Connection {
        match self {
            ConnectionSpec::Full(c) => c.clone(),
            ConnectionSpec::Short(s) => match s.split_once(':') {
                Some((peer, ifname)) => Connection {
                    to: peer.to_string(),
                    name: Some(ifname.to_string()),
                    ..Default::default()
                },
                None => Connection::to(s.as_str()),
            },
        }
    }
}

/// One end of a link as declared by a node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Connection {
    /// Peer node or switch. Empty for borrowed host interfaces.
    #[serde(default)]
    pub to: String,
    /// Interface name on this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Interface name on the peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_name: Option<String>,
    /// Address of this end; on point-to-point links also sizes the network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Network>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
    /// Host interface moved into the node instead of a veth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostintf: Option<String>,
}

impl Connection {
    pub fn to(peer: impl Into<String>) -> Self {
        Self {
            to: peer.into(),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn remote_named(mut self, name: impl Into<String>) -> Self {
        self.remote_name = Some(name.into());
        self
    }

    pub fn with_ip(mut self, ip: Ipv4Network) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_constraints(mut self, c: Constraints) -> Self {
        self.constraints = Some(c);
        self
    }

    pub fn host_interface(ifname: impl Into<String>) -> Self {
        Self {
            hostintf: Some(ifname.into()),
            ..Default::default()
        }
    }
}

impl TopologyConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json(&json)
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn network(&self, name: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.name == name)
    }

    /// Reject contract violations before anything touches the kernel.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let all = self
            .networks
            .iter()
            .map(|n| &n.name)
            .chain(self.nodes.iter().map(|n| &n.name));
        for name in all {
            check_ifname(name).map_err(|source| ConfigError::Name {
                name: name.clone(),
                source,
            })?;
            if !names.insert(name.as_str()) {
                return Err(ConfigError::Duplicate(name.clone()));
            }
        }

        for node in &self.nodes {
            if node.image.is_some() && node.vm.is_some() {
                return Err(ConfigError::Invalid {
                    node: node.name.clone(),
                    reason: "both image and vm given".to_string(),
                });
            }
            if let Some(vm) = &node.vm {
                if vm.kernel.is_none() && vm.disk.is_none() {
                    return Err(ConfigError::Invalid {
                        node: node.name.clone(),
                        reason: "vm needs a kernel or a disk".to_string(),
                    });
                }
            }

            let mut local = HashSet::new();
            for spec in &node.connections {
                let conn = spec.normalize();
                self.validate_connection(node, &conn)?;
                if let Some(name) = &conn.name {
                    if !local.insert(name.clone()) {
                        return Err(ConfigError::Duplicate(format!("{}:{}", node.name, name)));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_connection(&self, node: &NodeConfig, conn: &Connection) -> Result<(), ConfigError> {
        let check = |name: &String| {
            check_ifname(name).map_err(|source| ConfigError::Name {
                name: name.clone(),
                source,
            })
        };
        if let Some(name) = &conn.name {
            check(name)?;
        }
        if let Some(name) = &conn.remote_name {
            check(name)?;
        }

        if let Some(hostintf) = &conn.hostintf {
            check(hostintf)?;
            if !conn.to.is_empty() || conn.remote_name.is_some() {
                return Err(ConfigError::Invalid {
                    node: node.name.clone(),
                    reason: format!("host interface {} cannot also have a peer", hostintf),
                });
            }
        } else {
            if conn.to == node.name {
                return Err(ConfigError::SelfConnection(node.name.clone()));
            }
            if self.node(&conn.to).is_none() && self.network(&conn.to).is_none() {
                return Err(ConfigError::UnknownPeer {
                    node: node.name.clone(),
                    peer: conn.to.clone(),
                });
            }
        }

        if let Some(c) = &conn.constraints {
            c.validate().map_err(|source| ConfigError::Constraints {
                node: node.name.clone(),
                peer: conn.to.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"{
        "networks": [{"name": "sw1"}],
        "nodes": [
            {"name": "r1", "connections": ["sw1"]},
            {"name": "r2", "connections": ["sw1",
                {"to": "r3", "name": "p2p0", "constraints": {"delay": 80000}}]},
            {"name": "r3", "connections": ["sw1",
                {"to": "r2", "name": "p2p0", "constraints": {"delay": 40000}}]}
        ]
    }"#;

    #[test]
    fn test_defaults() {
        let c = TopologyConfig::from_json(SCENARIO).unwrap();
        assert!(c.autonumber);
        assert!(c.isolated);
        assert_eq!(c.rundir, PathBuf::from(DEFAULT_RUNDIR));
        let r1 = c.node("r1").unwrap();
        assert!(r1.hostname);
        assert!(r1.namespaces.net && r1.namespaces.pid && r1.namespaces.mount);
        assert!(!r1.namespaces.user);
        c.validate().unwrap();
    }

    #[test]
    fn test_shorthand_normalization() {
        let c = ConnectionSpec::from("r2:eth7").normalize();
        assert_eq!(c.to, "r2");
        assert_eq!(c.name.as_deref(), Some("eth7"));
        let c = ConnectionSpec::from("sw1").normalize();
        assert_eq!(c, Connection::to("sw1"));
    }

    #[test]
    fn test_unknown_peer_and_self() {
        let mut c = TopologyConfig::default();
        c.nodes.push(NodeConfig::new("r1").connect("nowhere"));
        assert!(matches!(c.validate(), Err(ConfigError::UnknownPeer { .. })));

        let mut c = TopologyConfig::default();
        c.nodes.push(NodeConfig::new("r1").connect("r1"));
        assert!(matches!(c.validate(), Err(ConfigError::SelfConnection(_))));
    }

    #[test]
    fn test_names_checked() {
        let mut c = TopologyConfig::default();
        c.networks.push(NetworkConfig::new("a-very-long-bridge"));
        assert!(matches!(c.validate(), Err(ConfigError::Name { .. })));

        let mut c = TopologyConfig::default();
        c.networks.push(NetworkConfig::new("x"));
        c.nodes.push(NodeConfig::new("x"));
        assert!(matches!(c.validate(), Err(ConfigError::Duplicate(_))));

        let mut c = TopologyConfig::default();
        c.networks.push(NetworkConfig::new("sw1"));
        c.nodes.push(NodeConfig::new("r1").connect(Connection::to("sw1").named("eth-name-too-long")));
        assert!(matches!(c.validate(), Err(ConfigError::Name { .. })));
    }

    #[test]
    fn test_loss_without_delay_rejected() {
        let json = r#"{
            "nodes": [
                {"name": "a", "connections": [{"to": "b", "constraints": {"loss": 30}}]},
                {"name": "b"}
            ]
        }"#;
        let c = TopologyConfig::from_json(json).unwrap();
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Constraints {
                source: ShapingError::MissingDelay { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_host_interface_has_no_peer() {
        let mut c = TopologyConfig::default();
        c.nodes.push(NodeConfig::new("r1").connect(Connection::host_interface("enp3s0").named("wan0")));
        c.validate().unwrap();

        let mut bad = Connection::host_interface("enp3s0");
        bad.to = "r1".into();
        c.nodes.push(NodeConfig::new("r2").connect(bad));
        assert!(matches!(c.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_unknown_field_in_constraints() {
        let json = r#"{"nodes": [{"name": "a", "connections": [{"to": "b", "constraints": {"dealy": 1}}]}]}"#;
        assert!(TopologyConfig::from_json(json).is_err());
    }
}
