//! Topology construction
//!
//! Builds a validated [`TopologyConfig`] into live kernel objects:
//!
//! 1. the topology root (an owned namespace, or the host when not isolated)
//! 2. switches and nodes, created concurrently
//! 3. links, switched or point-to-point, with MACs cached and indexed
//! 4. addresses, then traffic shaping on both ends of each link
//! 5. borrowed host interfaces and node workloads
//!
//! Interface names are settled by a pure planning pass before anything is
//! created, so naming problems never leave half-built state behind. A
//! failure during construction tears down whatever was already built.

use crate::addr::{self, AddrError};
use crate::command::{RunOptions, Runner};
use crate::config::{Connection, TopologyConfig};
use crate::intf::{InterfaceTable, Interfaces};
use crate::namespace::{Namespace, NamespaceKinds, NamespaceOptions, DEFAULT_VERIFY_TIMEOUT};
use crate::node::Node;
use crate::rundir::RunDir;
use crate::shaping::Constraints;
use crate::switch::{port_basename, Switch};
use crate::teardown;
use crate::TestbedError;
use futures::future::join_all;
use ipnetwork::Ipv4Network;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, PartialEq)]
pub enum TopologyError {
    #[error("no node or switch named {0:?}")]
    UnknownEntity(String),

    #[error("{entity}: interface {ifname} is claimed by two links")]
    NameTaken { entity: String, ifname: String },

    #[error("{0}: node has no namespace to link into")]
    NoNamespace(String),

    #[error("no link on {entity}:{ifname}")]
    NoSuchLink { entity: String, ifname: String },
}

#[derive(Clone, Debug)]
pub struct TopologyOptions {
    /// Init supervisor for PID-isolated nodes; looked up when unset.
    pub init: Option<PathBuf>,
    pub verify_timeout: Duration,
    /// Overrides the run directory of the configuration.
    pub rundir: Option<PathBuf>,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            init: None,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            rundir: None,
        }
    }
}

/// One end of a link.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub entity: String,
    pub ifname: String,
}

impl Endpoint {
    fn new(entity: &str, ifname: String) -> Self {
        Self {
            entity: entity.to_string(),
            ifname,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.ifname)
    }
}

/// A veth pair. `a` is always a node; `b` is a switch unless `p2p`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub a: Endpoint,
    pub b: Endpoint,
    pub p2p: bool,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.p2p { "<->" } else { "<=>" };
        write!(f, "{} {} {}", self.a, sep, self.b)
    }
}

/// A planned link together with the declarations of its two ends.
#[derive(Clone, Debug)]
pub(crate) struct LinkPlan {
    pub link: Link,
    pub local: Connection,
    /// The peer's own declaration of a point-to-point link, if it made one.
    pub remote: Option<Connection>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct HostIntfPlan {
    pub node: String,
    pub host_name: String,
    pub local_name: String,
    pub ip: Option<Ipv4Network>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Plan {
    pub links: Vec<LinkPlan>,
    pub host_intfs: Vec<HostIntfPlan>,
}

/// Ordinal counters of one topology instance.
#[derive(Debug, Default)]
struct Ordinals {
    switch: u32,
    node: u32,
}

impl Ordinals {
    fn next_switch(&mut self) -> u32 {
        self.switch += 1;
        self.switch
    }

    fn next_node(&mut self) -> u32 {
        self.node += 1;
        self.node
    }
}

struct Namer {
    tables: BTreeMap<String, Interfaces>,
    reserved: BTreeMap<String, BTreeSet<String>>,
}

impl Namer {
    fn name_or_generate(&mut self, entity: &str, name: Option<&String>) -> Result<String, TestbedError> {
        let table = self
            .tables
            .get_mut(entity)
            .ok_or_else(|| TopologyError::UnknownEntity(entity.to_string()))?;
        let ifname = match name {
            Some(n) => n.clone(),
            None => {
                let reserved = self.reserved.get(entity).cloned().unwrap_or_default();
                table.next_name(&reserved)?
            }
        };
        if table.contains(&ifname) {
            return Err(TopologyError::NameTaken {
                entity: entity.to_string(),
                ifname,
            }
            .into());
        }
        table.register(&ifname, None)?;
        Ok(ifname)
    }
}

/// Settle every interface name and pair up point-to-point declarations.
///
/// A point-to-point connection declared on both nodes is one link; the two
/// declarations pair up when their explicit names agree.
pub(crate) fn plan_links(config: &TopologyConfig) -> Result<Plan, TestbedError> {
    let declared: Vec<(String, Vec<Connection>)> = config
        .nodes
        .iter()
        .map(|n| (n.name.clone(), n.connections.iter().map(|c| c.normalize()).collect()))
        .collect();

    let mut namer = Namer {
        tables: BTreeMap::new(),
        reserved: BTreeMap::new(),
    };
    for (i, net) in config.networks.iter().enumerate() {
        let base = port_basename(&net.name, i as u32 + 1);
        namer.tables.insert(net.name.clone(), Interfaces::new(base));
    }
    for (node, conns) in &declared {
        namer.tables.insert(node.clone(), Interfaces::new("eth"));
        for c in conns {
            let local = c.name.as_ref().or(c.hostintf.as_ref());
            if let Some(name) = local {
                namer.reserved.entry(node.clone()).or_default().insert(name.clone());
            }
            if let Some(name) = &c.remote_name {
                namer.reserved.entry(c.to.clone()).or_default().insert(name.clone());
            }
        }
    }

    let mut plan = Plan::default();
    let mut consumed: HashSet<(usize, usize)> = HashSet::new();
    for (i, (node, conns)) in declared.iter().enumerate() {
        for (j, conn) in conns.iter().enumerate() {
            if !consumed.insert((i, j)) {
                continue;
            }
            if let Some(host_name) = &conn.hostintf {
                let local_name = namer.name_or_generate(node, Some(conn.name.as_ref().unwrap_or(host_name)))?;
                plan.host_intfs.push(HostIntfPlan {
                    node: node.clone(),
                    host_name: host_name.clone(),
                    local_name,
                    ip: conn.ip,
                });
                continue;
            }

            if config.network(&conn.to).is_some() {
                let a = namer.name_or_generate(node, conn.name.as_ref())?;
                let b = namer.name_or_generate(&conn.to, conn.remote_name.as_ref())?;
                plan.links.push(LinkPlan {
                    link: Link {
                        a: Endpoint::new(node, a),
                        b: Endpoint::new(&conn.to, b),
                        p2p: false,
                    },
                    local: conn.clone(),
                    remote: None,
                });
                continue;
            }

            let partner = declared
                .iter()
                .position(|(n, _)| *n == conn.to)
                .and_then(|k| {
                    declared[k].1.iter().enumerate().find_map(|(m, other)| {
                        let pairs = other.hostintf.is_none()
                            && other.to == *node
                            && !consumed.contains(&(k, m))
                            && agree(conn.remote_name.as_ref(), other.name.as_ref())
                            && agree(other.remote_name.as_ref(), conn.name.as_ref());
                        pairs.then_some((k, m))
                    })
                });
            let remote = partner.map(|(k, m)| {
                consumed.insert((k, m));
                declared[k].1[m].clone()
            });
            let a = namer.name_or_generate(node, conn.name.as_ref())?;
            let remote_name = conn
                .remote_name
                .as_ref()
                .or(remote.as_ref().and_then(|r| r.name.as_ref()));
            let b = namer.name_or_generate(&conn.to, remote_name)?;
            plan.links.push(LinkPlan {
                link: Link {
                    a: Endpoint::new(node, a),
                    b: Endpoint::new(&conn.to, b),
                    p2p: true,
                },
                local: conn.clone(),
                remote,
            });
        }
    }
    Ok(plan)
}

fn agree(a: Option<&String>, b: Option<&String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// An explicit `ip` that is a network address declares the link's network
/// rather than this end's address.
fn declared_network(ip: Ipv4Network) -> Option<Ipv4Network> {
    (ip.ip() == ip.network() && ip.prefix() <= addr::P2P_PREFIX).then_some(ip)
}

/// Addresses of the two ends of a point-to-point link.
fn p2p_addresses(
    plan: &LinkPlan,
    autonumber: bool,
    allocate: impl FnOnce() -> Result<Ipv4Network, AddrError>,
) -> Result<(Option<Ipv4Network>, Option<Ipv4Network>), AddrError> {
    let local = plan.local.ip;
    let remote = plan.remote.as_ref().and_then(|r| r.ip);
    if let Some(net) = local.and_then(declared_network) {
        let (a, b) = addr::p2p_endpoints(net)?;
        return Ok((Some(a), Some(b)));
    }
    if local.is_some() || remote.is_some() {
        return Ok((local, remote));
    }
    if !autonumber {
        return Ok((None, None));
    }
    let (a, b) = addr::p2p_endpoints(allocate()?)?;
    Ok((Some(a), Some(b)))
}

/// Constraints for each end of a link. Switched links shape both ends with
/// the node's declaration; point-to-point ends use their own declaration,
/// falling back to the other side's.
fn link_constraints(plan: &LinkPlan) -> (Option<&Constraints>, Option<&Constraints>) {
    let local = plan.local.constraints.as_ref();
    if !plan.link.p2p {
        return (local, local);
    }
    let remote = plan.remote.as_ref().and_then(|r| r.constraints.as_ref());
    (local.or(remote), remote.or(local))
}

fn strings(words: &[&str]) -> Vec<String> {
    words.iter().map(|s| s.to_string()).collect()
}

/// A built testbed.
#[derive(Debug)]
pub struct Topology {
    pub(crate) config: TopologyConfig,
    pub(crate) rundir: RunDir,
    pub(crate) root: Namespace,
    pub(crate) switches: BTreeMap<String, Switch>,
    pub(crate) nodes: BTreeMap<String, Node>,
    pub(crate) links: Vec<Link>,
    /// MAC address to owning (entity, interface).
    pub(crate) macs: HashMap<String, (String, String)>,
}

impl Topology {
    /// Validate `config` and build it. On failure everything already
    /// created is torn down before the error is returned.
    pub async fn build(config: TopologyConfig, opts: TopologyOptions) -> Result<Self, TestbedError> {
        config.validate()?;
        let plan = plan_links(&config)?;

        let rundir = RunDir::create(opts.rundir.clone().unwrap_or_else(|| config.rundir.clone()))?;
        let root = if config.isolated {
            let ns_opts = NamespaceOptions {
                kinds: NamespaceKinds::root_default(),
                verify_timeout: opts.verify_timeout,
                ..Default::default()
            };
            Namespace::create("root", ns_opts).await?
        } else {
            Namespace::host("host")
        };
        info!(
            "Building topology: {} switches, {} nodes, {} links",
            config.networks.len(),
            config.nodes.len(),
            plan.links.len()
        );

        let mut topo = Self {
            config,
            rundir,
            root,
            switches: BTreeMap::new(),
            nodes: BTreeMap::new(),
            links: Vec::new(),
            macs: HashMap::new(),
        };
        match topo.populate(&plan, &opts).await {
            Ok(()) => {
                info!("Topology ready");
                Ok(topo)
            }
            Err(e) => {
                warn!("Topology construction failed: {}", e);
                teardown::teardown(topo).await;
                Err(e)
            }
        }
    }

    async fn populate(&mut self, plan: &Plan, opts: &TopologyOptions) -> Result<(), TestbedError> {
        self.create_entities(opts).await?;
        for lp in &plan.links {
            self.wire(lp).await?;
        }
        self.index_macs().await?;
        for lp in &plan.links {
            self.address(lp).await?;
            self.shape(lp).await?;
        }
        for hp in &plan.host_intfs {
            let node = self.node_entry(&hp.node)?;
            node.borrow_host_interface(&hp.host_name, &hp.local_name)
                .await?;
            if let Some(ip) = hp.ip {
                node.add_address(&hp.local_name, ip).await?;
            }
        }
        for node in self.nodes.values_mut() {
            node.start_workload().await?;
        }
        Ok(())
    }

    /// Create every switch and node concurrently. Whatever was created is
    /// kept for teardown even when a sibling failed.
    async fn create_entities(&mut self, opts: &TopologyOptions) -> Result<(), TestbedError> {
        let mut ordinals = Ordinals::default();
        let autonumber = self.config.autonumber;
        let root = &self.root;

        let switches = join_all(
            self.config
                .networks
                .iter()
                .map(|net| (ordinals.next_switch(), net))
                .collect::<Vec<_>>()
                .into_iter()
                .map(|(ord, net)| Switch::create(net, ord, root, autonumber)),
        );
        let nodes = join_all(
            self.config
                .nodes
                .iter()
                .map(|cfg| (ordinals.next_node(), cfg))
                .collect::<Vec<_>>()
                .into_iter()
                .map(|(ord, cfg)| {
                    let ns_opts = NamespaceOptions {
                        kinds: cfg.namespaces,
                        hostname: cfg.hostname.then(|| cfg.name.clone()),
                        private_mounts: cfg.mounts.clone(),
                        verify_timeout: opts.verify_timeout,
                        init: opts.init.clone(),
                        cwd: cfg.cwd.clone(),
                    };
                    Node::create(cfg.clone(), ord, ns_opts, self.rundir.clone())
                }),
        );
        let (switches, nodes) = futures::join!(switches, nodes);

        let mut first = None;
        for sw in switches {
            match sw {
                Ok(sw) => {
                    self.switches.insert(sw.name().to_string(), sw);
                }
                Err(e) => {
                    first.get_or_insert(e);
                }
            }
        }
        for node in nodes {
            match node {
                Ok(node) => {
                    self.nodes.insert(node.name().to_string(), node);
                }
                Err(e) => {
                    first.get_or_insert(e);
                }
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn node_entry(&mut self, name: &str) -> Result<&mut Node, TopologyError> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| TopologyError::UnknownEntity(name.to_string()))
    }

    fn node_pid(&self, name: &str) -> Result<String, TopologyError> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| TopologyError::UnknownEntity(name.to_string()))?;
        node.namespace()
            .pid()
            .map(|p| p.to_string())
            .ok_or_else(|| TopologyError::NoNamespace(name.to_string()))
    }

    /// Create the veth pair of `lp`. Ends that already exist are left alone.
    async fn wire(&mut self, lp: &LinkPlan) -> Result<(), TestbedError> {
        let link = &lp.link;
        let exists = self
            .nodes
            .get(&link.a.entity)
            .is_some_and(|n| n.interfaces().contains(&link.a.ifname));
        if exists {
            debug!("link {} already present", link);
            return Ok(());
        }

        let a_pid = self.node_pid(&link.a.entity)?;
        let ip = self.root.ip_path().to_string();
        if link.p2p {
            let b_pid = self.node_pid(&link.b.entity)?;
            let argv = [
                ip.as_str(),
                "link",
                "add",
                link.a.ifname.as_str(),
                "netns",
                a_pid.as_str(),
                "type",
                "veth",
                "peer",
                "name",
                link.b.ifname.as_str(),
                "netns",
                b_pid.as_str(),
            ];
            self.root.cmd_raises(argv).await?;
            let b = self.node_entry(&link.b.entity)?;
            b.intf_ip_cmd(
                &link.b.ifname,
                strings(&["link", "set", &link.b.ifname, "up"]),
                RunOptions::default().raises(),
            )
            .await?;
            b.interfaces_mut().register(&link.b.ifname, None)?;
        } else {
            let argv = [
                ip.as_str(),
                "link",
                "add",
                link.b.ifname.as_str(),
                "type",
                "veth",
                "peer",
                "name",
                link.a.ifname.as_str(),
                "netns",
                a_pid.as_str(),
            ];
            self.root.cmd_raises(argv).await?;
            let sw = self
                .switches
                .get_mut(&link.b.entity)
                .ok_or_else(|| TopologyError::UnknownEntity(link.b.entity.clone()))?;
            sw.attach_port(&link.b.ifname).await?;
        }

        let a = self.node_entry(&link.a.entity)?;
        a.intf_ip_cmd(
            &link.a.ifname,
            strings(&["link", "set", &link.a.ifname, "up"]),
            RunOptions::default().raises(),
        )
        .await?;
        a.interfaces_mut().register(&link.a.ifname, None)?;
        debug!("link {} created", link);
        self.links.push(link.clone());
        Ok(())
    }

    async fn index_macs(&mut self) -> Result<(), TestbedError> {
        let mut found = Vec::new();
        for link in &self.links {
            for end in [&link.a, &link.b] {
                let entity = self
                    .entity(&end.entity)
                    .ok_or_else(|| TopologyError::UnknownEntity(end.entity.clone()))?;
                let mac = entity.get_intf_mac(&end.ifname).await?;
                found.push((mac, end.entity.clone(), end.ifname.clone()));
            }
        }
        for (mac, entity, ifname) in found {
            self.macs.insert(mac, (entity, ifname));
        }
        Ok(())
    }

    async fn address(&mut self, lp: &LinkPlan) -> Result<(), TestbedError> {
        let link = &lp.link;
        let autonumber = self.config.autonumber;
        if link.p2p {
            let node = self.node_entry(&link.a.entity)?;
            let (a, b) = p2p_addresses(lp, autonumber, || node.allocate_p2p(None))?;
            if let Some(a) = a {
                self.node_entry(&link.a.entity)?
                    .add_address(&link.a.ifname, a)
                    .await?;
            }
            if let Some(b) = b {
                self.node_entry(&link.b.entity)?
                    .add_address(&link.b.ifname, b)
                    .await?;
            }
            return Ok(());
        }

        let network = self.switches.get(&link.b.entity).and_then(Switch::network);
        let node = self.node_entry(&link.a.entity)?;
        let ip = match (lp.local.ip, network) {
            (Some(ip), _) => Some(ip),
            (None, Some(net)) if autonumber => Some(addr::node_address(net, node.ordinal())?),
            _ => None,
        };
        if let Some(ip) = ip {
            node.add_address(&link.a.ifname, ip).await?;
        }
        Ok(())
    }

    async fn shape(&self, lp: &LinkPlan) -> Result<(), TestbedError> {
        let (a, b) = link_constraints(lp);
        for (end, constraints) in [(&lp.link.a, a), (&lp.link.b, b)] {
            let Some(c) = constraints else { continue };
            let entity = self
                .entity(&end.entity)
                .ok_or_else(|| TopologyError::UnknownEntity(end.entity.clone()))?;
            entity.apply_constraints(&end.ifname, c).await?;
        }
        Ok(())
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn rundir(&self) -> &RunDir {
        &self.rundir
    }

    /// The namespace holding the switches.
    pub fn root(&self) -> &Namespace {
        &self.root
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn switches(&self) -> impl Iterator<Item = &Switch> {
        self.switches.values()
    }

    pub fn switch(&self, name: &str) -> Option<&Switch> {
        self.switches.get(name)
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Node or switch called `name`.
    pub fn entity(&self, name: &str) -> Option<&dyn InterfaceTable> {
        match self.nodes.get(name) {
            Some(n) => Some(n as &dyn InterfaceTable),
            None => self.switches.get(name).map(|s| s as &dyn InterfaceTable),
        }
    }

    /// Host name of the interface `ifname` borrowed by `node`.
    pub fn host_interface(&self, node: &str, ifname: &str) -> Option<&str> {
        self.nodes.get(node)?.host_interface(ifname)
    }

    /// (entity, interface) owning `mac`.
    pub fn mac_owner(&self, mac: &str) -> Option<(&str, &str)> {
        self.macs
            .get(&mac.to_ascii_lowercase())
            .map(|(e, i)| (e.as_str(), i.as_str()))
    }

    /// Delete the link with an end at `entity:ifname`.
    pub async fn delete_link(&mut self, entity: &str, ifname: &str) -> Result<(), TestbedError> {
        let at = |e: &Endpoint| e.entity == entity && e.ifname == ifname;
        let idx = self
            .links
            .iter()
            .position(|l| at(&l.a) || at(&l.b))
            .ok_or_else(|| TopologyError::NoSuchLink {
                entity: entity.to_string(),
                ifname: ifname.to_string(),
            })?;
        let link = self.links.remove(idx);
        {
            let a = self
                .entity(&link.a.entity)
                .ok_or_else(|| TopologyError::UnknownEntity(link.a.entity.clone()))?;
            let b = self
                .entity(&link.b.entity)
                .ok_or_else(|| TopologyError::UnknownEntity(link.b.entity.clone()))?;
            teardown::delete_veth(a, &link.a.ifname, b, &link.b.ifname).await?;
        }
        for end in [&link.a, &link.b] {
            self.macs
                .retain(|_, (e, i)| !(*e == end.entity && *i == end.ifname));
            if let Some(n) = self.nodes.get_mut(&end.entity) {
                n.interfaces_mut().unregister(&end.ifname);
            } else if let Some(s) = self.switches.get_mut(&end.entity) {
                s.interfaces_mut().unregister(&end.ifname);
            }
        }
        info!("link {} deleted", link);
        Ok(())
    }

    /// Tear everything down. Never fails; problems are logged.
    pub async fn teardown(self) {
        teardown::teardown(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"{
        "networks": [{"name": "sw1"}],
        "nodes": [
            {"name": "r1", "connections": ["sw1"]},
            {"name": "r2", "connections": [
                "sw1",
                {"to": "r3", "name": "p2p0", "constraints": {"delay": 80000}}
            ]},
            {"name": "r3", "connections": [
                "sw1",
                {"to": "r2", "constraints": {"delay": 40000}}
            ]}
        ]
    }"#;

    fn plan(json: &str) -> Plan {
        plan_links(&TopologyConfig::from_json(json).unwrap()).unwrap()
    }

    #[test]
    fn test_plan_names_and_pairs() {
        let plan = plan(SCENARIO);
        let links: Vec<String> = plan.links.iter().map(|l| l.link.to_string()).collect();
        assert_eq!(
            links,
            [
                "r1:eth0 <=> sw1:sw1-p0",
                "r2:eth0 <=> sw1:sw1-p1",
                "r2:p2p0 <-> r3:eth0",
                "r3:eth1 <=> sw1:sw1-p2",
            ]
        );
        // r3's declaration of the same link was folded into r2's
        let p2p = &plan.links[2];
        assert!(p2p.remote.is_some());
        let (a, b) = link_constraints(p2p);
        assert_eq!(a.unwrap().delay, Some(80000u64.into()));
        assert_eq!(b.unwrap().delay, Some(40000u64.into()));
    }

    #[test]
    fn test_plan_generated_names_skip_declared() {
        let plan = plan(
            r#"{"nodes": [
                {"name": "a", "connections": ["b", "b:eth0"]},
                {"name": "b"}
            ]}"#,
        );
        let links: Vec<String> = plan.links.iter().map(|l| l.link.to_string()).collect();
        assert_eq!(links, ["a:eth1 <-> b:eth0", "a:eth0 <-> b:eth1"]);
    }

    #[test]
    fn test_plan_rejects_name_claimed_twice() {
        let config = TopologyConfig::from_json(
            r#"{"nodes": [
                {"name": "a", "connections": [{"to": "b", "remote-name": "x0"}]},
                {"name": "c", "connections": [{"to": "b", "remote-name": "x0"}]},
                {"name": "b"}
            ]}"#,
        )
        .unwrap();
        let err = plan_links(&config).unwrap_err();
        assert!(matches!(
            err,
            TestbedError::Topology(TopologyError::NameTaken { ref entity, ref ifname })
                if entity == "b" && ifname == "x0"
        ));
    }

    #[test]
    fn test_plan_host_interfaces() {
        let plan = plan(
            r#"{"nodes": [{"name": "a", "connections": [
                {"hostintf": "enp3s0"},
                {"hostintf": "enp4s0", "name": "uplink", "ip": "192.0.2.2/24"}
            ]}]}"#,
        );
        assert!(plan.links.is_empty());
        assert_eq!(plan.host_intfs.len(), 2);
        assert_eq!(plan.host_intfs[0].local_name, "enp3s0");
        assert_eq!(plan.host_intfs[1].local_name, "uplink");
        assert_eq!(plan.host_intfs[1].ip.unwrap().to_string(), "192.0.2.2/24");
    }

    #[test]
    fn test_p2p_addresses() {
        let plan = plan(SCENARIO);
        let p2p = &plan.links[2];
        let mut pool = addr::P2pAllocator::for_ordinal(2).unwrap();
        let (a, b) = p2p_addresses(p2p, true, || pool.allocate(None)).unwrap();
        assert_eq!(a.unwrap().to_string(), "10.254.2.0/31");
        assert_eq!(b.unwrap().to_string(), "10.254.2.1/31");

        let (a, b) = p2p_addresses(p2p, false, || unreachable!()).unwrap();
        assert_eq!((a, b), (None, None));

        let mut declared = p2p.clone();
        declared.local.ip = Some("10.9.0.0/30".parse().unwrap());
        let (a, b) = p2p_addresses(&declared, true, || unreachable!()).unwrap();
        assert_eq!(a.unwrap().to_string(), "10.9.0.1/30");
        assert_eq!(b.unwrap().to_string(), "10.9.0.2/30");
    }

    #[test]
    fn test_many_p2p_links_disjoint() {
        let mut pool = addr::P2pAllocator::for_ordinal(5).unwrap();
        let nets: Vec<Ipv4Network> = (0..16).map(|_| pool.allocate(None).unwrap()).collect();
        for (i, x) in nets.iter().enumerate() {
            for y in &nets[i + 1..] {
                assert!(!x.contains(y.network()) && !y.contains(x.network()));
            }
        }
    }

    #[test]
    fn test_switched_constraints_on_both_ends() {
        let config = TopologyConfig::from_json(
            r#"{"networks": [{"name": "lan"}],
                "nodes": [{"name": "a", "connections": [
                    {"to": "lan", "constraints": {"delay": "10k", "loss": 1}}
                ]}]}"#,
        )
        .unwrap();
        config.validate().unwrap();
        let plan = plan_links(&config).unwrap();
        let (a, b) = link_constraints(&plan.links[0]);
        assert_eq!(a, b);
        let compiled = a.unwrap().compile("eth0").unwrap();
        assert!(compiled[0].join(" ").contains("delay 10000usec loss 1%"));
    }

    #[test]
    fn test_link_display() {
        let link = Link {
            a: Endpoint::new("r1", "eth0".into()),
            b: Endpoint::new("sw1", "sw1-p0".into()),
            p2p: false,
        };
        assert_eq!(link.to_string(), "r1:eth0 <=> sw1:sw1-p0");
    }
}
