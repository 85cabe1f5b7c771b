//! Testbed nodes
//!
//! A node owns a namespace for its links and addresses and a backend for
//! user commands. Interface commands always go through the namespace, so
//! container and VM nodes are wired exactly like bare ones.

use crate::addr::{AddrError, P2pAllocator};
use crate::backend::Backend;
use crate::command::{Cmd, CmdOutput, CommandError, Commander, RunOptions, Runner};
use crate::config::NodeConfig;
use crate::intf::{InterfaceTable, Interfaces};
use crate::namespace::{Namespace, NamespaceOptions};
use crate::rundir::RunDir;
use crate::teardown::spawn_terminate;
use crate::TestbedError;
use futures::future::BoxFuture;
use ipnetwork::Ipv4Network;
use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, warn};

const WORKLOAD_GRACE: Duration = Duration::from_secs(2);

/// A host interface lent to a node for the lifetime of the testbed.
#[derive(Debug, Clone, PartialEq)]
pub struct BorrowedIntf {
    /// Name on the host.
    pub host_name: String,
    /// Name inside the node.
    pub local_name: String,
}

#[derive(Debug)]
pub struct Node {
    name: String,
    ordinal: u32,
    ns: Namespace,
    backend: Backend,
    config: NodeConfig,
    intfs: Interfaces,
    /// Created on first use; ordinals past the autonumbering range are
    /// fine as long as nothing is allocated.
    p2p: Option<P2pAllocator>,
    workload: Option<Child>,
    borrowed: Vec<BorrowedIntf>,
    rundir: RunDir,
}

impl Node {
    /// Create the namespace of `config` and start its backend in it.
    pub async fn create(
        config: NodeConfig,
        ordinal: u32,
        opts: NamespaceOptions,
        rundir: RunDir,
    ) -> Result<Self, TestbedError> {
        let name = config.name.clone();
        let mut ns = Namespace::create(name.clone(), opts).await?;
        if let Some(pid) = ns.pid() {
            rundir.write_nspid(&name, pid)?;
        }

        let backend = match Backend::start(&config, &ns, &rundir).await {
            Ok(b) => b,
            Err(e) => {
                ns.release().await;
                rundir.remove_node(&name);
                return Err(e.into());
            }
        };
        info!("Node {} ({}) created with ordinal {}", name, backend.kind(), ordinal);

        Ok(Self {
            name,
            ordinal,
            ns,
            backend,
            config,
            intfs: Interfaces::new("eth"),
            p2p: None,
            workload: None,
            borrowed: Vec::new(),
            rundir,
        })
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Interface name to assigned address.
    pub fn addrs(&self) -> &BTreeMap<String, Option<Ipv4Network>> {
        self.intfs.addrs()
    }

    pub fn borrowed(&self) -> &[BorrowedIntf] {
        &self.borrowed
    }

    pub(crate) fn interfaces_mut(&mut self) -> &mut Interfaces {
        &mut self.intfs
    }

    pub(crate) fn allocate_p2p(&mut self, prefix: Option<u8>) -> Result<Ipv4Network, AddrError> {
        let pool = match self.p2p.take() {
            Some(pool) => pool,
            None => P2pAllocator::for_ordinal(self.ordinal)?,
        };
        self.p2p.insert(pool).allocate(prefix)
    }

    /// Working directory for later commands of every kind.
    pub fn set_cwd(&mut self, cwd: Option<PathBuf>) {
        self.ns.set_cwd(cwd.clone());
        self.backend.set_cwd(cwd);
    }

    /// Assign `addr` to `ifname` and record it.
    pub async fn add_address(&mut self, ifname: &str, addr: Ipv4Network) -> Result<(), TestbedError> {
        let args = vec![
            "addr".to_string(),
            "add".to_string(),
            addr.to_string(),
            "dev".to_string(),
            ifname.to_string(),
        ];
        self.intf_ip_cmd(ifname, args, RunOptions::default().raises())
            .await?;
        self.intfs.set_addr(ifname, addr)?;
        debug!("{}: {} has address {}", self.name, ifname, addr);
        Ok(())
    }

    /// Move host interface `host_name` into this node as `local_name`.
    pub async fn borrow_host_interface(&mut self, host_name: &str, local_name: &str) -> Result<(), TestbedError> {
        let Some(pid) = self.ns.pid() else {
            return Err(CommandError::Unsupported {
                target: self.name.clone(),
                what: "host interfaces without a namespace".to_string(),
            }
            .into());
        };
        let host = Commander::host(self.name.clone());
        let pid = pid.to_string();
        host.run(
            Cmd::argv(["ip", "link", "set", host_name, "netns", pid.as_str()]),
            RunOptions::default().raises(),
        )
        .await?;
        self.borrowed.push(BorrowedIntf {
            host_name: host_name.to_string(),
            local_name: local_name.to_string(),
        });
        self.intfs.register(local_name, None)?;

        let ip = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        if host_name != local_name {
            self.intf_ip_cmd(
                host_name,
                ip(&["link", "set", host_name, "name", local_name]),
                RunOptions::default().raises(),
            )
            .await?;
        }
        self.intf_ip_cmd(
            local_name,
            ip(&["link", "set", local_name, "up"]),
            RunOptions::default().raises(),
        )
        .await?;
        info!("{}: borrowed host interface {} as {}", self.name, host_name, local_name);
        Ok(())
    }

    async fn return_host_interface(&self, intf: &BorrowedIntf) -> Result<(), TestbedError> {
        // Only the network namespace is entered, so pid 1 is the host init.
        let net = Commander::with_prefix(self.name.clone(), self.ns.net_prefix());
        let quiet = || RunOptions::default().raises().quiet();
        let local = intf.local_name.as_str();
        net.run(Cmd::argv(["ip", "link", "set", local, "down"]), quiet())
            .await?;
        net.run(Cmd::argv(["ip", "link", "set", local, "netns", "1"]), quiet())
            .await?;
        if intf.host_name != intf.local_name {
            let host = Commander::host(self.name.clone());
            host.run(
                Cmd::argv(["ip", "link", "set", local, "name", intf.host_name.as_str()]),
                quiet(),
            )
            .await?;
        }
        debug!("{}: returned {} to the host", self.name, intf.host_name);
        Ok(())
    }

    /// Host name of a borrowed interface known locally as `local_name`.
    pub fn host_interface(&self, local_name: &str) -> Option<&str> {
        self.borrowed
            .iter()
            .find(|b| b.local_name == local_name)
            .map(|b| b.host_name.as_str())
    }

    /// Launch the declared workload. Container nodes already run theirs.
    pub async fn start_workload(&mut self) -> Result<(), TestbedError> {
        let Some(cmd) = self.config.cmd.clone() else {
            return Ok(());
        };
        if self.backend.owns_workload() || self.workload.is_some() {
            return Ok(());
        }
        match &self.backend {
            Backend::Vm(_) => {
                let line = format!("( {} ) >/dev/null 2>&1 &", cmd);
                self.run(Cmd::shell(line), RunOptions::default().raises())
                    .await?;
            }
            _ => {
                let (out, err) = self.rundir.output_files(&self.name)?;
                let child = self.ns.commander().spawn(
                    &Cmd::shell(cmd.as_str()),
                    false,
                    Stdio::from(out),
                    Stdio::from(err),
                )?;
                debug!("{}: workload running as pid {:?}", self.name, child.id());
                self.workload = Some(child);
            }
        }
        info!("{}: started `{}`", self.name, cmd);
        Ok(())
    }

    /// Stop the workload, run the cleanup command, return borrowed
    /// interfaces, stop the backend and release the namespace. Every step
    /// runs even if an earlier one failed; the first error is returned.
    pub async fn delete(&mut self) -> Result<(), TestbedError> {
        let mut first: Option<TestbedError> = None;
        let mut note = |e: TestbedError| {
            debug!("delete step failed: {}", e);
            first.get_or_insert(e);
        };

        if let Some(child) = self.workload.take() {
            let what = format!("{} workload", self.name);
            match spawn_terminate(what, child, WORKLOAD_GRACE, Some(Signal::SIGTERM)).await {
                Ok(Some(code)) => debug!("{}: workload exited with {}", self.name, code),
                Ok(None) => warn!("{}: workload did not exit", self.name),
                Err(e) => warn!("{}: workload termination task failed: {}", self.name, e),
            }
        }

        if let Some(cleanup) = self.config.cleanup_cmd.take() {
            if let Err(e) = self
                .run(Cmd::shell(cleanup), RunOptions::default().raises().quiet())
                .await
            {
                note(e.into());
            }
        }

        let borrowed = std::mem::take(&mut self.borrowed);
        for intf in &borrowed {
            if let Err(e) = self.return_host_interface(intf).await {
                note(e);
            }
            self.intfs.unregister(&intf.local_name);
        }

        if let Err(e) = self.backend.stop().await {
            note(e.into());
        }
        self.ns.release().await;
        self.rundir.remove_node(&self.name);
        debug!("Node {} deleted", self.name);

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Runner for Node {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(
        &'a self,
        cmd: Cmd,
        opts: RunOptions,
    ) -> BoxFuture<'a, Result<CmdOutput, CommandError>> {
        Box::pin(self.backend.run(&self.ns, cmd, opts))
    }
}

impl InterfaceTable for Node {
    fn interfaces(&self) -> &Interfaces {
        &self.intfs
    }

    fn ip_path(&self) -> &str {
        self.ns.ip_path()
    }

    fn run_intf<'a>(
        &'a self,
        cmd: Cmd,
        opts: RunOptions,
    ) -> BoxFuture<'a, Result<CmdOutput, CommandError>> {
        self.ns.run(cmd, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NamespaceKinds;

    // A node on the unisolated host, enough to exercise the bookkeeping
    // and the delete sequence without privileges.
    fn host_node(config: NodeConfig, rundir: RunDir) -> Node {
        Node {
            name: config.name.clone(),
            ordinal: 1,
            ns: Namespace::host(config.name.clone()),
            backend: Backend::Namespace,
            config,
            intfs: Interfaces::new("eth"),
            p2p: None,
            workload: None,
            borrowed: Vec::new(),
            rundir,
        }
    }

    #[tokio::test]
    async fn test_workload_output_and_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let rundir = RunDir::create(tmp.path()).unwrap();
        let config = NodeConfig::new("h1").with_cmd("echo started; exec sleep 30");
        let mut node = host_node(config, rundir);

        node.start_workload().await.unwrap();
        assert!(node.workload.is_some());
        tokio::time::sleep(Duration::from_millis(300)).await;

        node.delete().await.unwrap();
        assert!(node.workload.is_none());
        let out = std::fs::read_to_string(tmp.path().join("h1/cmd.out")).unwrap();
        assert_eq!(out, "started\n");
    }

    #[tokio::test]
    async fn test_cleanup_runs_once_and_reports() {
        let tmp = tempfile::tempdir().unwrap();
        let rundir = RunDir::create(tmp.path()).unwrap();
        let marker = tmp.path().join("cleaned");
        let config = NodeConfig::new("h2")
            .with_cleanup_cmd(format!("echo x >> {}; exit 3", marker.display()));
        let mut node = host_node(config, rundir);

        let err = node.delete().await.unwrap_err();
        assert!(matches!(
            err,
            TestbedError::Command(CommandError::Failed { status: 3, .. })
        ));
        node.delete().await.unwrap();
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "x\n");
    }

    #[tokio::test]
    async fn test_runs_through_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let node = host_node(NodeConfig::new("h3"), RunDir::create(tmp.path()).unwrap());
        assert_eq!(node.cmd_raises("echo hi").await.unwrap(), "hi\n");
        assert_eq!(node.namespace().kinds(), NamespaceKinds::none());
        assert!(node.host_interface("eth0").is_none());
    }

    #[test]
    fn test_p2p_allocations_disjoint() {
        let tmp = tempfile::tempdir().unwrap();
        let mut node = host_node(NodeConfig::new("h4"), RunDir::create(tmp.path()).unwrap());
        let a = node.allocate_p2p(None).unwrap();
        let b = node.allocate_p2p(None).unwrap();
        let c = node.allocate_p2p(Some(30)).unwrap();
        assert_eq!(a.to_string(), "10.254.1.0/31");
        assert_eq!(b.to_string(), "10.254.1.2/31");
        assert_eq!(c.to_string(), "10.254.1.4/30");
    }

    #[tokio::test]
    async fn test_ordinal_past_pool_range() {
        let tmp = tempfile::tempdir().unwrap();
        let rundir = RunDir::create(tmp.path()).unwrap();
        let opts = NamespaceOptions {
            kinds: NamespaceKinds::none(),
            ..Default::default()
        };
        let mut node = Node::create(NodeConfig::new("h5"), 300, opts, rundir)
            .await
            .unwrap();
        assert_eq!(node.ordinal(), 300);
        assert_eq!(node.allocate_p2p(None), Err(AddrError::OrdinalOutOfRange(300)));
        node.delete().await.unwrap();
    }
}
