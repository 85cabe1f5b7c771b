//! Interface bookkeeping for nodes and switches
//!
//! Each entity keeps the interfaces registered on it with their addresses, a
//! counter for generated names, the named network namespace an interface was
//! relocated into (if any) and a memoized MAC address per interface.

use crate::command::{Cmd, CmdOutput, CommandError, RunOptions, Runner};
use crate::shaping::{self, Constraints};
use crate::TestbedError;
use futures::future::BoxFuture;
use ipnetwork::Ipv4Network;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Longest usable interface name; the kernel's IFNAMSIZ includes the NUL.
pub const IFNAME_MAX: usize = 15;

#[derive(Error, Debug, PartialEq)]
pub enum IntfError {
    #[error("interface name {0:?} is longer than {IFNAME_MAX} bytes")]
    NameTooLong(String),

    #[error("empty interface name")]
    EmptyName,

    #[error("{owner}: no interface named {name}")]
    Unknown { owner: String, name: String },

    #[error("{owner}: no MAC address in output for {name}")]
    NoMac { owner: String, name: String },
}

/// Reject names the kernel would refuse.
pub fn check_ifname(name: &str) -> Result<(), IntfError> {
    if name.is_empty() {
        return Err(IntfError::EmptyName);
    }
    if name.len() > IFNAME_MAX {
        return Err(IntfError::NameTooLong(name.to_string()));
    }
    Ok(())
}

/// MAC address from `ip -o link show` output.
pub fn parse_mac(output: &str) -> Option<String> {
    let mut words = output.split_whitespace();
    while let Some(w) = words.next() {
        if w.starts_with("link/") {
            return words
                .next()
                .filter(|m| m.len() == 17 && m.matches(':').count() == 5)
                .map(str::to_ascii_lowercase);
        }
    }
    None
}

#[derive(Debug)]
pub struct Interfaces {
    basename: String,
    next_index: u32,
    addrs: BTreeMap<String, Option<Ipv4Network>>,
    netns: Mutex<HashMap<String, String>>,
    macs: Mutex<HashMap<String, String>>,
}

impl Interfaces {
    pub fn new(basename: impl Into<String>) -> Self {
        Self {
            basename: basename.into(),
            next_index: 0,
            addrs: BTreeMap::new(),
            netns: Mutex::new(HashMap::new()),
            macs: Mutex::new(HashMap::new()),
        }
    }

    /// Generate `basename + index`, skipping registered and `reserved` names.
    pub fn next_name(&mut self, reserved: &BTreeSet<String>) -> Result<String, IntfError> {
        loop {
            let name = format!("{}{}", self.basename, self.next_index);
            self.next_index += 1;
            check_ifname(&name)?;
            if !self.addrs.contains_key(&name) && !reserved.contains(&name) {
                return Ok(name);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.addrs.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.addrs.keys().map(String::as_str)
    }

    /// Register `name`; re-registering forgets the cached MAC.
    pub fn register(&mut self, name: &str, addr: Option<Ipv4Network>) -> Result<(), IntfError> {
        check_ifname(name)?;
        self.addrs.insert(name.to_string(), addr);
        self.forget_mac(name);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Option<Option<Ipv4Network>> {
        self.forget_mac(name);
        if let Ok(mut ns) = self.netns.lock() {
            ns.remove(name);
        }
        self.addrs.remove(name)
    }

    pub fn set_addr(&mut self, name: &str, addr: Ipv4Network) -> Result<(), IntfError> {
        match self.addrs.get_mut(name) {
            Some(slot) => {
                *slot = Some(addr);
                Ok(())
            }
            None => Err(IntfError::Unknown {
                owner: self.basename.clone(),
                name: name.to_string(),
            }),
        }
    }

    pub fn addr(&self, name: &str) -> Option<Ipv4Network> {
        self.addrs.get(name).copied().flatten()
    }

    /// Interface name to assigned address.
    pub fn addrs(&self) -> &BTreeMap<String, Option<Ipv4Network>> {
        &self.addrs
    }

    pub fn netns_of(&self, name: &str) -> Option<String> {
        self.netns.lock().ok().and_then(|m| m.get(name).cloned())
    }

    fn record_netns(&self, name: &str, netns: Option<&str>) {
        if let Ok(mut m) = self.netns.lock() {
            match netns {
                Some(ns) => m.insert(name.to_string(), ns.to_string()),
                None => m.remove(name),
            };
        }
    }

    pub fn cached_mac(&self, name: &str) -> Option<String> {
        self.macs.lock().ok().and_then(|m| m.get(name).cloned())
    }

    fn remember_mac(&self, name: &str, mac: &str) {
        if let Ok(mut m) = self.macs.lock() {
            m.insert(name.to_string(), mac.to_string());
        }
    }

    pub fn forget_mac(&self, name: &str) {
        if let Ok(mut m) = self.macs.lock() {
            m.remove(name);
        }
    }
}

/// Entities that own interfaces. Address and qdisc commands go through the
/// router methods so that relocated interfaces are addressed in their
/// sub-namespace.
pub trait InterfaceTable: Runner {
    fn interfaces(&self) -> &Interfaces;

    /// `ip` binary as seen by this entity.
    fn ip_path(&self) -> &str {
        "ip"
    }

    fn tc_path(&self) -> &str {
        "tc"
    }

    /// Where interface commands execute. Entities whose user commands run
    /// elsewhere (containers, VMs) point this at their namespace.
    fn run_intf<'a>(
        &'a self,
        cmd: Cmd,
        opts: RunOptions,
    ) -> BoxFuture<'a, Result<CmdOutput, CommandError>> {
        self.run(cmd, opts)
    }

    fn intf_ip_cmd<'a>(
        &'a self,
        ifname: &str,
        args: Vec<String>,
        opts: RunOptions,
    ) -> BoxFuture<'a, Result<CmdOutput, CommandError>> {
        let cmd = routed(self.interfaces().netns_of(ifname), self.ip_path(), self.ip_path(), args);
        self.run_intf(cmd, opts)
    }

    fn intf_tc_cmd<'a>(
        &'a self,
        ifname: &str,
        args: Vec<String>,
        opts: RunOptions,
    ) -> BoxFuture<'a, Result<CmdOutput, CommandError>> {
        let cmd = routed(self.interfaces().netns_of(ifname), self.ip_path(), self.tc_path(), args);
        self.run_intf(cmd, opts)
    }

    /// Move `ifname` into the named network namespace `netns` (created with
    /// `ip netns add`) and route later commands for it there.
    fn set_intf_netns<'a>(
        &'a self,
        ifname: &'a str,
        netns: &'a str,
    ) -> BoxFuture<'a, Result<(), CommandError>> {
        Box::pin(async move {
            let args = vec![
                "link".to_string(),
                "set".to_string(),
                ifname.to_string(),
                "netns".to_string(),
                netns.to_string(),
            ];
            self.intf_ip_cmd(ifname, args, RunOptions::default().raises())
                .await?;
            self.interfaces().record_netns(ifname, Some(netns));
            self.interfaces().forget_mac(ifname);
            debug!("{}: {} relocated into netns {}", self.name(), ifname, netns);
            Ok(())
        })
    }

    /// MAC address of `ifname`, queried once and memoized.
    fn get_intf_mac<'a>(&'a self, ifname: &'a str) -> BoxFuture<'a, Result<String, TestbedError>> {
        Box::pin(async move {
            if let Some(mac) = self.interfaces().cached_mac(ifname) {
                return Ok(mac);
            }
            let args = vec![
                "-o".to_string(),
                "link".to_string(),
                "show".to_string(),
                "dev".to_string(),
                ifname.to_string(),
            ];
            let out = self
                .intf_ip_cmd(ifname, args, RunOptions::default().raises())
                .await?;
            let mac = parse_mac(&out.stdout).ok_or_else(|| IntfError::NoMac {
                owner: self.name().to_string(),
                name: ifname.to_string(),
            })?;
            self.interfaces().remember_mac(ifname, &mac);
            Ok(mac)
        })
    }

    /// Replace the qdiscs of `ifname` with the compiled `constraints`.
    fn apply_constraints<'a>(
        &'a self,
        ifname: &'a str,
        constraints: &'a Constraints,
    ) -> BoxFuture<'a, Result<(), TestbedError>> {
        Box::pin(async move {
            let cmds = constraints.compile(ifname)?;
            if cmds.is_empty() {
                return Ok(());
            }
            debug!("{}: shaping {} with {:?}", self.name(), ifname, constraints);
            self.intf_tc_cmd(ifname, shaping::clear_args(ifname), RunOptions::default().quiet())
                .await?;
            for args in cmds {
                self.intf_tc_cmd(ifname, args, RunOptions::default().raises())
                    .await?;
            }
            Ok(())
        })
    }
}

fn routed(netns: Option<String>, ip: &str, tool: &str, args: Vec<String>) -> Cmd {
    let mut argv = Vec::with_capacity(args.len() + 4);
    if let Some(ns) = netns {
        argv.extend([ip.to_string(), "netns".to_string(), "exec".to_string(), ns]);
    }
    argv.push(tool.to_string());
    argv.extend(args);
    Cmd::Argv(argv)
}
