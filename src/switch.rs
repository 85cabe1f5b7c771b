//! Bridges
//!
//! A switch is a Linux bridge living in the topology root (or on the host
//! when the topology is not isolated). It shares the root's namespace rather
//! than owning one, and its ports are the switch-side ends of veth pairs.

use crate::addr;
use crate::command::{Cmd, CmdOutput, CommandError, RunOptions, Runner};
use crate::config::NetworkConfig;
use crate::intf::{check_ifname, InterfaceTable, Interfaces};
use crate::namespace::Namespace;
use crate::TestbedError;
use futures::future::BoxFuture;
use ipnetwork::Ipv4Network;
use tracing::{debug, info};

/// Basename of generated port names, short enough for the interface limit.
pub fn port_basename(name: &str, ordinal: u32) -> String {
    if name.len() <= 10 {
        format!("{}-p", name)
    } else {
        format!("sw{}-p", ordinal)
    }
}

fn args(words: &[&str]) -> Vec<String> {
    words.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug)]
pub struct Switch {
    name: String,
    ordinal: u32,
    ns: Namespace,
    intfs: Interfaces,
    network: Option<Ipv4Network>,
    addr: Option<Ipv4Network>,
    nat: bool,
}

impl Switch {
    /// Create the bridge for `config` inside `root`. With `autonumber` a
    /// switch without an address gets the network of its ordinal.
    pub async fn create(
        config: &NetworkConfig,
        ordinal: u32,
        root: &Namespace,
        autonumber: bool,
    ) -> Result<Self, TestbedError> {
        check_ifname(&config.name)?;
        let (network, addr) = match config.ip {
            Some(ip) if ip.ip() == ip.network() => (Some(ip), Some(addr::switch_address(ip)?)),
            Some(ip) => {
                let net = Ipv4Network::new(ip.network(), ip.prefix())
                    .map_err(|_| addr::AddrError::InvalidPrefix(ip.prefix()))?;
                (Some(net), Some(ip))
            }
            None if autonumber => {
                let net = addr::switch_network(ordinal)?;
                (Some(net), Some(addr::switch_address(net)?))
            }
            None => (None, None),
        };

        let sw = Self {
            name: config.name.clone(),
            ordinal,
            ns: root.share(config.name.clone()),
            intfs: Interfaces::new(port_basename(&config.name, ordinal)),
            network,
            addr,
            nat: config.nat && addr.is_some(),
        };
        let name = sw.name.as_str();

        sw.ip(&["link", "del", name], RunOptions::default().quiet())
            .await?;
        sw.ip(&["link", "add", "name", name, "type", "bridge"], RunOptions::default().raises())
            .await?;
        sw.ip(&["link", "set", name, "up"], RunOptions::default().raises())
            .await?;
        if let Some(a) = sw.addr {
            let a = a.to_string();
            sw.ip(&["addr", "add", &a, "dev", name], RunOptions::default().raises())
                .await?;
        }
        if sw.nat {
            sw.masquerade("-A", RunOptions::default().raises()).await?;
            sw.cmd_raises(["sysctl", "-w", "net.ipv4.ip_forward=1"])
                .await?;
        }
        info!("Switch {} created ({:?})", sw.name, sw.addr);
        Ok(sw)
    }

    async fn ip(&self, words: &[&str], opts: RunOptions) -> Result<CmdOutput, CommandError> {
        let mut argv = vec![self.ns.ip_path().to_string()];
        argv.extend(args(words));
        self.ns.run(Cmd::Argv(argv), opts).await
    }

    async fn masquerade(&self, op: &str, opts: RunOptions) -> Result<CmdOutput, CommandError> {
        let Some(net) = self.network else {
            return Ok(CmdOutput::default());
        };
        let net = net.to_string();
        let rule = [
            "iptables",
            "-t",
            "nat",
            op,
            "POSTROUTING",
            "-s",
            net.as_str(),
            "!",
            "-o",
            self.name.as_str(),
            "-j",
            "MASQUERADE",
        ];
        self.ns.run(Cmd::argv(rule), opts).await
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Network of the bridge, if it is a layer-3 switch.
    pub fn network(&self) -> Option<Ipv4Network> {
        self.network
    }

    /// Address of the bridge itself.
    pub fn address(&self) -> Option<Ipv4Network> {
        self.addr
    }

    pub fn nat(&self) -> bool {
        self.nat
    }

    pub(crate) fn interfaces_mut(&mut self) -> &mut Interfaces {
        &mut self.intfs
    }

    /// Enslave `port` to the bridge, bring it up and register it.
    pub async fn attach_port(&mut self, port: &str) -> Result<(), TestbedError> {
        let master = args(&["link", "set", port, "master", &self.name]);
        self.intf_ip_cmd(port, master, RunOptions::default().raises())
            .await?;
        self.intf_ip_cmd(port, args(&["link", "set", port, "up"]), RunOptions::default().raises())
            .await?;
        self.intfs.register(port, None)?;
        debug!("{}: port {} attached", self.name, port);
        Ok(())
    }

    /// Remove the NAT rule and the bridge.
    pub async fn delete(&mut self) -> Result<(), TestbedError> {
        if self.nat {
            self.masquerade("-D", RunOptions::default().quiet()).await?;
        }
        let name = self.name.clone();
        self.ip(&["link", "del", &name], RunOptions::default().raises().quiet())
            .await?;
        let ports: Vec<String> = self.intfs.names().map(str::to_string).collect();
        for port in ports {
            self.intfs.unregister(&port);
        }
        debug!("Switch {} deleted", self.name);
        Ok(())
    }
}

impl Runner for Switch {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(
        &'a self,
        cmd: Cmd,
        opts: RunOptions,
    ) -> BoxFuture<'a, Result<CmdOutput, CommandError>> {
        self.ns.run(cmd, opts)
    }
}

impl InterfaceTable for Switch {
    fn interfaces(&self) -> &Interfaces {
        &self.intfs
    }

    fn ip_path(&self) -> &str {
        self.ns.ip_path()
    }
}
