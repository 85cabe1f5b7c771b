//! Address autonumbering
//!
//! Switched networks are `10.0.<switch ordinal>.0/24`, the bridge takes the
//! last usable host and nodes take `base + node ordinal`. Point-to-point
//! links draw `/31` networks from a per-node pool seeded by the node ordinal,
//! so two nodes never hand out overlapping networks.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Prefix length of point-to-point networks unless declared otherwise.
pub const P2P_PREFIX: u8 = 31;

#[derive(Error, Debug, PartialEq)]
pub enum AddrError {
    #[error("ordinal {0} does not fit the autonumbering scheme (1..=254)")]
    OrdinalOutOfRange(u32),

    #[error("network {network} has no host address for ordinal {ordinal}")]
    HostOutOfRange { network: Ipv4Network, ordinal: u32 },

    #[error("point-to-point pool {0} exhausted")]
    PoolExhausted(Ipv4Network),

    #[error("invalid prefix length /{0}")]
    InvalidPrefix(u8),
}

fn check_ordinal(ordinal: u32) -> Result<u8, AddrError> {
    match u8::try_from(ordinal) {
        Ok(o) if (1..=254).contains(&o) => Ok(o),
        _ => Err(AddrError::OrdinalOutOfRange(ordinal)),
    }
}

fn host_count(network: Ipv4Network) -> u64 {
    1u64 << (32 - u32::from(network.prefix()))
}

fn net(addr: Ipv4Addr, prefix: u8) -> Result<Ipv4Network, AddrError> {
    Ipv4Network::new(addr, prefix).map_err(|_| AddrError::InvalidPrefix(prefix))
}

/// Autonumbered network of the switch with `ordinal`.
pub fn switch_network(ordinal: u32) -> Result<Ipv4Network, AddrError> {
    let o = check_ordinal(ordinal)?;
    net(Ipv4Addr::new(10, 0, o, 0), 24)
}

/// Bridge address inside `network`: the highest usable host.
pub fn switch_address(network: Ipv4Network) -> Result<Ipv4Network, AddrError> {
    if host_count(network) < 4 {
        return Err(AddrError::HostOutOfRange {
            network,
            ordinal: 0,
        });
    }
    let ip = u32::from(network.broadcast()) - 1;
    net(Ipv4Addr::from(ip), network.prefix())
}

/// Address of the node with `ordinal` on `network`.
pub fn node_address(network: Ipv4Network, ordinal: u32) -> Result<Ipv4Network, AddrError> {
    let base = u32::from(network.network());
    // network address, broadcast and the bridge itself are excluded
    if ordinal == 0 || u64::from(ordinal) + 2 >= host_count(network) {
        return Err(AddrError::HostOutOfRange { network, ordinal });
    }
    net(Ipv4Addr::from(base + ordinal), network.prefix())
}

/// The two endpoint addresses of a point-to-point network.
///
/// A `/31` uses both addresses; anything larger uses the first two hosts.
pub fn p2p_endpoints(network: Ipv4Network) -> Result<(Ipv4Network, Ipv4Network), AddrError> {
    let base = u32::from(network.network());
    let prefix = network.prefix();
    let (a, b) = match prefix {
        31 => (base, base + 1),
        p if p < 31 => (base + 1, base + 2),
        p => return Err(AddrError::InvalidPrefix(p)),
    };
    Ok((
        net(Ipv4Addr::from(a), prefix)?,
        net(Ipv4Addr::from(b), prefix)?,
    ))
}

/// Per-node pool of point-to-point networks.
#[derive(Debug, Clone)]
pub struct P2pAllocator {
    pool: Ipv4Network,
    next: u32,
}

impl P2pAllocator {
    /// Pool `10.254.<ordinal>.0/24`.
    pub fn for_ordinal(ordinal: u32) -> Result<Self, AddrError> {
        let o = check_ordinal(ordinal)?;
        Ok(Self::with_pool(net(Ipv4Addr::new(10, 254, o, 0), 24)?))
    }

    pub fn with_pool(pool: Ipv4Network) -> Self {
        Self {
            pool,
            next: u32::from(pool.network()),
        }
    }

    pub fn pool(&self) -> Ipv4Network {
        self.pool
    }

    /// Next free network of the given prefix length (`/31` by default).
    /// Allocations are aligned and never overlap previous ones.
    pub fn allocate(&mut self, prefix: Option<u8>) -> Result<Ipv4Network, AddrError> {
        let prefix = prefix.unwrap_or(P2P_PREFIX);
        if prefix < self.pool.prefix() || prefix > 31 {
            return Err(AddrError::InvalidPrefix(prefix));
        }
        let size = 1u64 << (32 - prefix);
        let start = (self.next as u64).div_ceil(size) * size;
        let end = start + size - 1;
        if end > u32::from(self.pool.broadcast()) as u64 {
            return Err(AddrError::PoolExhausted(self.pool));
        }
        self.next = (end + 1).min(u32::MAX as u64) as u32;
        net(Ipv4Addr::from(start as u32), prefix)
    }
}
