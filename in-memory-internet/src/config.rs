//! The requested state of the virtual internet: networks, nodes and their
//! NAT behaviors. A `Config` is built by the caller and handed to
//! [`Server::new`](crate::server::Server::new), which materializes the
//! runtime state; after that the config plays no further role.

use crate::mac::Mac;
use crate::nat::NatKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Errors that make a configuration unusable. These are the only fatal
/// errors in the crate; everything after startup is per-packet.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("two networks have the same WAN IP {0}; anycast not supported")]
    DuplicateWanIp(Ipv4Addr),
    #[error("two nodes have the same MAC {0}")]
    DuplicateMac(Mac),
    #[error("invalid IPv4 prefix {0:?}")]
    InvalidPrefix(String),
    #[error("node {0} is not attached to any network")]
    NodeWithoutNetwork(usize),
}

/// An IPv4 prefix such as `192.168.0.0/24`, kept with the address exactly
/// as configured (the address may have host bits set, in which case it
/// doubles as the router address).
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Prefix {
    addr: Ipv4Addr,
    bits: u8,
}

impl Ipv4Prefix {
    /// The default LAN of a network: 192.168.0.0/24.
    pub const DEFAULT_LAN: Ipv4Prefix = Ipv4Prefix {
        addr: Ipv4Addr::new(192, 168, 0, 0),
        bits: 24,
    };

    pub fn new(addr: Ipv4Addr, bits: u8) -> Result<Ipv4Prefix, ConfigError> {
        if bits > 32 {
            return Err(ConfigError::InvalidPrefix(format!("{addr}/{bits}")));
        }
        Ok(Ipv4Prefix { addr, bits })
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn mask(&self) -> Ipv4Addr {
        let mask = if self.bits == 0 {
            0
        } else {
            u32::MAX << (32 - self.bits as u32)
        };
        Ipv4Addr::from(mask)
    }

    /// The prefix with host bits cleared.
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & u32::from(self.mask()))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & u32::from(self.mask()) == u32::from(self.network())
    }

    /// The router/gateway address: the configured address if it carries host
    /// bits, otherwise the lowest host in the prefix.
    pub fn router_ip(&self) -> Ipv4Addr {
        if self.addr != self.network() {
            self.addr
        } else {
            Ipv4Addr::from(u32::from(self.network()) + 1)
        }
    }

    /// The LAN address a node gets: the network address with its final octet
    /// replaced by 101 plus the node number.
    pub(crate) fn node_ip(&self, node_num: u8) -> Ipv4Addr {
        let mut octets = self.network().octets();
        octets[3] = 101u8.wrapping_add(node_num);
        Ipv4Addr::from(octets)
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.bits)
    }
}

impl fmt::Debug for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPrefix(s.to_string());
        let (addr, bits) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let bits: u8 = bits.parse().map_err(|_| invalid())?;
        Ipv4Prefix::new(addr, bits).map_err(|_| invalid())
    }
}

impl TryFrom<String> for Ipv4Prefix {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Prefix> for String {
    fn from(p: Ipv4Prefix) -> String {
        p.to_string()
    }
}

/// A service a network can advertise to its guests. Only NAT-PMP has any
/// runtime behavior today; PCP and UPnP are accepted and recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkService {
    NatPmp,
    Pcp,
    Upnp,
}

/// The requested state of one network.
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub(crate) wan_ip: Ipv4Addr,
    pub(crate) lan_prefix: Ipv4Prefix,
    pub(crate) nat: NatKind,
    pub(crate) services: BTreeSet<NetworkService>,
}

impl NetworkSpec {
    pub fn new(wan_ip: Ipv4Addr) -> NetworkSpec {
        NetworkSpec {
            wan_ip,
            lan_prefix: Ipv4Prefix::DEFAULT_LAN,
            nat: NatKind::default(),
            services: BTreeSet::new(),
        }
    }

    pub fn lan_prefix(mut self, prefix: Ipv4Prefix) -> NetworkSpec {
        self.lan_prefix = prefix;
        self
    }

    pub fn nat(mut self, kind: NatKind) -> NetworkSpec {
        self.nat = kind;
        self
    }

    pub fn service(mut self, service: NetworkService) -> NetworkSpec {
        self.services.insert(service);
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NodeSpec {
    pub(crate) networks: Vec<usize>,
}

/// Refers to a network added to a [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkHandle(pub(crate) usize);

/// Refers to a node added to a [`Config`]; also the runtime identity of the
/// node once the server is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub(crate) usize);

/// The requested state of the whole virtual internet. The zero value is a
/// valid empty configuration.
#[derive(Debug, Default)]
pub struct Config {
    pub(crate) networks: Vec<NetworkSpec>,
    pub(crate) nodes: Vec<NodeSpec>,
}

impl Config {
    pub fn add_network(&mut self, spec: NetworkSpec) -> NetworkHandle {
        self.networks.push(spec);
        NetworkHandle(self.networks.len() - 1)
    }

    /// Adds a node attached to the given networks. Multiple networks are
    /// accepted for forward compatibility, but the runtime binds a node to
    /// its first network only.
    pub fn add_node(&mut self, networks: &[NetworkHandle]) -> NodeHandle {
        self.nodes.push(NodeSpec {
            networks: networks.iter().map(|h| h.0).collect(),
        });
        NodeHandle(self.nodes.len() - 1)
    }
}

/// Deterministic MAC of the `idx`-th node.
pub(crate) fn node_mac(idx: usize) -> Mac {
    Mac([0x52, 0xcc, 0xcc, 0xcc, 0xcc, idx as u8])
}

/// Deterministic MAC of the `idx`-th network's router.
pub(crate) fn network_mac(idx: usize) -> Mac {
    Mac([0x52, 0xee, 0xee, 0xee, 0xee, idx as u8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_parsing_and_derived_addresses() {
        let p: Ipv4Prefix = "192.168.0.0/24".parse().unwrap();
        assert_eq!(p.network(), Ipv4Addr::new(192, 168, 0, 0));
        assert_eq!(p.mask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(p.router_ip(), Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(p.node_ip(0), Ipv4Addr::new(192, 168, 0, 101));
        assert_eq!(p.node_ip(2), Ipv4Addr::new(192, 168, 0, 103));
        assert!(p.contains(Ipv4Addr::new(192, 168, 0, 7)));
        assert!(!p.contains(Ipv4Addr::new(192, 168, 1, 7)));
    }

    #[test]
    fn prefix_with_host_bits_is_the_router() {
        let p: Ipv4Prefix = "192.168.2.1/24".parse().unwrap();
        assert_eq!(p.router_ip(), Ipv4Addr::new(192, 168, 2, 1));
        assert_eq!(p.network(), Ipv4Addr::new(192, 168, 2, 0));
    }

    #[test]
    fn bad_prefixes_are_rejected() {
        assert!("192.168.0.0".parse::<Ipv4Prefix>().is_err());
        assert!("192.168.0.0/33".parse::<Ipv4Prefix>().is_err());
        assert!("banana/24".parse::<Ipv4Prefix>().is_err());
    }

    #[test]
    fn deterministic_macs() {
        assert_eq!(node_mac(0).to_string(), "52:cc:cc:cc:cc:00");
        assert_eq!(network_mac(3).to_string(), "52:ee:ee:ee:ee:03");
    }
}
