//! A simulated Internet for end-to-end testing of networking software under
//! a variety of NAT behaviors.
//!
//! Guests attach over a local framed transport and see an Ethernet segment
//! with a router/gateway that speaks ARP, DHCP, DNS, STUN (via the
//! synthetic WAN) and NAT-PMP. Each network NATs its guests onto a WAN IP;
//! UDP is switched between networks in-process, and selected TCP
//! destinations are terminated on a per-network user-space TCP/IP stack so
//! they can be answered locally or bridged to the real host network.
//!
//! Build a [`Config`] describing networks and nodes, then hand it to
//! [`Server::new`]; the server owns everything from there.

pub(crate) mod agent;
pub mod config;
pub mod mac;
pub mod nat;
pub(crate) mod network;
pub mod server;
pub mod stack;
pub mod transport;
pub mod wire;

pub use config::{
    Config, ConfigError, Ipv4Prefix, NetworkHandle, NetworkService, NetworkSpec, NodeHandle,
};
pub use mac::Mac;
pub use nat::{NatKind, NatTable};
pub use server::Server;
pub use stack::StackConn;

use std::net::{Ipv4Addr, SocketAddrV4};

/// The synthetic resolver every network hands out via DHCP.
pub const FAKE_DNS_IP: Ipv4Addr = Ipv4Addr::new(4, 11, 4, 11);
/// Where `controlplane.tailscale.com` resolves to inside the simulation.
pub const FAKE_CONTROL_PLANE_IP: Ipv4Addr = Ipv4Addr::new(52, 52, 0, 1);
/// Where in-guest test agents dial out to; terminated in-process.
pub const FAKE_TEST_AGENT_IP: Ipv4Addr = Ipv4Addr::new(52, 52, 0, 2);

pub(crate) const STUN_PORT: u16 = 3478;
pub(crate) const NATPMP_PORT: u16 = 5351;

/// A UDP packet on the synthetic WAN. This, not a general IP packet, is the
/// unit of NAT translation: it is all the tested software uses.
#[derive(Debug, Clone)]
pub struct UdpPacket {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    /// Everything after the UDP header.
    pub payload: Vec<u8>,
}

/// Source of real-world relay (DERP) IPv4 addresses; how the catalog is
/// obtained (subprocess, file, static list) is up to the caller.
pub trait RelayCatalog {
    fn list_relay_ipv4s(&self) -> anyhow::Result<Vec<Ipv4Addr>>;
}
