//! The runtime state of one simulated network: its router identity, its
//! nodes, its NAT table and the link registry of connected guests.

pub(crate) mod link;
mod router;

use crate::config::Ipv4Prefix;
use crate::mac::Mac;
use crate::nat::{self, NatKind, NatTable};
use crate::network::link::LinkRegistry;
use crate::server::Server;
use crate::wire;
use crate::UdpPacket;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) struct Network {
    pub(crate) index: usize,
    /// MAC of the router/gateway device.
    pub(crate) mac: Mac,
    pub(crate) wan_ip: Ipv4Addr,
    pub(crate) lan_prefix: Ipv4Prefix,
    /// Whether the network advertises NAT-PMP to its guests.
    pub(crate) portmap: bool,
    pub(crate) nodes_by_ip: HashMap<Ipv4Addr, usize>,
    /// Held while using or replacing the NAT table.
    nat: Mutex<Box<dyn NatTable>>,
    nat_style: Mutex<NatKind>,
    pub(crate) links: LinkRegistry,
    /// Feeds intercepted IPv4 datagrams to this network's TCP/IP stack.
    pub(crate) stack_inject: mpsc::Sender<Vec<u8>>,
}

impl Network {
    pub(crate) fn new(
        index: usize,
        mac: Mac,
        wan_ip: Ipv4Addr,
        lan_prefix: Ipv4Prefix,
        portmap: bool,
        nat_kind: NatKind,
        stack_inject: mpsc::Sender<Vec<u8>>,
    ) -> Network {
        Network {
            index,
            mac,
            wan_ip,
            lan_prefix,
            portmap,
            nodes_by_ip: HashMap::new(),
            nat: Mutex::new(nat::table_for(nat_kind, wan_ip)),
            nat_style: Mutex::new(nat_kind),
            links: LinkRegistry::default(),
            stack_inject,
        }
    }

    pub(crate) fn router_ip(&self) -> Ipv4Addr {
        self.lan_prefix.router_ip()
    }

    /// Replaces the NAT table with a fresh one of the given kind. Safe at
    /// runtime: translation state is rebuilt from scratch under the mutex.
    pub(crate) fn set_nat(&self, kind: NatKind) {
        let mut nat = self.nat.lock();
        *nat = nat::table_for(kind, self.wan_ip);
        *self.nat_style.lock() = kind;
    }

    pub(crate) fn nat_style(&self) -> NatKind {
        *self.nat_style.lock()
    }

    /// Resolves an IP on this segment to a MAC: the router's own, or a
    /// node's.
    pub(crate) fn mac_of_ip(&self, server: &Server, ip: Ipv4Addr) -> Option<Mac> {
        if ip == self.router_ip() {
            return Some(self.mac);
        }
        let node = *self.nodes_by_ip.get(&ip)?;
        Some(server.nodes[node].mac)
    }

    /// NATs an outgoing packet, returning the WAN source to use.
    pub(crate) fn nat_out(&self, lan_src: SocketAddrV4, wan_dst: SocketAddrV4) -> SocketAddrV4 {
        self.nat.lock().pick_outgoing_src(lan_src, wan_dst, Instant::now())
    }

    /// NATs an incoming packet, returning the LAN destination, or `None` to
    /// drop it.
    pub(crate) fn nat_in(&self, wan_src: SocketAddrV4, wan_dst: SocketAddrV4) -> Option<SocketAddrV4> {
        self.nat.lock().pick_incoming_dst(wan_src, wan_dst, Instant::now())
    }

    /// Handles a UDP packet arriving from the WAN, addressed to this
    /// network's WAN IP: NAT it back to a LAN address and deliver it.
    pub(crate) async fn handle_udp_packet(&self, server: &Server, mut p: UdpPacket) {
        let Some(dst) = self.nat_in(p.src, p.dst) else {
            return;
        };
        p.dst = dst;
        self.write_udp_no_nat(server, p).await;
    }

    /// Wraps a UDP packet in Ethernet+IPv4 and delivers it to the node that
    /// owns the destination LAN IP. The frame always carries the router's
    /// source MAC, so this must not be used for traffic between guests on
    /// the same segment.
    pub(crate) async fn write_udp_no_nat(&self, server: &Server, p: UdpPacket) {
        let Some(&node) = self.nodes_by_ip.get(p.dst.ip()) else {
            debug!(dst = %p.dst, src = %p.src, "no node for dest IP in UDP packet");
            return;
        };
        let frame = wire::build_udp_frame(self.mac, server.nodes[node].mac, p.src, p.dst, &p.payload);
        self.links.write_eth(frame).await;
    }
}
