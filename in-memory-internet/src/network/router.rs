//! The per-network virtual router: classifies every Ethernet frame arriving
//! from a guest, synthesizes ARP/DHCP/DNS/NAT-PMP answers, forwards LAN
//! traffic between guests and hands off-LAN traffic to the NAT engine, the
//! WAN switch or the TCP terminator.

use crate::mac::Mac;
use crate::network::Network;
use crate::server::Server;
use crate::wire::{self, dns};
use crate::{UdpPacket, FAKE_DNS_IP, NATPMP_PORT};
use pnet_packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket};
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket as UdpView;
use pnet_packet::Packet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

impl Network {
    /// Entry point for every frame a guest on this network sends.
    pub(crate) async fn handle_ethernet_frame(&self, server: &Server, frame: Vec<u8>) {
        let Some(eth) = EthernetPacket::new(&frame) else {
            return;
        };
        let dst = Mac::from(eth.get_destination());
        let for_router = dst == self.mac || dst.is_broadcast();
        let ethertype = eth.get_ethertype();
        drop(eth);

        match ethertype {
            EtherTypes::Arp => {
                if let Some(reply) = self.create_arp_response(server, &frame) {
                    self.links.write_eth(reply).await;
                }
                return;
            }
            // IPv4 NAT behaviors are what this simulator exists to test.
            EtherTypes::Ipv6 => return,
            EtherTypes::Ipv4 => {}
            other => {
                trace!(ethertype = %other, "dropping non-IP frame");
                return;
            }
        }

        // Ethernet broadcasts and unicasts between guests stay on the
        // segment whether or not the router also acts on the frame.
        self.links.write_eth(frame.clone()).await;

        if for_router {
            self.handle_ipv4_for_router(server, &frame).await;
        }
    }

    /// Handles an IPv4 frame directed at the router (its MAC or broadcast).
    /// The target IP may be the router's own, or an internet (routed) one.
    async fn handle_ipv4_for_router(&self, server: &Server, frame: &[u8]) {
        let Some(eth) = EthernetPacket::new(frame) else {
            return;
        };
        let ip_raw = eth.payload();
        let Some(ip) = Ipv4Packet::new(ip_raw) else {
            return;
        };
        let src_ip = ip.get_source();
        let dst_ip = ip.get_destination();
        let to_forward = dst_ip != self.router_ip() && !dst_ip.is_unspecified();
        let proto = ip.get_next_level_protocol();
        let Some(l4) = wire::ipv4_l4_slice(ip_raw, &ip) else {
            return;
        };

        if proto == IpNextHeaderProtocols::Udp {
            let Some(udp) = UdpView::new(l4) else {
                return;
            };
            let src_port = udp.get_source();
            let dst_port = udp.get_destination();
            let payload = wire::udp_payload(l4).unwrap_or(&[]);

            if src_port == 68 && dst_port == 67 {
                match server.create_dhcp_response(self, Mac::from(eth.get_source()), src_ip, dst_ip, payload) {
                    Some(reply) => self.links.write_eth(reply).await,
                    None => debug!(src = %eth.get_source(), "ignoring unanswerable DHCP request"),
                }
                return;
            }

            // mDNS is not serviced and too spammy to log.
            if src_port == 5353 && dst_port == 5353 {
                return;
            }

            if dst_port == 53 && dst_ip == FAKE_DNS_IP {
                if let Some(query) = dns::parse_query(payload) {
                    if let Some(reply) = self.create_dns_response(server, &eth, src_ip, dst_ip, src_port, &query) {
                        self.links.write_eth(reply).await;
                    }
                    return;
                }
            }

            if !to_forward && dst_port == NATPMP_PORT && payload.first() == Some(&0) {
                self.handle_natpmp_request(
                    server,
                    UdpPacket {
                        src: SocketAddrV4::new(src_ip, src_port),
                        dst: SocketAddrV4::new(dst_ip, dst_port),
                        payload: payload.to_vec(),
                    },
                )
                .await;
                return;
            }

            if to_forward {
                let lan_src = SocketAddrV4::new(src_ip, src_port);
                let wan_dst = SocketAddrV4::new(dst_ip, dst_port);
                let wan_src = self.nat_out(lan_src, wan_dst);
                server
                    .route_udp_packet(UdpPacket {
                        src: wan_src,
                        dst: wan_dst,
                        payload: payload.to_vec(),
                    })
                    .await;
            }
            return;
        }

        // IGMP is not serviced and not worth logging.
        if proto == IpNextHeaderProtocols::Igmp {
            return;
        }

        if proto == IpNextHeaderProtocols::Tcp && to_forward {
            let Some(tcp) = TcpPacket::new(l4) else {
                return;
            };
            if server.should_intercept_tcp(dst_ip, tcp.get_destination()) {
                // The terminator owns the copy from here on.
                let header = ip.get_header_length() as usize * 4;
                let datagram = ip_raw[..(header + l4.len())].to_vec();
                if self.stack_inject.send(datagram).await.is_err() {
                    debug!(network = self.index, "TCP stack is gone; dropping intercepted packet");
                }
            }
        }
    }

    /// Answers an ARP request for any IP the router can speak for: its own,
    /// or that of any node on the segment. Everything else is ignored.
    fn create_arp_response(&self, server: &Server, frame: &[u8]) -> Option<Vec<u8>> {
        let eth = EthernetPacket::new(frame)?;
        let arp = ArpPacket::new(eth.payload())?;
        if arp.get_operation() != ArpOperations::Request
            || arp.get_hardware_type() != ArpHardwareTypes::Ethernet
            || arp.get_protocol_type() != EtherTypes::Ipv4
            || arp.get_hw_addr_len() != 6
            || arp.get_proto_addr_len() != 4
        {
            return None;
        }

        let want_ip = arp.get_target_proto_addr();
        let found_mac = self.mac_of_ip(server, want_ip)?;
        Some(wire::build_arp_reply(
            found_mac,
            want_ip,
            Mac::from(eth.get_source()),
            arp.get_sender_proto_addr(),
        ))
    }

    /// Builds the response frame for a DNS query to the fake resolver.
    /// Returns `None` when the whole response should be suppressed.
    fn create_dns_response(
        &self,
        server: &Server,
        eth: &EthernetPacket<'_>,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        query: &dns::Query,
    ) -> Option<Vec<u8>> {
        let mut answers = Vec::new();
        for (i, q) in query.questions.iter().enumerate() {
            // NTP pool lookups get no response at all: guests take their
            // time from the hypervisor.
            if q.name.ends_with(".pool.ntp.org") {
                return None;
            }
            if q.qclass != dns::CLASS_IN || q.qtype != dns::TYPE_A {
                continue;
            }
            if let Some(addr) = server.ipv4_for_dns(&q.name) {
                answers.push(dns::Answer {
                    question: i,
                    addr,
                    ttl: 60,
                });
            }
        }

        let response = dns::build_response(query, &answers);
        Some(wire::build_udp_frame(
            Mac::from(eth.get_destination()),
            Mac::from(eth.get_source()),
            SocketAddrV4::new(dst_ip, 53),
            SocketAddrV4::new(src_ip, src_port),
            &response,
        ))
    }

    /// Answers the NAT-PMP public-address announcement (RFC 6886 §3.2).
    async fn handle_natpmp_request(&self, server: &Server, req: UdpPacket) {
        if req.payload == [0, 0] {
            let mut res = Vec::with_capacity(12);
            res.push(0); // version
            res.push(128); // response to op 0
            res.extend_from_slice(&[0, 0]); // result: success
            let epoch_secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as u32;
            res.extend_from_slice(&epoch_secs.to_be_bytes());
            res.extend_from_slice(&self.wan_ip.octets());
            self.write_udp_no_nat(
                server,
                UdpPacket {
                    src: req.dst,
                    dst: req.src,
                    payload: res,
                },
            )
            .await;
            return;
        }

        // TODO: answer port-map create/refresh requests (RFC 6886 §3.3).
        if self.portmap {
            debug!(payload = ?req.payload, "unhandled NAT-PMP request");
        } else {
            trace!("NAT-PMP mapping request on a network without the port-map service");
        }
    }
}
