//! Wire-format helpers shared by the router, the WAN switch and tests:
//! Ethernet/IPv4/UDP frame construction on top of `pnet_packet`, plus the
//! hand-rolled application codecs the fake services speak.

pub mod dhcp;
pub mod dns;
pub mod stun;

use crate::mac::Mac;
use pnet_packet::arp::{ArpHardwareTypes, ArpOperations, MutableArpPacket};
use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet_packet::udp::{self, MutableUdpPacket};
use std::net::Ipv4Addr;

pub const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const ARP_PACKET_LEN: usize = 28;

/// Builds a complete Ethernet+IPv4+UDP frame, lengths and checksums filled
/// in during serialization.
pub fn build_udp_frame(
    src_mac: Mac,
    dst_mac: Mac,
    src: std::net::SocketAddrV4,
    dst: std::net::SocketAddrV4,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let ip_len = IPV4_HEADER_LEN + udp_len;
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ip_len];

    let mut eth = MutableEthernetPacket::new(&mut buf).unwrap();
    eth.set_destination(dst_mac.into());
    eth.set_source(src_mac.into());
    eth.set_ethertype(EtherTypes::Ipv4);

    let mut ip = MutableIpv4Packet::new(&mut buf[ETHERNET_HEADER_LEN..]).unwrap();
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_total_length(ip_len as u16);
    ip.set_identification(0);
    ip.set_flags(Ipv4Flags::DontFragment);
    ip.set_ttl(64);
    ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
    ip.set_source(*src.ip());
    ip.set_destination(*dst.ip());
    let checksum = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(checksum);

    let mut udp =
        MutableUdpPacket::new(&mut buf[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..]).unwrap();
    udp.set_source(src.port());
    udp.set_destination(dst.port());
    udp.set_length(udp_len as u16);
    udp.set_payload(payload);
    let checksum = udp::ipv4_checksum(&udp.to_immutable(), src.ip(), dst.ip());
    udp.set_checksum(checksum);

    buf
}

/// Prepends an Ethernet header to an IPv4 datagram produced by the
/// user-space TCP/IP stack.
pub(crate) fn prepend_ethernet(src_mac: Mac, dst_mac: Mac, ip_datagram: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ip_datagram.len()];
    let mut eth = MutableEthernetPacket::new(&mut buf).unwrap();
    eth.set_destination(dst_mac.into());
    eth.set_source(src_mac.into());
    eth.set_ethertype(EtherTypes::Ipv4);
    buf[ETHERNET_HEADER_LEN..].copy_from_slice(ip_datagram);
    buf
}

/// Builds an ARP reply telling `requester` that `sender_ip` is at
/// `sender_mac`.
pub fn build_arp_reply(
    sender_mac: Mac,
    sender_ip: Ipv4Addr,
    requester_mac: Mac,
    requester_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ARP_PACKET_LEN];

    let mut eth = MutableEthernetPacket::new(&mut buf).unwrap();
    eth.set_destination(requester_mac.into());
    eth.set_source(sender_mac.into());
    eth.set_ethertype(EtherTypes::Arp);

    let mut arp = MutableArpPacket::new(&mut buf[ETHERNET_HEADER_LEN..]).unwrap();
    arp.set_hardware_type(ArpHardwareTypes::Ethernet);
    arp.set_protocol_type(EtherTypes::Ipv4);
    arp.set_hw_addr_len(6);
    arp.set_proto_addr_len(4);
    arp.set_operation(ArpOperations::Reply);
    arp.set_sender_hw_addr(sender_mac.into());
    arp.set_sender_proto_addr(sender_ip);
    arp.set_target_hw_addr(requester_mac.into());
    arp.set_target_proto_addr(requester_ip);

    buf
}

/// Returns the transport-layer slice of an IPv4 datagram, honoring the
/// header-length and total-length fields (frames may carry link padding).
pub(crate) fn ipv4_l4_slice<'a>(ip_raw: &'a [u8], ip: &Ipv4Packet<'_>) -> Option<&'a [u8]> {
    let header = ip.get_header_length() as usize * 4;
    let total = (ip.get_total_length() as usize).min(ip_raw.len());
    if header < IPV4_HEADER_LEN || total < header {
        return None;
    }
    Some(&ip_raw[header..total])
}

/// Returns the payload of a UDP datagram given its transport-layer slice.
pub(crate) fn udp_payload<'a>(l4: &'a [u8]) -> Option<&'a [u8]> {
    if l4.len() < UDP_HEADER_LEN {
        return None;
    }
    let len = u16::from_be_bytes([l4[4], l4[5]]) as usize;
    if len < UDP_HEADER_LEN {
        return None;
    }
    l4.get(UDP_HEADER_LEN..len.min(l4.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet_packet::ethernet::EthernetPacket;
    use pnet_packet::udp::UdpPacket;
    use pnet_packet::Packet;
    use std::net::SocketAddrV4;

    #[test]
    fn udp_frame_round_trips() {
        let src = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 101), 4242);
        let dst = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 3478);
        let frame = build_udp_frame(
            Mac([0x52, 0xee, 0xee, 0xee, 0xee, 0x00]),
            Mac([0x52, 0xcc, 0xcc, 0xcc, 0xcc, 0x00]),
            src,
            dst,
            b"ping",
        );

        let eth = EthernetPacket::new(&frame).unwrap();
        assert_eq!(eth.get_ethertype(), EtherTypes::Ipv4);
        let ip = Ipv4Packet::new(eth.payload()).unwrap();
        assert_eq!(ip.get_source(), *src.ip());
        assert_eq!(ip.get_destination(), *dst.ip());
        assert_eq!(ipv4::checksum(&ip), ip.get_checksum());

        let l4 = ipv4_l4_slice(eth.payload(), &ip).unwrap();
        let udp_pkt = UdpPacket::new(l4).unwrap();
        assert_eq!(udp_pkt.get_source(), 4242);
        assert_eq!(udp_pkt.get_destination(), 3478);
        assert_eq!(udp_payload(l4).unwrap(), b"ping");
    }

    #[test]
    fn l4_slice_ignores_link_padding() {
        let src = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 101), 68);
        let dst = SocketAddrV4::new(Ipv4Addr::new(255, 255, 255, 255), 67);
        let mut frame = build_udp_frame(Mac([0; 6]), Mac::BROADCAST, src, dst, b"x");
        // Pad to the Ethernet minimum the way a link would.
        frame.resize(60, 0);

        let eth = EthernetPacket::new(&frame).unwrap();
        let ip = Ipv4Packet::new(eth.payload()).unwrap();
        let l4 = ipv4_l4_slice(eth.payload(), &ip).unwrap();
        assert_eq!(udp_payload(l4).unwrap(), b"x");
    }
}
