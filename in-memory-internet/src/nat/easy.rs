use crate::nat::{NatTable, EPHEMERAL_PORT_START, UDP_MAPPING_LIFETIME};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

/// Endpoint-independent NAT: each LAN endpoint gets a single WAN port that
/// is reused for every peer it talks to, and inbound packets are routed by
/// WAN port alone, whoever they come from.
pub struct EasyNat {
    wan_ip: Ipv4Addr,
    by_lan: HashMap<SocketAddrV4, Mapping>,
    by_wan_port: HashMap<u16, SocketAddrV4>,
    next_port: u16,
}

struct Mapping {
    wan_port: u16,
    last_used: Instant,
}

impl EasyNat {
    pub fn new(wan_ip: Ipv4Addr) -> Self {
        Self {
            wan_ip,
            by_lan: HashMap::new(),
            by_wan_port: HashMap::new(),
            next_port: EPHEMERAL_PORT_START,
        }
    }

    fn expire(&mut self, now: Instant) {
        let by_wan_port = &mut self.by_wan_port;
        self.by_lan.retain(|_, m| {
            if now.duration_since(m.last_used) < UDP_MAPPING_LIFETIME {
                true
            } else {
                by_wan_port.remove(&m.wan_port);
                false
            }
        });
    }

    /// Prefers keeping the LAN source port visible on the WAN; falls back to
    /// a scan of the ephemeral range when it is taken.
    fn allocate_port(&mut self, preferred: u16) -> u16 {
        if preferred >= 1024 && !self.by_wan_port.contains_key(&preferred) {
            return preferred;
        }
        for _ in EPHEMERAL_PORT_START..=u16::MAX {
            let candidate = self.next_port;
            self.next_port = self.next_port.checked_add(1).unwrap_or(EPHEMERAL_PORT_START);
            if !self.by_wan_port.contains_key(&candidate) {
                return candidate;
            }
        }
        preferred
    }
}

impl NatTable for EasyNat {
    fn pick_outgoing_src(
        &mut self,
        lan_src: SocketAddrV4,
        _wan_dst: SocketAddrV4,
        now: Instant,
    ) -> SocketAddrV4 {
        self.expire(now);
        if let Some(m) = self.by_lan.get_mut(&lan_src) {
            m.last_used = now;
            return SocketAddrV4::new(self.wan_ip, m.wan_port);
        }
        let wan_port = self.allocate_port(lan_src.port());
        self.by_lan.insert(
            lan_src,
            Mapping {
                wan_port,
                last_used: now,
            },
        );
        self.by_wan_port.insert(wan_port, lan_src);
        SocketAddrV4::new(self.wan_ip, wan_port)
    }

    fn pick_incoming_dst(
        &mut self,
        _wan_src: SocketAddrV4,
        wan_dst: SocketAddrV4,
        now: Instant,
    ) -> Option<SocketAddrV4> {
        self.expire(now);
        let lan = *self.by_wan_port.get(&wan_dst.port())?;
        if let Some(m) = self.by_lan.get_mut(&lan) {
            m.last_used = now;
        }
        Some(lan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WAN: Ipv4Addr = Ipv4Addr::new(2, 0, 0, 1);

    fn lan(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 101), port)
    }

    fn peer(a: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(a, a, a, a), port)
    }

    #[test]
    fn mapping_is_stable_across_peers() {
        let mut nat = EasyNat::new(WAN);
        let now = Instant::now();
        let first = nat.pick_outgoing_src(lan(4242), peer(1, 3478), now);
        let second = nat.pick_outgoing_src(lan(4242), peer(5, 3478), now + Duration::from_secs(1));
        assert_eq!(first, second);
        assert_eq!(*first.ip(), WAN);
    }

    #[test]
    fn inbound_is_endpoint_independent() {
        let mut nat = EasyNat::new(WAN);
        let now = Instant::now();
        let wan_src = nat.pick_outgoing_src(lan(4242), peer(1, 3478), now);
        // A packet from a peer we never contacted still reaches the mapping.
        let dst = nat.pick_incoming_dst(peer(7, 999), wan_src, now + Duration::from_secs(2));
        assert_eq!(dst, Some(lan(4242)));
    }

    #[test]
    fn mappings_expire_when_idle() {
        let mut nat = EasyNat::new(WAN);
        let now = Instant::now();
        let first = nat.pick_outgoing_src(lan(4242), peer(1, 3478), now);
        let later = now + UDP_MAPPING_LIFETIME + Duration::from_secs(1);
        assert_eq!(nat.pick_incoming_dst(peer(1, 3478), first, later), None);
        // A fresh outbound flow may get the port back afterwards.
        let second = nat.pick_outgoing_src(lan(4242), peer(1, 3478), later);
        assert_eq!(first, second);
    }

    #[test]
    fn traffic_keeps_mappings_alive() {
        let mut nat = EasyNat::new(WAN);
        let mut now = Instant::now();
        let wan_src = nat.pick_outgoing_src(lan(4242), peer(1, 3478), now);
        for _ in 0..4 {
            now += UDP_MAPPING_LIFETIME / 2;
            assert_eq!(
                nat.pick_outgoing_src(lan(4242), peer(1, 3478), now),
                wan_src
            );
        }
    }

    #[test]
    fn live_ports_never_collide() {
        let mut nat = EasyNat::new(WAN);
        let now = Instant::now();
        // Two LAN endpoints with the same source port cannot share a WAN port,
        // inbound packets would be ambiguous.
        let a = nat.pick_outgoing_src(
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 101), 4242),
            peer(1, 3478),
            now,
        );
        let b = nat.pick_outgoing_src(
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 102), 4242),
            peer(1, 3478),
            now,
        );
        assert_ne!(a.port(), b.port());
    }
}
