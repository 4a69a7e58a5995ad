use crate::nat::{NatTable, EPHEMERAL_PORT_START, UDP_MAPPING_LIFETIME};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

/// Endpoint-dependent (symmetric) NAT: every (LAN endpoint, WAN peer) pair
/// gets its own WAN port, and inbound packets must match the full 4-tuple
/// that created the mapping.
pub struct HardNat {
    wan_ip: Ipv4Addr,
    by_flow: HashMap<(SocketAddrV4, SocketAddrV4), u16>,
    by_wan_port: HashMap<u16, Flow>,
    next_port: u16,
}

struct Flow {
    lan: SocketAddrV4,
    peer: SocketAddrV4,
    last_used: Instant,
}

impl HardNat {
    pub fn new(wan_ip: Ipv4Addr) -> Self {
        Self {
            wan_ip,
            by_flow: HashMap::new(),
            by_wan_port: HashMap::new(),
            next_port: EPHEMERAL_PORT_START,
        }
    }

    fn expire(&mut self, now: Instant) {
        let by_flow = &mut self.by_flow;
        self.by_wan_port.retain(|_, flow| {
            if now.duration_since(flow.last_used) < UDP_MAPPING_LIFETIME {
                true
            } else {
                by_flow.remove(&(flow.lan, flow.peer));
                false
            }
        });
    }

    fn allocate_port(&mut self) -> u16 {
        for _ in EPHEMERAL_PORT_START..=u16::MAX {
            let candidate = self.next_port;
            self.next_port = self.next_port.checked_add(1).unwrap_or(EPHEMERAL_PORT_START);
            if !self.by_wan_port.contains_key(&candidate) {
                return candidate;
            }
        }
        self.next_port
    }
}

impl NatTable for HardNat {
    fn pick_outgoing_src(
        &mut self,
        lan_src: SocketAddrV4,
        wan_dst: SocketAddrV4,
        now: Instant,
    ) -> SocketAddrV4 {
        self.expire(now);
        if let Some(&port) = self.by_flow.get(&(lan_src, wan_dst)) {
            if let Some(flow) = self.by_wan_port.get_mut(&port) {
                flow.last_used = now;
            }
            return SocketAddrV4::new(self.wan_ip, port);
        }
        let port = self.allocate_port();
        self.by_flow.insert((lan_src, wan_dst), port);
        self.by_wan_port.insert(
            port,
            Flow {
                lan: lan_src,
                peer: wan_dst,
                last_used: now,
            },
        );
        SocketAddrV4::new(self.wan_ip, port)
    }

    fn pick_incoming_dst(
        &mut self,
        wan_src: SocketAddrV4,
        wan_dst: SocketAddrV4,
        now: Instant,
    ) -> Option<SocketAddrV4> {
        self.expire(now);
        let flow = self.by_wan_port.get_mut(&wan_dst.port())?;
        if flow.peer != wan_src {
            return None;
        }
        flow.last_used = now;
        Some(flow.lan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WAN: Ipv4Addr = Ipv4Addr::new(2, 0, 0, 2);

    fn lan(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 101), port)
    }

    fn peer(a: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(a, a, a, a), port)
    }

    #[test]
    fn fresh_port_per_peer() {
        let mut nat = HardNat::new(WAN);
        let now = Instant::now();
        let a = nat.pick_outgoing_src(lan(4242), peer(1, 3478), now);
        let b = nat.pick_outgoing_src(lan(4242), peer(5, 3478), now);
        assert_ne!(a.port(), b.port());
        // But the same flow keeps its port.
        assert_eq!(
            nat.pick_outgoing_src(lan(4242), peer(1, 3478), now + Duration::from_secs(1)),
            a
        );
    }

    #[test]
    fn inbound_requires_full_tuple_match() {
        let mut nat = HardNat::new(WAN);
        let now = Instant::now();
        let mapped = nat.pick_outgoing_src(lan(4242), peer(1, 3478), now);

        // The contacted peer gets through.
        assert_eq!(
            nat.pick_incoming_dst(peer(1, 3478), mapped, now),
            Some(lan(4242))
        );
        // Anyone else, including the same host from another port, does not.
        assert_eq!(nat.pick_incoming_dst(peer(1, 3479), mapped, now), None);
        assert_eq!(nat.pick_incoming_dst(peer(5, 3478), mapped, now), None);
    }

    #[test]
    fn mappings_expire_when_idle() {
        let mut nat = HardNat::new(WAN);
        let now = Instant::now();
        let mapped = nat.pick_outgoing_src(lan(4242), peer(1, 3478), now);
        let later = now + UDP_MAPPING_LIFETIME + Duration::from_secs(1);
        assert_eq!(nat.pick_incoming_dst(peer(1, 3478), mapped, later), None);
    }
}
