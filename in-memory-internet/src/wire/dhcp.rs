//! DHCPv4 (RFC 2131) message codec, limited to what the virtual router's
//! lease service needs: parsing client requests and building replies.

use crate::mac::Mac;
use std::net::Ipv4Addr;

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;

const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;
const OPT_PAD: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Ack,
}

impl MessageType {
    fn from_wire(v: u8) -> Option<MessageType> {
        match v {
            1 => Some(MessageType::Discover),
            2 => Some(MessageType::Offer),
            3 => Some(MessageType::Request),
            5 => Some(MessageType::Ack),
            _ => None,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            MessageType::Discover => 1,
            MessageType::Offer => 2,
            MessageType::Request => 3,
            MessageType::Ack => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub op: u8,
    pub xid: u32,
    pub flags: u16,
    pub client_mac: Mac,
    pub your_ip: Ipv4Addr,
    pub message_type: MessageType,
    pub server_id: Option<Ipv4Addr>,
    pub lease_secs: Option<u32>,
    pub router: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
}

impl Message {
    /// Parses a DHCPv4 message from a UDP payload. Returns `None` for
    /// anything that is not BOOTP-framed DHCP with a known message type.
    pub fn parse(buf: &[u8]) -> Option<Message> {
        if buf.len() < 240 {
            return None;
        }
        if buf[0] != BOOTREQUEST && buf[0] != BOOTREPLY {
            return None;
        }
        // Hardware type Ethernet, 6-byte addresses.
        if buf[1] != 1 || buf[2] != 6 {
            return None;
        }
        if buf[236..240] != MAGIC_COOKIE {
            return None;
        }
        let xid = u32::from_be_bytes(buf[4..8].try_into().ok()?);
        let flags = u16::from_be_bytes(buf[10..12].try_into().ok()?);
        let your_ip = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);
        let client_mac = Mac::from_slice(&buf[28..34])?;

        let mut message_type = None;
        let mut server_id = None;
        let mut lease_secs = None;
        let mut router = None;
        let mut dns = None;
        let mut subnet_mask = None;

        let mut idx = 240;
        while idx < buf.len() {
            let code = buf[idx];
            idx += 1;
            match code {
                OPT_PAD => continue,
                OPT_END => break,
                _ => {}
            }
            let len = *buf.get(idx)? as usize;
            idx += 1;
            let data = buf.get(idx..idx + len)?;
            idx += len;
            match code {
                OPT_MESSAGE_TYPE if len == 1 => message_type = MessageType::from_wire(data[0]),
                OPT_SERVER_ID if len == 4 => server_id = Some(ip4(data)),
                OPT_LEASE_TIME if len == 4 => {
                    lease_secs = Some(u32::from_be_bytes(data.try_into().ok()?))
                }
                OPT_ROUTER if len == 4 => router = Some(ip4(data)),
                OPT_DNS if len == 4 => dns = Some(ip4(data)),
                OPT_SUBNET_MASK if len == 4 => subnet_mask = Some(ip4(data)),
                _ => {}
            }
        }

        Some(Message {
            op: buf[0],
            xid,
            flags,
            client_mac,
            your_ip,
            message_type: message_type?,
            server_id,
            lease_secs,
            router,
            dns,
            subnet_mask,
        })
    }
}

/// Everything the router hands out with an Ack.
#[derive(Debug, Clone, Copy)]
pub struct LeaseOptions {
    pub lease_secs: u32,
    pub router: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
}

/// Builds a BOOTREPLY for `request`: an Offer for a Discover, an Ack (with
/// the full lease options) for a Request. `your_ip` is the address the
/// requesting node is being leased, `server_id` the router's own IP.
pub fn build_reply(
    request: &Message,
    reply_type: MessageType,
    your_ip: Ipv4Addr,
    server_id: Ipv4Addr,
    lease: Option<LeaseOptions>,
) -> Vec<u8> {
    let mut out = vec![0u8; 240];
    out[0] = BOOTREPLY;
    out[1] = 1; // Ethernet
    out[2] = 6; // MAC length
    out[4..8].copy_from_slice(&request.xid.to_be_bytes());
    out[10..12].copy_from_slice(&request.flags.to_be_bytes());
    out[16..20].copy_from_slice(&your_ip.octets());
    out[28..34].copy_from_slice(&request.client_mac.0);
    out[236..240].copy_from_slice(&MAGIC_COOKIE);

    out.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, reply_type.to_wire()]);
    out.extend_from_slice(&[OPT_SERVER_ID, 4]);
    out.extend_from_slice(&server_id.octets());
    if let Some(lease) = lease {
        out.extend_from_slice(&[OPT_LEASE_TIME, 4]);
        out.extend_from_slice(&lease.lease_secs.to_be_bytes());
        out.extend_from_slice(&[OPT_ROUTER, 4]);
        out.extend_from_slice(&lease.router.octets());
        out.extend_from_slice(&[OPT_DNS, 4]);
        out.extend_from_slice(&lease.dns.octets());
        out.extend_from_slice(&[OPT_SUBNET_MASK, 4]);
        out.extend_from_slice(&lease.subnet_mask.octets());
    }
    out.push(OPT_END);
    out
}

fn ip4(data: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(data[0], data[1], data[2], data[3])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_discover(xid: u32, mac: Mac) -> Vec<u8> {
        let mut out = vec![0u8; 240];
        out[0] = BOOTREQUEST;
        out[1] = 1;
        out[2] = 6;
        out[4..8].copy_from_slice(&xid.to_be_bytes());
        out[10] = 0x80; // broadcast flag
        out[28..34].copy_from_slice(&mac.0);
        out[236..240].copy_from_slice(&MAGIC_COOKIE);
        out.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, 1, OPT_END]);
        out
    }

    #[test]
    fn parse_discover() {
        let mac = Mac([0x52, 0xcc, 0xcc, 0xcc, 0xcc, 0x00]);
        let msg = Message::parse(&build_discover(0x1234_5678, mac)).unwrap();
        assert_eq!(msg.op, BOOTREQUEST);
        assert_eq!(msg.xid, 0x1234_5678);
        assert_eq!(msg.client_mac, mac);
        assert_eq!(msg.message_type, MessageType::Discover);
    }

    #[test]
    fn reply_carries_lease_options() {
        let mac = Mac([0x52, 0xcc, 0xcc, 0xcc, 0xcc, 0x00]);
        let req = Message::parse(&build_discover(42, mac)).unwrap();
        let your_ip = Ipv4Addr::new(192, 168, 0, 101);
        let gw = Ipv4Addr::new(192, 168, 0, 1);
        let reply = build_reply(
            &req,
            MessageType::Ack,
            your_ip,
            gw,
            Some(LeaseOptions {
                lease_secs: 3600,
                router: gw,
                dns: Ipv4Addr::new(4, 11, 4, 11),
                subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            }),
        );

        let parsed = Message::parse(&reply).unwrap();
        assert_eq!(parsed.op, BOOTREPLY);
        assert_eq!(parsed.xid, 42);
        assert_eq!(parsed.your_ip, your_ip);
        assert_eq!(parsed.message_type, MessageType::Ack);
        assert_eq!(parsed.server_id, Some(gw));
        assert_eq!(parsed.lease_secs, Some(3600));
        assert_eq!(parsed.router, Some(gw));
        assert_eq!(parsed.dns, Some(Ipv4Addr::new(4, 11, 4, 11)));
        assert_eq!(parsed.subnet_mask, Some(Ipv4Addr::new(255, 255, 255, 0)));
    }

    #[test]
    fn parse_rejects_truncated_and_cookieless() {
        assert!(Message::parse(&[0u8; 100]).is_none());
        let mut msg = build_discover(1, Mac([0; 6]));
        msg[236] = 0;
        assert!(Message::parse(&msg).is_none());
    }
}
