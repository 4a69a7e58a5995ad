//! Minimal STUN (RFC 5389) support: just enough to answer binding requests
//! with the caller's server-reflexive address.

use std::net::SocketAddrV4;

const MAGIC_COOKIE: u32 = 0x2112_a442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;

pub const HEADER_LEN: usize = 20;

/// A STUN transaction ID.
pub type TxId = [u8; 12];

/// Parses `payload` as a STUN binding request and returns its transaction ID.
///
/// Anything that is not a well-formed binding request (wrong message type,
/// missing magic cookie, inconsistent length) returns `None`.
pub fn parse_binding_request(payload: &[u8]) -> Option<TxId> {
    if payload.len() < HEADER_LEN {
        return None;
    }
    let msg_type = u16::from_be_bytes([payload[0], payload[1]]);
    if msg_type != BINDING_REQUEST {
        return None;
    }
    let msg_len = u16::from_be_bytes([payload[2], payload[3]]) as usize;
    if msg_len % 4 != 0 || HEADER_LEN + msg_len != payload.len() {
        return None;
    }
    let cookie = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    if cookie != MAGIC_COOKIE {
        return None;
    }
    payload[8..20].try_into().ok()
}

/// Builds a binding success response reporting `mapped` as the caller's
/// server-reflexive transport address (XOR-MAPPED-ADDRESS).
pub fn response(txid: TxId, mapped: SocketAddrV4) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + 12);
    out.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
    out.extend_from_slice(&12u16.to_be_bytes()); // one ipv4 attribute
    out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    out.extend_from_slice(&txid);

    out.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    out.extend_from_slice(&8u16.to_be_bytes());
    out.push(0);
    out.push(FAMILY_IPV4);
    let xor_port = mapped.port() ^ (MAGIC_COOKIE >> 16) as u16;
    out.extend_from_slice(&xor_port.to_be_bytes());
    let xor_addr = u32::from(*mapped.ip()) ^ MAGIC_COOKIE;
    out.extend_from_slice(&xor_addr.to_be_bytes());
    out
}

/// Extracts the XOR-MAPPED-ADDRESS from a binding response.
///
/// Used by tests and by in-process callers that want to observe their own
/// NAT mapping the way a real STUN client would.
pub fn parse_response_mapped(payload: &[u8]) -> Option<SocketAddrV4> {
    if payload.len() < HEADER_LEN {
        return None;
    }
    if u16::from_be_bytes([payload[0], payload[1]]) != BINDING_RESPONSE {
        return None;
    }
    let mut off = HEADER_LEN;
    while off + 4 <= payload.len() {
        let attr = u16::from_be_bytes([payload[off], payload[off + 1]]);
        let len = u16::from_be_bytes([payload[off + 2], payload[off + 3]]) as usize;
        let val = payload.get(off + 4..off + 4 + len)?;
        if attr == ATTR_XOR_MAPPED_ADDRESS && len == 8 && val[1] == FAMILY_IPV4 {
            let port = u16::from_be_bytes([val[2], val[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
            let addr = u32::from_be_bytes([val[4], val[5], val[6], val[7]]) ^ MAGIC_COOKIE;
            return Some(SocketAddrV4::new(addr.into(), port));
        }
        // Attributes are padded to 4-byte boundaries.
        off += 4 + len.next_multiple_of(4);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn binding_request(txid: TxId) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(&txid);
        out
    }

    #[test]
    fn request_round_trip() {
        let txid = [7u8; 12];
        assert_eq!(parse_binding_request(&binding_request(txid)), Some(txid));
    }

    #[test]
    fn rejects_bad_cookie_and_type() {
        let mut req = binding_request([1; 12]);
        req[4] = 0;
        assert!(parse_binding_request(&req).is_none());

        let mut req = binding_request([1; 12]);
        req[0] = 0x01;
        req[1] = 0x11; // a response, not a request
        assert!(parse_binding_request(&req).is_none());
    }

    #[test]
    fn rejects_truncated_attributes() {
        let mut req = binding_request([1; 12]);
        req[3] = 8; // claims 8 bytes of attributes that are not present
        assert!(parse_binding_request(&req).is_none());
    }

    #[test]
    fn response_reports_mapped_address() {
        let mapped = SocketAddrV4::new(Ipv4Addr::new(2, 0, 0, 1), 40612);
        let res = response([9; 12], mapped);
        assert_eq!(parse_response_mapped(&res), Some(mapped));
        assert_eq!(&res[8..20], &[9; 12]);
    }
}
