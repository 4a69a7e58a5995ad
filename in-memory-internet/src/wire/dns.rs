//! DNS (RFC 1035) codec for the router's fake resolver: parses queries and
//! builds authoritative responses for A/IN questions. Compression pointers
//! are followed when parsing but responses always spell names out in full.

use std::net::Ipv4Addr;

pub const TYPE_A: u16 = 1;
pub const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const OPCODE_MASK: u16 = 0x7800;

#[derive(Debug, Clone)]
pub struct Question {
    /// Dotted, lowercase-insensitive name as sent ("controlplane.tailscale.com").
    pub name: String,
    /// The name in wire form, used verbatim when echoing the question.
    raw_name: Vec<u8>,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Debug, Clone)]
pub struct Query {
    pub id: u16,
    pub recursion_desired: bool,
    pub questions: Vec<Question>,
}

/// Parses `payload` as a DNS query. Responses, non-QUERY opcodes, and
/// question-less messages return `None`.
pub fn parse_query(payload: &[u8]) -> Option<Query> {
    if payload.len() < 12 {
        return None;
    }
    let id = u16::from_be_bytes([payload[0], payload[1]]);
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    if flags & FLAG_QR != 0 || flags & OPCODE_MASK != 0 {
        return None;
    }
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut questions = Vec::with_capacity(qdcount as usize);
    let mut off = 12;
    for _ in 0..qdcount {
        let (name, end) = parse_name(payload, off)?;
        let fixed = payload.get(end..end + 4)?;
        questions.push(Question {
            name,
            raw_name: payload[off..end].to_vec(),
            qtype: u16::from_be_bytes([fixed[0], fixed[1]]),
            qclass: u16::from_be_bytes([fixed[2], fixed[3]]),
        });
        off = end + 4;
    }

    Some(Query {
        id,
        recursion_desired: flags & FLAG_RD != 0,
        questions,
    })
}

/// Reads a (possibly compressed) name starting at `offset`, returning the
/// dotted form and the offset just past the name in the original stream.
fn parse_name(msg: &[u8], mut offset: usize) -> Option<(String, usize)> {
    let mut labels: Vec<&str> = Vec::new();
    let mut end = offset;
    let mut jumped = false;
    let mut hops = 0;

    loop {
        hops += 1;
        if hops > 64 {
            return None;
        }
        let len = *msg.get(offset)?;
        if len == 0 {
            if !jumped {
                end = offset + 1;
            }
            break;
        }
        if len & 0xc0 == 0xc0 {
            let low = *msg.get(offset + 1)?;
            if !jumped {
                end = offset + 2;
            }
            offset = ((len as usize & 0x3f) << 8) | low as usize;
            jumped = true;
            continue;
        }
        if len & 0xc0 != 0 {
            return None;
        }
        let label = msg.get(offset + 1..offset + 1 + len as usize)?;
        labels.push(std::str::from_utf8(label).ok()?);
        offset += 1 + len as usize;
        if !jumped {
            end = offset;
        }
    }

    Some((labels.join("."), end))
}

/// An A answer for one of the query's questions.
#[derive(Debug, Clone, Copy)]
pub struct Answer {
    pub question: usize,
    pub addr: Ipv4Addr,
    pub ttl: u32,
}

/// Builds a NoError response to `query`, echoing every question and
/// answering the subset named in `answers`. ID and RD are preserved;
/// QR, AA and RA are set.
pub fn build_response(query: &Query, answers: &[Answer]) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(&query.id.to_be_bytes());
    let mut flags = FLAG_QR | FLAG_AA | FLAG_RA;
    if query.recursion_desired {
        flags |= FLAG_RD;
    }
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&(query.questions.len() as u16).to_be_bytes());
    out.extend_from_slice(&(answers.len() as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount

    for q in &query.questions {
        out.extend_from_slice(&q.raw_name);
        out.extend_from_slice(&q.qtype.to_be_bytes());
        out.extend_from_slice(&q.qclass.to_be_bytes());
    }
    for a in answers {
        let q = &query.questions[a.question];
        out.extend_from_slice(&q.raw_name);
        out.extend_from_slice(&TYPE_A.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out.extend_from_slice(&a.ttl.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&a.addr.octets());
    }
    out
}
