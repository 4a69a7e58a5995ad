//! Pluggable NAT behaviors for a network's WAN edge.
//!
//! A [`NatTable`] owns the translation state for one network. Callers hold
//! the network's NAT mutex while using it and supply `now` explicitly so
//! idle expiry is deterministic under test.

mod easy;
mod hard;

pub use easy::EasyNat;
pub use hard::HardNat;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

/// How long a UDP mapping survives without traffic in either direction.
pub const UDP_MAPPING_LIFETIME: Duration = Duration::from_secs(120);

/// First WAN port handed out when the LAN source port cannot be preserved.
pub(crate) const EPHEMERAL_PORT_START: u16 = 32768;

/// The kinds of NAT a network can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatKind {
    /// No translation at all: outbound packets keep their LAN source and
    /// nothing is accepted inbound.
    None,
    /// Endpoint-independent: one WAN port per LAN endpoint, reused across
    /// peers, inbound demultiplexed by WAN port alone.
    Easy,
    /// Endpoint-dependent: a fresh WAN port per (LAN endpoint, WAN peer)
    /// pair, inbound filtered on the full 4-tuple.
    Hard,
    /// Alias for the endpoint-dependent table under its common name.
    Symmetric,
}

impl Default for NatKind {
    fn default() -> Self {
        NatKind::Easy
    }
}

impl fmt::Display for NatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NatKind::None => "none",
            NatKind::Easy => "easy",
            NatKind::Hard => "hard",
            NatKind::Symmetric => "symmetric",
        })
    }
}

/// One network's translation table.
///
/// `pick_outgoing_src` must be idempotent while a flow is alive: repeated
/// calls for the same (LAN source, WAN destination) before expiry return the
/// same WAN source. Implementations may never hand out a WAN port that a
/// live flow already holds where inbound demultiplexing would be ambiguous.
pub trait NatTable: Send {
    /// Translates the source of an outbound packet from `lan_src` to
    /// `wan_dst`, returning the WAN source to use.
    fn pick_outgoing_src(
        &mut self,
        lan_src: SocketAddrV4,
        wan_dst: SocketAddrV4,
        now: Instant,
    ) -> SocketAddrV4;

    /// Translates the destination of an inbound packet from `wan_src` to
    /// this network's `wan_dst`. `None` means drop.
    fn pick_incoming_dst(
        &mut self,
        wan_src: SocketAddrV4,
        wan_dst: SocketAddrV4,
        now: Instant,
    ) -> Option<SocketAddrV4>;
}

/// Builds the table implementing `kind` for a network with the given WAN IP.
pub fn table_for(kind: NatKind, wan_ip: Ipv4Addr) -> Box<dyn NatTable> {
    match kind {
        NatKind::None => Box::new(NoNat),
        NatKind::Easy => Box::new(EasyNat::new(wan_ip)),
        NatKind::Hard | NatKind::Symmetric => Box::new(HardNat::new(wan_ip)),
    }
}

/// The identity "NAT": traffic leaves untranslated and nothing comes back.
struct NoNat;

impl NatTable for NoNat {
    fn pick_outgoing_src(
        &mut self,
        lan_src: SocketAddrV4,
        _wan_dst: SocketAddrV4,
        _now: Instant,
    ) -> SocketAddrV4 {
        lan_src
    }

    fn pick_incoming_dst(
        &mut self,
        _wan_src: SocketAddrV4,
        _wan_dst: SocketAddrV4,
        _now: Instant,
    ) -> Option<SocketAddrV4> {
        None
    }
}
