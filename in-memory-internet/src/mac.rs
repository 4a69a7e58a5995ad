use pnet_base::MacAddr;
use std::fmt;

/// A 6-octet Ethernet link address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    pub const BROADCAST: Mac = Mac([0xff; 6]);

    /// Returns the MAC embedded in `bytes`, or `None` if `bytes` is not
    /// exactly 6 octets long.
    pub fn from_slice(bytes: &[u8]) -> Option<Mac> {
        let octets: [u8; 6] = bytes.try_into().ok()?;
        Some(Mac(octets))
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Mac::BROADCAST
    }

    /// The node number encoded in the low byte of generated MACs.
    pub(crate) fn low_byte(&self) -> u8 {
        self.0[5]
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<Mac> for MacAddr {
    fn from(m: Mac) -> MacAddr {
        let [a, b, c, d, e, f] = m.0;
        MacAddr::new(a, b, c, d, e, f)
    }
}

impl From<MacAddr> for Mac {
    fn from(m: MacAddr) -> Mac {
        Mac([m.0, m.1, m.2, m.3, m.4, m.5])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let mac = Mac([0x52, 0xcc, 0xcc, 0xcc, 0xcc, 0x01]);
        assert_eq!(mac.to_string(), "52:cc:cc:cc:cc:01");
    }

    #[test]
    fn broadcast() {
        assert!(Mac([0xff; 6]).is_broadcast());
        assert!(!Mac([0x52, 0, 0, 0, 0, 0]).is_broadcast());
    }

    #[test]
    fn from_slice_rejects_wrong_lengths() {
        assert!(Mac::from_slice(&[1, 2, 3, 4, 5]).is_none());
        assert!(Mac::from_slice(&[1, 2, 3, 4, 5, 6, 7]).is_none());
        assert_eq!(Mac::from_slice(&[1, 2, 3, 4, 5, 6]), Some(Mac([1, 2, 3, 4, 5, 6])));
    }
}
