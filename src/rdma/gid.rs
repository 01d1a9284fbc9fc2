//! Global identifiers.

use std::fmt;
use std::io;
use std::net::{AddrParseError, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

use super::type_alias::GidIndex;
use crate::bindings::ibv_gid;

/// A 128-bit identifier of a port on a network adapter.
///
/// Displayed in full IPv6 notation (eight groups of four hex digits, no `::`
/// compression), and parsed from any IPv6 notation.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Gid(ibv_gid);

unsafe impl Send for Gid {}
unsafe impl Sync for Gid {}

impl Gid {
    /// Get the raw bytes of this GID in network order.
    #[inline]
    pub fn octets(&self) -> [u8; 16] {
        // SAFETY: byte-level reinterpretation of POD union.
        unsafe { self.0.raw }
    }

    /// Whether this GID is all-zero, as unpopulated GID table entries are.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.octets() == [0; 16]
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = self.octets();
        for (i, group) in raw.chunks_exact(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", group[0], group[1])?;
        }
        Ok(())
    }
}

impl fmt::Debug for Gid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gid").field(&self.to_string()).finish()
    }
}

impl FromStr for Gid {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<Ipv6Addr>().map(Self::from)
    }
}

impl PartialEq for Gid {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.octets() == other.octets()
    }
}

impl Eq for Gid {}

impl From<ibv_gid> for Gid {
    #[inline]
    fn from(gid: ibv_gid) -> Self {
        Self(gid)
    }
}

impl From<Gid> for ibv_gid {
    #[inline]
    fn from(gid: Gid) -> Self {
        gid.0
    }
}

impl From<[u8; 16]> for Gid {
    #[inline]
    fn from(raw: [u8; 16]) -> Self {
        Self(ibv_gid { raw })
    }
}

impl From<Ipv6Addr> for Gid {
    #[inline]
    fn from(addr: Ipv6Addr) -> Self {
        Self::from(addr.octets())
    }
}

impl From<Gid> for Ipv6Addr {
    #[inline]
    fn from(gid: Gid) -> Self {
        Ipv6Addr::from(gid.octets())
    }
}

/// GID query error type.
#[derive(Debug, Error)]
pub enum GidQueryError {
    /// `ibv_query_gid` failed for this table index.
    #[error("cannot query GID at index {index}")]
    Io {
        index: GidIndex,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROCE_V2_GID: [u8; 16] = [
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 10, 0, 0, 1,
    ];

    #[test]
    fn display_is_uncompressed() {
        let gid = Gid::from(ROCE_V2_GID);
        assert_eq!(gid.to_string(), "0000:0000:0000:0000:0000:ffff:0a00:0001");
    }

    #[test]
    fn parse_accepts_any_ipv6_notation() {
        let full: Gid = "fe80:0000:0000:0000:0202:c9ff:fe00:0001".parse().unwrap();
        let short: Gid = "fe80::202:c9ff:fe00:1".parse().unwrap();
        assert_eq!(full, short);
        assert_eq!(Gid::from(ROCE_V2_GID), "::ffff:10.0.0.1".parse::<Gid>().unwrap());
        assert!("not-a-gid".parse::<Gid>().is_err());
    }

    #[test]
    fn display_parse_agree() {
        let gid = Gid::from(ROCE_V2_GID);
        assert_eq!(gid.to_string().parse::<Gid>().unwrap(), gid);
    }

    #[test]
    fn ipv6_conversions() {
        let addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0x0202, 0xc9ff, 0xfe00, 1);
        let gid = Gid::from(addr);
        assert_eq!(Ipv6Addr::from(gid), addr);
        assert_eq!(gid.octets(), addr.octets());
        assert!(!gid.is_zero());
        assert!(Gid::from([0; 16]).is_zero());
    }
}
