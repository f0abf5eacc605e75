use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{CoreError, Result};

/// A CIDR block: a 32-bit IPv4 base address plus a mask length of 0..=32.
///
/// The representation is canonical: every bit of `addr` below the mask is
/// zero. All address arithmetic and ordering is unsigned `u32` by
/// construction, so prefixes at or above `128.0.0.0` order correctly.
///
/// Ordering is by base address first, then by specificity (shorter mask
/// before longer mask at the same address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Prefix {
    addr: u32,
    len: u8,
}

impl Ipv4Prefix {
    /// The whole IPv4 address space, `0.0.0.0/0`.
    pub const ZERO: Ipv4Prefix = Ipv4Prefix { addr: 0, len: 0 };

    /// Builds a prefix, rejecting non-canonical input (host bits set
    /// below the mask) and mask lengths above 32.
    pub fn new(addr: u32, len: u8) -> Result<Self> {
        if len > 32 {
            return Err(CoreError::InvalidPrefix(format!(
                "mask length {} exceeds 32",
                len
            )));
        }
        let prefix = Ipv4Prefix { addr, len };
        if addr & !prefix.mask() != 0 {
            return Err(CoreError::InvalidPrefix(format!(
                "{}/{} has host bits set below the mask",
                Ipv4Addr::from(addr),
                len
            )));
        }
        Ok(prefix)
    }

    /// Builds a prefix by truncating `addr` to the mask, never failing on
    /// host bits. Mask lengths above 32 are still rejected.
    pub fn truncate(addr: u32, len: u8) -> Result<Self> {
        if len > 32 {
            return Err(CoreError::InvalidPrefix(format!(
                "mask length {} exceeds 32",
                len
            )));
        }
        let mask = mask_of(len);
        Ok(Ipv4Prefix {
            addr: addr & mask,
            len,
        })
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    /// Number of addresses covered by this block.
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.len)
    }

    /// The network mask as a raw `u32`.
    pub fn mask(&self) -> u32 {
        mask_of(self.len)
    }

    /// True if `other` lies entirely inside this block.
    pub fn contains(&self, other: &Ipv4Prefix) -> bool {
        self.len <= other.len && (other.addr & self.mask()) == self.addr
    }

    pub fn contains_addr(&self, addr: u32) -> bool {
        addr & self.mask() == self.addr
    }

    /// True if either block contains the other.
    pub fn overlaps(&self, other: &Ipv4Prefix) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Address bit at position `i`, 0-indexed from the most significant bit.
    pub fn bit(&self, i: u8) -> bool {
        debug_assert!(i < 32);
        self.addr >> (31 - i) & 1 == 1
    }

    /// The half of this block with the next bit set to `one`.
    ///
    /// Callers must not halve a host route; mutating entry points guard
    /// for this before descending.
    pub fn child(&self, one: bool) -> Ipv4Prefix {
        debug_assert!(self.len < 32);
        let addr = if one {
            self.addr | 1 << (31 - self.len)
        } else {
            self.addr
        };
        Ipv4Prefix {
            addr,
            len: self.len + 1,
        }
    }

    /// The block covering this one with a one-bit-shorter mask, or `None`
    /// for `0.0.0.0/0`.
    pub fn parent(&self) -> Option<Ipv4Prefix> {
        if self.len == 0 {
            return None;
        }
        let len = self.len - 1;
        Some(Ipv4Prefix {
            addr: self.addr & mask_of(len),
            len,
        })
    }

    /// The other half of this block's parent, or `None` for `0.0.0.0/0`.
    pub fn sibling(&self) -> Option<Ipv4Prefix> {
        if self.len == 0 {
            return None;
        }
        Some(Ipv4Prefix {
            addr: self.addr ^ 1 << (32 - self.len),
            len: self.len,
        })
    }

    /// Siblings have equal mask length and differ only in the last masked bit.
    pub fn is_sibling_of(&self, other: &Ipv4Prefix) -> bool {
        self.len > 0 && other.len == self.len && self.sibling() == Some(*other)
    }
}

fn mask_of(len: u8) -> u32 {
    // u32 << 32 is undefined, so /0 is special-cased.
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - len)
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.addr), self.len)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let net: Ipv4Net = s
            .parse()
            .map_err(|e| CoreError::InvalidPrefix(format!("{}: {}", s, e)))?;
        net.try_into()
    }
}

impl TryFrom<Ipv4Net> for Ipv4Prefix {
    type Error = CoreError;

    fn try_from(net: Ipv4Net) -> Result<Self> {
        Ipv4Prefix::new(u32::from(net.addr()), net.prefix_len())
    }
}

impl From<Ipv4Prefix> for Ipv4Net {
    fn from(prefix: Ipv4Prefix) -> Self {
        // Mask length is <= 32 and host bits are clear, so this cannot fail.
        Ipv4Net::new(Ipv4Addr::from(prefix.addr), prefix.len)
            .expect("canonical prefix is a valid Ipv4Net")
    }
}

impl Serialize for Ipv4Prefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Prefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Ipv4Prefix {
        s.parse().expect("test prefix")
    }

    #[test]
    fn canonical_form_is_enforced() {
        assert!(Ipv4Prefix::new(0x0A00_0001, 8).is_err());
        assert_eq!(
            Ipv4Prefix::truncate(0x0A00_0001, 8).unwrap(),
            p("10.0.0.0/8")
        );
        assert!(Ipv4Prefix::new(0, 33).is_err());
    }

    #[test]
    fn ordering_is_unsigned() {
        // 128.0.0.0 must sort after 127.255.255.255-side prefixes; a signed
        // compare of the raw representation would invert this.
        assert!(p("128.0.0.0/1") > p("0.0.0.0/1"));
        assert!(p("224.0.0.0/3") > p("128.0.0.0/2"));
        // Same address: less specific first.
        assert!(p("10.0.0.0/8") < p("10.0.0.0/9"));
    }

    #[test]
    fn containment_and_overlap() {
        assert!(p("0.0.0.0/0").contains(&p("224.0.0.0/3")));
        assert!(!p("224.0.0.0/3").contains(&p("0.0.0.0/0")));
        assert!(p("224.0.0.0/3").overlaps(&p("0.0.0.0/0")));
        assert!(!p("10.0.0.0/8").overlaps(&p("11.0.0.0/8")));
        assert!(p("128.0.0.0/1").contains_addr(u32::from(Ipv4Addr::new(192, 0, 2, 1))));
    }

    #[test]
    fn sibling_and_parent_arithmetic() {
        assert_eq!(p("128.0.0.0/2").sibling(), Some(p("192.0.0.0/2")));
        assert_eq!(p("192.0.0.0/2").sibling(), Some(p("128.0.0.0/2")));
        assert!(p("128.0.0.0/2").is_sibling_of(&p("192.0.0.0/2")));
        assert!(!p("128.0.0.0/2").is_sibling_of(&p("128.0.0.0/2")));
        assert_eq!(p("192.0.0.0/2").parent(), Some(p("128.0.0.0/1")));
        assert_eq!(Ipv4Prefix::ZERO.parent(), None);
        assert_eq!(Ipv4Prefix::ZERO.sibling(), None);
    }

    #[test]
    fn halving_sets_the_next_bit() {
        let root = Ipv4Prefix::ZERO;
        assert_eq!(root.child(false), p("0.0.0.0/1"));
        assert_eq!(root.child(true), p("128.0.0.0/1"));
        assert_eq!(p("128.0.0.0/1").child(true), p("192.0.0.0/2"));
    }

    #[test]
    fn display_round_trips_through_serde() {
        let prefix = p("198.51.100.0/24");
        let json = serde_json::to_string(&prefix).unwrap();
        assert_eq!(json, "\"198.51.100.0/24\"");
        let back: Ipv4Prefix = serde_json::from_str(&json).unwrap();
        assert_eq!(back, prefix);
    }
}
