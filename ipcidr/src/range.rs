// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.

//! Address ranges: the numeric primitive the pool layer is built on.
//!
//! Unlike [`IpCidr`], a range is not necessarily prefix-aligned: it is any
//! pair of endpoints `from..=to` within one address family, either parsed
//! straight from a CIDR or from an explicit `A - B` pair.

use crate::IpCidr;
use serde::{de, de::Deserializer, Deserialize, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl Display for AddressFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "ipv4"),
            AddressFamily::V6 => write!(f, "ipv6"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeParseError {
    #[error("malformed address range: {0}")]
    Malformed(String),
    #[error("range endpoints belong to different address families: {0}")]
    FamilyMismatch(String),
    #[error("range end is before range start: {0}")]
    InvalidOrder(String),
}

/// Canonical 16-byte form used for cross-family-safe comparison: an IPv4
/// address is embedded the same way an IPv4-mapped IPv6 address is.
fn canonical(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(addr) => u128::from(addr.to_ipv6_mapped()),
        IpAddr::V6(addr) => u128::from(*addr),
    }
}

fn family_of(ip: &IpAddr) -> AddressFamily {
    match ip {
        IpAddr::V4(_) => AddressFamily::V4,
        IpAddr::V6(_) => AddressFamily::V6,
    }
}

fn step(ip: &IpAddr, by: i128) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(addr) => {
            let n = i128::from(u32::from(*addr)).checked_add(by)?;
            let n = u32::try_from(n).ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(n)))
        }
        IpAddr::V6(addr) => {
            let n = i128::from(u128::from(*addr)).checked_add(by)?;
            let n = u128::try_from(n).ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(n)))
        }
    }
}

/// True iff `ip` lies within `cidr`, endpoints included. This differs from
/// [`IpCidr::contains`], which treats the network and broadcast addresses as
/// reserved; a pool range is allowed to span the whole subnet, endpoints and
/// all.
pub fn cidr_contains_inclusive(cidr: &IpCidr, ip: &IpAddr) -> bool {
    if family_of(ip) != family_of(&cidr.addr()) {
        return false;
    }
    let lo = canonical(&cidr.network_addr());
    let hi = canonical(&cidr.broadcast_addr());
    let v = canonical(ip);
    lo <= v && v <= hi
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpRange {
    from: IpAddr,
    to: IpAddr,
}

impl IpRange {
    /// Builds a range directly from two endpoints. Fails if the endpoints
    /// are of different families or out of order.
    pub fn new(from: IpAddr, to: IpAddr) -> Result<Self, RangeParseError> {
        if family_of(&from) != family_of(&to) {
            return Err(RangeParseError::FamilyMismatch(format!("{from} - {to}")));
        }
        if canonical(&from) > canonical(&to) {
            return Err(RangeParseError::InvalidOrder(format!("{from} - {to}")));
        }
        Ok(IpRange { from, to })
    }

    pub fn from_cidr(cidr: &IpCidr) -> Self {
        IpRange {
            from: cidr.network_addr(),
            to: cidr.broadcast_addr(),
        }
    }

    pub fn family(&self) -> AddressFamily {
        family_of(&self.from)
    }

    pub fn first(&self) -> IpAddr {
        self.from
    }

    pub fn last(&self) -> IpAddr {
        self.to
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        if family_of(ip) != self.family() {
            return false;
        }
        let v = canonical(ip);
        canonical(&self.from) <= v && v <= canonical(&self.to)
    }

    pub fn overlaps(&self, other: &IpRange) -> bool {
        if self.family() != other.family() {
            return false;
        }
        canonical(&self.from) <= canonical(&other.to) && canonical(&other.from) <= canonical(&self.to)
    }

    pub fn contained_by(&self, cidr: &IpCidr) -> bool {
        cidr_contains_inclusive(cidr, &self.from) && cidr_contains_inclusive(cidr, &self.to)
    }

    /// The address following `ip` within the range, or `None` if `ip` is the
    /// last address (or not in the range at all).
    pub fn next(&self, ip: &IpAddr) -> Option<IpAddr> {
        if !self.contains(ip) || canonical(ip) == canonical(&self.to) {
            return None;
        }
        step(ip, 1)
    }

    /// Inclusive address count, saturating at `u64::MAX` for ranges wider
    /// than 64 bits of address space (only reachable with IPv6).
    pub fn size(&self) -> u64 {
        let span = canonical(&self.to) - canonical(&self.from);
        match span.checked_add(1) {
            Some(n) if n <= u128::from(u64::MAX) => n as u64,
            _ => u64::MAX,
        }
    }

    /// Iterates every address in the range, in ascending order. Only meant
    /// for small ranges (tests, demos): a /64 is not something you want to
    /// walk one address at a time.
    pub fn iter(&self) -> IpRangeIter {
        IpRangeIter {
            range: self.clone(),
            next: Some(self.from),
        }
    }
}

pub struct IpRangeIter {
    range: IpRange,
    next: Option<IpAddr>,
}

impl Iterator for IpRangeIter {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        let current = self.next?;
        self.next = self.range.next(&current);
        Some(current)
    }
}

impl Display for IpRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{} - {}", self.from, self.to)
        }
    }
}

impl FromStr for IpRange {
    type Err = RangeParseError;

    fn from_str(s: &str) -> Result<Self, RangeParseError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(RangeParseError::Malformed(s.to_string()));
        }

        if trimmed.contains('/') {
            let cidr = IpCidr::from_str(trimmed)
                .map_err(|_| RangeParseError::Malformed(trimmed.to_string()))?;
            return Ok(IpRange::from_cidr(&cidr));
        }

        if let Some(idx) = trimmed.find('-') {
            // IPv6 addresses never contain '-', so the first '-' always
            // separates the two endpoints.
            let (lhs, rhs) = trimmed.split_at(idx);
            let from = IpAddr::from_str(lhs.trim())
                .map_err(|_| RangeParseError::Malformed(trimmed.to_string()))?;
            let to = IpAddr::from_str(rhs[1..].trim())
                .map_err(|_| RangeParseError::Malformed(trimmed.to_string()))?;
            return IpRange::new(from, to);
        }

        // A bare address is treated as a single-address range.
        let addr = IpAddr::from_str(trimmed)
            .map_err(|_| RangeParseError::Malformed(trimmed.to_string()))?;
        IpRange::new(addr, addr)
    }
}

impl<'de> Deserialize<'de> for IpRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        FromStr::from_str(&String::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

impl Serialize for IpRange {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cidr_inclusive_of_endpoints() {
        let r: IpRange = "1.2.3.0/31".parse().unwrap();
        assert_eq!(r.first(), IpAddr::from_str("1.2.3.0").unwrap());
        assert_eq!(r.last(), IpAddr::from_str("1.2.3.1").unwrap());
        assert_eq!(r.size(), 2);
    }

    #[test]
    fn single_address_cidr_is_size_one() {
        let r: IpRange = "10.0.0.5/32".parse().unwrap();
        assert_eq!(r.size(), 1);
        assert_eq!(r.first(), r.last());

        let r6: IpRange = "2001:db8::1/128".parse().unwrap();
        assert_eq!(r6.size(), 1);
    }

    #[test]
    fn parses_from_to_range_with_and_without_spaces() {
        let a: IpRange = "192.168.1.2 - 192.168.1.10".parse().unwrap();
        let b: IpRange = "192.168.1.2-192.168.1.10".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.size(), 9);
    }

    #[test]
    fn rejects_family_mismatch_and_backwards_order() {
        assert!("1.2.3.0 - ::1".parse::<IpRange>().is_err());
        assert!("1.2.3.10 - 1.2.3.0".parse::<IpRange>().is_err());
    }

    #[test]
    fn overlap_and_contains() {
        let a: IpRange = "10.0.0.0/30".parse().unwrap();
        let b: IpRange = "10.0.0.2/31".parse().unwrap();
        let c: IpRange = "10.0.1.0/31".parse().unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(a.contains(&IpAddr::from_str("10.0.0.1").unwrap()));
        assert!(!a.contains(&IpAddr::from_str("10.0.1.0").unwrap()));
    }

    #[test]
    fn contained_by_uses_inclusive_subnet_bounds() {
        let r: IpRange = "10.0.0.0/24".parse().unwrap();
        let subnet = IpCidr::from_str("10.0.0.0/24").unwrap();
        assert!(r.contained_by(&subnet));
    }

    #[test]
    fn size_saturates_for_wide_ipv6_ranges() {
        let r: IpRange = "::/0".parse().unwrap();
        assert_eq!(r.size(), u64::MAX);
    }

    #[test]
    fn next_reaches_none_at_the_last_address() {
        let r: IpRange = "10.0.0.0/31".parse().unwrap();
        let first = r.first();
        let second = r.next(&first).unwrap();
        assert_eq!(second, r.last());
        assert_eq!(r.next(&second), None);
    }
}
