//! Network addresses and the canonical endpoint pair used to key edges.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Error, Result};

// ============================================================================
// HardwareAddress
// ============================================================================

/// Link-layer address as raw bytes (MAC, EUI-64, ...).
///
/// Ordered length-first, then lexicographically by byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct HardwareAddress(SmallVec<[u8; 8]>);

impl HardwareAddress {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidArgument("hardware address has no bytes".into()));
        }
        Ok(Self(SmallVec::from_slice(bytes)))
    }

    pub fn mac(bytes: [u8; 6]) -> Self {
        Self(SmallVec::from_slice(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<Vec<u8>> for HardwareAddress {
    type Error = Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        Self::new(&bytes)
    }
}

impl From<HardwareAddress> for Vec<u8> {
    fn from(address: HardwareAddress) -> Self {
        address.0.into_vec()
    }
}

impl Ord for HardwareAddress {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.as_slice().cmp(other.0.as_slice()))
    }
}

impl PartialOrd for HardwareAddress {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for HardwareAddress {
    type Err = Error;

    /// Parses `aa:bb:cc:dd:ee:ff` (also `-` separated).
    fn from_str(s: &str) -> Result<Self> {
        let bytes = s
            .split([':', '-'])
            .map(|octet| {
                u8::from_str_radix(octet, 16)
                    .map_err(|_| Error::InvalidArgument(format!("bad hardware address: {s}")))
            })
            .collect::<Result<Vec<u8>>>()?;
        Self::new(&bytes)
    }
}

// ============================================================================
// LogicalAddress
// ============================================================================

/// Network-layer address: a single host or a CIDR block.
///
/// A host is a block with a full-length prefix. Blocks are normalized on
/// construction (host bits cleared), so two addresses are equal exactly
/// when each contains the other. Ordering is family, then network
/// address, then prefix length (wider blocks first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawLogicalAddress")]
pub enum LogicalAddress {
    V4 { addr: Ipv4Addr, prefix: u8 },
    V6 { addr: Ipv6Addr, prefix: u8 },
}

/// Wire shape of [`LogicalAddress`], checked and normalized on the way in.
#[derive(Deserialize)]
enum RawLogicalAddress {
    V4 { addr: Ipv4Addr, prefix: u8 },
    V6 { addr: Ipv6Addr, prefix: u8 },
}

impl TryFrom<RawLogicalAddress> for LogicalAddress {
    type Error = Error;

    fn try_from(raw: RawLogicalAddress) -> Result<Self> {
        match raw {
            RawLogicalAddress::V4 { addr, prefix } => Self::cidr(IpAddr::V4(addr), prefix),
            RawLogicalAddress::V6 { addr, prefix } => Self::cidr(IpAddr::V6(addr), prefix),
        }
    }
}

impl LogicalAddress {
    pub fn host(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(addr) => LogicalAddress::V4 { addr, prefix: 32 },
            IpAddr::V6(addr) => LogicalAddress::V6 { addr, prefix: 128 },
        }
    }

    pub fn ipv4(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self::host(IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
    }

    pub fn cidr(ip: IpAddr, prefix: u8) -> Result<Self> {
        match ip {
            IpAddr::V4(addr) => {
                if prefix > 32 {
                    return Err(Error::InvalidArgument(format!("IPv4 prefix /{prefix} out of range")));
                }
                let bits = u32::from(addr) & mask_v4(prefix);
                Ok(LogicalAddress::V4 { addr: Ipv4Addr::from(bits), prefix })
            }
            IpAddr::V6(addr) => {
                if prefix > 128 {
                    return Err(Error::InvalidArgument(format!("IPv6 prefix /{prefix} out of range")));
                }
                let bits = u128::from(addr) & mask_v6(prefix);
                Ok(LogicalAddress::V6 { addr: Ipv6Addr::from(bits), prefix })
            }
        }
    }

    pub fn prefix(&self) -> u8 {
        match self {
            LogicalAddress::V4 { prefix, .. } | LogicalAddress::V6 { prefix, .. } => *prefix,
        }
    }

    pub fn is_host(&self) -> bool {
        match self {
            LogicalAddress::V4 { prefix, .. } => *prefix == 32,
            LogicalAddress::V6 { prefix, .. } => *prefix == 128,
        }
    }

    /// True when every address in `other` is also in `self`.
    pub fn contains(&self, other: &LogicalAddress) -> bool {
        match (self, other) {
            (LogicalAddress::V4 { addr, prefix }, LogicalAddress::V4 { addr: inner, prefix: inner_prefix }) => {
                prefix <= inner_prefix && u32::from(*inner) & mask_v4(*prefix) == u32::from(*addr)
            }
            (LogicalAddress::V6 { addr, prefix }, LogicalAddress::V6 { addr: inner, prefix: inner_prefix }) => {
                prefix <= inner_prefix && u128::from(*inner) & mask_v6(*prefix) == u128::from(*addr)
            }
            _ => false,
        }
    }
}

// Prefixes past the address width act as full length.
fn mask_v4(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32u32.saturating_sub(prefix.into())).unwrap_or(0)
}

fn mask_v6(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128u32.saturating_sub(prefix.into())).unwrap_or(0)
}

impl fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalAddress::V4 { addr, prefix: 32 } => write!(f, "{addr}"),
            LogicalAddress::V6 { addr, prefix: 128 } => write!(f, "{addr}"),
            LogicalAddress::V4 { addr, prefix } => write!(f, "{addr}/{prefix}"),
            LogicalAddress::V6 { addr, prefix } => write!(f, "{addr}/{prefix}"),
        }
    }
}

impl FromStr for LogicalAddress {
    type Err = Error;

    /// Parses `10.0.0.1`, `10.0.0.0/8`, `fe80::1` or `fe80::/10`.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidArgument(format!("bad logical address: {s}"));
        match s.split_once('/') {
            Some((ip, prefix)) => {
                let ip: IpAddr = ip.trim().parse().map_err(|_| bad())?;
                let prefix: u8 = prefix.trim().parse().map_err(|_| bad())?;
                Self::cidr(ip, prefix)
            }
            None => Ok(Self::host(s.trim().parse().map_err(|_| bad())?)),
        }
    }
}

// ============================================================================
// LogicalAddressMapping
// ============================================================================

/// A logical address as seen behind one hardware address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalAddressMapping {
    pub hardware: HardwareAddress,
    pub logical: LogicalAddress,
}

impl LogicalAddressMapping {
    pub fn new(hardware: HardwareAddress, logical: LogicalAddress) -> Self {
        Self { hardware, logical }
    }
}

impl fmt::Display for LogicalAddressMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.logical, self.hardware)
    }
}

// ============================================================================
// AddressPair
// ============================================================================

/// Unordered endpoint pair, stored with `source < destination`.
///
/// `AddressPair::new(a, b)` and `AddressPair::new(b, a)` build the same
/// value, so derived equality and hashing are symmetric. Equal endpoints
/// are rejected, also when deserializing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(
    try_from = "RawAddressPair<T>",
    bound(deserialize = "T: Deserialize<'de> + Ord + fmt::Display")
)]
pub struct AddressPair<T> {
    source: T,
    destination: T,
}

#[derive(Deserialize)]
struct RawAddressPair<T> {
    source: T,
    destination: T,
}

impl<T: Ord + fmt::Display> TryFrom<RawAddressPair<T>> for AddressPair<T> {
    type Error = Error;

    fn try_from(raw: RawAddressPair<T>) -> Result<Self> {
        Self::new(raw.source, raw.destination)
    }
}

pub type HardwareAddressPair = AddressPair<HardwareAddress>;
pub type LogicalAddressPair = AddressPair<LogicalAddressMapping>;

impl<T: Ord + fmt::Display> AddressPair<T> {
    pub fn new(a: T, b: T) -> Result<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Ok(Self { source: a, destination: b }),
            std::cmp::Ordering::Greater => Ok(Self { source: b, destination: a }),
            std::cmp::Ordering::Equal => Err(Error::InvalidArgument(format!(
                "connection endpoints must differ: {a}"
            ))),
        }
    }

    pub fn source(&self) -> &T {
        &self.source
    }

    pub fn destination(&self) -> &T {
        &self.destination
    }
}

impl<T: fmt::Display> fmt::Display for AddressPair<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.source, self.destination)
    }
}
