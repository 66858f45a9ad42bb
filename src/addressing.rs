//! Node identity and deterministic subnet addressing.
//!
//! Every mesh node is identified by its 6-byte hardware address. The last
//! address byte, taken modulo [`SUBNET_SPACE`], yields the node's subnet id,
//! which maps onto the IPv4 prefix `192.168.(10+id).0/24`. The mapping is
//! deterministic but not injective: two nodes whose addresses share a last
//! byte modulo 240 are indistinguishable to the addressing scheme. That is
//! an accepted trade-off of the scheme, not a defect.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of distinct subnet ids. Third octets 10..250 are mesh subnets.
pub const SUBNET_SPACE: u8 = 240;

/// Third octet of the first mesh subnet (`192.168.10.0/24` is subnet 0).
pub const SUBNET_BASE_OCTET: u8 = 10;

/// A 6-byte mesh hardware address. Equality and ordering are byte-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MeshNodeId([u8; 6]);

impl MeshNodeId {
    /// The all-zero address. Never a valid destination.
    pub const ZERO: MeshNodeId = MeshNodeId([0; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MeshNodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Subnet id derived from this address.
    pub fn subnet_id(&self) -> SubnetId {
        SubnetId(self.0[5] % SUBNET_SPACE)
    }
}

impl fmt::Display for MeshNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MeshNodeId {
    type Err = AddressParseError;

    /// Parse `aa:bb:cc:dd:ee:ff` (case-insensitive hex).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for slot in bytes.iter_mut() {
            let part = parts.next().ok_or(AddressParseError)?;
            if part.len() != 2 {
                return Err(AddressParseError);
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| AddressParseError)?;
        }
        if parts.next().is_some() {
            return Err(AddressParseError);
        }
        Ok(MeshNodeId(bytes))
    }
}

/// Returned when a hardware address string is not `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressParseError;

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected a hardware address like aa:bb:cc:dd:ee:ff")
    }
}

impl std::error::Error for AddressParseError {}

impl Serialize for MeshNodeId {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MeshNodeId {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An 8-bit subnet identifier in `[0, SUBNET_SPACE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubnetId(u8);

impl SubnetId {
    pub fn new(raw: u8) -> Self {
        SubnetId(raw % SUBNET_SPACE)
    }

    pub fn raw(&self) -> u8 {
        self.0
    }

    /// Inverse mapping from a destination IP. `None` when the third octet
    /// falls outside the mesh subnet range; such addresses are never
    /// bridgeable.
    pub fn from_ip(ip: Ipv4Addr) -> Option<SubnetId> {
        let octets = ip.octets();
        let third = octets[2];
        if third >= SUBNET_BASE_OCTET && third < SUBNET_BASE_OCTET + SUBNET_SPACE {
            Some(SubnetId(third - SUBNET_BASE_OCTET))
        } else {
            None
        }
    }

    /// Network address of this subnet: `192.168.(10+id).0`.
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, SUBNET_BASE_OCTET + self.0, 0)
    }

    /// Gateway address handed to locally-attached clients: `.1`.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, SUBNET_BASE_OCTET + self.0, 1)
    }

    /// CIDR prefix string, e.g. `192.168.20.0/24`.
    pub fn prefix(&self) -> String {
        format!("{}/24", self.network())
    }
}

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
