//! Opaque identifiers for logical processes, nodes, and proclets.
//!
//! The source identifies a proclet by the raw pointer value of its heap
//! base. We keep the numeric identity (it is still the segment's base
//! address, carved out by the address planner) but never expose it to user
//! code as a pointer: [`ProcletId`] is an opaque `u64` and the only way to
//! reach the backing header is through `proclet_header`-style lookups that
//! validate the id lies in the proclet-heap region.

use std::fmt;
use std::net::IpAddr;

/// Identity of a logical process (tenant). Allocated by whichever node first
/// registers with a given id, or by the controller when `0` ("auto") is
/// requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LpId(pub u16);

impl LpId {
    pub const AUTO: LpId = LpId(0);

    pub fn is_auto(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lp{}", self.0)
    }
}

/// Identity of a server (or the controller) process within an LP.
///
/// Nodes are identified by IP for the lifetime of the spec; a real
/// deployment would pair this with a port, which `NodeId` carries so the
/// RPC fabric can dial it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub ip: IpAddr,
    pub port: u16,
}

impl NodeId {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        NodeId { ip, port }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl std::str::FromStr for NodeId {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: std::net::SocketAddr = s.parse().unwrap_or_else(|_| {
            // Accept a bare IP (no port) by defaulting to 0; caller fills in
            // the real port once it knows which listener it wants.
            std::net::SocketAddr::new(s.parse().expect("invalid ip/addr"), 0)
        });
        Ok(NodeId::new(addr.ip(), addr.port()))
    }
}

/// Identity of a proclet: the base address of its heap segment.
///
/// Never dereference this directly. Use [`crate::status::StatusTable`] or a
/// runtime's proclet manager to go from id to the actual heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcletId(pub u64);

impl ProcletId {
    pub const NONE: ProcletId = ProcletId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ProcletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proclet:{:#x}", self.0)
    }
}

/// A power-of-two heap capacity, expressed as its base-2 logarithm so that
/// bucket indices are cheap to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CapacityClass(pub u8);

impl CapacityClass {
    pub fn bytes(self) -> u64 {
        1u64 << self.0
    }

    /// Smallest class whose capacity is >= `min_bytes`.
    pub fn covering(min_bytes: u64, min_shift: u8, max_shift: u8) -> Option<CapacityClass> {
        let shift = (64 - min_bytes.max(1).leading_zeros()) as u8;
        let shift = shift.max(min_shift);
        if shift > max_shift {
            None
        } else {
            Some(CapacityClass(shift))
        }
    }
}
