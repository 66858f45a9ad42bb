//! Bounded cache of currently reachable mesh nodes.
//!
//! The transport's own routing table is authoritative; this is a
//! best-effort projection of it, overwritten wholesale on every topology
//! event or discovery query and capped at a fixed entry count. Readers
//! tolerate slightly-stale contents; no invariant depends on freshness.

use crate::addressing::{MeshNodeId, SubnetId};

/// One cached node. Layer, RSSI and the root flag are reserved for a
/// future transport API and are always zero/false today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub node_id: MeshNodeId,
    pub subnet: SubnetId,
    pub layer: u8,
    pub rssi: i8,
    pub is_root: bool,
}

impl RouteEntry {
    fn from_node(node_id: MeshNodeId) -> Self {
        RouteEntry {
            node_id,
            subnet: node_id.subnet_id(),
            layer: 0,
            rssi: 0,
            is_root: false,
        }
    }
}

#[derive(Debug)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    capacity: usize,
}

impl RouteTable {
    pub fn new(capacity: usize) -> Self {
        RouteTable {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Replace the whole cache with the transport's current view,
    /// truncated at capacity.
    pub fn refresh(&mut self, nodes: impl IntoIterator<Item = MeshNodeId>) {
        self.entries.clear();
        for node in nodes {
            if self.entries.len() >= self.capacity {
                break;
            }
            self.entries.push(RouteEntry::from_node(node));
        }
    }

    /// Linear scan, first match wins. When several nodes hash to the same
    /// subnet id the result is whichever was enumerated first after the
    /// last refresh; the addressing scheme accepts this ambiguity.
    pub fn find_by_subnet(&self, subnet: SubnetId) -> Option<RouteEntry> {
        self.entries.iter().find(|e| e.subnet == subnet).copied()
    }

    pub fn entries(&self, max: usize) -> Vec<RouteEntry> {
        self.entries.iter().take(max).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
