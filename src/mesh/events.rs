//! Caller-facing mesh events and the observer/data-handler traits.

use std::net::Ipv4Addr;

use crate::addressing::MeshNodeId;

/// Connectivity state transitions and station notifications reported to
/// the embedding application. Each variant carries its typed payload;
/// there is no out-of-band context pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    Started,
    Stopped,
    Connected { layer: u8, is_root: bool },
    Disconnected,
    ChildConnected { child: MeshNodeId },
    ChildDisconnected { child: MeshNodeId },
    RootChanged { is_root: bool },
    RouteTableChanged { nodes: usize },
    ExternalStationConnected { station: MeshNodeId, ip: Ipv4Addr },
}

/// Receives every [`MeshEvent`]. Invoked from the manager's event-loop
/// task; implementations should hand off anything slow.
pub trait MeshObserver: Send + Sync {
    fn on_mesh_event(&self, event: MeshEvent);
}

/// Single-slot consumer for raw received mesh payloads. Every payload is
/// delivered regardless of kind; the handler self-filters by inspecting
/// the leading signature bytes.
pub trait MeshDataHandler: Send + Sync {
    fn on_mesh_data(&self, src: MeshNodeId, data: &[u8]);
}
