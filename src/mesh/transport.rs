//! Seam between the mesh manager and the underlying radio/transport.
//!
//! The real transport is a self-organizing wireless multi-hop network that
//! delivers point-to-point payloads and a serialized stream of topology
//! events. The manager only ever talks to it through [`MeshTransport`], so
//! tests and the demo binary can run against the in-process hub in
//! [`crate::mesh::sim`] instead of hardware.

use bytes::Bytes;
use std::net::Ipv4Addr;
use tokio::sync::mpsc;

use crate::addressing::MeshNodeId;
use crate::error::Result;

/// Identity and radio parameters handed to the transport at start.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Mesh group id; nodes only ever join a mesh with the same id.
    pub mesh_id: MeshNodeId,
    pub channel: u8,
    pub max_layer: u8,
    /// Whether this node votes for itself in root election.
    pub allow_root: bool,
    pub password: String,
}

/// Topology and station events emitted by the transport. The transport
/// serializes these; the manager treats the stream as the single logical
/// writer to its connection state.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Started,
    Stopped,
    ParentConnected {
        parent: MeshNodeId,
        layer: u8,
        is_root: bool,
    },
    ParentDisconnected {
        reason: u8,
    },
    ChildConnected {
        child: MeshNodeId,
    },
    ChildDisconnected {
        child: MeshNodeId,
    },
    RootSwitched,
    RoutingTableAdded,
    RoutingTableRemoved,
    /// No parent was found within the transport's scan window. With
    /// `allow_root` this is the trigger for explicit self-promotion, not
    /// an error.
    NoParentFound,
    LayerChanged {
        layer: u8,
    },
    ExternalStationConnected {
        station: MeshNodeId,
        ip: Ipv4Addr,
    },
    ExternalStationDisconnected {
        station: MeshNodeId,
    },
}

/// Channels handed back by [`MeshTransport::start`]. Events carry topology
/// changes; data carries raw received mesh payloads with their source.
pub struct TransportStreams {
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub data: mpsc::Receiver<(MeshNodeId, Bytes)>,
}

/// Contract the mesh manager requires of any transport backend.
pub trait MeshTransport: Send + Sync + 'static {
    /// This node's hardware address.
    fn node_addr(&self) -> MeshNodeId;

    /// Bring up the radio. Failures here are fatal to the caller but the
    /// call is safe to retry.
    fn initialize(&self) -> Result<()>;

    /// Join (or form) the mesh and return the event/data streams.
    fn start(&self, config: &TransportConfig) -> Result<TransportStreams>;

    /// Leave the mesh and halt the radio side. Closes the streams.
    fn stop(&self) -> Result<()>;

    /// Point-to-point send. Best effort; the transport never retries.
    fn send_to(&self, dest: MeshNodeId, payload: Bytes) -> Result<()>;

    /// Authoritative snapshot of currently reachable nodes.
    fn routing_table(&self) -> Vec<MeshNodeId>;

    fn is_root(&self) -> bool;

    fn layer(&self) -> u8;

    /// Force-promote this node to root with layer 1.
    fn promote_to_root(&self) -> Result<()>;

    /// Enable or disable self-organization. Disabled after explicit root
    /// promotion so the node's identity is not renegotiated by later
    /// topology churn.
    fn set_self_organized(&self, enabled: bool) -> Result<()>;

    /// Configure the non-mesh station gate (external access point).
    fn configure_external_ap(&self, enabled: bool, max_connections: u8) -> Result<()>;
}
