//! In-process simulated mesh transport.
//!
//! A [`SimNetwork`] is a hub connecting any number of [`SimTransport`]
//! nodes through channels, reproducing the transport event semantics the
//! manager is written against: a node that finds no root within the
//! election window is told [`TransportEvent::NoParentFound`]; nodes that
//! start while a root exists attach to it directly (a flat star is enough
//! for a simulation) and everyone is told about routing-table growth.
//!
//! Used by the integration tests and the demo binary. Nodes racing for
//! root is not arbitrated beyond first-promotion-wins; start nodes
//! staggered when a deterministic topology matters.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use rand::Rng;
use tokio::sync::mpsc;

use crate::addressing::MeshNodeId;
use crate::error::{MeshError, Result};

use super::transport::{MeshTransport, TransportConfig, TransportEvent, TransportStreams};

const DATA_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_ELECTION_WINDOW: Duration = Duration::from_millis(100);

struct SimPorts {
    events: mpsc::UnboundedSender<TransportEvent>,
    data: mpsc::Sender<(MeshNodeId, Bytes)>,
    has_parent: bool,
}

#[derive(Default)]
struct HubState {
    nodes: BTreeMap<MeshNodeId, SimPorts>,
    root: Option<MeshNodeId>,
}

struct SimHub {
    state: Mutex<HubState>,
    election_window: Duration,
}

impl SimHub {
    fn emit(state: &HubState, to: MeshNodeId, event: TransportEvent) {
        if let Some(ports) = state.nodes.get(&to) {
            let _ = ports.events.send(event);
        }
    }

    fn broadcast_except(state: &HubState, skip: MeshNodeId, event: TransportEvent) {
        for (addr, ports) in &state.nodes {
            if *addr != skip {
                let _ = ports.events.send(event.clone());
            }
        }
    }

    /// Attach every parentless node to the given root.
    fn attach_orphans(state: &mut HubState, root: MeshNodeId) {
        let orphans: Vec<MeshNodeId> = state
            .nodes
            .iter()
            .filter(|(addr, ports)| **addr != root && !ports.has_parent)
            .map(|(addr, _)| *addr)
            .collect();
        for orphan in orphans {
            if let Some(ports) = state.nodes.get_mut(&orphan) {
                ports.has_parent = true;
            }
            Self::emit(
                state,
                orphan,
                TransportEvent::ParentConnected {
                    parent: root,
                    layer: 2,
                    is_root: false,
                },
            );
            Self::emit(state, root, TransportEvent::ChildConnected { child: orphan });
            Self::broadcast_except(state, orphan, TransportEvent::RoutingTableAdded);
        }
    }
}

/// Handle to the simulated hub; clone freely, create one transport per
/// node address.
#[derive(Clone)]
pub struct SimNetwork {
    hub: Arc<SimHub>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::with_election_window(DEFAULT_ELECTION_WINDOW)
    }

    /// Tests use short windows to keep the root election fast.
    pub fn with_election_window(window: Duration) -> Self {
        SimNetwork {
            hub: Arc::new(SimHub {
                state: Mutex::new(HubState::default()),
                election_window: window,
            }),
        }
    }

    pub fn create_node(&self, addr: MeshNodeId) -> Arc<SimTransport> {
        Arc::new(SimTransport {
            hub: self.hub.clone(),
            addr,
            initialized: AtomicBool::new(false),
            started: AtomicBool::new(false),
            is_root: AtomicBool::new(false),
            self_organized: AtomicBool::new(true),
            fail_initialize: AtomicBool::new(false),
        })
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One simulated node's transport endpoint.
pub struct SimTransport {
    hub: Arc<SimHub>,
    addr: MeshNodeId,
    initialized: AtomicBool,
    started: AtomicBool,
    is_root: AtomicBool,
    self_organized: AtomicBool,
    fail_initialize: AtomicBool,
}

impl SimTransport {
    /// Test hook: make the next `initialize` fail like a dead radio.
    pub fn set_initialize_failure(&self, fail: bool) {
        self.fail_initialize.store(fail, Ordering::SeqCst);
    }

    /// Test hook: feed an arbitrary event into this node's stream, as if
    /// the radio driver had emitted it.
    pub fn inject_event(&self, event: TransportEvent) {
        let state = self.hub.state.lock().unwrap();
        SimHub::emit(&state, self.addr, event);
    }

    /// Test hook: simulate a non-mesh station associating with this
    /// node's external access point.
    pub fn external_station_connected(&self, station: MeshNodeId, ip: Ipv4Addr) {
        self.inject_event(TransportEvent::ExternalStationConnected { station, ip });
    }

    pub fn external_station_disconnected(&self, station: MeshNodeId) {
        self.inject_event(TransportEvent::ExternalStationDisconnected { station });
    }
}

impl MeshTransport for SimTransport {
    fn node_addr(&self) -> MeshNodeId {
        self.addr
    }

    fn initialize(&self) -> Result<()> {
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(MeshError::Transport("simulated radio failure".into()));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn start(&self, _config: &TransportConfig) -> Result<TransportStreams> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(MeshError::InvalidState("sim transport not initialized"));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);

        let mut state = self.hub.state.lock().unwrap();
        let root = state.root;
        state.nodes.insert(
            self.addr,
            SimPorts {
                events: events_tx.clone(),
                data: data_tx,
                has_parent: false,
            },
        );
        self.started.store(true, Ordering::SeqCst);
        let _ = events_tx.send(TransportEvent::Started);

        match root {
            Some(root_addr) => {
                SimHub::attach_orphans(&mut state, root_addr);
            }
            None => {
                // Election window: report NoParentFound if no root has
                // appeared by the time the scan gives up.
                let hub = self.hub.clone();
                let addr = self.addr;
                let jitter = rand::thread_rng().gen_range(0..25);
                let window = self.hub.election_window + Duration::from_millis(jitter);
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    let state = hub.state.lock().unwrap();
                    let still_scanning = state.root.is_none()
                        && state
                            .nodes
                            .get(&addr)
                            .map(|p| !p.has_parent)
                            .unwrap_or(false);
                    if still_scanning {
                        SimHub::emit(&state, addr, TransportEvent::NoParentFound);
                    }
                });
            }
        }

        Ok(TransportStreams {
            events: events_rx,
            data: data_rx,
        })
    }

    fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.hub.state.lock().unwrap();
        state.nodes.remove(&self.addr);
        if state.root == Some(self.addr) {
            state.root = None;
            self.is_root.store(false, Ordering::SeqCst);
            for ports in state.nodes.values_mut() {
                ports.has_parent = false;
            }
            SimHub::broadcast_except(
                &state,
                self.addr,
                TransportEvent::ParentDisconnected { reason: 0 },
            );
        } else {
            if let Some(root) = state.root {
                SimHub::emit(&state, root, TransportEvent::ChildDisconnected { child: self.addr });
            }
            SimHub::broadcast_except(&state, self.addr, TransportEvent::RoutingTableRemoved);
        }
        debug!("sim node {} left the mesh", self.addr);
        Ok(())
    }

    fn send_to(&self, dest: MeshNodeId, payload: Bytes) -> Result<()> {
        let state = self.hub.state.lock().unwrap();
        let ports = state
            .nodes
            .get(&dest)
            .ok_or(MeshError::NotFound("destination not in mesh"))?;
        ports
            .data
            .try_send((self.addr, payload))
            .map_err(|_| MeshError::Transport(format!("delivery to {} failed", dest)))
    }

    fn routing_table(&self) -> Vec<MeshNodeId> {
        let state = self.hub.state.lock().unwrap();
        state
            .nodes
            .keys()
            .filter(|addr| **addr != self.addr)
            .copied()
            .collect()
    }

    fn is_root(&self) -> bool {
        self.is_root.load(Ordering::SeqCst)
    }

    fn layer(&self) -> u8 {
        if self.is_root() {
            1
        } else {
            2
        }
    }

    fn promote_to_root(&self) -> Result<()> {
        let mut state = self.hub.state.lock().unwrap();
        if let Some(existing) = state.root {
            if existing != self.addr {
                return Err(MeshError::Transport(format!(
                    "root already elected: {}",
                    existing
                )));
            }
        }
        state.root = Some(self.addr);
        self.is_root.store(true, Ordering::SeqCst);
        SimHub::attach_orphans(&mut state, self.addr);
        debug!("sim node {} promoted to root", self.addr);
        Ok(())
    }

    fn set_self_organized(&self, enabled: bool) -> Result<()> {
        self.self_organized.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn configure_external_ap(&self, _enabled: bool, _max_connections: u8) -> Result<()> {
        Ok(())
    }
}
