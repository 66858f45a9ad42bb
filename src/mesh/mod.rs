//! # Mesh Network Manager
//!
//! Owns the mesh state machine: initialization, start/stop, root election
//! fallback, parent/child tracking, external access-point gating, and the
//! dispatch of received payloads to the registered data handler.
//!
//! ## State machine
//!
//! ```text
//! Stopped → Started → {Root | Connected} → Disconnected → Started…
//! ```
//!
//! The transport serializes its topology events, so the event-loop task is
//! the single logical writer to the connection state; every other task or
//! caller only reads, and tolerates a slightly-stale view.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshgate::mesh::{MeshManager, MeshOptions};
//! use meshgate::mesh::sim::SimNetwork;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let net = SimNetwork::new();
//!     let transport = net.create_node("24:6f:28:00:00:0a".parse()?);
//!     let manager = MeshManager::new(transport, MeshOptions::default(), None);
//!     manager.initialize()?;
//!     manager.start()?;
//!     // ... run ...
//!     manager.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod events;
pub mod sim;
pub mod transport;

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::addressing::{MeshNodeId, SubnetId};
use crate::error::{MeshError, Result};
use crate::logutil::escape_log;
use crate::routing::{RouteEntry, RouteTable};
use crate::storage::MeshIdentity;

pub use events::{MeshDataHandler, MeshEvent, MeshObserver};
pub use transport::{MeshTransport, TransportConfig, TransportEvent, TransportStreams};

/// Bounded wait for a task to confirm termination during stop.
const TASK_STOP_TIMEOUT: Duration = Duration::from_millis(1000);

/// Single source of truth for whether send operations are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshStatus {
    Stopped,
    Started,
    Connected,
    Root,
    Disconnected,
}

impl std::fmt::Display for MeshStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MeshStatus::Stopped => "stopped",
            MeshStatus::Started => "started",
            MeshStatus::Connected => "connected",
            MeshStatus::Root => "root",
            MeshStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Runtime parameters for the manager, mirroring the `[mesh]` config
/// section.
#[derive(Debug, Clone)]
pub struct MeshOptions {
    pub transport: TransportConfig,
    pub route_table_size: usize,
}

impl Default for MeshOptions {
    fn default() -> Self {
        MeshOptions {
            transport: TransportConfig {
                mesh_id: MeshNodeId::new([0x47, 0x45, 0x4F, 0x00, 0x00, 0x01]),
                channel: 1,
                max_layer: 6,
                allow_root: true,
                password: String::new(),
            },
            route_table_size: 50,
        }
    }
}

#[derive(Debug, Default)]
struct ExternalApState {
    running: bool,
    ssid: String,
    max_connections: u8,
    clients: u8,
}

struct MeshState {
    status: MeshStatus,
    initialized: bool,
    started: bool,
    layer: u8,
    is_root: bool,
    parent: Option<MeshNodeId>,
    subnet: SubnetId,
    routes: RouteTable,
    external_ap: ExternalApState,
}

impl MeshState {
    fn new(route_table_size: usize) -> Self {
        MeshState {
            status: MeshStatus::Stopped,
            initialized: false,
            started: false,
            layer: 0,
            is_root: false,
            parent: None,
            subnet: SubnetId::new(0),
            routes: RouteTable::new(route_table_size),
            external_ap: ExternalApState::default(),
        }
    }
}

struct ManagerInner {
    transport: Arc<dyn MeshTransport>,
    options: MeshOptions,
    state: RwLock<MeshState>,
    observer: RwLock<Option<Arc<dyn MeshObserver>>>,
    data_handler: RwLock<Option<Arc<dyn MeshDataHandler>>>,
    shutdown: Mutex<watch::Sender<bool>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    rx_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the mesh core. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MeshManager {
    inner: Arc<ManagerInner>,
}

impl MeshManager {
    pub fn new(
        transport: Arc<dyn MeshTransport>,
        options: MeshOptions,
        observer: Option<Arc<dyn MeshObserver>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        MeshManager {
            inner: Arc::new(ManagerInner {
                transport,
                state: RwLock::new(MeshState::new(options.route_table_size)),
                options,
                observer: RwLock::new(observer),
                data_handler: RwLock::new(None),
                shutdown: Mutex::new(shutdown),
                event_task: Mutex::new(None),
                rx_task: Mutex::new(None),
            }),
        }
    }

    /// Bring up the underlying transport and radio. Idempotent; a radio
    /// failure propagates unchanged and the call is safe to retry.
    pub fn initialize(&self) -> Result<()> {
        if self.inner.state.read().unwrap().initialized {
            debug!("mesh already initialized");
            return Ok(());
        }
        info!("initializing mesh transport");
        self.inner.transport.initialize()?;
        self.inner.state.write().unwrap().initialized = true;
        Ok(())
    }

    /// Join (or form) the mesh. Requires [`initialize`](Self::initialize);
    /// a second call without an intervening stop is a no-op success.
    pub fn start(&self) -> Result<()> {
        {
            let state = self.inner.state.read().unwrap();
            if !state.initialized {
                return Err(MeshError::InvalidState("mesh not initialized"));
            }
            if state.started {
                warn!("mesh already started");
                return Ok(());
            }
        }

        let cfg = &self.inner.options.transport;
        let subnet = self.inner.transport.node_addr().subnet_id();
        info!(
            "starting mesh: id={} channel={} max_layer={} allow_root={} subnet={} ({})",
            cfg.mesh_id, cfg.channel, cfg.max_layer, cfg.allow_root, subnet,
            subnet.prefix()
        );

        let streams = self.inner.transport.start(cfg)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.inner.shutdown.lock().unwrap() = shutdown_tx;

        {
            let mut state = self.inner.state.write().unwrap();
            state.started = true;
            state.status = MeshStatus::Started;
            state.subnet = subnet;
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(run_event_loop(inner, streams, shutdown_rx));
        *self.inner.event_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Leave the mesh and reset all transient state to the `Stopped`
    /// baseline. Idempotent. A task that fails to exit within the bounded
    /// wait is a logged anomaly; teardown proceeds regardless.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.state.read().unwrap().started {
            return Ok(());
        }
        info!("stopping mesh");

        if let Err(e) = self.stop_external_ap() {
            warn!("external AP stop during mesh stop failed: {}", e);
        }

        let _ = self.inner.shutdown.lock().unwrap().send(true);
        join_with_timeout(self.inner.rx_task.lock().unwrap().take(), "mesh rx").await;
        join_with_timeout(self.inner.event_task.lock().unwrap().take(), "mesh event loop").await;

        if let Err(e) = self.inner.transport.stop() {
            warn!("transport stop failed: {}", e);
        }

        {
            let mut state = self.inner.state.write().unwrap();
            state.started = false;
            state.status = MeshStatus::Stopped;
            state.is_root = false;
            state.layer = 0;
            state.parent = None;
            state.routes.clear();
        }
        self.inner.notify(MeshEvent::Stopped);
        info!("mesh stopped");
        Ok(())
    }

    /// Point-to-point send. Requires `Connected` or `Root`; never retried
    /// internally, retry policy belongs to the caller.
    pub fn send_to(&self, dest: MeshNodeId, payload: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(MeshError::InvalidState("mesh not connected"));
        }
        if dest.is_zero() {
            return Err(MeshError::InvalidArgument("zero destination address"));
        }
        if payload.is_empty() {
            return Err(MeshError::InvalidArgument("empty payload"));
        }
        debug!("tx {} bytes to {}", payload.len(), dest);
        self.inner.transport.send_to(dest, payload)
    }

    // ---- external access point gating ----

    /// Expose a conventional access point for non-mesh clients. Requires
    /// the mesh to be started; idempotent while running.
    pub fn start_external_ap(&self, ssid: &str, max_connections: u8) -> Result<()> {
        {
            let state = self.inner.state.read().unwrap();
            if !state.started {
                return Err(MeshError::InvalidState("mesh not started"));
            }
            if state.external_ap.running {
                warn!("external AP already running");
                return Ok(());
            }
        }
        self.inner.transport.configure_external_ap(true, max_connections)?;
        let gateway = {
            let mut state = self.inner.state.write().unwrap();
            state.external_ap = ExternalApState {
                running: true,
                ssid: ssid.to_string(),
                max_connections,
                clients: 0,
            };
            state.subnet.gateway()
        };
        info!(
            "external AP started: \"{}\" gateway {} (max {} clients)",
            escape_log(ssid),
            gateway,
            max_connections
        );
        Ok(())
    }

    /// Stop the external access point without tearing down the mesh.
    /// Idempotent.
    pub fn stop_external_ap(&self) -> Result<()> {
        if !self.inner.state.read().unwrap().external_ap.running {
            return Ok(());
        }
        self.inner.transport.configure_external_ap(false, 0)?;
        self.inner.state.write().unwrap().external_ap = ExternalApState::default();
        info!("external AP stopped");
        Ok(())
    }

    pub fn external_ap_running(&self) -> bool {
        self.inner.state.read().unwrap().external_ap.running
    }

    /// Gateway address of the external AP, `192.168.(10+subnet).1`.
    pub fn external_ap_ip(&self) -> Result<Ipv4Addr> {
        let state = self.inner.state.read().unwrap();
        if !state.external_ap.running {
            return Err(MeshError::InvalidState("external AP not running"));
        }
        Ok(state.subnet.gateway())
    }

    pub fn external_ap_client_count(&self) -> u8 {
        self.inner.state.read().unwrap().external_ap.clients
    }

    // ---- discovery queries ----

    /// Reachable nodes, refreshed from the transport before answering.
    pub fn get_nodes(&self, max: usize) -> Vec<RouteEntry> {
        self.inner.refresh_routes();
        self.inner.state.read().unwrap().routes.entries(max)
    }

    pub fn get_node_count(&self) -> usize {
        self.inner.refresh_routes();
        self.inner.state.read().unwrap().routes.len()
    }

    /// First cached node owning `subnet`. When several nodes collide on a
    /// subnet id the first enumerated after the refresh wins.
    pub fn find_node_by_subnet(&self, subnet: SubnetId) -> Result<RouteEntry> {
        self.inner.refresh_routes();
        self.inner
            .state
            .read()
            .unwrap()
            .routes
            .find_by_subnet(subnet)
            .ok_or(MeshError::NotFound("no mesh node for subnet"))
    }

    // ---- status queries ----

    pub fn get_status(&self) -> MeshStatus {
        self.inner.state.read().unwrap().status
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.get_status(), MeshStatus::Connected | MeshStatus::Root)
    }

    pub fn is_root(&self) -> bool {
        self.inner.state.read().unwrap().is_root
    }

    pub fn get_layer(&self) -> u8 {
        self.inner.state.read().unwrap().layer
    }

    pub fn get_subnet_id(&self) -> SubnetId {
        self.inner.state.read().unwrap().subnet
    }

    pub fn get_parent(&self) -> Result<MeshNodeId> {
        self.inner
            .state
            .read()
            .unwrap()
            .parent
            .ok_or(MeshError::NotFound("no parent recorded"))
    }

    pub fn node_addr(&self) -> MeshNodeId {
        self.inner.transport.node_addr()
    }

    /// Durable identity for [`crate::storage::ConfigStore::save_identity`].
    pub fn identity(&self) -> MeshIdentity {
        let cfg = &self.inner.options.transport;
        MeshIdentity {
            mesh_id: *cfg.mesh_id.as_bytes(),
            channel: cfg.channel,
            max_layer: cfg.max_layer,
        }
    }

    // ---- callback registration ----

    pub fn set_observer(&self, observer: Arc<dyn MeshObserver>) {
        *self.inner.observer.write().unwrap() = Some(observer);
    }

    /// Install the single data-handler slot. Every received payload is
    /// delivered to it regardless of kind.
    pub fn set_data_handler(&self, handler: Arc<dyn MeshDataHandler>) {
        *self.inner.data_handler.write().unwrap() = Some(handler);
    }

    pub fn clear_data_handler(&self) {
        *self.inner.data_handler.write().unwrap() = None;
    }
}

impl ManagerInner {
    fn notify(&self, event: MeshEvent) {
        let observer = self.observer.read().unwrap().clone();
        if let Some(observer) = observer {
            observer.on_mesh_event(event);
        }
    }

    fn refresh_routes(&self) {
        let nodes = self.transport.routing_table();
        self.state.write().unwrap().routes.refresh(nodes);
    }

    /// Start the receive task exactly once. Later parent-connect events
    /// find the data stream already taken and are task-lifecycle no-ops.
    fn spawn_rx_task(
        self: &Arc<Self>,
        data: &mut Option<mpsc::Receiver<(MeshNodeId, Bytes)>>,
        shutdown: watch::Receiver<bool>,
    ) {
        if let Some(data_rx) = data.take() {
            info!("starting mesh rx task");
            let inner = self.clone();
            let handle = tokio::spawn(run_rx_task(inner, data_rx, shutdown));
            *self.rx_task.lock().unwrap() = Some(handle);
        }
    }

    fn handle_event(
        self: &Arc<Self>,
        event: TransportEvent,
        data: &mut Option<mpsc::Receiver<(MeshNodeId, Bytes)>>,
        shutdown: &watch::Receiver<bool>,
    ) {
        match event {
            TransportEvent::Started => {
                info!("mesh started, scanning for network");
                self.state.write().unwrap().status = MeshStatus::Started;
                self.notify(MeshEvent::Started);
            }
            TransportEvent::Stopped => {
                info!("transport reported mesh stopped");
                {
                    let mut state = self.state.write().unwrap();
                    state.status = MeshStatus::Stopped;
                    state.is_root = false;
                    state.layer = 0;
                }
                self.notify(MeshEvent::Stopped);
            }
            TransportEvent::ParentConnected {
                parent,
                layer,
                is_root,
            } => {
                let subnet = {
                    let mut state = self.state.write().unwrap();
                    state.parent = Some(parent);
                    state.layer = layer;
                    state.is_root = is_root;
                    state.status = if is_root {
                        MeshStatus::Root
                    } else {
                        MeshStatus::Connected
                    };
                    state.subnet
                };
                info!(
                    "connected to mesh: parent={} layer={} root={} subnet={}",
                    parent,
                    layer,
                    is_root,
                    subnet.prefix()
                );
                self.spawn_rx_task(data, shutdown.clone());
                self.notify(MeshEvent::Connected { layer, is_root });
            }
            TransportEvent::ParentDisconnected { reason } => {
                if self.state.read().unwrap().is_root {
                    // Root nodes have no parent; the transport's event
                    // stream emits this anyway after a root switch.
                    debug!("ignoring spurious parent disconnect on root (reason {})", reason);
                    return;
                }
                warn!("parent disconnected (reason {})", reason);
                {
                    let mut state = self.state.write().unwrap();
                    state.status = MeshStatus::Disconnected;
                    state.parent = None;
                    state.layer = 0;
                }
                self.notify(MeshEvent::Disconnected);
            }
            TransportEvent::ChildConnected { child } => {
                info!("child connected: {}", child);
                self.refresh_routes();
                self.notify(MeshEvent::ChildConnected { child });
            }
            TransportEvent::ChildDisconnected { child } => {
                warn!("child disconnected: {}", child);
                self.refresh_routes();
                self.notify(MeshEvent::ChildDisconnected { child });
            }
            TransportEvent::RootSwitched => {
                let is_root = self.transport.is_root();
                let layer = self.transport.layer();
                {
                    let mut state = self.state.write().unwrap();
                    state.is_root = is_root;
                    state.layer = layer;
                    state.status = if is_root {
                        MeshStatus::Root
                    } else {
                        MeshStatus::Connected
                    };
                }
                info!("root status changed: root={} layer={}", is_root, layer);
                self.notify(MeshEvent::RootChanged { is_root });
            }
            TransportEvent::RoutingTableAdded | TransportEvent::RoutingTableRemoved => {
                self.refresh_routes();
                let nodes = self.state.read().unwrap().routes.len();
                debug!("route table changed: {} nodes", nodes);
                self.notify(MeshEvent::RouteTableChanged { nodes });
            }
            TransportEvent::NoParentFound => {
                if !self.options.transport.allow_root {
                    info!("no parent found; root not allowed, continuing scan");
                    return;
                }
                // Recovery path, not an error: a node with no peers still
                // becomes a usable access point. Self-organization is
                // disabled so the promoted identity stays stable.
                info!("no parent found within election window; promoting self to root");
                if let Err(e) = self.transport.promote_to_root() {
                    error!("root promotion failed: {}", e);
                    return;
                }
                if let Err(e) = self.transport.set_self_organized(false) {
                    warn!("could not disable self-organization: {}", e);
                }
                {
                    let mut state = self.state.write().unwrap();
                    state.is_root = true;
                    state.layer = 1;
                    state.parent = None;
                    state.status = MeshStatus::Root;
                }
                self.spawn_rx_task(data, shutdown.clone());
                self.notify(MeshEvent::RootChanged { is_root: true });
            }
            TransportEvent::LayerChanged { layer } => {
                debug!("layer changed to {}", layer);
                self.state.write().unwrap().layer = layer;
            }
            TransportEvent::ExternalStationConnected { station, ip } => {
                let clients = {
                    let mut state = self.state.write().unwrap();
                    state.external_ap.clients = state.external_ap.clients.saturating_add(1);
                    state.external_ap.clients
                };
                info!("external station {} connected with {} ({} total)", station, ip, clients);
                self.notify(MeshEvent::ExternalStationConnected { station, ip });
            }
            TransportEvent::ExternalStationDisconnected { station } => {
                let mut state = self.state.write().unwrap();
                state.external_ap.clients = state.external_ap.clients.saturating_sub(1);
                info!(
                    "external station {} disconnected ({} remain)",
                    station, state.external_ap.clients
                );
            }
        }
    }
}

async fn run_event_loop(
    inner: Arc<ManagerInner>,
    streams: TransportStreams,
    mut shutdown: watch::Receiver<bool>,
) {
    let TransportStreams { mut events, data } = streams;
    let mut data = Some(data);
    debug!("mesh event loop running");
    loop {
        tokio::select! {
            maybe = events.recv() => match maybe {
                Some(event) => inner.handle_event(event, &mut data, &shutdown),
                None => {
                    debug!("transport event stream closed");
                    break;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("mesh event loop terminated");
}

async fn run_rx_task(
    inner: Arc<ManagerInner>,
    mut data: mpsc::Receiver<(MeshNodeId, Bytes)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rx_count: u64 = 0;
    loop {
        tokio::select! {
            maybe = data.recv() => match maybe {
                Some((src, payload)) => {
                    rx_count += 1;
                    debug!("rx #{}: {} bytes from {}", rx_count, payload.len(), src);
                    let handler = inner.data_handler.read().unwrap().clone();
                    match handler {
                        Some(handler) => handler.on_mesh_data(src, &payload),
                        None => debug!("no data handler registered; payload dropped"),
                    }
                }
                None => {
                    debug!("transport data stream closed");
                    break;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("mesh rx task stopped ({} payloads)", rx_count);
}

async fn join_with_timeout(handle: Option<JoinHandle<()>>, name: &str) {
    if let Some(handle) = handle {
        match tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} task join error: {}", name, e),
            Err(_) => warn!("{} task did not stop within {:?}", name, TASK_STOP_TIMEOUT),
        }
    }
}
