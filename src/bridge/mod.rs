//! # IP Bridge
//!
//! Tunnels IP packets between subnets by wrapping them in bridge frames
//! and handing them to the mesh manager's point-to-point send. Outbound
//! packets pass through a bounded, lossy forward queue drained by a
//! dedicated task; inbound mesh payloads are validated step by step and
//! the surviving IP packets go to a caller-supplied [`LocalDelivery`]
//! sink.
//!
//! Forwarding is best-effort by design: a full queue drops the packet
//! rather than blocking the caller, and a failed send is logged, counted
//! and never retried. Drops are observable only through [`BridgeStats`],
//! never as errors crossing the bridge boundary after enqueue.

pub mod frame;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::addressing::{MeshNodeId, SubnetId};
use crate::error::{MeshError, Result};
use crate::mesh::{MeshDataHandler, MeshManager};

use frame::{BridgeHeader, BRIDGE_VERSION, HEADER_LEN};

const TASK_STOP_TIMEOUT: Duration = Duration::from_millis(1000);

/// Mirrors the `[bridge]` config section.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Forward queue depth; overflow drops the newest packet.
    pub queue_size: usize,
    /// Largest IP packet accepted for bridging.
    pub mtu: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        BridgeOptions {
            queue_size: 8,
            mtu: 1500,
        }
    }
}

/// Co-resident payload kinds (e.g. the chat relay) register one of these.
/// Every received mesh payload is offered to every interpreter before the
/// bridge inspects it; implementations must be side-effect-free for
/// payloads whose signature is not theirs.
pub trait PayloadInterpreter: Send + Sync {
    fn on_payload(&self, src: MeshNodeId, data: &[u8]);
}

/// Receives validated inbound IP packets for local delivery. How the
/// packet reaches the local network stack is the embedder's decision;
/// without a sink the bridge only counts and logs.
pub trait LocalDelivery: Send + Sync {
    fn deliver(&self, src_subnet: SubnetId, packet: &[u8]);
}

/// A packet queued for asynchronous transmission. Owned by the queue
/// until the forwarding task releases it after one send attempt.
struct ForwardJob {
    dest: MeshNodeId,
    frame: Bytes,
}

/// Running byte/packet counters. Per-packet failures update these and
/// nothing else.
#[derive(Default)]
pub struct BridgeStats {
    packets_tx: AtomicU64,
    packets_rx: AtomicU64,
    bytes_tx: AtomicU64,
    bytes_rx: AtomicU64,
    tx_dropped: AtomicU64,
    tx_failed: AtomicU64,
    rx_truncated: AtomicU64,
    rx_corrupted: AtomicU64,
    rx_unsupported: AtomicU64,
    rx_foreign: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStatsSnapshot {
    pub packets_tx: u64,
    pub packets_rx: u64,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub tx_dropped: u64,
    pub tx_failed: u64,
    pub rx_truncated: u64,
    pub rx_corrupted: u64,
    pub rx_unsupported: u64,
    pub rx_foreign: u64,
}

impl BridgeStats {
    fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            packets_tx: self.packets_tx.load(Ordering::Relaxed),
            packets_rx: self.packets_rx.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            tx_failed: self.tx_failed.load(Ordering::Relaxed),
            rx_truncated: self.rx_truncated.load(Ordering::Relaxed),
            rx_corrupted: self.rx_corrupted.load(Ordering::Relaxed),
            rx_unsupported: self.rx_unsupported.load(Ordering::Relaxed),
            rx_foreign: self.rx_foreign.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.packets_tx.store(0, Ordering::Relaxed);
        self.packets_rx.store(0, Ordering::Relaxed);
        self.bytes_tx.store(0, Ordering::Relaxed);
        self.bytes_rx.store(0, Ordering::Relaxed);
        self.tx_dropped.store(0, Ordering::Relaxed);
        self.tx_failed.store(0, Ordering::Relaxed);
        self.rx_truncated.store(0, Ordering::Relaxed);
        self.rx_corrupted.store(0, Ordering::Relaxed);
        self.rx_unsupported.store(0, Ordering::Relaxed);
        self.rx_foreign.store(0, Ordering::Relaxed);
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct BridgeInner {
    manager: MeshManager,
    options: BridgeOptions,
    enabled: AtomicBool,
    queue: Mutex<Option<mpsc::Sender<ForwardJob>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<watch::Sender<bool>>,
    stats: BridgeStats,
    interpreters: RwLock<Vec<Arc<dyn PayloadInterpreter>>>,
    delivery: RwLock<Option<Arc<dyn LocalDelivery>>>,
}

/// Handle to the bridge. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct IpBridge {
    inner: Arc<BridgeInner>,
}

impl IpBridge {
    pub fn new(manager: MeshManager, options: BridgeOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        IpBridge {
            inner: Arc::new(BridgeInner {
                manager,
                options,
                enabled: AtomicBool::new(false),
                queue: Mutex::new(None),
                task: Mutex::new(None),
                shutdown: Mutex::new(shutdown),
                stats: BridgeStats::default(),
                interpreters: RwLock::new(Vec::new()),
                delivery: RwLock::new(None),
            }),
        }
    }

    /// Start bridging. Requires the mesh to report connected or root;
    /// idempotent while enabled. Registers the bridge as the manager's
    /// data-callback consumer.
    pub fn enable(&self) -> Result<()> {
        if self.inner.enabled.load(Ordering::SeqCst) {
            warn!("bridge already enabled");
            return Ok(());
        }
        if !self.inner.manager.is_connected() {
            return Err(MeshError::InvalidState("mesh not connected"));
        }
        info!(
            "enabling IP bridge: queue={} mtu={}",
            self.inner.options.queue_size, self.inner.options.mtu
        );

        let (tx, rx) = mpsc::channel(self.inner.options.queue_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.inner.queue.lock().unwrap() = Some(tx);
        *self.inner.shutdown.lock().unwrap() = shutdown_tx;
        self.inner.stats.reset();

        let inner = self.inner.clone();
        let handle = tokio::spawn(run_forward_task(inner, rx, shutdown_rx));
        *self.inner.task.lock().unwrap() = Some(handle);

        self.inner.manager.set_data_handler(self.inner.clone());
        self.inner.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop bridging: unregister, drain and free queued jobs, terminate
    /// the forwarding task. Idempotent.
    pub async fn disable(&self) -> Result<()> {
        if !self.inner.enabled.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("disabling IP bridge");
        self.inner.manager.clear_data_handler();

        // Dropping the sender closes the queue; undelivered jobs are freed
        // when the receiver side winds down.
        self.inner.queue.lock().unwrap().take();
        let _ = self.inner.shutdown.lock().unwrap().send(true);

        let handle = self.inner.task.lock().unwrap().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("forward task join error: {}", e),
                Err(_) => warn!("forward task did not stop within {:?}", TASK_STOP_TIMEOUT),
            }
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Queue an IP packet for forwarding to the mesh node owning the
    /// destination subnet. Never blocks: a full queue drops the packet and
    /// reports `ResourceExhausted`. A destination already on the local
    /// subnet is success without bridging.
    pub fn forward(&self, dest_ip: Ipv4Addr, packet: &[u8]) -> Result<()> {
        let inner = &self.inner;
        if !inner.enabled.load(Ordering::SeqCst) {
            return Err(MeshError::InvalidState("bridge not enabled"));
        }
        if packet.is_empty() {
            return Err(MeshError::InvalidArgument("empty packet"));
        }
        if packet.len() > inner.options.mtu {
            return Err(MeshError::InvalidArgument("packet exceeds bridge mtu"));
        }
        let dest_subnet = SubnetId::from_ip(dest_ip)
            .ok_or(MeshError::InvalidArgument("destination not a mesh subnet"))?;
        let my_subnet = inner.manager.get_subnet_id();
        if dest_subnet == my_subnet {
            debug!("destination {} on local subnet, not bridging", dest_ip);
            return Ok(());
        }

        let node = inner.manager.find_node_by_subnet(dest_subnet)?;
        let frame = frame::encode_frame(my_subnet, dest_subnet, packet);
        let job = ForwardJob {
            dest: node.node_id,
            frame,
        };

        let queue = inner.queue.lock().unwrap();
        let tx = queue
            .as_ref()
            .ok_or(MeshError::InvalidState("bridge not enabled"))?;
        match tx.try_send(job) {
            Ok(()) => {
                debug!(
                    "queued {} byte packet for subnet {} via {}",
                    packet.len(),
                    dest_subnet,
                    node.node_id
                );
                Ok(())
            }
            Err(_) => {
                BridgeStats::inc(&inner.stats.tx_dropped);
                warn!("forward queue full, dropping packet for subnet {}", dest_subnet);
                Err(MeshError::ResourceExhausted("forward queue full"))
            }
        }
    }

    /// Register a co-resident payload interpreter (chat, etc.).
    pub fn register_interpreter(&self, interpreter: Arc<dyn PayloadInterpreter>) {
        self.inner.interpreters.write().unwrap().push(interpreter);
    }

    pub fn set_local_delivery(&self, sink: Arc<dyn LocalDelivery>) {
        *self.inner.delivery.write().unwrap() = Some(sink);
    }

    pub fn stats(&self) -> BridgeStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl MeshDataHandler for IpBridge {
    fn on_mesh_data(&self, src: MeshNodeId, data: &[u8]) {
        self.inner.on_mesh_data(src, data)
    }
}

impl MeshDataHandler for BridgeInner {
    fn on_mesh_data(&self, src: MeshNodeId, data: &[u8]) {
        // Other payload kinds share the transport; offer the bytes to
        // every interpreter first. Non-matching interpreters must treat
        // this as a no-op.
        let interpreters = self.interpreters.read().unwrap().clone();
        for interpreter in &interpreters {
            interpreter.on_payload(src, data);
        }

        // Too short or wrong magic: not a bridge frame, likely a payload
        // kind handled above. Ignore silently.
        let header = match BridgeHeader::peek(data) {
            Some(header) => header,
            None => return,
        };

        if header.version != BRIDGE_VERSION {
            warn!("unsupported bridge frame version {} from {}", header.version, src);
            BridgeStats::inc(&self.stats.rx_unsupported);
            return;
        }

        // Declared payload must be physically present before the checksum
        // is even looked at.
        let declared = header.payload_len as usize;
        if data.len() < HEADER_LEN + declared {
            warn!(
                "truncated bridge frame from {}: declared {} bytes, got {}",
                src,
                declared,
                data.len() - HEADER_LEN
            );
            BridgeStats::inc(&self.stats.rx_truncated);
            return;
        }

        let my_subnet = self.manager.get_subnet_id();
        if header.dest_subnet != my_subnet {
            // Mesh send is point-to-point, so this indicates a routing
            // error upstream. Not our traffic.
            warn!(
                "bridge frame from {} for foreign subnet {} (ours {})",
                src, header.dest_subnet, my_subnet
            );
            BridgeStats::inc(&self.stats.rx_foreign);
            return;
        }

        let payload = &data[HEADER_LEN..HEADER_LEN + declared];
        if !frame::verify_checksum(payload, header.checksum) {
            warn!("bridge frame checksum mismatch from {}", src);
            BridgeStats::inc(&self.stats.rx_corrupted);
            return;
        }

        self.stats.packets_rx.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_rx
            .fetch_add(declared as u64, Ordering::Relaxed);
        debug!(
            "bridged packet received: {} bytes from subnet {} via {}",
            declared, header.src_subnet, src
        );

        let sink = self.delivery.read().unwrap().clone();
        match sink {
            Some(sink) => sink.deliver(header.src_subnet, payload),
            None => debug!("no local delivery sink; packet counted only"),
        }
    }
}

/// Drains the forward queue, one transport send per job. At-most-once:
/// failures are logged and counted, never re-enqueued.
async fn run_forward_task(
    inner: Arc<BridgeInner>,
    mut rx: mpsc::Receiver<ForwardJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("bridge forward task running");
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(job) => {
                    let len = job.frame.len() as u64;
                    match inner.manager.send_to(job.dest, job.frame) {
                        Ok(()) => {
                            inner.stats.packets_tx.fetch_add(1, Ordering::Relaxed);
                            inner.stats.bytes_tx.fetch_add(len, Ordering::Relaxed);
                        }
                        Err(e) => {
                            BridgeStats::inc(&inner.stats.tx_failed);
                            warn!("failed to forward packet to {}: {}", job.dest, e);
                        }
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("bridge forward task stopped");
}
