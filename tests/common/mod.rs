//! Shared fixtures for the integration tests: a recording observer, a
//! recording delivery sink, and polling helpers for the simulated mesh.

#![allow(dead_code)] // not every test file uses every helper

use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshgate::addressing::MeshNodeId;
use meshgate::bridge::LocalDelivery;
use meshgate::mesh::sim::{SimNetwork, SimTransport};
use meshgate::mesh::{MeshEvent, MeshManager, MeshObserver, MeshOptions};
use meshgate::SubnetId;

/// Short election window so tests form a mesh quickly.
pub const ELECTION_WINDOW: Duration = Duration::from_millis(30);

pub fn node_id(last: u8) -> MeshNodeId {
    MeshNodeId::new([0x24, 0x6f, 0x28, 0x00, 0x00, last])
}

/// Observer that records every event for later assertions.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<MeshEvent>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<MeshEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, wanted: &MeshEvent) -> bool {
        self.events.lock().unwrap().iter().any(|e| e == wanted)
    }
}

impl MeshObserver for Recorder {
    fn on_mesh_event(&self, event: MeshEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Delivery sink that records inbound bridged packets.
#[derive(Default)]
pub struct SinkRecorder {
    packets: Mutex<Vec<(SubnetId, Vec<u8>)>>,
}

impl SinkRecorder {
    pub fn packets(&self) -> Vec<(SubnetId, Vec<u8>)> {
        self.packets.lock().unwrap().clone()
    }
}

impl LocalDelivery for SinkRecorder {
    fn deliver(&self, src_subnet: SubnetId, packet: &[u8]) {
        self.packets
            .lock()
            .unwrap()
            .push((src_subnet, packet.to_vec()));
    }
}

/// Create, initialize and start one node on the network.
pub fn started_node(
    net: &SimNetwork,
    last: u8,
    options: MeshOptions,
) -> (MeshManager, Arc<SimTransport>, Arc<Recorder>) {
    let transport = net.create_node(node_id(last));
    let recorder = Arc::new(Recorder::default());
    let manager = MeshManager::new(transport.clone(), options, Some(recorder.clone()));
    manager.initialize().expect("initialize");
    manager.start().expect("start");
    (manager, transport, recorder)
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for a node to reach root status.
pub async fn wait_for_root(manager: &MeshManager) {
    assert!(
        wait_until(Duration::from_secs(2), || manager.is_root()).await,
        "node {} never became root",
        manager.node_addr()
    );
}

/// Wait for a node to report connectivity (child or root).
pub async fn wait_for_connected(manager: &MeshManager) {
    assert!(
        wait_until(Duration::from_secs(2), || manager.is_connected()).await,
        "node {} never connected",
        manager.node_addr()
    );
}
