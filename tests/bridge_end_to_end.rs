//! Two-node bridging across the simulated mesh: outbound framing, mesh
//! transit, inbound validation and local delivery.

mod common;

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use common::*;
use meshgate::bridge::{BridgeOptions, IpBridge, PayloadInterpreter};
use meshgate::mesh::sim::SimNetwork;
use meshgate::mesh::MeshOptions;
use meshgate::{MeshError, MeshNodeId};

/// Counts payload offers; side-effect free for non-matching payloads,
/// like the chat relay this hook exists for.
#[derive(Default)]
struct CountingInterpreter {
    seen: Mutex<Vec<Vec<u8>>>,
}

impl CountingInterpreter {
    fn seen(&self) -> Vec<Vec<u8>> {
        self.seen.lock().unwrap().clone()
    }
}

impl PayloadInterpreter for CountingInterpreter {
    fn on_payload(&self, _src: MeshNodeId, data: &[u8]) {
        self.seen.lock().unwrap().push(data.to_vec());
    }
}

struct TwoNodes {
    root: meshgate::mesh::MeshManager,
    child: meshgate::mesh::MeshManager,
}

async fn two_node_mesh() -> (SimNetwork, TwoNodes) {
    let net = SimNetwork::with_election_window(ELECTION_WINDOW);
    let (root, _, _) = started_node(&net, 0x01, MeshOptions::default());
    wait_for_root(&root).await;
    let (child, _, _) = started_node(&net, 0x02, MeshOptions::default());
    wait_for_connected(&child).await;
    (net, TwoNodes { root, child })
}

#[tokio::test]
async fn packet_is_bridged_between_subnets() {
    let (_net, nodes) = two_node_mesh().await;

    let root_bridge = IpBridge::new(nodes.root.clone(), BridgeOptions::default());
    let root_sink = Arc::new(SinkRecorder::default());
    root_bridge.set_local_delivery(root_sink.clone());
    root_bridge.enable().unwrap();

    let child_bridge = IpBridge::new(nodes.child.clone(), BridgeOptions::default());
    child_bridge.enable().unwrap();

    // Root address ends in 0x01: subnet 1, prefix 192.168.11.0/24.
    let dest = Ipv4Addr::new(192, 168, 11, 42);
    let payload = b"pretend this is an IP packet";
    child_bridge.forward(dest, payload).unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || !root_sink.packets().is_empty()).await,
        "packet never delivered"
    );
    let delivered = root_sink.packets();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, node_id(0x02).subnet_id());
    assert_eq!(delivered[0].1, payload);

    let tx = child_bridge.stats();
    assert_eq!(tx.packets_tx, 1);
    assert!(tx.bytes_tx as usize > payload.len()); // frame includes header
    let rx = root_bridge.stats();
    assert_eq!(rx.packets_rx, 1);
    assert_eq!(rx.bytes_rx as usize, payload.len());

    child_bridge.disable().await.unwrap();
    root_bridge.disable().await.unwrap();
    nodes.child.stop().await.unwrap();
    nodes.root.stop().await.unwrap();
}

#[tokio::test]
async fn interpreters_are_offered_every_payload() {
    let (_net, nodes) = two_node_mesh().await;

    let root_bridge = IpBridge::new(nodes.root.clone(), BridgeOptions::default());
    let interpreter = Arc::new(CountingInterpreter::default());
    root_bridge.register_interpreter(interpreter.clone());
    root_bridge.enable().unwrap();

    // A raw non-bridge payload (chat-style) reaches the interpreter but
    // leaves the bridge counters untouched.
    let chat = Bytes::from_static(b"CHAT hello everyone");
    nodes.child.send_to(node_id(0x01), chat.clone()).unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || !interpreter.seen().is_empty()).await,
        "payload never offered"
    );
    assert_eq!(interpreter.seen()[0], chat.to_vec());
    let stats = root_bridge.stats();
    assert_eq!(stats.packets_rx, 0);
    assert_eq!(stats.rx_corrupted, 0);

    root_bridge.disable().await.unwrap();
    nodes.child.stop().await.unwrap();
    nodes.root.stop().await.unwrap();
}

#[tokio::test]
async fn bridge_enable_requires_connectivity() {
    let net = SimNetwork::with_election_window(ELECTION_WINDOW);
    let mut options = MeshOptions::default();
    options.transport.allow_root = false; // stays scanning forever
    let (manager, _, _) = started_node(&net, 0x03, options);

    let bridge = IpBridge::new(manager.clone(), BridgeOptions::default());
    assert!(matches!(bridge.enable(), Err(MeshError::InvalidState(_))));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn forward_edge_cases() {
    let (_net, nodes) = two_node_mesh().await;

    let bridge = IpBridge::new(nodes.child.clone(), BridgeOptions::default());

    // Disabled bridge refuses outright.
    assert!(matches!(
        bridge.forward(Ipv4Addr::new(192, 168, 11, 1), b"x"),
        Err(MeshError::InvalidState(_))
    ));

    bridge.enable().unwrap();
    bridge.enable().unwrap(); // idempotent

    // Child address ends in 0x02: its own subnet is 192.168.12.0/24.
    // Local destinations succeed without bridging anything.
    bridge.forward(Ipv4Addr::new(192, 168, 12, 9), b"local").unwrap();

    assert!(matches!(
        bridge.forward(Ipv4Addr::new(192, 168, 11, 1), b""),
        Err(MeshError::InvalidArgument(_))
    ));
    let oversized = vec![0u8; 1501];
    assert!(matches!(
        bridge.forward(Ipv4Addr::new(192, 168, 11, 1), &oversized),
        Err(MeshError::InvalidArgument(_))
    ));
    // 192.168.1.x is not a mesh subnet at all.
    assert!(matches!(
        bridge.forward(Ipv4Addr::new(192, 168, 1, 1), b"x"),
        Err(MeshError::InvalidArgument(_))
    ));
    // Subnet 200 has no owning node.
    assert!(matches!(
        bridge.forward(Ipv4Addr::new(192, 168, 210, 1), b"x"),
        Err(MeshError::NotFound(_))
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = bridge.stats();
    assert_eq!(stats.packets_tx, 0); // nothing was actually bridged

    bridge.disable().await.unwrap();
    bridge.disable().await.unwrap(); // idempotent
    nodes.child.stop().await.unwrap();
    nodes.root.stop().await.unwrap();
}
