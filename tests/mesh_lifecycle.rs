//! Mesh manager state-machine behavior over the simulated transport.

mod common;

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use meshgate::mesh::sim::SimNetwork;
use meshgate::mesh::{MeshEvent, MeshManager, MeshOptions, MeshStatus, TransportEvent};
use meshgate::{MeshError, MeshNodeId};

fn net() -> SimNetwork {
    SimNetwork::with_election_window(ELECTION_WINDOW)
}

#[tokio::test]
async fn lone_node_promotes_itself_to_root() {
    let net = net();
    let (manager, _, recorder) = started_node(&net, 0x01, MeshOptions::default());
    wait_for_root(&manager).await;

    assert_eq!(manager.get_status(), MeshStatus::Root);
    assert_eq!(manager.get_layer(), 1);
    assert!(manager.is_connected());
    assert!(matches!(manager.get_parent(), Err(MeshError::NotFound(_))));
    assert!(recorder.contains(&MeshEvent::RootChanged { is_root: true }));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn start_before_initialize_is_rejected() {
    let net = net();
    let transport = net.create_node(node_id(0x01));
    let manager = MeshManager::new(transport, MeshOptions::default(), None);
    assert!(matches!(manager.start(), Err(MeshError::InvalidState(_))));
}

#[tokio::test]
async fn initialize_failure_is_fatal_but_retryable() {
    let net = net();
    let transport = net.create_node(node_id(0x01));
    transport.set_initialize_failure(true);
    let manager = MeshManager::new(transport.clone(), MeshOptions::default(), None);
    assert!(matches!(manager.initialize(), Err(MeshError::Transport(_))));

    transport.set_initialize_failure(false);
    manager.initialize().expect("retry succeeds");
    manager.start().expect("start after retry");
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn double_start_is_a_noop_success() {
    let net = net();
    let (manager, _, _) = started_node(&net, 0x01, MeshOptions::default());
    wait_for_root(&manager).await;

    manager.start().expect("second start is Ok");
    assert_eq!(manager.get_status(), MeshStatus::Root);
    assert_eq!(manager.get_layer(), 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn stop_resets_all_transient_state() {
    let net = net();
    let (root, _, _) = started_node(&net, 0x01, MeshOptions::default());
    wait_for_root(&root).await;
    let (child, _, _) = started_node(&net, 0x02, MeshOptions::default());
    wait_for_connected(&child).await;
    assert!(child.get_node_count() > 0);

    child.stop().await.unwrap();
    assert_eq!(child.get_status(), MeshStatus::Stopped);
    assert_eq!(child.get_layer(), 0);
    assert!(!child.is_root());
    assert!(matches!(child.get_parent(), Err(MeshError::NotFound(_))));

    // stop() is idempotent
    child.stop().await.unwrap();
    assert_eq!(child.get_status(), MeshStatus::Stopped);

    root.stop().await.unwrap();
}

#[tokio::test]
async fn second_node_attaches_as_child_of_root() {
    let net = net();
    let (root, _, root_events) = started_node(&net, 0x01, MeshOptions::default());
    wait_for_root(&root).await;

    let (child, _, _) = started_node(&net, 0x02, MeshOptions::default());
    wait_for_connected(&child).await;

    assert_eq!(child.get_status(), MeshStatus::Connected);
    assert_eq!(child.get_layer(), 2);
    assert_eq!(child.get_parent().unwrap(), node_id(0x01));
    assert!(root_events.contains(&MeshEvent::ChildConnected {
        child: node_id(0x02)
    }));

    // Both sides see each other in discovery.
    assert!(wait_until(Duration::from_secs(1), || root.get_node_count() == 1).await);
    let nodes = root.get_nodes(10);
    assert_eq!(nodes[0].node_id, node_id(0x02));
    assert_eq!(child.find_node_by_subnet(node_id(0x01).subnet_id()).unwrap().node_id, node_id(0x01));

    child.stop().await.unwrap();
    root.stop().await.unwrap();
}

#[tokio::test]
async fn spurious_parent_disconnect_is_ignored_on_root() {
    let net = net();
    let (root, transport, _) = started_node(&net, 0x01, MeshOptions::default());
    wait_for_root(&root).await;

    transport.inject_event(TransportEvent::ParentDisconnected { reason: 4 });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(root.get_status(), MeshStatus::Root);
    assert_eq!(root.get_layer(), 1);

    root.stop().await.unwrap();
}

#[tokio::test]
async fn root_departure_disconnects_children() {
    let net = net();
    let (root, _, _) = started_node(&net, 0x01, MeshOptions::default());
    wait_for_root(&root).await;
    let (child, _, child_events) = started_node(&net, 0x02, MeshOptions::default());
    wait_for_connected(&child).await;

    root.stop().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(1), || {
            child.get_status() == MeshStatus::Disconnected
        })
        .await
    );
    assert!(matches!(child.get_parent(), Err(MeshError::NotFound(_))));
    assert_eq!(child.get_layer(), 0);
    assert!(child_events.contains(&MeshEvent::Disconnected));

    child.stop().await.unwrap();
}

#[tokio::test]
async fn root_not_allowed_keeps_scanning() {
    let net = net();
    let mut options = MeshOptions::default();
    options.transport.allow_root = false;
    let (manager, _, _) = started_node(&net, 0x01, options);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.get_status(), MeshStatus::Started);
    assert!(!manager.is_root());

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn send_requires_connectivity_and_valid_arguments() {
    let net = net();
    let (manager, _, _) = started_node(&net, 0x01, MeshOptions::default());

    // Still scanning: sends are refused.
    let err = manager.send_to(node_id(0x02), Bytes::from_static(b"hi"));
    assert!(matches!(err, Err(MeshError::InvalidState(_))));

    wait_for_root(&manager).await;
    assert!(matches!(
        manager.send_to(node_id(0x02), Bytes::new()),
        Err(MeshError::InvalidArgument(_))
    ));
    assert!(matches!(
        manager.send_to(MeshNodeId::ZERO, Bytes::from_static(b"hi")),
        Err(MeshError::InvalidArgument(_))
    ));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn external_ap_gating_and_client_counter() {
    let net = net();
    let transport = net.create_node(node_id(0x0a));
    let manager = MeshManager::new(transport.clone(), MeshOptions::default(), None);
    manager.initialize().unwrap();

    // Requires the mesh to be started.
    assert!(matches!(
        manager.start_external_ap("lobby", 4),
        Err(MeshError::InvalidState(_))
    ));

    manager.start().unwrap();
    wait_for_root(&manager).await;

    manager.start_external_ap("lobby", 4).unwrap();
    manager.start_external_ap("lobby", 4).unwrap(); // idempotent
    assert!(manager.external_ap_running());

    // Address ends in 0x0a: subnet 10, gateway 192.168.20.1.
    assert_eq!(
        manager.external_ap_ip().unwrap(),
        Ipv4Addr::new(192, 168, 20, 1)
    );

    let phone = MeshNodeId::new([0xaa, 0xbb, 0xcc, 0, 0, 1]);
    transport.external_station_connected(phone, Ipv4Addr::new(192, 168, 20, 100));
    assert!(
        wait_until(Duration::from_secs(1), || {
            manager.external_ap_client_count() == 1
        })
        .await
    );

    // The counter saturates at zero.
    transport.external_station_disconnected(phone);
    transport.external_station_disconnected(phone);
    assert!(
        wait_until(Duration::from_secs(1), || {
            manager.external_ap_client_count() == 0
        })
        .await
    );

    // Independently stoppable without tearing down the mesh.
    manager.stop_external_ap().unwrap();
    manager.stop_external_ap().unwrap();
    assert!(!manager.external_ap_running());
    assert!(matches!(
        manager.external_ap_ip(),
        Err(MeshError::InvalidState(_))
    ));
    assert_eq!(manager.get_status(), MeshStatus::Root);

    manager.stop().await.unwrap();
}
