//! Integration tests for the Node public API.
//!
//! These tests run real async nodes over the in-process `MemoryNetwork`, with
//! tokio's clock paused so timers and polling advance without wall-clock waits.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use meshroute::{
    Keypair, MemoryNetwork, MemoryTransport, Node, NodeId, NodeKind, PeerTable, RoutingConfig,
};
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);
const POLL: Duration = Duration::from_millis(10);

fn config() -> RoutingConfig {
    RoutingConfig {
        closest_nodes_size: 32,
        ..RoutingConfig::default()
    }
}

async fn vault(network: &MemoryNetwork) -> Node<MemoryTransport> {
    let (transport, inbound) = network.bind().expect("bind failed");
    Node::vault(Keypair::generate(), config(), transport, inbound)
        .await
        .expect("vault start failed")
}

async fn client(network: &MemoryNetwork, id: Option<NodeId>) -> Node<MemoryTransport> {
    let (transport, inbound) = network.bind().expect("bind failed");
    Node::client(Keypair::generate(), id, config(), transport, inbound)
        .await
        .expect("client start failed")
}

/// Poll `cond` until it holds or the test timeout expires.
async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    timeout(TEST_TIMEOUT, async {
        while !cond() {
            sleep(POLL).await;
        }
    })
    .await
    .is_ok()
}

/// Build a full mesh of `n` vaults, joining one at a time through the first.
async fn mesh(network: &MemoryNetwork, n: usize) -> Vec<Node<MemoryTransport>> {
    let mut vaults: Vec<Node<MemoryTransport>> = Vec::with_capacity(n);
    for _ in 0..n {
        let node = vault(network).await;
        if let Some(bootstrap) = vaults.first() {
            node.join(bootstrap.node_info()).await.expect("join failed");
        }
        vaults.push(node);
        let expected = vaults.len() - 1;
        let converged = wait_until(|| vaults.iter().all(|v| v.routing_len() == expected)).await;
        assert!(converged, "mesh of {} vaults did not converge", vaults.len());
    }
    vaults
}

async fn count_deliveries(node: &Node<MemoryTransport>, counter: Arc<AtomicUsize>) {
    let mut rx = node.deliveries().await.expect("deliveries already taken");
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
}

#[tokio::test(start_paused = true)]
async fn vault_identity_is_key_derived() {
    let network = MemoryNetwork::new();
    let keypair = Keypair::generate();
    let expected = keypair.node_id();
    let (transport, inbound) = network.bind().unwrap();
    let node = Node::vault(keypair, config(), transport, inbound).await.unwrap();

    assert_eq!(node.id(), expected);
    assert_eq!(node.kind(), NodeKind::Vault);
    assert_eq!(node.node_info().id, expected);
    assert_eq!(node.node_info().endpoints, node.endpoints());
    assert!(node.endpoints().local.ip().is_loopback());
    node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn client_keeps_its_chosen_id() {
    let network = MemoryNetwork::new();
    let chosen = NodeId::random();
    let node = client(&network, Some(chosen)).await;
    assert_eq!(node.id(), chosen);
    assert_eq!(node.kind(), NodeKind::Client);
    assert!(node.table().client_mode());
    node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn isolated_vault_cannot_reach_others() {
    let network = MemoryNetwork::new();
    let node = vault(&network).await;
    assert!(node.send(NodeId::random(), b"nowhere".to_vec()).await.is_err());
    node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn vaults_join_into_a_full_mesh() {
    let network = MemoryNetwork::new();
    let vaults = mesh(&network, 5).await;

    for v in &vaults {
        for other in &vaults {
            if other.id() != v.id() {
                assert!(v.table().get(&other.id()).is_some());
            }
        }
    }
    for v in &vaults {
        v.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn direct_message_between_vaults() {
    let network = MemoryNetwork::new();
    let vaults = mesh(&network, 3).await;
    let mut rx = vaults[2].deliveries().await.unwrap();

    vaults[0].send(vaults[2].id(), b"ping".to_vec()).await.unwrap();

    let delivery = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(delivery.data, b"ping");
    assert_eq!(delivery.source.node, vaults[0].id());
    for v in &vaults {
        v.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn client_group_send_reaches_group_size_members() {
    let network = MemoryNetwork::new();
    let vaults = mesh(&network, 6).await;
    let received = Arc::new(AtomicUsize::new(0));
    for v in &vaults {
        count_deliveries(v, received.clone()).await;
    }

    let leaf = client(&network, None).await;
    count_deliveries(&leaf, received.clone()).await;
    leaf.join(vaults[0].node_info()).await.unwrap();
    assert!(wait_until(|| leaf.routing_len() == vaults.len()).await);

    let pivot = NodeId::random();
    for i in 0..10 {
        leaf.send_group(pivot, format!("group {i}").into_bytes()).await.unwrap();
    }

    let group_size = config().node_group_size;
    assert!(wait_until(|| received.load(Ordering::SeqCst) == 10 * group_size).await);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(received.load(Ordering::SeqCst), 10 * group_size);

    leaf.shutdown().await;
    for v in &vaults {
        v.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn clients_sharing_an_id_all_receive() {
    let network = MemoryNetwork::new();
    let vaults = mesh(&network, 4).await;
    let shared = NodeId::random();
    let received = Arc::new(AtomicUsize::new(0));

    let mut clients = Vec::new();
    for _ in 0..3 {
        let c = client(&network, Some(shared)).await;
        count_deliveries(&c, received.clone()).await;
        c.join(vaults[0].node_info()).await.unwrap();
        assert!(wait_until(|| c.routing_len() == vaults.len()).await);
        clients.push(c);
    }

    vaults[1].send(shared, b"to every session".to_vec()).await.unwrap();
    assert!(wait_until(|| received.load(Ordering::SeqCst) == clients.len()).await);

    for c in &clients {
        c.shutdown().await;
    }
    for v in &vaults {
        v.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn failed_send_drops_the_peer() {
    let network = MemoryNetwork::new();
    let vaults = mesh(&network, 3).await;
    let gone = vaults[2].id();
    vaults[2].shutdown().await;

    vaults[0].send(gone, b"anyone there".to_vec()).await.unwrap();
    assert!(wait_until(|| vaults[0].table().get(&gone).is_none()).await);
    assert_eq!(vaults[0].routing_len(), 1);

    vaults[0].shutdown().await;
    vaults[1].shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn deliveries_receiver_is_taken_once() {
    let network = MemoryNetwork::new();
    let node = vault(&network).await;
    assert!(node.deliveries().await.is_ok());
    assert!(node.deliveries().await.is_err());
    node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_inbound_processing() {
    let network = MemoryNetwork::new();
    let vaults = mesh(&network, 2).await;
    let mut rx = vaults[1].deliveries().await.unwrap();

    vaults[1].shutdown().await;
    // a second shutdown finds no tasks left to join
    vaults[1].shutdown().await;

    vaults[0].send(vaults[1].id(), b"late".to_vec()).await.unwrap();
    sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());
    vaults[0].shutdown().await;
}
