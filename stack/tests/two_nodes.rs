//! End-to-end discovery and delivery between in-process mesh nodes.

use bm_net::vpd::{VirtualPortConfig, VirtualPortDevice};
use bm_net::NetworkDevice;
use bm_stack::bcmp::{Bcmp, BcmpConfig};
use bm_stack::l2::L2;
use bm_stack::pubsub::PubSub;
use bm_stack::topology::Topology;
use bm_stack::{ip, middleware, service};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

struct Node {
    l2: Arc<L2>,
    bcmp: Arc<Bcmp>,
    topology: Arc<Topology>,
    pubsub: Arc<PubSub>,
}

/// The full bring-up order, with timings tightened for tests.
async fn start_node(dir: &Path, node_id: u64, peers: &[u64]) -> Node {
    let device: Arc<dyn NetworkDevice> = Arc::new(VirtualPortDevice::new(VirtualPortConfig {
        node_id,
        peers: peers.to_vec(),
        socket_dir: dir.to_path_buf(),
    }));

    let l2 = L2::init(device, node_id).await.unwrap();
    ip::init().unwrap();
    let bcmp = Bcmp::init(
        l2.clone(),
        BcmpConfig {
            heartbeat_interval: Duration::from_millis(200),
            neighbor_timeout: Duration::from_millis(1500),
        },
    )
    .await
    .unwrap();
    let topology = Topology::init(&bcmp, l2.num_ports()).unwrap();
    service::init().unwrap();
    let pubsub = PubSub::init(l2.clone()).unwrap();
    middleware::init().unwrap();

    Node {
        l2,
        bcmp,
        topology,
        pubsub,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Duration::from_secs(10);
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(50)).await;
    }
}

fn sees(node: &Node, peer: u64) -> bool {
    node.bcmp
        .neighbors()
        .iter()
        .any(|neighbor| neighbor.node_id == peer)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_nodes_discover_each_other() {
    let dir = TempDir::new().unwrap();
    let a = start_node(dir.path(), 0x1, &[0x2]).await;
    let b = start_node(dir.path(), 0x2, &[0x1]).await;

    wait_for("a to discover b", || sees(&a, 0x2)).await;
    wait_for("b to discover a", || sees(&b, 0x1)).await;

    assert_eq!(a.topology.neighbor_on(1), Some(0x2));
    assert_eq!(b.topology.neighbor_on(1), Some(0x1));
    assert_eq!(a.l2.num_ports(), 15);

    // The echo flood goes out once both sides are connected.
    a.bcmp.send_ping().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_node_chain_stays_a_chain() {
    let dir = TempDir::new().unwrap();
    let a = start_node(dir.path(), 0xA, &[0xB]).await;
    let b = start_node(dir.path(), 0xB, &[0xA, 0xC]).await;
    let c = start_node(dir.path(), 0xC, &[0xB]).await;

    wait_for("b to discover both ends", || sees(&b, 0xA) && sees(&b, 0xC)).await;
    wait_for("a to discover b", || sees(&a, 0xB)).await;
    wait_for("c to discover b", || sees(&c, 0xB)).await;

    let mut middle: Vec<u64> = b.bcmp.neighbors().iter().map(|n| n.node_id).collect();
    middle.sort_unstable();
    assert_eq!(middle, vec![0xA, 0xC]);
    // The ends are not adjacent.
    assert!(!sees(&a, 0xC));
    assert!(!sees(&c, 0xA));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_joiner_connects_through_renegotiation() {
    let dir = TempDir::new().unwrap();
    let a = start_node(dir.path(), 0x11, &[0x22]).await;

    // Give the early node time to run through a few failed retry cycles.
    sleep(Duration::from_millis(1200)).await;
    assert!(a.bcmp.neighbors().is_empty());

    let b = start_node(dir.path(), 0x22, &[0x11]).await;
    wait_for("late joiner discovery", || sees(&a, 0x22) && sees(&b, 0x11)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pubsub_reaches_remote_subscriber() {
    let dir = TempDir::new().unwrap();
    let a = start_node(dir.path(), 0x1, &[0x2]).await;
    let b = start_node(dir.path(), 0x2, &[0x1]).await;
    wait_for("discovery", || sees(&a, 0x2) && sees(&b, 0x1)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    b.pubsub.subscribe(
        "sensors/tilt",
        Arc::new(move |src_node: u64, topic: &str, payload: &[u8]| {
            let _ = tx.send((src_node, topic.to_string(), payload.to_vec()));
        }),
    );

    a.pubsub.publish("sensors/tilt", b"reading=42").await.unwrap();

    let (src_node, topic, payload) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no pub/sub delivery")
        .unwrap();
    assert_eq!(src_node, 0x1);
    assert_eq!(topic, "sensors/tilt");
    assert_eq!(payload, b"reading=42");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_neighbor_expires_after_silence() {
    let dir = TempDir::new().unwrap();
    let a = start_node(dir.path(), 0x1, &[0x2]).await;
    let b = start_node(dir.path(), 0x2, &[0x1]).await;
    wait_for("discovery", || sees(&a, 0x2)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    a.bcmp
        .register_discovery_callback(Arc::new(
            move |discovered: bool, neighbor: &bm_stack::Neighbor| {
                if !discovered {
                    let _ = tx.send(neighbor.node_id);
                }
            },
        ));

    // Silence the peer; its heartbeats stop and the sweep retires it.
    b.l2.device().disable().await.unwrap();

    let gone = timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("neighbor never expired")
        .unwrap();
    assert_eq!(gone, 0x2);
    assert!(!sees(&a, 0x2));
    assert_eq!(a.topology.neighbor_on(1), None);
}
