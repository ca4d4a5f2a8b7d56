//! Gossip and peer-lifecycle integration tests: line-topology convergence
//! and inactive-peer cleanup on real sockets.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::time::{sleep, timeout};

use placard::{Node, NodeConfig, PeerEvent};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn gossip_config(name: &str, interval: Duration) -> NodeConfig {
    let mut config = NodeConfig::new(name);
    config.force_localhost = true;
    config.stun_server = None;
    config.gossip_interval = interval;
    config
}

#[tokio::test]
async fn line_topology_reaches_full_mesh_tables() {
    // Four nodes in a line; each node is seeded only with its left neighbor
    let interval = Duration::from_secs(2);
    let mut nodes = Vec::new();
    for i in 0..4 {
        let node = Node::start(gossip_config(&format!("line-{i}"), interval))
            .await
            .unwrap();
        if let Some(prev) = nodes.last() {
            let prev: &Node = prev;
            node.add_donor(LOCALHOST, prev.local_addr().port()).await;
        }
        nodes.push(node);
        // Let each handshake settle before extending the line
        sleep(Duration::from_millis(300)).await;
    }

    let everyone: Vec<String> = nodes.iter().map(|n| n.device_id().to_string()).collect();
    let deadline = Duration::from_secs(15);

    let converged = timeout(deadline, async {
        loop {
            let mut full_mesh = true;
            for node in &nodes {
                let known: Vec<String> = node
                    .peers()
                    .await
                    .into_iter()
                    .map(|p| p.device_id)
                    .collect();
                if !everyone.iter().all(|id| known.contains(id)) {
                    full_mesh = false;
                    break;
                }
            }
            if full_mesh {
                return;
            }
            sleep(Duration::from_millis(500)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "line topology did not converge to full mesh");

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn gossiped_peers_stay_unauthenticated_until_handshake() {
    let interval = Duration::from_secs(1);
    let a = Node::start(gossip_config("tri-a", interval)).await.unwrap();
    let b = Node::start(gossip_config("tri-b", interval)).await.unwrap();
    let c = Node::start(gossip_config("tri-c", interval)).await.unwrap();

    // a <-> b and b <-> c handshake; a learns c only via gossip
    a.add_donor(LOCALHOST, b.local_addr().port()).await;
    c.add_donor(LOCALHOST, b.local_addr().port()).await;

    let learned = timeout(Duration::from_secs(10), async {
        loop {
            if a.peers().await.iter().any(|p| p.device_id == "tri-c") {
                return;
            }
            sleep(Duration::from_millis(200)).await;
        }
    })
    .await;
    assert!(learned.is_ok(), "a never learned about c via gossip");

    let c_entry = a
        .peers()
        .await
        .into_iter()
        .find(|p| p.device_id == "tri-c")
        .unwrap();
    assert!(
        !c_entry.authenticated,
        "gossip must not confer authentication"
    );

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn inactive_authenticated_peer_is_swept() {
    let mut config = gossip_config("sweep-a", Duration::from_secs(60));
    config.message_timeout = Duration::from_secs(1);
    config.peer_cleanup_interval = Duration::from_secs(2);
    let a = Node::start(config).await.unwrap();
    let b = Node::start(gossip_config("sweep-b", Duration::from_secs(60)))
        .await
        .unwrap();

    let mut events = a.events();
    a.add_donor(LOCALHOST, b.local_addr().port()).await;

    // Wait until b is authenticated on a's side
    let authed = timeout(Duration::from_secs(10), async {
        loop {
            if a.peers()
                .await
                .iter()
                .any(|p| p.device_id == "sweep-b" && p.authenticated)
            {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(authed.is_ok(), "handshake did not complete");

    // b goes silent; with message_timeout=1s the cutoff is 2s and the sweep
    // runs every 2s, so eviction lands within a few seconds
    b.stop().await;
    let swept = timeout(Duration::from_secs(6), async {
        loop {
            if !a.peers().await.iter().any(|p| p.device_id == "sweep-b") {
                return;
            }
            sleep(Duration::from_millis(200)).await;
        }
    })
    .await;
    assert!(swept.is_ok(), "inactive peer was not evicted");

    // The eviction was announced
    let expired = timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Ok(PeerEvent::Expired { device_id }) if device_id == "sweep-b" => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await;
    assert!(matches!(expired, Ok(true)), "expected an Expired event");

    a.stop().await;
}
