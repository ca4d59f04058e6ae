//! Multi-node routing scenarios: bootstrap convergence and table-driven
//! discovery over loopback transports.

use std::sync::Arc;
use std::time::Duration;

use lattica::{AppProtocolVersion, BoundPeer, Keypair, Transport};

const PING_TIMEOUT: Duration = Duration::from_secs(1);
const FIND_TIMEOUT: Duration = Duration::from_secs(1);
const BOOTSTRAP_DEPTH: usize = 2;

struct TestNode {
    transport: Arc<Transport>,
    bound: BoundPeer,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn spawn_node(version: AppProtocolVersion) -> TestNode {
    init_tracing();
    let keypair = Keypair::generate();
    let transport = Arc::new(
        Transport::builder()
            .keypair(keypair)
            .app_version(version)
            .host("127.0.0.1")
            .build()
            .expect("build failed"),
    );
    transport.start().await.expect("start failed");
    {
        let transport = transport.clone();
        tokio::spawn(async move {
            let _ = transport.run().await;
        });
    }
    transport.wait_for_running().await;
    let bound = transport.self_bound().await.expect("no bound peer");
    TestNode { transport, bound }
}

fn network_version() -> AppProtocolVersion {
    let operator = Keypair::generate();
    AppProtocolVersion::signed(1, b"routing-testnet".to_vec(), &operator)
}

#[tokio::test]
async fn bootstrap_converges_across_nodes() {
    let version = network_version();
    let mut nodes = Vec::new();
    for _ in 0..6 {
        nodes.push(spawn_node(version.clone()).await);
    }

    // Every node bootstraps from node 0.
    let seed = nodes[0].bound.clone();
    for node in nodes.iter().skip(1) {
        let routing = node.transport.routing().await.unwrap();
        let live = routing
            .bootstrap(
                std::slice::from_ref(&seed),
                PING_TIMEOUT,
                FIND_TIMEOUT,
                BOOTSTRAP_DEPTH,
            )
            .await;
        assert_eq!(live, 1, "seed should be reachable");
    }

    // Give liveness updates a moment to settle.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Every table is non-empty after bootstrap.
    for (i, node) in nodes.iter().enumerate() {
        let routing = node.transport.routing().await.unwrap();
        assert!(
            routing.len().await >= 1,
            "node {} has an empty routing table",
            i
        );
    }

    // PING succeeds between any pair.
    for i in 0..nodes.len() {
        for j in 0..nodes.len() {
            if i == j {
                continue;
            }
            nodes[i]
                .transport
                .ping(&nodes[j].bound, PING_TIMEOUT)
                .await
                .unwrap_or_else(|e| panic!("ping {} -> {} failed: {}", i, j, e));
        }
    }
}

#[tokio::test]
async fn later_nodes_discover_earlier_ones_through_seed() {
    let version = network_version();
    let seed = spawn_node(version.clone()).await;
    let first = spawn_node(version.clone()).await;
    let second = spawn_node(version.clone()).await;

    let first_routing = first.transport.routing().await.unwrap();
    first_routing
        .bootstrap(
            std::slice::from_ref(&seed.bound),
            PING_TIMEOUT,
            FIND_TIMEOUT,
            BOOTSTRAP_DEPTH,
        )
        .await;

    // The seed learned `first` from its inbound ping.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let seed_routing = seed.transport.routing().await.unwrap();
    assert!(seed_routing.len().await >= 1, "seed learned nothing");

    // A later joiner's self-lookup through the seed discovers `first`.
    let second_routing = second.transport.routing().await.unwrap();
    second_routing
        .bootstrap(
            std::slice::from_ref(&seed.bound),
            PING_TIMEOUT,
            FIND_TIMEOUT,
            BOOTSTRAP_DEPTH,
        )
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let peers = second_routing.peers_to_broadcast(None).await;
    assert!(
        peers.iter().any(|p| p.address() == first.bound.address()),
        "second node never learned about the first"
    );
}

#[tokio::test]
async fn find_specific_peer_locates_target_via_seed() {
    let version = network_version();
    let seed = spawn_node(version.clone()).await;
    let target = spawn_node(version.clone()).await;
    let searcher = spawn_node(version.clone()).await;

    // Teach the seed about the target.
    target
        .transport
        .ping(&seed.bound, PING_TIMEOUT)
        .await
        .expect("target ping failed");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let routing = searcher.transport.routing().await.unwrap();
    let found = routing
        .find_specific_peer(target.bound.address(), &seed.bound, 3, FIND_TIMEOUT)
        .await
        .expect("lookup failed");

    assert_eq!(
        found.map(|p| p.address()),
        Some(target.bound.address()),
        "target not found through seed"
    );
}
