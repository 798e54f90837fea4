//! Multi-node scenarios on loopback.

use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};

use stratus_common::{CacheInvalidation, ClusterMessage, OpaqueMessage, Payload, StratusError};

use super::{Cluster, ClusterConfig, GossipCluster};
use crate::pool::Tuning;

type Inbox = Arc<Mutex<Vec<ClusterMessage>>>;

struct Node {
    cluster: GossipCluster,
    inbox: Inbox,
}

impl Node {
    fn received(&self) -> usize {
        self.inbox.lock().len()
    }

    fn lan_seed(&self) -> String {
        self.cluster.lan_addr().unwrap().to_string()
    }
}

fn config(
    region: &str,
    node_id: &str,
    lan_seeds: Vec<String>,
    wan_seeds: Vec<String>,
) -> (ClusterConfig, Inbox) {
    let inbox: Inbox = Arc::default();
    let sink = inbox.clone();
    let config = ClusterConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        bind_port: 0,
        wan_bind_port: 0,
        lan_seeds,
        wan_seeds,
        lan_tuning: Tuning::local(),
        wan_tuning: Tuning::local(),
        ..ClusterConfig::new(region, node_id)
    }
    .with_handler(Arc::new(move |msg| sink.lock().push(msg)));
    (config, inbox)
}

async fn start(region: &str, node_id: &str, lan_seeds: Vec<String>, wan_seeds: Vec<String>) -> Node {
    let (config, inbox) = config(region, node_id, lan_seeds, wan_seeds);
    let cluster = GossipCluster::new(config).await.unwrap();
    Node { cluster, inbox }
}

/// Two regions of two nodes each, with `us-1` and `eu-1` as bridges
async fn two_regions() -> [Node; 4] {
    let us1 = start("us-east-1", "us-1", vec![], vec![]).await;
    assert!(wait_until(Duration::from_secs(5), || us1.cluster.is_bridge()).await);
    let wan_seed = us1.cluster.wan_addr();

    let us2 = start("us-east-1", "us-2", vec![us1.lan_seed()], vec![wan_seed.clone()]).await;
    let eu1 = start("eu-west-1", "eu-1", vec![], vec![wan_seed.clone()]).await;
    let eu2 = start("eu-west-1", "eu-2", vec![eu1.lan_seed()], vec![wan_seed]).await;

    let ready = wait_until(Duration::from_secs(20), || {
        us1.cluster.is_bridge()
            && eu1.cluster.is_bridge()
            && !us2.cluster.is_bridge()
            && !eu2.cluster.is_bridge()
            && us2.cluster.members().len() == 2
            && eu2.cluster.members().len() == 2
            && us1.cluster.wan_members().len() == 2
            && eu1.cluster.wan_members().len() == 2
    })
    .await;
    assert!(ready, "WAN members: {:?}", us1.cluster.wan_members());

    [us1, us2, eu1, eu2]
}

/// Poll `condition` until it holds or `deadline` passes
async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    condition()
}

fn bridges(nodes: &[&Node]) -> Vec<String> {
    nodes
        .iter()
        .filter(|n| n.cluster.is_bridge())
        .map(|n| n.cluster.node_id().to_string())
        .collect()
}

#[tokio::test]
async fn test_single_node_bootstraps_as_bridge() {
    let node = start("us-east-1", "gw-a", vec![], vec![]).await;

    assert!(wait_until(Duration::from_secs(5), || node.cluster.is_bridge()).await);
    assert_eq!(node.cluster.members().len(), 1);
    assert!(!node.cluster.wan_addr().is_empty());
    assert_eq!(node.cluster.wan_members().len(), 1);
    assert_eq!(node.cluster.wan_members()[0].name, "gw-a-wan");

    node.cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_one_bridge_per_region_and_failover() {
    let a = start("us-east-1", "gw-a", vec![], vec![]).await;
    let seed = a.lan_seed();
    let b = start("us-east-1", "gw-b", vec![seed.clone()], vec![]).await;
    let c = start("us-east-1", "gw-c", vec![seed], vec![]).await;

    let converged = wait_until(Duration::from_secs(10), || {
        [&a, &b, &c].iter().all(|n| n.cluster.members().len() == 3)
            && bridges(&[&a, &b, &c]) == ["gw-a"]
    })
    .await;
    assert!(converged, "bridges: {:?}", bridges(&[&a, &b, &c]));
    assert!(b.cluster.wan_addr().is_empty());

    a.cluster.close().await.unwrap();

    let failed_over = wait_until(Duration::from_secs(10), || {
        b.cluster.members().len() == 2 && bridges(&[&b, &c]) == ["gw-b"]
    })
    .await;
    assert!(failed_over, "bridges: {:?}", bridges(&[&b, &c]));

    b.cluster.close().await.unwrap();
    c.cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_reaches_every_lan_peer() {
    let a = start("us-east-1", "gw-a", vec![], vec![]).await;
    let seed = a.lan_seed();
    let b = start("us-east-1", "gw-b", vec![seed.clone()], vec![]).await;
    let c = start("us-east-1", "gw-c", vec![seed], vec![]).await;
    assert!(
        wait_until(Duration::from_secs(10), || {
            [&a, &b, &c].iter().all(|n| n.cluster.members().len() == 3)
        })
        .await
    );

    c.cluster
        .broadcast(CacheInvalidation::key("sessions", "user-42").into())
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || a.received() == 1 && b.received() == 1).await);
    let msg = a.inbox.lock()[0].clone();
    assert_eq!(msg.sender_node, "gw-c");
    assert_eq!(msg.source_region, "us-east-1");
    assert_eq!(
        msg.payload,
        Payload::from(CacheInvalidation::key("sessions", "user-42"))
    );

    // The sender never hears its own message back
    sleep(Duration::from_millis(500)).await;
    assert_eq!(c.received(), 0);

    for node in [&a, &b, &c] {
        node.cluster.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_cross_region_delivery_happens_once() {
    let [us1, us2, eu1, eu2] = two_regions().await;

    us2.cluster
        .broadcast(
            OpaqueMessage {
                topic: "deploy".to_string(),
                data: vec![0, 1, 2, 255],
            }
            .into(),
        )
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            us1.received() == 1 && eu1.received() == 1 && eu2.received() == 1
        })
        .await
    );

    // Let retransmissions settle, then check nothing arrived twice or looped
    sleep(Duration::from_secs(2)).await;
    assert_eq!(us1.received(), 1);
    assert_eq!(eu1.received(), 1);
    assert_eq!(eu2.received(), 1);
    assert_eq!(us2.received(), 0);
    assert!(eu2.inbox.lock().iter().all(|m| m.source_region == "us-east-1"));

    for node in [&eu2, &eu1, &us2, &us1] {
        node.cluster.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_bridge_broadcast_reaches_both_pools_once() {
    let [us1, us2, eu1, eu2] = two_regions().await;

    us1.cluster
        .broadcast(CacheInvalidation::clear_all("routes").into())
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            us2.received() == 1 && eu1.received() == 1 && eu2.received() == 1
        })
        .await
    );

    sleep(Duration::from_secs(2)).await;
    assert_eq!(us1.received(), 0);
    assert_eq!(us2.received(), 1);
    assert_eq!(eu1.received(), 1);
    assert_eq!(eu2.received(), 1);
    for node in [&us2, &eu1, &eu2] {
        let msg = node.inbox.lock()[0].clone();
        assert_eq!(msg.sender_node, "us-1");
        assert_eq!(msg.source_region, "us-east-1");
    }

    for node in [&eu2, &eu1, &us2, &us1] {
        node.cluster.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_identical_broadcasts_are_each_delivered() {
    let a = start("us-east-1", "gw-a", vec![], vec![]).await;
    let b = start("us-east-1", "gw-b", vec![a.lan_seed()], vec![]).await;
    assert!(
        wait_until(Duration::from_secs(10), || {
            a.cluster.members().len() == 2 && b.cluster.members().len() == 2
        })
        .await
    );

    // Invalidate, refill, invalidate: both invalidations must land
    for _ in 0..2 {
        b.cluster
            .broadcast(CacheInvalidation::key("sessions", "user-42").into())
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || a.received() == 2).await);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(a.received(), 2);
    let inbox = a.inbox.lock().clone();
    assert_eq!(inbox[0].payload, inbox[1].payload);
    assert_ne!(inbox[0].msg_id, inbox[1].msg_id);

    a.cluster.close().await.unwrap();
    b.cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_promotion_retries_until_wan_port_is_free() {
    let held = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let wan_port = held.local_addr().unwrap().port();

    let (mut config, _inbox) = config("us-east-1", "gw-a", vec![], vec![]);
    config.wan_bind_port = wan_port;
    let cluster = GossipCluster::new(config).await.unwrap();

    // Elected, but the WAN pool cannot bind yet
    sleep(Duration::from_secs(1)).await;
    assert!(!cluster.is_bridge());
    assert!(cluster.wan_addr().is_empty());

    drop(held);
    assert!(wait_until(Duration::from_secs(10), || cluster.is_bridge()).await);
    assert!(cluster.wan_addr().ends_with(&format!(":{wan_port}")));

    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_close_interrupts_wan_backoff() {
    let held = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let (mut config, _inbox) = config("us-east-1", "gw-a", vec![], vec![]);
    config.wan_bind_port = held.local_addr().unwrap().port();
    let cluster = GossipCluster::new(config).await.unwrap();

    sleep(Duration::from_millis(700)).await;
    tokio::time::timeout(Duration::from_secs(5), cluster.close())
        .await
        .expect("close must not wait out the backoff")
        .unwrap();

    assert!(!cluster.is_bridge());
    assert!(cluster.wan_addr().is_empty());
}

#[tokio::test]
async fn test_wan_pool_opened_while_closing_is_discarded() {
    let node = start("us-east-1", "gw-a", vec![], vec![]).await;
    node.cluster.close().await.unwrap();

    // A promotion that finishes after close must not install its pool
    node.cluster.shared().promote().await;

    assert!(!node.cluster.is_bridge());
    assert!(node.cluster.wan_addr().is_empty());
    assert!(node.cluster.wan_members().is_empty());
}

#[tokio::test]
async fn test_dropping_without_close_releases_ports() {
    let node = start("us-east-1", "gw-a", vec![], vec![]).await;
    assert!(wait_until(Duration::from_secs(5), || node.cluster.is_bridge()).await);
    let lan = node.cluster.lan_addr().unwrap();
    let wan: SocketAddr = node.cluster.wan_addr().parse().unwrap();

    drop(node);

    let released = wait_until(Duration::from_secs(10), || {
        std::net::UdpSocket::bind(lan).is_ok() && std::net::UdpSocket::bind(wan).is_ok()
    })
    .await;
    assert!(released);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let node = start("us-east-1", "gw-a", vec![], vec![]).await;
    assert!(wait_until(Duration::from_secs(5), || node.cluster.is_bridge()).await);

    let (first, second) = tokio::join!(node.cluster.close(), node.cluster.close());
    first.unwrap();
    second.unwrap();
    node.cluster.close().await.unwrap();

    assert!(!node.cluster.is_bridge());
    assert!(node.cluster.wan_addr().is_empty());
    assert!(node.cluster.members().is_empty());
    assert!(node.cluster.lan_addr().is_none());
    assert!(matches!(
        node.cluster.broadcast(CacheInvalidation::clear_all("c").into()),
        Err(StratusError::Closed)
    ));
}

#[tokio::test]
async fn test_oversized_broadcast_is_rejected() {
    let node = start("us-east-1", "gw-a", vec![], vec![]).await;

    let result = node.cluster.broadcast(
        OpaqueMessage {
            topic: "blob".to_string(),
            data: vec![7u8; 4096],
        }
        .into(),
    );
    assert!(matches!(result, Err(StratusError::MessageTooLarge { .. })));

    node.cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_fails_without_side_effects() {
    let config = ClusterConfig::new("us-east-1", "gw-a");
    assert!(matches!(
        GossipCluster::new(config).await,
        Err(StratusError::Config(_))
    ));
}
