//! Pool callbacks: message delivery, relaying and membership events.

use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use stratus_common::constants::pools;
use stratus_common::{ClusterMessage, Direction, NodeDescriptor};

use super::gossip_cluster::Shared;
use super::metrics::{ClusterMetrics, LAN_TO_WAN, WAN_TO_LAN};
use crate::message::{self, ClusterBroadcast};
use crate::pool::{Delegate, EventDelegate, TransmitLimitedQueue};

/// Delegate of the LAN pool
pub(crate) struct LanDelegate {
    cluster: Weak<Shared>,
}

impl LanDelegate {
    pub(crate) fn new(cluster: Weak<Shared>) -> Self {
        Self { cluster }
    }
}

impl Delegate for LanDelegate {
    fn notify_msg(&self, msg: &[u8]) {
        if let Some(cluster) = self.cluster.upgrade() {
            cluster.on_lan_message(msg);
        }
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let Some(cluster) = self.cluster.upgrade() else {
            return Vec::new();
        };
        let state = cluster.state.read();
        match &state.lan_queue {
            Some(queue) => queue.get_broadcasts(overhead, limit),
            None => Vec::new(),
        }
    }
}

/// Delegate of one WAN pool.
///
/// Holds the queue it was created with so a pool that is being retired
/// never drains the queue of its successor.
pub(crate) struct WanDelegate {
    cluster: Weak<Shared>,
    queue: Arc<TransmitLimitedQueue>,
}

impl WanDelegate {
    pub(crate) fn new(cluster: Weak<Shared>, queue: Arc<TransmitLimitedQueue>) -> Self {
        Self { cluster, queue }
    }
}

impl Delegate for WanDelegate {
    fn notify_msg(&self, msg: &[u8]) {
        if let Some(cluster) = self.cluster.upgrade() {
            cluster.on_wan_message(msg);
        }
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let Some(cluster) = self.cluster.upgrade() else {
            return Vec::new();
        };
        let state = cluster.state.read();
        match state.role.link() {
            Some(link) if Arc::ptr_eq(&link.queue, &self.queue) => {
                link.queue.get_broadcasts(overhead, limit)
            }
            _ => Vec::new(),
        }
    }
}

/// Counts membership changes and, for the LAN pool, wakes the election
/// evaluator.
///
/// Runs under the pool's member-table lock, so it only ever does a
/// non-blocking `try_send`.
pub(crate) struct MembershipEvents {
    pool: &'static str,
    election: Option<mpsc::Sender<()>>,
}

impl MembershipEvents {
    pub(crate) fn new(pool: &'static str, election: Option<mpsc::Sender<()>>) -> Self {
        Self { pool, election }
    }

    fn record(&self, event: &str, node: &NodeDescriptor) {
        ClusterMetrics::get()
            .membership_events
            .with_label_values(&[self.pool, event])
            .inc();
        debug!(pool = self.pool, event, node = %node.name, addr = %node.addr, "Membership changed");

        if let Some(election) = &self.election {
            // A full slot already guarantees a pending evaluation
            let _ = election.try_send(());
        }
    }
}

impl EventDelegate for MembershipEvents {
    fn notify_join(&self, node: &NodeDescriptor) {
        self.record("join", node);
    }

    fn notify_leave(&self, node: &NodeDescriptor) {
        self.record("leave", node);
    }
}

impl Shared {
    pub(crate) fn on_lan_message(&self, bytes: &[u8]) {
        let metrics = ClusterMetrics::get();
        let msg = match message::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                metrics.unmarshal_errors.with_label_values(&[pools::LAN]).inc();
                warn!(pool = pools::LAN, error = %e, "Dropping undecodable cluster message");
                return;
            }
        };
        if !self.recent.first_sighting(&msg) {
            metrics.duplicates.with_label_values(&[pools::LAN]).inc();
            return;
        }
        metrics.record_receipt(pools::LAN, &msg);

        // Only traffic that has not crossed regions yet goes out on the WAN
        let relay = (msg.direction == Direction::Lan).then(|| msg.with_direction(Direction::Wan));
        (self.on_message)(msg);
        if let Some(relay) = relay {
            self.relay_to_wan(&relay);
        }
    }

    pub(crate) fn on_wan_message(&self, bytes: &[u8]) {
        let metrics = ClusterMetrics::get();
        let msg = match message::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                metrics.unmarshal_errors.with_label_values(&[pools::WAN]).inc();
                warn!(pool = pools::WAN, error = %e, "Dropping undecodable cluster message");
                return;
            }
        };
        if msg.source_region == self.config.region {
            metrics.same_region_skips.inc();
            debug!(sender = %msg.sender_node, "Dropping WAN message from our own region");
            return;
        }
        if !self.recent.first_sighting(&msg) {
            metrics.duplicates.with_label_values(&[pools::WAN]).inc();
            return;
        }
        metrics.record_receipt(pools::WAN, &msg);

        let relay = msg.with_direction(Direction::Wan);
        (self.on_message)(msg);
        self.relay_to_lan(&relay);
    }

    /// LAN -> WAN hop; a no-op unless we are the bridge
    fn relay_to_wan(&self, msg: &ClusterMessage) {
        let state = self.state.read();
        let Some(link) = state.role.link() else {
            return;
        };
        self.relay(msg, &link.queue, LAN_TO_WAN);
    }

    /// WAN -> LAN hop
    fn relay_to_lan(&self, msg: &ClusterMessage) {
        let state = self.state.read();
        let Some(queue) = &state.lan_queue else {
            return;
        };
        self.relay(msg, queue, WAN_TO_LAN);
    }

    fn relay(&self, msg: &ClusterMessage, queue: &TransmitLimitedQueue, hop: &'static str) {
        let metrics = ClusterMetrics::get();
        match message::encode(msg) {
            Ok(bytes) => {
                queue.queue_broadcast(ClusterBroadcast::boxed(bytes));
                metrics.relays.with_label_values(&[hop]).inc();
                debug!(hop, source_region = %msg.source_region, "Relayed cluster message");
            }
            Err(e) => {
                metrics.relay_errors.with_label_values(&[hop]).inc();
                warn!(hop, error = %e, "Failed to relay cluster message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Cluster, ClusterConfig, GossipCluster};
    use crate::pool::Tuning;
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};
    use stratus_common::CacheInvalidation;

    async fn cluster(inbox: Arc<Mutex<Vec<ClusterMessage>>>) -> GossipCluster {
        let config = ClusterConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_port: 0,
            wan_bind_port: 0,
            lan_tuning: Tuning::local(),
            wan_tuning: Tuning::local(),
            ..ClusterConfig::new("us-east-1", "gw-1")
        }
        .with_handler(Arc::new(move |msg| inbox.lock().push(msg)));
        GossipCluster::new(config).await.unwrap()
    }

    fn encoded(region: &str, key: &str, direction: Direction) -> Vec<u8> {
        let msg = ClusterMessage::new(
            CacheInvalidation::key("keys", key).into(),
            region,
            "gw-remote",
            direction,
        );
        message::encode(&msg).unwrap()
    }

    #[tokio::test]
    async fn test_wan_drops_own_region() {
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let cluster = cluster(inbox.clone()).await;

        cluster.shared().on_wan_message(&encoded("us-east-1", "k", Direction::Wan));
        assert!(inbox.lock().is_empty());

        cluster.shared().on_wan_message(&encoded("eu-west-1", "k", Direction::Wan));
        assert_eq!(inbox.lock().len(), 1);
        assert_eq!(inbox.lock()[0].source_region, "eu-west-1");

        cluster.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_and_duplicates_are_dropped() {
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let cluster = cluster(inbox.clone()).await;

        cluster.shared().on_lan_message(&[0xFF, 0x00, 0x13]);
        assert!(inbox.lock().is_empty());

        let bytes = encoded("us-east-1", "dup", Direction::Lan);
        cluster.shared().on_lan_message(&bytes);
        cluster.shared().on_lan_message(&bytes);
        assert_eq!(inbox.lock().len(), 1);

        cluster.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeats_are_not_counted_as_receipts() {
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let cluster = cluster(inbox.clone()).await;
        let latency = ClusterMetrics::get()
            .message_latency
            .with_label_values(&["wan", "receipt-region"]);
        let before = latency.get_sample_count();

        let bytes = encoded("receipt-region", "k", Direction::Wan);
        cluster.shared().on_wan_message(&bytes);
        cluster.shared().on_wan_message(&bytes);

        assert_eq!(inbox.lock().len(), 1);
        assert_eq!(latency.get_sample_count(), before + 1);

        cluster.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_delegate_only_signals() {
        let (tx, mut rx) = mpsc::channel(1);
        let events = MembershipEvents::new(pools::LAN, Some(tx));
        let node = NodeDescriptor {
            name: "gw-2".to_string(),
            addr: "127.0.0.1:7946".parse().unwrap(),
        };

        // A burst collapses into one pending signal
        events.notify_join(&node);
        events.notify_leave(&node);
        events.notify_join(&node);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
