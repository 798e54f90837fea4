//! Prometheus metrics for the gossip cluster.

use prometheus::{
    HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, register_histogram_vec,
    register_int_counter, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
};
use std::sync::OnceLock;

use stratus_common::ClusterMessage;

static METRICS: OnceLock<ClusterMetrics> = OnceLock::new();

/// Relay hop labels
pub const LAN_TO_WAN: &str = "lan_to_wan";
pub const WAN_TO_LAN: &str = "wan_to_lan";

/// Gossip cluster metrics
pub struct ClusterMetrics {
    /// Join/leave events by pool
    pub membership_events: IntCounterVec,
    pub members: IntGaugeVec,

    /// 1 while this process is its region's bridge
    pub bridge_status: IntGauge,
    pub bridge_transitions: IntCounterVec,

    /// Broadcast metrics
    pub broadcasts: IntCounterVec,
    pub broadcast_errors: IntCounterVec,

    /// Inbound message metrics
    pub messages_received: IntCounterVec,
    pub message_latency: HistogramVec,
    pub unmarshal_errors: IntCounterVec,
    pub duplicates: IntCounterVec,
    pub same_region_skips: IntCounter,

    /// Relay metrics
    pub relays: IntCounterVec,
    pub relay_errors: IntCounterVec,

    pub seed_joins: IntCounterVec,
}

impl ClusterMetrics {
    /// Initialize metrics
    pub fn init() -> &'static Self {
        METRICS.get_or_init(|| {
            let membership_events = register_int_counter_vec!(
                "stratus_cluster_membership_events_total",
                "Pool membership events",
                &["pool", "event"]
            )
            .expect("membership_events metric registers once");

            let members = register_int_gauge_vec!(
                "stratus_cluster_members",
                "Live members per pool",
                &["pool"]
            )
            .expect("members metric registers once");

            let bridge_status = register_int_gauge!(
                "stratus_cluster_bridge_status",
                "1 if this node is the region's bridge"
            )
            .expect("bridge_status metric registers once");

            let bridge_transitions = register_int_counter_vec!(
                "stratus_cluster_bridge_transitions_total",
                "Bridge promotions and demotions",
                &["transition"]
            )
            .expect("bridge_transitions metric registers once");

            let broadcasts = register_int_counter_vec!(
                "stratus_cluster_broadcasts_total",
                "Messages queued for broadcast",
                &["pool"]
            )
            .expect("broadcasts metric registers once");

            let broadcast_errors = register_int_counter_vec!(
                "stratus_cluster_broadcast_errors_total",
                "Messages that could not be queued",
                &["pool"]
            )
            .expect("broadcast_errors metric registers once");

            let messages_received = register_int_counter_vec!(
                "stratus_cluster_messages_received_total",
                "Messages received",
                &["pool", "direction", "payload_type"]
            )
            .expect("messages_received metric registers once");

            let message_latency = register_histogram_vec!(
                "stratus_cluster_message_latency_seconds",
                "Time from broadcast to receipt",
                &["direction", "source_region"],
                vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            )
            .expect("message_latency metric registers once");

            let unmarshal_errors = register_int_counter_vec!(
                "stratus_cluster_unmarshal_errors_total",
                "Messages that failed to decode",
                &["pool"]
            )
            .expect("unmarshal_errors metric registers once");

            let duplicates = register_int_counter_vec!(
                "stratus_cluster_duplicate_messages_total",
                "Repeated deliveries dropped",
                &["pool"]
            )
            .expect("duplicates metric registers once");

            let same_region_skips = register_int_counter!(
                "stratus_cluster_same_region_skips_total",
                "WAN messages dropped because they originated in our region"
            )
            .expect("same_region_skips metric registers once");

            let relays = register_int_counter_vec!(
                "stratus_cluster_relays_total",
                "Messages relayed between pools",
                &["direction"]
            )
            .expect("relays metric registers once");

            let relay_errors = register_int_counter_vec!(
                "stratus_cluster_relay_errors_total",
                "Messages that could not be relayed",
                &["direction"]
            )
            .expect("relay_errors metric registers once");

            let seed_joins = register_int_counter_vec!(
                "stratus_cluster_seed_joins_total",
                "Seed join attempts",
                &["pool", "status"]
            )
            .expect("seed_joins metric registers once");

            Self {
                membership_events,
                members,
                bridge_status,
                bridge_transitions,
                broadcasts,
                broadcast_errors,
                messages_received,
                message_latency,
                unmarshal_errors,
                duplicates,
                same_region_skips,
                relays,
                relay_errors,
                seed_joins,
            }
        })
    }

    /// Get the global metrics instance
    pub fn get() -> &'static Self {
        Self::init()
    }

    /// Count a received message and observe its latency
    pub fn record_receipt(&self, pool: &str, msg: &ClusterMessage) {
        self.messages_received
            .with_label_values(&[pool, msg.direction.as_str(), msg.payload.kind().as_str()])
            .inc();
        if let Some(age_ms) = msg.age_ms() {
            self.message_latency
                .with_label_values(&[msg.direction.as_str(), msg.source_region.as_str()])
                .observe(age_ms as f64 / 1000.0);
        }
    }
}
