//! Cluster coordination.
//!
//! Implements:
//! - Two-tier gossip (per-region LAN pool, cross-region WAN pool)
//! - Bridge election (smallest LAN member name)
//! - LAN <-> WAN relaying with loop prevention
//! - Seed joining with backoff and isolation recovery

mod config;
mod dedup;
mod delegates;
mod election;
mod gossip_cluster;
mod metrics;
mod reconnect;
mod seeds;

#[cfg(test)]
mod tests;

pub use config::{ClusterConfig, MessageHandler};
pub use election::{Transition, elect_bridge, next_transition};
pub use gossip_cluster::GossipCluster;
pub use metrics::ClusterMetrics;
pub use reconnect::Backoff;
pub use seeds::resolve_seeds;

use async_trait::async_trait;

use stratus_common::{NodeDescriptor, Payload, Result};

/// What applications use to talk to the cluster
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Queue a payload for delivery to every other node. Never blocks on I/O.
    fn broadcast(&self, payload: Payload) -> Result<()>;

    /// LAN members, self included, sorted by name
    fn members(&self) -> Vec<NodeDescriptor>;

    fn is_bridge(&self) -> bool;

    /// Advertised WAN address; empty unless bridge
    fn wan_addr(&self) -> String;

    /// Leave both pools and stop every task. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// A cluster of one: broadcasts go nowhere
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCluster;

#[async_trait]
impl Cluster for NoopCluster {
    fn broadcast(&self, _payload: Payload) -> Result<()> {
        Ok(())
    }

    fn members(&self) -> Vec<NodeDescriptor> {
        Vec::new()
    }

    fn is_bridge(&self) -> bool {
        false
    }

    fn wan_addr(&self) -> String {
        String::new()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
