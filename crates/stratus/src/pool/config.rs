//! Pool configuration and failure-detector tuning profiles.

use std::net::IpAddr;
use std::time::Duration;

/// Timers and fan-out of one gossip pool.
#[derive(Clone, Debug)]
pub struct Tuning {
    /// Interval between failure-detector probes
    pub probe_interval: Duration,
    /// How long to wait for a direct ack before asking peers
    pub probe_timeout: Duration,
    /// Peers asked to ping an unresponsive node on our behalf
    pub indirect_checks: usize,
    /// Suspicion timeout multiplier (scaled by log10 of pool size)
    pub suspicion_mult: u32,
    /// Interval between gossip rounds
    pub gossip_interval: Duration,
    /// Random peers contacted per gossip round
    pub gossip_nodes: usize,
    /// How long dead nodes keep receiving gossip before being forgotten
    pub gossip_to_dead: Duration,
    /// Interval between full-state anti-entropy exchanges
    pub push_pull_interval: Duration,
    /// How long a join waits for a seed to answer
    pub sync_timeout: Duration,
    /// Retransmit multiplier for membership updates
    pub retransmit_mult: u32,
    /// Maximum datagram size used for piggybacked gossip
    pub packet_budget: usize,
}

impl Tuning {
    /// Low-latency intra-region links
    pub fn lan() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            indirect_checks: 3,
            suspicion_mult: 4,
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            gossip_to_dead: Duration::from_secs(30),
            push_pull_interval: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(10),
            retransmit_mult: 4,
            packet_budget: 1400,
        }
    }

    /// High-latency cross-region links
    pub fn wan() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            indirect_checks: 3,
            suspicion_mult: 6,
            gossip_interval: Duration::from_millis(500),
            gossip_nodes: 4,
            gossip_to_dead: Duration::from_secs(60),
            push_pull_interval: Duration::from_secs(60),
            sync_timeout: Duration::from_secs(30),
            retransmit_mult: 4,
            packet_budget: 1400,
        }
    }

    /// Loopback clusters (tests, single-host development)
    pub fn local() -> Self {
        Self {
            probe_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(100),
            indirect_checks: 1,
            suspicion_mult: 3,
            gossip_interval: Duration::from_millis(50),
            gossip_nodes: 3,
            gossip_to_dead: Duration::from_secs(5),
            push_pull_interval: Duration::from_secs(2),
            sync_timeout: Duration::from_secs(1),
            retransmit_mult: 4,
            packet_budget: 1400,
        }
    }

    /// Time a suspect has to refute before it is declared dead
    pub fn suspicion_timeout(&self, live_nodes: usize) -> Duration {
        let scale = (live_nodes.max(1) as f64).log10().max(1.0);
        self.probe_interval
            .mul_f64(f64::from(self.suspicion_mult) * scale)
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self::lan()
    }
}

/// Everything needed to create a [`Pool`](super::Pool)
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Unique member name
    pub name: String,
    /// Label used in logs ("lan" / "wan")
    pub label: &'static str,
    /// Local address to bind
    pub bind_addr: IpAddr,
    /// Local port to bind (0 picks an ephemeral port)
    pub bind_port: u16,
    /// Address other members should use to reach us
    pub advertise_addr: Option<IpAddr>,
    /// Shared AES-GCM key (16, 24 or 32 bytes)
    pub secret_key: Option<Vec<u8>>,
    pub tuning: Tuning,
}
