//! Shared constants for Stratus components.

use std::time::Duration;

/// Default bind address for both pools
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

/// Default LAN gossip port
pub const DEFAULT_LAN_PORT: u16 = 7946;

/// Default WAN gossip port
pub const DEFAULT_WAN_PORT: u16 = 7947;

/// Retransmit multiplier for the LAN broadcast queue
pub const LAN_RETRANSMIT_MULT: u32 = 3;

/// Retransmit multiplier for the WAN broadcast queue (higher loss/latency)
pub const WAN_RETRANSMIT_MULT: u32 = 4;

/// Timeout for a graceful pool leave
pub const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// First delay of the join / pool-creation backoff
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound of the join / pool-creation backoff
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How often an isolated node retries its seeds
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// How often member-count gauges are refreshed
pub const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Suffix appended to the node id to form its WAN identity
pub const WAN_NAME_SUFFIX: &str = "-wan";

/// Largest encoded cluster message accepted for broadcast
pub const MAX_MESSAGE_BYTES: usize = 1024;

/// Recently seen messages remembered for duplicate suppression
pub const DEDUP_CAPACITY: usize = 4096;

/// Accepted shared secret lengths (AES-128/192/256)
pub const SECRET_KEY_LENGTHS: [usize; 3] = [16, 24, 32];

/// Pool labels used in logs and metrics
pub mod pools {
    /// Intra-region pool
    pub const LAN: &str = "lan";

    /// Cross-region pool
    pub const WAN: &str = "wan";
}
