//! # Stratus
//!
//! Two-tier gossip broadcast for regional fleets.
//!
//! ## Architecture
//! ```text
//!   region us-east-1                 region eu-west-1
//!  ┌──────────────────┐             ┌──────────────────┐
//!  │ gw-a* gw-b gw-c  │  LAN pool   │ gw-d* gw-e       │  LAN pool
//!  └──┬───────────────┘             └──┬───────────────┘
//!     └────────────── WAN pool ────────┘
//!                (* = bridge)
//! ```
//!
//! ## Modules
//! - `pool` - SWIM-style UDP membership pool
//! - `message` - Cluster message codec, broadcast wrapper, typed mux
//! - `cluster` - Bridge election, relaying, reconnection, metrics

pub mod cluster;
pub mod message;
pub mod pool;

pub use cluster::{Cluster, ClusterConfig, GossipCluster, NoopCluster, resolve_seeds};
pub use message::Mux;
