//! Core types shared across Stratus components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Which pool a message travels on next.
///
/// `Lan` marks traffic freshly originated inside a region. Anything that has
/// been relayed, and everything carried by the WAN pool, is `Wan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Lan,
    Wan,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lan => "lan",
            Self::Wan => "wan",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a cache invalidation asks receivers to drop
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationAction {
    /// Drop a single key
    Key(String),
    /// Drop the whole cache
    ClearAll,
}

/// Cache invalidation fanned out to every gateway
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheInvalidation {
    /// Logical cache name (e.g. "verification_key_by_hash")
    pub cache_name: String,
    pub action: InvalidationAction,
}

impl CacheInvalidation {
    pub fn key(cache_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            action: InvalidationAction::Key(key.into()),
        }
    }

    pub fn clear_all(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            action: InvalidationAction::ClearAll,
        }
    }
}

/// Application-defined bytes routed by topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpaqueMessage {
    pub topic: String,
    pub data: Vec<u8>,
}

/// Application payload carried by a [`ClusterMessage`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Payload {
    CacheInvalidation(CacheInvalidation),
    Opaque(OpaqueMessage),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::CacheInvalidation(_) => PayloadKind::CacheInvalidation,
            Self::Opaque(_) => PayloadKind::Opaque,
        }
    }
}

impl From<CacheInvalidation> for Payload {
    fn from(value: CacheInvalidation) -> Self {
        Self::CacheInvalidation(value)
    }
}

impl From<OpaqueMessage> for Payload {
    fn from(value: OpaqueMessage) -> Self {
        Self::Opaque(value)
    }
}

/// Discriminant of [`Payload`], used for routing and metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    CacheInvalidation,
    Opaque,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheInvalidation => "cache_invalidation",
            Self::Opaque => "opaque",
        }
    }
}

/// The wire message: payload plus routing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMessage {
    pub payload: Payload,

    /// Region the message was first broadcast in
    pub source_region: String,

    /// Node that called broadcast
    pub sender_node: String,

    /// Random per-broadcast id; relayed copies keep it
    pub msg_id: u64,

    /// Unix epoch milliseconds at broadcast time
    pub sent_at_ms: i64,

    /// Next hop (see [`Direction`])
    pub direction: Direction,
}

impl ClusterMessage {
    /// Stamp a freshly originated message with the current time
    pub fn new(
        payload: Payload,
        source_region: impl Into<String>,
        sender_node: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            payload,
            source_region: source_region.into(),
            sender_node: sender_node.into(),
            msg_id: rand::random(),
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
            direction,
        }
    }

    /// Copy of this message tagged for a different hop
    pub fn with_direction(&self, direction: Direction) -> Self {
        Self {
            direction,
            ..self.clone()
        }
    }

    /// Milliseconds since the message was sent, if the clocks allow it
    pub fn age_ms(&self) -> Option<i64> {
        let age = chrono::Utc::now().timestamp_millis() - self.sent_at_ms;
        (age >= 0).then_some(age)
    }
}

/// A member of a gossip pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique node name within the pool
    pub name: String,

    /// Advertised gossip address
    pub addr: SocketAddr,
}
