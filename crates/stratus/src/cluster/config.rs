//! Cluster configuration.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::Span;

use stratus_common::constants::{DEFAULT_LAN_PORT, DEFAULT_WAN_PORT, SECRET_KEY_LENGTHS};
use stratus_common::{ClusterMessage, Result, StratusError};

use crate::pool::Tuning;

/// Application callback for every delivered message
pub type MessageHandler = Arc<dyn Fn(ClusterMessage) + Send + Sync>;

/// Everything a [`GossipCluster`](super::GossipCluster) needs to start
#[derive(Clone)]
pub struct ClusterConfig {
    /// Region this node belongs to (one LAN pool per region)
    pub region: String,

    /// Globally unique node id, used as the LAN member name
    pub node_id: String,

    /// Address both pools bind to
    pub bind_addr: IpAddr,

    /// LAN pool port (0 picks an ephemeral port)
    pub bind_port: u16,

    /// WAN pool port, used while this node is the bridge
    pub wan_bind_port: u16,

    /// Address advertised to peers when `bind_addr` is a wildcard
    pub advertise_addr: Option<IpAddr>,

    /// `host:port` addresses of LAN members to join
    pub lan_seeds: Vec<String>,

    /// `host:port` addresses of WAN members (other bridges) to join
    pub wan_seeds: Vec<String>,

    /// Shared AES-GCM key for all gossip traffic (16, 24 or 32 bytes)
    pub secret_key: Option<Vec<u8>>,

    /// Called for every message delivered to this node
    pub on_message: Option<MessageHandler>,

    pub lan_tuning: Tuning,

    pub wan_tuning: Tuning,

    /// Span every cluster task is instrumented with
    pub span: Span,
}

impl ClusterConfig {
    /// Defaults for everything but identity
    pub fn new(region: impl Into<String>, node_id: impl Into<String>) -> Self {
        let region = region.into();
        let node_id = node_id.into();
        let span = tracing::info_span!("cluster", region = %region, node = %node_id);

        Self {
            region,
            node_id,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: DEFAULT_LAN_PORT,
            wan_bind_port: DEFAULT_WAN_PORT,
            advertise_addr: None,
            lan_seeds: Vec::new(),
            wan_seeds: Vec::new(),
            secret_key: None,
            on_message: None,
            lan_tuning: Tuning::lan(),
            wan_tuning: Tuning::wan(),
            span,
        }
    }

    pub fn with_handler(mut self, handler: MessageHandler) -> Self {
        self.on_message = Some(handler);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.region.trim().is_empty() {
            return Err(StratusError::Config("region must not be empty".to_string()));
        }
        if self.node_id.trim().is_empty() {
            return Err(StratusError::Config("node_id must not be empty".to_string()));
        }
        if self.on_message.is_none() {
            return Err(StratusError::Config("on_message handler is required".to_string()));
        }
        if self.bind_port != 0 && self.bind_port == self.wan_bind_port {
            return Err(StratusError::Config(format!(
                "LAN and WAN pools cannot share port {}",
                self.bind_port
            )));
        }
        if let Some(key) = &self.secret_key {
            if !SECRET_KEY_LENGTHS.contains(&key.len()) {
                return Err(StratusError::Config(format!(
                    "secret_key must be 16, 24 or 32 bytes (got {})",
                    key.len()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("region", &self.region)
            .field("node_id", &self.node_id)
            .field("bind_addr", &self.bind_addr)
            .field("bind_port", &self.bind_port)
            .field("wan_bind_port", &self.wan_bind_port)
            .field("advertise_addr", &self.advertise_addr)
            .field("lan_seeds", &self.lan_seeds)
            .field("wan_seeds", &self.wan_seeds)
            .field("encrypted", &self.secret_key.is_some())
            .finish_non_exhaustive()
    }
}
