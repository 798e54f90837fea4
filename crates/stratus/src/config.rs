//! Configuration management for stratusd.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;

use stratus::cluster::{ClusterConfig, MessageHandler, resolve_seeds};
use stratus_common::constants::{DEFAULT_BIND_ADDR, DEFAULT_LAN_PORT, DEFAULT_WAN_PORT};

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Region this node belongs to
    #[serde(default = "default_region")]
    pub region: String,

    /// This node's unique ID (auto-generated if not set)
    #[serde(default = "generate_node_id")]
    pub node_id: String,

    /// Address both pools bind to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// LAN gossip port
    #[serde(default = "default_lan_port")]
    pub lan_port: u16,

    /// WAN gossip port (bridge only)
    #[serde(default = "default_wan_port")]
    pub wan_port: u16,

    /// Address advertised to peers
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// LAN seed hosts (`host` or `host:port`)
    #[serde(default)]
    pub lan_seeds: Vec<String>,

    /// WAN seed hosts (other regions' bridges)
    #[serde(default)]
    pub wan_seeds: Vec<String>,

    /// Base64 AES key shared by every node
    #[serde(default)]
    pub secret_key: Option<String>,
}

// Default value functions
fn default_region() -> String { "local".to_string() }
fn default_bind_addr() -> String { DEFAULT_BIND_ADDR.to_string() }
fn default_lan_port() -> u16 { DEFAULT_LAN_PORT }
fn default_wan_port() -> u16 { DEFAULT_WAN_PORT }

fn generate_node_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("node-{:08x}", rng.random::<u32>())
}

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            // Use defaults if config file doesn't exist
            tracing::warn!("Config file not found, using defaults");
            Self::default()
        };

        // Apply CLI overrides
        if let Some(ref node_id) = args.node_id {
            config.node_id = node_id.clone();
        }
        if let Some(ref region) = args.region {
            config.region = region.clone();
        }

        Ok(config)
    }

    /// Build the cluster configuration, resolving seed hosts
    pub async fn cluster_config(&self, handler: MessageHandler) -> Result<ClusterConfig> {
        let bind_addr: IpAddr = self
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid bind_addr {:?}", self.bind_addr))?;
        let advertise_addr = self
            .advertise_addr
            .as_deref()
            .map(str::parse::<IpAddr>)
            .transpose()
            .context("Invalid advertise_addr")?;
        let secret_key = self
            .secret_key
            .as_deref()
            .map(|key| STANDARD.decode(key.trim()))
            .transpose()
            .context("secret_key is not valid base64")?;

        let config = ClusterConfig {
            bind_addr,
            bind_port: self.lan_port,
            wan_bind_port: self.wan_port,
            advertise_addr,
            lan_seeds: resolve_seeds(&self.lan_seeds, self.lan_port).await,
            wan_seeds: resolve_seeds(&self.wan_seeds, self.wan_port).await,
            secret_key,
            ..ClusterConfig::new(&self.region, &self.node_id)
        }
        .with_handler(handler);

        config.validate().context("Invalid cluster configuration")?;
        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            node_id: generate_node_id(),
            bind_addr: default_bind_addr(),
            lan_port: default_lan_port(),
            wan_port: default_wan_port(),
            advertise_addr: None,
            lan_seeds: Vec::new(),
            wan_seeds: Vec::new(),
            secret_key: None,
        }
    }
}
