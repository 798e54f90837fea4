//! # stratusd - Stratus gossip daemon
//!
//! Joins the region's LAN pool (and the WAN pool when elected bridge),
//! logs every message it receives and broadcasts each line read from stdin.
//!
//! ## Architecture
//! ```text
//! stdin → stratusd → LAN pool ⇄ bridge ⇄ WAN pool → other regions
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use config::AppConfig;
use stratus::{Cluster, GossipCluster, Mux};
use stratus_common::{CacheInvalidation, OpaqueMessage};

/// Topic of payloads read from stdin
const STDIN_TOPIC: &str = "stdin";

/// Stratus gossip daemon
#[derive(Parser, Debug)]
#[command(name = "stratusd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/stratus.toml")]
    config: String,

    /// Node ID (overrides config)
    #[arg(long, env = "STRATUS_NODE_ID")]
    node_id: Option<String>,

    /// Region (overrides config)
    #[arg(long, env = "STRATUS_REGION")]
    region: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("🌩️ Starting stratusd v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args)?;
    info!(
        region = %config.region,
        node = %config.node_id,
        "📋 Configuration loaded from {}",
        args.config
    );

    // Route inbound messages by payload type
    let mux = Arc::new(Mux::new());
    mux.subscribe::<CacheInvalidation>(|inv| {
        info!(
            cache = %inv.body.cache_name,
            action = ?inv.body.action,
            from = %inv.sender_node,
            region = %inv.source_region,
            "🧹 Cache invalidation"
        );
    });
    mux.subscribe::<OpaqueMessage>(|msg| {
        info!(
            topic = %msg.body.topic,
            bytes = msg.body.data.len(),
            text = %String::from_utf8_lossy(&msg.body.data),
            from = %msg.sender_node,
            region = %msg.source_region,
            "📨 Message"
        );
    });

    let cluster_config = config.cluster_config(mux.handler()).await?;
    let cluster = GossipCluster::new(cluster_config)
        .await
        .context("Failed to start gossip cluster")?;
    info!(lan_addr = ?cluster.lan_addr(), "🚀 stratusd listening");

    let mut lines = spawn_stdin_reader();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to install Ctrl+C handler")?;
                info!("🛑 Shutdown signal received");
                break;
            }
            line = lines.recv(), if stdin_open => match line {
                Some(line) => broadcast_line(&cluster, &line),
                None => {
                    info!("stdin closed, waiting for Ctrl+C");
                    stdin_open = false;
                }
            }
        }
    }

    cluster.close().await.context("Failed to close gossip cluster")?;
    info!("👋 stratusd shutdown complete");
    Ok(())
}

/// Read stdin on a plain thread so a pending read never blocks shutdown
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn broadcast_line(cluster: &GossipCluster, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let payload = OpaqueMessage {
        topic: STDIN_TOPIC.to_string(),
        data: line.as_bytes().to_vec(),
    };
    match cluster.broadcast(payload.into()) {
        Ok(()) => info!(bytes = line.len(), bridge = cluster.is_bridge(), "📣 Broadcast queued"),
        Err(e) => warn!(error = %e, "Broadcast failed"),
    }
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
