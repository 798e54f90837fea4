//! Seed address expansion.

use std::net::{IpAddr, SocketAddr};
use tracing::warn;

/// Expand seed hosts into `ip:port` strings.
///
/// Literal IPs get `port` appended, `host:port` / `ip:port` entries that
/// already parse as socket addresses pass through, and host names expand to
/// every address record. A host that cannot be resolved is kept as
/// `host:port` so the pool can retry resolution at join time.
pub async fn resolve_seeds(hosts: &[String], port: u16) -> Vec<String> {
    let mut seeds = Vec::new();

    for host in hosts {
        let host = host.trim();
        if host.is_empty() {
            continue;
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            seeds.push(SocketAddr::new(ip, port).to_string());
            continue;
        }
        if host.parse::<SocketAddr>().is_ok() {
            seeds.push(host.to_string());
            continue;
        }

        match tokio::net::lookup_host((host, port)).await {
            Ok(addrs) => {
                let before = seeds.len();
                seeds.extend(addrs.map(|addr| addr.to_string()));
                if seeds.len() == before {
                    warn!(host = %host, "Seed host has no address records");
                    seeds.push(format!("{host}:{port}"));
                }
            }
            Err(e) => {
                warn!(host = %host, error = %e, "Failed to resolve seed host, keeping it as is");
                seeds.push(format!("{host}:{port}"));
            }
        }
    }

    seeds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_addresses() {
        let hosts = vec![
            "10.0.0.1".to_string(),
            "::1".to_string(),
            "10.0.0.2:9000".to_string(),
            "  ".to_string(),
        ];
        let seeds = resolve_seeds(&hosts, 7946).await;
        assert_eq!(seeds, vec!["10.0.0.1:7946", "[::1]:7946", "10.0.0.2:9000"]);
    }

    #[tokio::test]
    async fn test_localhost_expands() {
        let seeds = resolve_seeds(&["localhost".to_string()], 7946).await;
        assert!(!seeds.is_empty());
        assert!(seeds.iter().all(|s| s.ends_with(":7946")));
    }

    #[tokio::test]
    async fn test_unresolvable_host_falls_back() {
        let seeds = resolve_seeds(&["gossip.invalid".to_string()], 7946).await;
        assert_eq!(seeds, vec!["gossip.invalid:7946"]);
    }
}
