//! Seed joining and isolation recovery.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stratus_common::Result;
use stratus_common::constants::{INITIAL_BACKOFF, MAX_BACKOFF, RECONNECT_INTERVAL};

use super::metrics::ClusterMetrics;
use crate::pool::Pool;

/// Exponential backoff: doubles every step up to a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial,
            initial,
            max,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

/// `pool.join(seeds)`, abandoned on cancellation
async fn join_seeds(
    pool: &Pool,
    seeds: &[String],
    cancel: &CancellationToken,
) -> Option<Result<usize>> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        result = pool.join(seeds) => Some(result),
    }
}

/// Join `seeds` until it works, then rejoin whenever the pool is down to
/// ourselves. Runs until `cancel` fires.
pub(crate) async fn reconnect_loop(
    pool: Arc<Pool>,
    seeds: Vec<String>,
    label: &'static str,
    cancel: CancellationToken,
) {
    let metrics = ClusterMetrics::get();
    let mut backoff = Backoff::default();

    loop {
        match join_seeds(&pool, &seeds, &cancel).await {
            None => return,
            Some(Ok(contacted)) => {
                metrics.seed_joins.with_label_values(&[label, "success"]).inc();
                info!(pool = label, contacted, "Joined seeds");
                break;
            }
            Some(Err(e)) => {
                metrics.seed_joins.with_label_values(&[label, "failure"]).inc();
                let delay = backoff.next_delay();
                warn!(pool = label, error = %e, retry_in = ?delay, "Seed join failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    let mut ticker = interval_at(
        tokio::time::Instant::now() + RECONNECT_INTERVAL,
        RECONNECT_INTERVAL,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if pool.num_members() > 1 {
            continue;
        }

        warn!(pool = label, "Node is isolated, rejoining seeds");
        match join_seeds(&pool, &seeds, &cancel).await {
            None => return,
            Some(Ok(contacted)) => {
                metrics.seed_joins.with_label_values(&[label, "success"]).inc();
                info!(pool = label, contacted, "Rejoined seeds");
            }
            Some(Err(e)) => {
                metrics.seed_joins.with_label_values(&[label, "failure"]).inc();
                warn!(pool = label, error = %e, "Rejoin failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Delegate, PoolConfig, Tuning};
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::default();
        let delays: Vec<_> = (0..9).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[2], Duration::from_secs(2));
        assert_eq!(delays[6], Duration::from_secs(30));
        assert_eq!(delays[8], Duration::from_secs(30));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    struct Silent;

    impl Delegate for Silent {
        fn notify_msg(&self, _msg: &[u8]) {}

        fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
            Vec::new()
        }
    }

    async fn pool(name: &str) -> Arc<Pool> {
        let config = PoolConfig {
            name: name.to_string(),
            label: "lan",
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_port: 0,
            advertise_addr: None,
            secret_key: None,
            tuning: Tuning::local(),
        };
        Pool::create(config, Arc::new(Silent), None).await.unwrap()
    }

    #[tokio::test]
    async fn test_loop_joins_and_stops_on_cancel() {
        let seed = pool("seed").await;
        let joiner = pool("joiner").await;
        let cancel = CancellationToken::new();

        let task = tokio::spawn(reconnect_loop(
            joiner.clone(),
            vec![seed.local_addr().to_string()],
            "lan",
            cancel.clone(),
        ));

        let mut joined = false;
        for _ in 0..50 {
            if joiner.num_members() == 2 {
                joined = true;
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        assert!(joined);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        seed.shutdown().await.unwrap();
        joiner.shutdown().await.unwrap();
    }
}
