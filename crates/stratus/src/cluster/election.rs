//! Bridge election and the follower/bridge state machine.
//!
//! The bridge of a region is the LAN member with the smallest name. Every
//! node computes this from its own membership view, so no votes are
//! exchanged. Entering the bridge state opens a WAN pool; leaving it closes
//! that pool.

use std::sync::{Arc, OnceLock, Weak};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, warn};

use stratus_common::{NodeDescriptor, Result};
use stratus_common::constants::{LEAVE_TIMEOUT, WAN_NAME_SUFFIX, WAN_RETRANSMIT_MULT, pools};

use super::delegates::{MembershipEvents, WanDelegate};
use super::gossip_cluster::Shared;
use super::metrics::ClusterMetrics;
use super::reconnect::{Backoff, reconnect_loop};
use crate::pool::{Pool, PoolConfig, TransmitLimitedQueue};

/// Name of the bridge for a membership view
pub fn elect_bridge<'a>(members: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    members.into_iter().min()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Promote,
    Demote,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Promote => "promote",
            Self::Demote => "demote",
        }
    }
}

/// What `local` has to do, given the LAN members it sees
pub fn next_transition(
    local: &str,
    members: &[NodeDescriptor],
    is_bridge: bool,
) -> Option<Transition> {
    let elected = elect_bridge(members.iter().map(|m| m.name.as_str())) == Some(local);
    match (elected, is_bridge) {
        (true, false) => Some(Transition::Promote),
        (false, true) => Some(Transition::Demote),
        _ => None,
    }
}

/// The WAN side of a bridge
pub(crate) struct WanLink {
    pub pool: Arc<Pool>,
    pub queue: Arc<TransmitLimitedQueue>,
    /// Stops the WAN reconnect loop
    pub cancel: CancellationToken,
}

pub(crate) enum BridgeRole {
    Follower,
    Bridge(WanLink),
}

impl BridgeRole {
    pub(crate) fn is_bridge(&self) -> bool {
        matches!(self, Self::Bridge(_))
    }

    pub(crate) fn link(&self) -> Option<&WanLink> {
        match self {
            Self::Bridge(link) => Some(link),
            Self::Follower => None,
        }
    }
}

/// Size of the pool behind `handle`, for a queue created before its pool
pub(crate) fn pool_size(handle: &Arc<OnceLock<Weak<Pool>>>) -> impl Fn() -> usize + Send + Sync + 'static {
    let handle = handle.clone();
    move || {
        handle
            .get()
            .and_then(Weak::upgrade)
            .map(|pool| pool.num_members())
            .unwrap_or(1)
    }
}

/// Leave and shut down a WAN pool we no longer want
async fn retire(link: WanLink) {
    link.cancel.cancel();
    if let Err(e) = link.pool.leave(LEAVE_TIMEOUT).await {
        warn!(pool = pools::WAN, error = %e, "WAN leave failed");
    }
    if let Err(e) = link.pool.shutdown().await {
        warn!(pool = pools::WAN, error = %e, "WAN shutdown failed");
    }
}

impl Shared {
    /// Re-run the election against the current LAN view
    pub(crate) async fn evaluate(self: &Arc<Self>) {
        if self.is_closing() {
            return;
        }
        let (lan, is_bridge) = {
            let state = self.state.read();
            (state.lan.clone(), state.role.is_bridge())
        };
        let Some(lan) = lan else {
            return;
        };

        let members = lan.members();
        match next_transition(&self.config.node_id, &members, is_bridge) {
            Some(Transition::Promote) => self.promote().await,
            Some(Transition::Demote) => self.demote().await,
            None => {}
        }
    }

    /// Follower -> bridge
    pub(crate) async fn promote(self: &Arc<Self>) {
        if self.state.read().role.is_bridge() {
            return;
        }
        let Some(link) = self.open_wan_link().await else {
            return;
        };

        let installed = {
            let mut state = self.state.write();
            if self.is_closing() || state.role.is_bridge() {
                Err(link)
            } else {
                let pool = link.pool.clone();
                let cancel = link.cancel.clone();
                state.role = BridgeRole::Bridge(link);
                Ok((pool, cancel))
            }
        };

        let (pool, cancel) = match installed {
            Ok(installed) => installed,
            Err(link) => {
                info!("Discarding WAN pool opened during shutdown");
                retire(link).await;
                return;
            }
        };

        let metrics = ClusterMetrics::get();
        metrics.bridge_status.set(1);
        metrics
            .bridge_transitions
            .with_label_values(&[Transition::Promote.as_str()])
            .inc();
        info!(wan_addr = %pool.local_addr(), "Promoted to bridge");

        if !self.config.wan_seeds.is_empty() {
            let task = tokio::spawn(
                reconnect_loop(pool, self.config.wan_seeds.clone(), pools::WAN, cancel)
                    .instrument(self.config.span.clone()),
            );
            self.track(task);
        }
    }

    /// Bridge -> follower
    pub(crate) async fn demote(&self) {
        let link = {
            let mut state = self.state.write();
            match std::mem::replace(&mut state.role, BridgeRole::Follower) {
                BridgeRole::Bridge(link) => link,
                BridgeRole::Follower => return,
            }
        };

        let metrics = ClusterMetrics::get();
        metrics.bridge_status.set(0);
        metrics
            .bridge_transitions
            .with_label_values(&[Transition::Demote.as_str()])
            .inc();
        info!(wan_addr = %link.pool.local_addr(), "Demoted to follower");

        retire(link).await;
    }

    /// Open the WAN pool, retrying with backoff until it binds or we shut down
    async fn open_wan_link(self: &Arc<Self>) -> Option<WanLink> {
        let mut backoff = Backoff::default();
        loop {
            match self.create_wan_pool().await {
                Ok(link) => return Some(link),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "Failed to open WAN pool");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn create_wan_pool(self: &Arc<Self>) -> Result<WanLink> {
        let handle: Arc<OnceLock<Weak<Pool>>> = Arc::default();
        let queue = Arc::new(TransmitLimitedQueue::new(
            WAN_RETRANSMIT_MULT,
            pool_size(&handle),
        ));

        let config = PoolConfig {
            name: format!("{}{WAN_NAME_SUFFIX}", self.config.node_id),
            label: pools::WAN,
            bind_addr: self.config.bind_addr,
            bind_port: self.config.wan_bind_port,
            advertise_addr: self.config.advertise_addr,
            secret_key: self.config.secret_key.clone(),
            tuning: self.config.wan_tuning.clone(),
        };
        let delegate = Arc::new(WanDelegate::new(Arc::downgrade(self), queue.clone()));
        let events = Arc::new(MembershipEvents::new(pools::WAN, None));

        let pool = Pool::create(config, delegate, Some(events))
            .instrument(self.config.span.clone())
            .await?;
        let _ = handle.set(Arc::downgrade(&pool));

        Ok(WanLink {
            pool,
            queue,
            cancel: self.cancel.child_token(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn members(names: &[&str]) -> Vec<NodeDescriptor> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| NodeDescriptor {
                name: name.to_string(),
                addr: SocketAddr::from(([10, 0, 0, i as u8 + 1], 7946)),
            })
            .collect()
    }

    #[test]
    fn test_smallest_name_wins() {
        assert_eq!(elect_bridge(["gw-b", "gw-a", "gw-c"]), Some("gw-a"));
        assert_eq!(elect_bridge(["node-10", "node-9"]), Some("node-10"));
        assert_eq!(elect_bridge(Vec::<&str>::new()), None);
    }

    #[test]
    fn test_every_view_agrees_on_one_bridge() {
        let view = members(&["gw-c", "gw-a", "gw-b"]);
        let promotions = ["gw-a", "gw-b", "gw-c"]
            .iter()
            .filter(|name| next_transition(name, &view, false) == Some(Transition::Promote))
            .count();
        assert_eq!(promotions, 1);
    }

    #[test]
    fn test_transitions() {
        let view = members(&["gw-a", "gw-b"]);
        assert_eq!(next_transition("gw-a", &view, false), Some(Transition::Promote));
        assert_eq!(next_transition("gw-a", &view, true), None);
        assert_eq!(next_transition("gw-b", &view, true), Some(Transition::Demote));
        assert_eq!(next_transition("gw-b", &view, false), None);
    }

    #[test]
    fn test_failover_to_next_smallest() {
        let after = members(&["gw-c", "gw-b"]);
        assert_eq!(next_transition("gw-b", &after, false), Some(Transition::Promote));
        assert_eq!(next_transition("gw-c", &after, false), None);
    }

    #[test]
    fn test_lone_node_promotes_itself_and_empty_view_demotes() {
        assert_eq!(
            next_transition("gw-a", &members(&["gw-a"]), false),
            Some(Transition::Promote)
        );
        assert_eq!(next_transition("gw-a", &[], true), Some(Transition::Demote));
    }
}
