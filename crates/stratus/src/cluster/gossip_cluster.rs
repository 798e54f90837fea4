//! The two-tier gossip cluster.
//!
//! Every node joins its region's LAN pool. The node with the smallest name
//! in each region is the bridge: it also joins the WAN pool and relays
//! messages between the two.
//!
//! Lock rules: `state` is never held across an `.await`, and no pool call
//! that can call back into us (create, join, leave, shutdown) runs while it
//! is held.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, warn};

use stratus_common::constants::{
    DEDUP_CAPACITY, LAN_RETRANSMIT_MULT, LEAVE_TIMEOUT, MAX_MESSAGE_BYTES, METRICS_INTERVAL, pools,
};
use stratus_common::{ClusterMessage, Direction, NodeDescriptor, Payload, Result, StratusError};

use super::Cluster;
use super::config::{ClusterConfig, MessageHandler};
use super::dedup::RecentMessages;
use super::delegates::{LanDelegate, MembershipEvents};
use super::election::{BridgeRole, pool_size};
use super::metrics::ClusterMetrics;
use super::reconnect::reconnect_loop;
use crate::message::{self, ClusterBroadcast};
use crate::pool::{Pool, PoolConfig, TransmitLimitedQueue};

/// Mutable cluster state, guarded by `Shared::state`
pub(crate) struct State {
    pub lan: Option<Arc<Pool>>,
    pub lan_queue: Option<Arc<TransmitLimitedQueue>>,
    pub role: BridgeRole,
}

/// State shared between the cluster handle, its tasks and its delegates
pub(crate) struct Shared {
    pub config: ClusterConfig,
    pub on_message: MessageHandler,
    pub state: RwLock<State>,
    pub recent: RecentMessages,
    pub cancel: CancellationToken,
    closing: AtomicBool,
    election: mpsc::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    /// Flip into the closing state; false if someone already did
    fn begin_close(&self) -> bool {
        self.closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn trigger_election(&self) {
        let _ = self.election.try_send(());
    }

    /// Tear down tasks, the WAN link and the LAN pool, in that order.
    ///
    /// Only a failed LAN shutdown is reported; everything else is logged.
    async fn close(&self) -> Result<()> {
        info!("Closing gossip cluster");
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Cluster task ended abnormally");
            }
        }

        self.demote().await;

        let (lan, _queue) = {
            let mut state = self.state.write();
            (state.lan.take(), state.lan_queue.take())
        };
        let Some(lan) = lan else {
            return Ok(());
        };

        if let Err(e) = lan.leave(LEAVE_TIMEOUT).await {
            warn!(pool = pools::LAN, error = %e, "LAN leave failed");
        }
        lan.shutdown().await?;

        self.update_gauges();
        info!("Gossip cluster closed");
        Ok(())
    }

    fn update_gauges(&self) {
        let (lan, wan) = {
            let state = self.state.read();
            (
                state.lan.clone(),
                state.role.link().map(|link| link.pool.clone()),
            )
        };
        let metrics = ClusterMetrics::get();
        metrics
            .members
            .with_label_values(&[pools::LAN])
            .set(lan.map_or(0, |pool| pool.num_members() as i64));
        metrics
            .members
            .with_label_values(&[pools::WAN])
            .set(wan.map_or(0, |pool| pool.num_members() as i64));
    }
}

/// Encode `msg` for one pool, refusing anything that cannot fit a packet
fn encode_for(pool: &str, msg: &ClusterMessage) -> Result<Vec<u8>> {
    let encoded = message::encode(msg).and_then(|bytes| {
        if bytes.len() > MAX_MESSAGE_BYTES {
            Err(StratusError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_BYTES,
            })
        } else {
            Ok(bytes)
        }
    });
    if encoded.is_err() {
        ClusterMetrics::get()
            .broadcast_errors
            .with_label_values(&[pool])
            .inc();
    }
    encoded
}

async fn run_elections(shared: Arc<Shared>, mut trigger: mpsc::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            signal = trigger.recv() => {
                if signal.is_none() {
                    break;
                }
            }
        }
        shared.evaluate().await;
    }
}

async fn run_metrics(shared: Arc<Shared>) {
    let mut ticker = interval(METRICS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => shared.update_gauges(),
        }
    }
}

/// A node of the two-tier gossip cluster
pub struct GossipCluster {
    inner: Arc<Shared>,
}

impl GossipCluster {
    /// Start the LAN pool and the background tasks.
    ///
    /// Fails if the config is invalid or the LAN pool cannot bind.
    pub async fn new(mut config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let on_message = config
            .on_message
            .take()
            .ok_or_else(|| StratusError::Config("on_message handler is required".to_string()))?;
        let span = config.span.clone();

        let lan_handle: Arc<OnceLock<Weak<Pool>>> = Arc::default();
        let lan_queue = Arc::new(TransmitLimitedQueue::new(
            LAN_RETRANSMIT_MULT,
            pool_size(&lan_handle),
        ));
        let (election, trigger) = mpsc::channel(1);

        let inner = Arc::new(Shared {
            config,
            on_message,
            state: RwLock::new(State {
                lan: None,
                lan_queue: Some(lan_queue),
                role: BridgeRole::Follower,
            }),
            recent: RecentMessages::new(DEDUP_CAPACITY),
            cancel: CancellationToken::new(),
            closing: AtomicBool::new(false),
            election: election.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let pool_config = PoolConfig {
            name: inner.config.node_id.clone(),
            label: pools::LAN,
            bind_addr: inner.config.bind_addr,
            bind_port: inner.config.bind_port,
            advertise_addr: inner.config.advertise_addr,
            secret_key: inner.config.secret_key.clone(),
            tuning: inner.config.lan_tuning.clone(),
        };
        let delegate = Arc::new(LanDelegate::new(Arc::downgrade(&inner)));
        let events = Arc::new(MembershipEvents::new(pools::LAN, Some(election)));
        let lan = Pool::create(pool_config, delegate, Some(events))
            .instrument(span.clone())
            .await?;
        let _ = lan_handle.set(Arc::downgrade(&lan));
        inner.state.write().lan = Some(lan.clone());

        let mut tasks = vec![
            tokio::spawn(run_elections(inner.clone(), trigger).instrument(span.clone())),
            tokio::spawn(run_metrics(inner.clone()).instrument(span.clone())),
        ];
        if !inner.config.lan_seeds.is_empty() {
            tasks.push(tokio::spawn(
                reconnect_loop(
                    lan,
                    inner.config.lan_seeds.clone(),
                    pools::LAN,
                    inner.cancel.clone(),
                )
                .instrument(span.clone()),
            ));
        }
        inner.tasks.lock().extend(tasks);
        inner.trigger_election();

        span.in_scope(|| info!("Gossip cluster started"));
        Ok(Self { inner })
    }

    /// Region this node belongs to
    pub fn region(&self) -> &str {
        &self.inner.config.region
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    /// Advertised LAN address; `None` once closed
    pub fn lan_addr(&self) -> Option<SocketAddr> {
        self.inner
            .state
            .read()
            .lan
            .as_ref()
            .map(|pool| pool.local_addr())
    }

    /// WAN pool members; empty unless this node is the bridge
    pub fn wan_members(&self) -> Vec<NodeDescriptor> {
        let wan = self
            .inner
            .state
            .read()
            .role
            .link()
            .map(|link| link.pool.clone());
        wan.map(|pool| pool.members()).unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner
    }
}

#[async_trait]
impl Cluster for GossipCluster {
    fn broadcast(&self, payload: Payload) -> Result<()> {
        let shared = &self.inner;
        if shared.is_closing() {
            return Err(StratusError::Closed);
        }

        let msg = ClusterMessage::new(
            payload,
            &shared.config.region,
            &shared.config.node_id,
            Direction::Lan,
        );
        let lan_bytes = encode_for(pools::LAN, &msg)?;
        let metrics = ClusterMetrics::get();

        let state = shared.state.read();
        let Some(lan_queue) = &state.lan_queue else {
            return Err(StratusError::Closed);
        };
        lan_queue.queue_broadcast(ClusterBroadcast::boxed(lan_bytes));
        metrics.broadcasts.with_label_values(&[pools::LAN]).inc();

        if let Some(link) = state.role.link() {
            let wan_bytes = encode_for(pools::WAN, &msg.with_direction(Direction::Wan))?;
            link.queue.queue_broadcast(ClusterBroadcast::boxed(wan_bytes));
            metrics.broadcasts.with_label_values(&[pools::WAN]).inc();
        }
        Ok(())
    }

    fn members(&self) -> Vec<NodeDescriptor> {
        let lan = self.inner.state.read().lan.clone();
        lan.map(|pool| pool.members()).unwrap_or_default()
    }

    fn is_bridge(&self) -> bool {
        self.inner.state.read().role.is_bridge()
    }

    fn wan_addr(&self) -> String {
        self.inner
            .state
            .read()
            .role
            .link()
            .map(|link| link.pool.local_addr().to_string())
            .unwrap_or_default()
    }

    async fn close(&self) -> Result<()> {
        let shared = &self.inner;
        if !shared.begin_close() {
            return Ok(());
        }
        let span = shared.config.span.clone();
        shared.close().instrument(span).await
    }
}

/// Dropping an open cluster stops its tasks and tears the pools down in
/// the background. Call [`Cluster::close`] to wait for that instead.
impl Drop for GossipCluster {
    fn drop(&mut self) {
        if !self.inner.begin_close() {
            return;
        }
        self.inner.cancel.cancel();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = self.inner.clone();
        let span = shared.config.span.clone();
        runtime.spawn(
            async move {
                if let Err(e) = shared.close().await {
                    warn!(error = %e, "Background close of dropped cluster failed");
                }
            }
            .instrument(span),
        );
    }
}

impl std::fmt::Debug for GossipCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipCluster")
            .field("region", &self.inner.config.region)
            .field("node_id", &self.inner.config.node_id)
            .field("is_bridge", &self.is_bridge())
            .finish()
    }
}
