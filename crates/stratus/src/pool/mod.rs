//! SWIM-style gossip pool over UDP.
//!
//! A [`Pool`] owns one UDP socket and four background tasks:
//! - receive: decodes datagrams and dispatches them
//! - probe: round-robin failure detection (direct, then indirect pings)
//! - gossip: piggybacks queued membership and user broadcasts on random peers
//! - push/pull: periodic full-state exchange (anti-entropy)
//!
//! Membership changes are reported through an [`EventDelegate`], user
//! messages through a [`Delegate`].

mod config;
mod delegate;
mod keyring;
mod queue;
mod state;
mod wire;

pub use config::{PoolConfig, Tuning};
pub use delegate::{Delegate, EventDelegate};
pub use keyring::Keyring;
pub use queue::{Broadcast, TransmitLimitedQueue, retransmit_limit};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use stratus_common::{NodeDescriptor, Result, StratusError};

use keyring::SEAL_OVERHEAD;
use state::{NodeTable, ProbeTarget};
use wire::{COMPOUND_OVERHEAD, MAX_PACKET, Packet, Suspect, USER_OVERHEAD, WireMessage};

/// One gossip membership pool
pub struct Pool {
    config: PoolConfig,
    /// Address peers use to reach us
    advertise: SocketAddr,
    /// Taken on shutdown so the port is released
    socket: RwLock<Option<Arc<UdpSocket>>>,
    keyring: Option<Keyring>,
    delegate: Arc<dyn Delegate>,
    events: Option<Arc<dyn EventDelegate>>,
    table: Mutex<NodeTable>,
    /// Alive + suspect members, self included
    live: Arc<AtomicUsize>,
    seq: AtomicU32,
    acks: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    /// Membership updates awaiting dissemination
    broadcasts: TransmitLimitedQueue,
    /// Encoded packet header plus sealing overhead
    header_overhead: usize,
    leaving: AtomicBool,
    shut_down: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Bind the socket, register ourselves as alive and start the
    /// background tasks
    pub async fn create(
        config: PoolConfig,
        delegate: Arc<dyn Delegate>,
        events: Option<Arc<dyn EventDelegate>>,
    ) -> Result<Arc<Self>> {
        let keyring = config
            .secret_key
            .as_deref()
            .map(Keyring::new)
            .transpose()?;

        let bind = SocketAddr::new(config.bind_addr, config.bind_port);
        let socket = UdpSocket::bind(bind).await.map_err(|e| {
            StratusError::Bind(format!("{} pool failed to bind {bind}: {e}", config.label))
        })?;
        let bound = socket
            .local_addr()
            .map_err(|e| StratusError::Bind(format!("{} pool has no local address: {e}", config.label)))?;
        let advertise = SocketAddr::new(
            config.advertise_addr.unwrap_or(bound.ip()),
            bound.port(),
        );

        let header = Packet {
            from: config.name.clone(),
            from_addr: advertise,
            messages: Vec::new(),
        };
        let mut header_overhead = wire::encoded_len(&header)? + 8;
        if keyring.is_some() {
            header_overhead += SEAL_OVERHEAD;
        }

        let live = Arc::new(AtomicUsize::new(1));
        let counter = live.clone();
        let broadcasts = TransmitLimitedQueue::new(config.tuning.retransmit_mult, move || {
            counter.load(Ordering::Relaxed)
        });
        let table = NodeTable::new(&config.name, advertise);

        let pool = Arc::new(Self {
            config,
            advertise,
            socket: RwLock::new(Some(Arc::new(socket))),
            keyring,
            delegate,
            events,
            table: Mutex::new(table),
            live,
            seq: AtomicU32::new(0),
            acks: Mutex::new(HashMap::new()),
            broadcasts,
            header_overhead,
            leaving: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        info!(
            pool = pool.config.label,
            node = %pool.config.name,
            addr = %advertise,
            encrypted = pool.keyring.is_some(),
            "Gossip pool listening"
        );

        if let Some(events) = &pool.events {
            events.notify_join(&pool.local_node());
        }

        let handles = vec![
            tokio::spawn(pool.clone().receive_loop().in_current_span()),
            tokio::spawn(pool.clone().probe_loop().in_current_span()),
            tokio::spawn(pool.clone().gossip_loop().in_current_span()),
            tokio::spawn(pool.clone().push_pull_loop().in_current_span()),
        ];
        *pool.tasks.lock() = handles;

        Ok(pool)
    }

    /// Our member name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Our advertised gossip address
    pub fn local_addr(&self) -> SocketAddr {
        self.advertise
    }

    pub fn local_node(&self) -> NodeDescriptor {
        NodeDescriptor {
            name: self.config.name.clone(),
            addr: self.advertise,
        }
    }

    /// Alive and suspect members, self included, sorted by name
    pub fn members(&self) -> Vec<NodeDescriptor> {
        self.table.lock().live_members()
    }

    /// Number of alive and suspect members without taking the table lock
    pub fn num_members(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Push/pull with every address the seeds resolve to.
    ///
    /// Returns how many answered; errors if none did.
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(StratusError::Join(format!(
                "{} pool is shut down",
                self.config.label
            )));
        }

        let mut addrs = Vec::new();
        for seed in seeds {
            match tokio::net::lookup_host(seed.as_str()).await {
                Ok(resolved) => addrs.extend(resolved),
                Err(e) => {
                    warn!(pool = self.config.label, seed = %seed, error = %e, "Failed to resolve seed")
                }
            }
        }
        if addrs.is_empty() {
            return Err(StratusError::Join(format!(
                "No seed address could be resolved from {seeds:?}"
            )));
        }

        let answered = join_all(addrs.iter().map(|addr| self.push_pull(*addr)))
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        if answered == 0 {
            return Err(StratusError::Join(format!(
                "None of {} seed addresses answered",
                addrs.len()
            )));
        }

        info!(
            pool = self.config.label,
            contacted = answered,
            members = self.num_members(),
            "Joined gossip pool"
        );
        Ok(answered)
    }

    /// Announce our departure and wait until it has been gossiped
    pub async fn leave(&self, wait: Duration) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(StratusError::Leave(format!(
                "{} pool is shut down",
                self.config.label
            )));
        }
        if self.leaving.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        let peers = self.table.lock().mark_local_left(self, tx);
        if peers == 0 {
            return Ok(());
        }

        info!(pool = self.config.label, peers, "Leaving gossip pool");
        match timeout(wait, rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(StratusError::Timeout(format!(
                "{} pool leave was not gossiped within {wait:?}",
                self.config.label
            ))),
        }
    }

    /// Stop every task and release the socket. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut panicked = Vec::new();
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    panicked.push(e.to_string());
                }
            }
        }

        self.socket.write().take();
        self.acks.lock().clear();
        info!(pool = self.config.label, node = %self.config.name, "Gossip pool shut down");

        if panicked.is_empty() {
            Ok(())
        } else {
            Err(StratusError::Shutdown(format!(
                "{} pool tasks panicked: {}",
                self.config.label,
                panicked.join("; ")
            )))
        }
    }

    // ---------------------------------------------------------------------
    // Background tasks
    // ---------------------------------------------------------------------

    async fn receive_loop(self: Arc<Self>) {
        let Some(socket) = self.socket() else {
            return;
        };
        let mut buf = vec![0u8; MAX_PACKET + 1];

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => self.handle_datagram(&buf[..len], src).await,
                    Err(e) => {
                        debug!(pool = self.config.label, error = %e, "Gossip receive error");
                    }
                }
            }
        }
    }

    async fn probe_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.tuning.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.probe() => {}
            }
            self.expire_suspects();
            self.reap_dead();
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.tuning.gossip_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for addr in self.gossip_targets() {
                let mut messages = Vec::new();
                self.piggyback(&mut messages);
                if messages.is_empty() {
                    break;
                }
                self.send_packet(addr, messages).await;
            }
        }
    }

    async fn push_pull_loop(self: Arc<Self>) {
        let period = self.config.tuning.push_pull_interval;
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Some(peer) = self.random_peers(1, |_| true).pop() {
                let msg = WireMessage::PushPull {
                    seq: self.next_seq(),
                    join: false,
                    states: self.local_states(),
                };
                self.send_direct(peer.addr, &msg).await;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Failure detection
    // ---------------------------------------------------------------------

    async fn probe(&self) {
        let Some(target) = self.next_probe_target() else {
            return;
        };
        let tuning = &self.config.tuning;
        let seq = self.next_seq();
        let mut ack = self.register_ack(seq);

        let ping = WireMessage::Ping {
            seq,
            target: target.name.clone(),
        };
        self.send_with_piggyback(target.addr, &ping).await;
        if matches!(timeout(tuning.probe_timeout, &mut ack).await, Ok(Ok(()))) {
            return;
        }

        let helpers = self.random_peers(tuning.indirect_checks, |name| name != target.name);
        for helper in &helpers {
            let req = WireMessage::IndirectPing {
                seq,
                target: target.name.clone(),
                target_addr: target.addr,
            };
            self.send_direct(helper.addr, &req).await;
        }

        let remaining = tuning.probe_interval.saturating_sub(tuning.probe_timeout);
        if matches!(timeout(remaining, &mut ack).await, Ok(Ok(()))) {
            return;
        }
        self.forget_ack(seq);

        debug!(
            pool = self.config.label,
            node = %target.name,
            indirect = helpers.len(),
            "Probe unanswered"
        );
        self.handle_suspect(Suspect {
            incarnation: target.incarnation,
            node: target.name,
            from: self.config.name.clone(),
        });
    }

    /// Ping `target` for a peer whose own probe went unanswered
    async fn relay_ping(
        self: Arc<Self>,
        seq: u32,
        target: String,
        target_addr: SocketAddr,
        requester: SocketAddr,
    ) {
        let own_seq = self.next_seq();
        let ack = self.register_ack(own_seq);
        self.send_direct(target_addr, &WireMessage::Ping { seq: own_seq, target })
            .await;

        match timeout(self.config.tuning.probe_timeout, ack).await {
            Ok(Ok(())) => self.send_direct(requester, &WireMessage::Ack { seq }).await,
            _ => self.forget_ack(own_seq),
        }
    }

    async fn push_pull(&self, addr: SocketAddr) -> bool {
        let seq = self.next_seq();
        let reply = self.register_ack(seq);
        let msg = WireMessage::PushPull {
            seq,
            join: true,
            states: self.local_states(),
        };
        self.send_direct(addr, &msg).await;

        match timeout(self.config.tuning.sync_timeout, reply).await {
            Ok(Ok(())) => true,
            _ => {
                self.forget_ack(seq);
                debug!(pool = self.config.label, seed = %addr, "Seed did not answer push/pull");
                false
            }
        }
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn register_ack(&self, seq: u32) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.acks.lock().insert(seq, tx);
        rx
    }

    fn resolve_ack(&self, seq: u32) {
        if let Some(tx) = self.acks.lock().remove(&seq) {
            let _ = tx.send(());
        }
    }

    fn forget_ack(&self, seq: u32) {
        self.acks.lock().remove(&seq);
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    async fn handle_datagram(self: &Arc<Self>, data: &[u8], src: SocketAddr) {
        let plain: Cow<'_, [u8]> = match &self.keyring {
            Some(keyring) => match keyring.open(data) {
                Ok(plain) => Cow::Owned(plain),
                Err(e) => {
                    warn!(pool = self.config.label, peer = %src, error = %e, "Dropping undecryptable packet");
                    return;
                }
            },
            None => Cow::Borrowed(data),
        };

        let packet: Packet = match wire::decode(&plain) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(pool = self.config.label, peer = %src, error = %e, "Dropping malformed packet");
                return;
            }
        };

        for raw in &packet.messages {
            match wire::decode::<WireMessage>(raw) {
                Ok(msg) => self.handle_message(msg, &packet.from, src).await,
                Err(e) => {
                    warn!(pool = self.config.label, peer = %src, error = %e, "Dropping malformed message")
                }
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, msg: WireMessage, from: &str, src: SocketAddr) {
        match msg {
            WireMessage::Ping { seq, target } => {
                if target != self.config.name {
                    debug!(pool = self.config.label, target = %target, "Ignoring ping for another node");
                    return;
                }
                self.send_with_piggyback(src, &WireMessage::Ack { seq }).await;
            }
            WireMessage::IndirectPing {
                seq,
                target,
                target_addr,
            } => {
                let pool = self.clone();
                tokio::spawn(
                    pool.relay_ping(seq, target, target_addr, src)
                        .in_current_span(),
                );
            }
            WireMessage::Ack { seq } => self.resolve_ack(seq),
            WireMessage::Alive(mut alive) => {
                if alive.node == from {
                    alive.addr = wire::fixup_addr(alive.addr, src);
                }
                self.handle_alive(alive);
            }
            WireMessage::Suspect(suspect) => self.handle_suspect(suspect),
            WireMessage::Dead(dead) => self.handle_dead(dead),
            WireMessage::PushPull { seq, join, states } => {
                if join {
                    debug!(pool = self.config.label, peer = %from, "Join request");
                }
                self.merge_states(states, from, src);
                let reply = WireMessage::PushPullReply {
                    seq,
                    states: self.local_states(),
                };
                self.send_direct(src, &reply).await;
            }
            WireMessage::PushPullReply { seq, states } => {
                self.merge_states(states, from, src);
                self.resolve_ack(seq);
            }
            WireMessage::User(data) => self.delegate.notify_msg(&data),
        }
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.read().clone()
    }

    fn seal(&self, packet: &Packet) -> Result<Vec<u8>> {
        let bytes = wire::encode(packet)?;
        match &self.keyring {
            Some(keyring) => keyring.seal(&bytes),
            None => Ok(bytes),
        }
    }

    async fn send_packet(&self, addr: SocketAddr, messages: Vec<Vec<u8>>) {
        let Some(socket) = self.socket() else {
            return;
        };
        let packet = Packet {
            from: self.config.name.clone(),
            from_addr: self.advertise,
            messages,
        };
        let bytes = match self.seal(&packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(pool = self.config.label, error = %e, "Failed to build gossip packet");
                return;
            }
        };
        if let Err(e) = socket.send_to(&bytes, addr).await {
            debug!(pool = self.config.label, peer = %addr, error = %e, "Failed to send gossip packet");
        }
    }

    async fn send_direct(&self, addr: SocketAddr, msg: &WireMessage) {
        match wire::encode(msg) {
            Ok(bytes) => self.send_packet(addr, vec![bytes]).await,
            Err(e) => warn!(pool = self.config.label, error = %e, "Failed to encode message"),
        }
    }

    async fn send_with_piggyback(&self, addr: SocketAddr, msg: &WireMessage) {
        let mut messages = match wire::encode(msg) {
            Ok(bytes) => vec![bytes],
            Err(e) => {
                warn!(pool = self.config.label, error = %e, "Failed to encode message");
                return;
            }
        };
        self.piggyback(&mut messages);
        self.send_packet(addr, messages).await;
    }

    /// Fill the remaining packet budget with queued broadcasts
    fn piggyback(&self, messages: &mut Vec<Vec<u8>>) {
        let used = self.header_overhead
            + messages
                .iter()
                .map(|m| m.len() + COMPOUND_OVERHEAD)
                .sum::<usize>();
        let mut remaining = self.config.tuning.packet_budget.saturating_sub(used);

        let membership = self.broadcasts.get_broadcasts(COMPOUND_OVERHEAD, remaining);
        remaining = remaining.saturating_sub(
            membership
                .iter()
                .map(|m| m.len() + COMPOUND_OVERHEAD)
                .sum::<usize>(),
        );
        messages.extend(membership);

        for user in self
            .delegate
            .get_broadcasts(COMPOUND_OVERHEAD + USER_OVERHEAD, remaining)
        {
            match wire::encode(&WireMessage::User(user)) {
                Ok(bytes) => messages.push(bytes),
                Err(e) => warn!(pool = self.config.label, error = %e, "Failed to wrap user broadcast"),
            }
        }
    }

    fn next_probe_target(&self) -> Option<ProbeTarget> {
        self.table.lock().next_probe_target(&self.config.name)
    }

    fn random_peers(&self, count: usize, filter: impl Fn(&str) -> bool) -> Vec<ProbeTarget> {
        self.table
            .lock()
            .random_peers(&self.config.name, count, filter)
    }

    fn gossip_targets(&self) -> Vec<SocketAddr> {
        self.table.lock().gossip_targets(
            &self.config.name,
            self.config.tuning.gossip_nodes,
            self.config.tuning.gossip_to_dead,
        )
    }

    fn local_states(&self) -> Vec<wire::PushNodeState> {
        self.table.lock().push_states()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("label", &self.config.label)
            .field("name", &self.config.name)
            .field("addr", &self.advertise)
            .field("members", &self.num_members())
            .finish()
    }
}
