//! Member table and the SWIM state transitions applied to it.

use parking_lot::Mutex;
use rand::seq::{IndexedRandom, SliceRandom};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use stratus_common::NodeDescriptor;

use super::Pool;
use super::queue::Broadcast;
use super::wire::{self, Alive, Dead, NodeStatus, PushNodeState, Suspect, WireMessage};

pub(crate) struct NodeState {
    pub name: String,
    pub addr: SocketAddr,
    pub incarnation: u64,
    pub status: NodeStatus,
    /// Last status change
    pub changed: Instant,
}

impl NodeState {
    fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            name: self.name.clone(),
            addr: self.addr,
        }
    }

    fn target(&self) -> ProbeTarget {
        ProbeTarget {
            name: self.name.clone(),
            addr: self.addr,
            incarnation: self.incarnation,
        }
    }
}

/// Peer picked for a probe, indirect ping or push/pull
#[derive(Debug, Clone)]
pub(crate) struct ProbeTarget {
    pub name: String,
    pub addr: SocketAddr,
    pub incarnation: u64,
}

pub(crate) struct NodeTable {
    nodes: HashMap<String, NodeState>,
    probe_order: Vec<String>,
    probe_index: usize,
}

impl NodeTable {
    pub(crate) fn new(local: &str, addr: SocketAddr) -> Self {
        let mut table = Self {
            nodes: HashMap::new(),
            probe_order: Vec::new(),
            probe_index: 0,
        };
        table.insert(NodeState {
            name: local.to_string(),
            addr,
            incarnation: 0,
            status: NodeStatus::Alive,
            changed: Instant::now(),
        });
        table
    }

    /// Add a node at a random slot of the probe order
    fn insert(&mut self, node: NodeState) {
        let slot = if self.probe_order.is_empty() {
            0
        } else {
            rand::random_range(0..=self.probe_order.len())
        };
        self.probe_order.insert(slot, node.name.clone());
        self.nodes.insert(node.name.clone(), node);
    }

    pub(crate) fn live_count(&self) -> usize {
        self.nodes.values().filter(|n| n.status.is_live()).count()
    }

    pub(crate) fn live_members(&self) -> Vec<NodeDescriptor> {
        let mut members: Vec<_> = self
            .nodes
            .values()
            .filter(|n| n.status.is_live())
            .map(NodeState::descriptor)
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    pub(crate) fn push_states(&self) -> Vec<PushNodeState> {
        self.nodes
            .values()
            .map(|n| PushNodeState {
                name: n.name.clone(),
                addr: n.addr,
                incarnation: n.incarnation,
                status: n.status,
            })
            .collect()
    }

    /// Next live peer in the shuffled round-robin order
    pub(crate) fn next_probe_target(&mut self, local: &str) -> Option<ProbeTarget> {
        let Self {
            nodes,
            probe_order,
            probe_index,
        } = self;

        // The tail of the current order, then all of a reshuffled one
        for _ in 0..2 * probe_order.len() {
            if *probe_index >= probe_order.len() {
                probe_order.shuffle(&mut rand::rng());
                *probe_index = 0;
            }
            let name = &probe_order[*probe_index];
            *probe_index += 1;

            if name == local {
                continue;
            }
            if let Some(node) = nodes.get(name) {
                if node.status.is_live() {
                    return Some(node.target());
                }
            }
        }
        None
    }

    pub(crate) fn random_peers(
        &self,
        local: &str,
        count: usize,
        filter: impl Fn(&str) -> bool,
    ) -> Vec<ProbeTarget> {
        let candidates: Vec<&NodeState> = self
            .nodes
            .values()
            .filter(|n| n.name != local && n.status.is_live() && filter(n.name.as_str()))
            .collect();
        candidates
            .choose_multiple(&mut rand::rng(), count)
            .map(|n| n.target())
            .collect()
    }

    /// Live peers plus those that died within `dead_window`
    pub(crate) fn gossip_targets(
        &self,
        local: &str,
        count: usize,
        dead_window: Duration,
    ) -> Vec<SocketAddr> {
        let candidates: Vec<SocketAddr> = self
            .nodes
            .values()
            .filter(|n| n.name != local)
            .filter(|n| n.status.is_live() || n.changed.elapsed() < dead_window)
            .map(|n| n.addr)
            .collect();
        candidates
            .choose_multiple(&mut rand::rng(), count)
            .copied()
            .collect()
    }

    fn incarnation_of(&self, name: &str) -> u64 {
        self.nodes.get(name).map(|n| n.incarnation).unwrap_or(0)
    }

    /// Forget dead and left nodes once they fall out of `horizon`
    fn reap(&mut self, local: &str, horizon: Duration) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|name, node| {
            name == local || node.status.is_live() || node.changed.elapsed() < horizon
        });
        let Self {
            nodes, probe_order, ..
        } = self;
        probe_order.retain(|name| nodes.contains_key(name));
        before - self.nodes.len()
    }

    /// Mark ourselves as left and queue the announcement.
    ///
    /// Returns the number of live peers that should hear about it.
    pub(crate) fn mark_local_left(&mut self, pool: &Pool, notify: oneshot::Sender<()>) -> usize {
        let local = pool.config.name.clone();
        let Some(node) = self.nodes.get_mut(&local) else {
            return 0;
        };
        node.status = NodeStatus::Left;
        node.changed = Instant::now();
        let dead = Dead {
            incarnation: node.incarnation,
            node: local.clone(),
            from: local.clone(),
        };

        pool.refresh_live(self);
        pool.queue_member_broadcast(&local, &WireMessage::Dead(dead), Some(notify));
        self.live_count()
    }
}

/// Queued membership update about one node
struct MemberBroadcast {
    node: String,
    msg: Vec<u8>,
    notify: Mutex<Option<oneshot::Sender<()>>>,
}

impl Broadcast for MemberBroadcast {
    fn invalidates(&self, other: &dyn Broadcast) -> bool {
        other.subject() == Some(self.node.as_str())
    }

    fn message(&self) -> &[u8] {
        &self.msg
    }

    fn finished(&self) {
        if let Some(tx) = self.notify.lock().take() {
            let _ = tx.send(());
        }
    }

    fn subject(&self) -> Option<&str> {
        Some(&self.node)
    }
}

impl Pool {
    pub(crate) fn queue_member_broadcast(
        &self,
        node: &str,
        msg: &WireMessage,
        notify: Option<oneshot::Sender<()>>,
    ) {
        match wire::encode(msg) {
            Ok(bytes) => self.broadcasts.queue_broadcast(Box::new(MemberBroadcast {
                node: node.to_string(),
                msg: bytes,
                notify: Mutex::new(notify),
            })),
            Err(e) => warn!(pool = self.config.label, error = %e, "Failed to encode membership update"),
        }
    }

    fn refresh_live(&self, table: &NodeTable) {
        self.live.store(table.live_count(), Ordering::Relaxed);
    }

    /// Bump our incarnation past `accused` and announce we are alive
    fn refute(&self, table: &mut NodeTable, accused: u64) {
        let Some(local) = table.nodes.get_mut(&self.config.name) else {
            return;
        };
        local.incarnation = local.incarnation.max(accused) + 1;
        local.status = NodeStatus::Alive;
        local.changed = Instant::now();

        let alive = Alive {
            incarnation: local.incarnation,
            node: self.config.name.clone(),
            addr: self.advertise,
        };
        warn!(
            pool = self.config.label,
            incarnation = alive.incarnation,
            "Refuting suspicion about ourselves"
        );
        self.queue_member_broadcast(&self.config.name, &WireMessage::Alive(alive), None);
    }

    pub(crate) fn handle_alive(&self, alive: Alive) {
        let mut table = self.table.lock();

        if alive.node == self.config.name {
            if alive.incarnation > table.incarnation_of(&alive.node)
                && !self.leaving.load(Ordering::Acquire)
            {
                self.refute(&mut table, alive.incarnation);
            }
            return;
        }

        let rejoined = match table.nodes.get_mut(&alive.node) {
            Some(node) => {
                if alive.incarnation <= node.incarnation {
                    return;
                }
                let was_down = !node.status.is_live();
                node.incarnation = alive.incarnation;
                node.addr = alive.addr;
                node.status = NodeStatus::Alive;
                node.changed = Instant::now();
                was_down
            }
            None => {
                table.insert(NodeState {
                    name: alive.node.clone(),
                    addr: alive.addr,
                    incarnation: alive.incarnation,
                    status: NodeStatus::Alive,
                    changed: Instant::now(),
                });
                true
            }
        };
        self.refresh_live(&table);

        let descriptor = NodeDescriptor {
            name: alive.node.clone(),
            addr: alive.addr,
        };
        self.queue_member_broadcast(&descriptor.name, &WireMessage::Alive(alive), None);

        if rejoined {
            info!(
                pool = self.config.label,
                node = %descriptor.name,
                addr = %descriptor.addr,
                "Node joined"
            );
            if let Some(events) = &self.events {
                events.notify_join(&descriptor);
            }
        }
    }

    pub(crate) fn handle_suspect(&self, suspect: Suspect) {
        let mut table = self.table.lock();

        if suspect.node == self.config.name {
            if suspect.incarnation >= table.incarnation_of(&suspect.node)
                && !self.leaving.load(Ordering::Acquire)
            {
                self.refute(&mut table, suspect.incarnation);
            }
            return;
        }

        let Some(node) = table.nodes.get_mut(&suspect.node) else {
            return;
        };
        if suspect.incarnation < node.incarnation || node.status != NodeStatus::Alive {
            return;
        }
        node.incarnation = suspect.incarnation;
        node.status = NodeStatus::Suspect;
        node.changed = Instant::now();

        info!(
            pool = self.config.label,
            node = %suspect.node,
            from = %suspect.from,
            "Node suspected"
        );
        let name = suspect.node.clone();
        self.queue_member_broadcast(&name, &WireMessage::Suspect(suspect), None);
    }

    pub(crate) fn handle_dead(&self, dead: Dead) {
        let mut table = self.table.lock();

        if dead.node == self.config.name {
            if dead.incarnation >= table.incarnation_of(&dead.node)
                && !self.leaving.load(Ordering::Acquire)
            {
                self.refute(&mut table, dead.incarnation);
            }
            return;
        }

        let Some(node) = table.nodes.get_mut(&dead.node) else {
            return;
        };
        if dead.incarnation < node.incarnation || !node.status.is_live() {
            return;
        }
        let left = dead.from == dead.node;
        node.incarnation = dead.incarnation;
        node.status = if left {
            NodeStatus::Left
        } else {
            NodeStatus::Dead
        };
        node.changed = Instant::now();
        let descriptor = node.descriptor();
        self.refresh_live(&table);

        if left {
            info!(pool = self.config.label, node = %descriptor.name, "Node left");
        } else {
            warn!(
                pool = self.config.label,
                node = %descriptor.name,
                from = %dead.from,
                "Node declared dead"
            );
        }
        self.queue_member_broadcast(&descriptor.name, &WireMessage::Dead(dead), None);

        if let Some(events) = &self.events {
            events.notify_leave(&descriptor);
        }
    }

    /// Declare dead every suspect whose suspicion timeout has run out
    pub(crate) fn expire_suspects(&self) {
        let mut table = self.table.lock();
        let timeout = self.config.tuning.suspicion_timeout(table.live_count());
        let expired: Vec<String> = table
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Suspect && n.changed.elapsed() >= timeout)
            .map(|n| n.name.clone())
            .collect();

        for name in expired {
            let Some(node) = table.nodes.get_mut(&name) else {
                continue;
            };
            node.status = NodeStatus::Dead;
            node.changed = Instant::now();
            let descriptor = node.descriptor();
            let dead = Dead {
                incarnation: node.incarnation,
                node: name.clone(),
                from: self.config.name.clone(),
            };
            self.refresh_live(&table);

            warn!(pool = self.config.label, node = %name, "Suspicion timed out, declaring node dead");
            self.queue_member_broadcast(&name, &WireMessage::Dead(dead), None);
            if let Some(events) = &self.events {
                events.notify_leave(&descriptor);
            }
        }
    }

    pub(crate) fn reap_dead(&self) {
        let reaped = self
            .table
            .lock()
            .reap(&self.config.name, self.config.tuning.gossip_to_dead);
        if reaped > 0 {
            debug!(pool = self.config.label, reaped, "Forgot departed nodes");
        }
    }

    /// Fold a peer's full state into ours
    pub(crate) fn merge_states(&self, states: Vec<PushNodeState>, sender: &str, observed: SocketAddr) {
        for state in states {
            let addr = if state.name == sender {
                wire::fixup_addr(state.addr, observed)
            } else {
                state.addr
            };
            match state.status {
                NodeStatus::Alive => self.handle_alive(Alive {
                    incarnation: state.incarnation,
                    node: state.name,
                    addr,
                }),
                NodeStatus::Left => self.handle_dead(Dead {
                    incarnation: state.incarnation,
                    node: state.name.clone(),
                    from: state.name,
                }),
                NodeStatus::Suspect | NodeStatus::Dead => self.handle_suspect(Suspect {
                    incarnation: state.incarnation,
                    node: state.name,
                    from: sender.to_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn alive(name: &str, port: u16) -> NodeState {
        NodeState {
            name: name.to_string(),
            addr: addr(port),
            incarnation: 1,
            status: NodeStatus::Alive,
            changed: Instant::now(),
        }
    }

    fn with_status(name: &str, port: u16, status: NodeStatus) -> NodeState {
        NodeState {
            status,
            ..alive(name, port)
        }
    }

    #[test]
    fn test_probe_order_skips_self_and_dead() {
        let mut table = NodeTable::new("a", addr(1));
        table.insert(alive("b", 2));
        let mut c = alive("c", 3);
        c.status = NodeStatus::Dead;
        table.insert(c);

        for _ in 0..5 {
            let target = table.next_probe_target("a").unwrap();
            assert_eq!(target.name, "b");
        }
    }

    #[test]
    fn test_single_live_peer_is_found_across_reshuffles() {
        // Every shuffle order and starting offset must still reach "b"
        for _ in 0..200 {
            let mut table = NodeTable::new("a", addr(1));
            table.insert(alive("b", 2));
            table.insert(with_status("c", 3, NodeStatus::Dead));
            table.insert(with_status("d", 4, NodeStatus::Left));

            for _ in 0..10 {
                let target = table.next_probe_target("a").unwrap();
                assert_eq!(target.name, "b");
            }
        }
    }

    #[test]
    fn test_no_probe_target_when_alone() {
        let mut table = NodeTable::new("a", addr(1));
        assert!(table.next_probe_target("a").is_none());
    }

    #[test]
    fn test_live_members_sorted() {
        let mut table = NodeTable::new("m", addr(1));
        table.insert(alive("z", 2));
        table.insert(alive("b", 3));
        let mut gone = alive("c", 4);
        gone.status = NodeStatus::Left;
        table.insert(gone);

        let names: Vec<_> = table.live_members().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["b", "m", "z"]);
        assert_eq!(table.live_count(), 3);
    }

    #[test]
    fn test_reap_keeps_self_and_recent() {
        let mut table = NodeTable::new("a", addr(1));
        let mut old = alive("old", 2);
        old.status = NodeStatus::Dead;
        old.changed = Instant::now() - Duration::from_secs(60);
        table.insert(old);
        let mut fresh = alive("fresh", 3);
        fresh.status = NodeStatus::Dead;
        table.insert(fresh);

        assert_eq!(table.reap("a", Duration::from_secs(30)), 1);
        assert!(table.nodes.contains_key("a"));
        assert!(table.nodes.contains_key("fresh"));
        assert!(!table.probe_order.iter().any(|n| n == "old"));
    }

    #[test]
    fn test_random_peers_respects_filter() {
        let mut table = NodeTable::new("a", addr(1));
        table.insert(alive("b", 2));
        table.insert(alive("c", 3));

        let peers = table.random_peers("a", 5, |name| name != "b");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "c");
    }
}
