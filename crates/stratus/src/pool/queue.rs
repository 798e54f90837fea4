//! Transmit-limited broadcast queue.
//!
//! Every queued broadcast is handed out on outgoing gossip until it has been
//! transmitted `retransmit_mult * ceil(log10(n + 1))` times, where `n` is the
//! current pool size. Least-transmitted broadcasts go first; among equals the
//! newest wins.

use parking_lot::Mutex;

/// Something the queue can piggyback on gossip traffic
pub trait Broadcast: Send + Sync {
    /// Whether queuing `self` makes `other` obsolete
    fn invalidates(&self, other: &dyn Broadcast) -> bool;

    /// Encoded bytes to transmit
    fn message(&self) -> &[u8];

    /// Called once the broadcast leaves the queue (sent out or invalidated)
    fn finished(&self) {}

    /// Pool member this broadcast is about, if any
    fn subject(&self) -> Option<&str> {
        None
    }
}

struct Queued {
    id: u64,
    transmits: u32,
    broadcast: Box<dyn Broadcast>,
}

#[derive(Default)]
struct QueueInner {
    items: Vec<Queued>,
    next_id: u64,
}

pub struct TransmitLimitedQueue {
    retransmit_mult: u32,
    num_nodes: Box<dyn Fn() -> usize + Send + Sync>,
    inner: Mutex<QueueInner>,
}

/// Transmissions allowed per broadcast for a pool of `num_nodes`
pub fn retransmit_limit(retransmit_mult: u32, num_nodes: usize) -> u32 {
    let scale = ((num_nodes + 1) as f64).log10().ceil() as u32;
    retransmit_mult * scale.max(1)
}

impl TransmitLimitedQueue {
    pub fn new(
        retransmit_mult: u32,
        num_nodes: impl Fn() -> usize + Send + Sync + 'static,
    ) -> Self {
        Self {
            retransmit_mult,
            num_nodes: Box::new(num_nodes),
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Enqueue a broadcast, dropping anything it invalidates
    pub fn queue_broadcast(&self, broadcast: Box<dyn Broadcast>) {
        let invalidated = {
            let mut inner = self.inner.lock();
            let (stale, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.items)
                .into_iter()
                .partition(|q| broadcast.invalidates(q.broadcast.as_ref()));
            inner.items = kept;

            let id = inner.next_id;
            inner.next_id += 1;
            inner.items.push(Queued {
                id,
                transmits: 0,
                broadcast,
            });
            stale
        };

        for q in invalidated {
            q.broadcast.finished();
        }
    }

    /// Take as many messages as fit into `limit` bytes, charging `overhead`
    /// per message
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let transmit_limit = retransmit_limit(self.retransmit_mult, (self.num_nodes)());

        let (selected, done) = {
            let mut inner = self.inner.lock();
            if inner.items.is_empty() {
                return Vec::new();
            }

            inner
                .items
                .sort_by(|a, b| a.transmits.cmp(&b.transmits).then(b.id.cmp(&a.id)));

            let mut remaining = limit;
            let mut selected = Vec::new();
            for q in inner.items.iter_mut() {
                let cost = q.broadcast.message().len() + overhead;
                if cost > remaining {
                    continue;
                }
                remaining -= cost;
                selected.push(q.broadcast.message().to_vec());
                q.transmits += 1;
            }

            let (done, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.items)
                .into_iter()
                .partition(|q| q.transmits >= transmit_limit);
            inner.items = kept;
            (selected, done)
        };

        for q in done {
            q.broadcast.finished();
        }
        selected
    }

    pub fn num_queued(&self) -> usize {
        self.inner.lock().items.len()
    }
}
