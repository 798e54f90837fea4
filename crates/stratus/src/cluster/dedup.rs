//! Recently-seen message set.
//!
//! Gossip retransmits every broadcast several times, so one node can receive
//! the same message from more than one peer. A bounded FIFO of fingerprints
//! drops the repeats before they reach the application or get relayed.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use stratus_common::ClusterMessage;

pub(crate) struct RecentMessages {
    capacity: usize,
    inner: Mutex<Seen>,
}

#[derive(Default)]
struct Seen {
    set: HashSet<u64>,
    order: VecDeque<u64>,
}

/// Identity of one broadcast, independent of the hop it is on
fn fingerprint(msg: &ClusterMessage) -> u64 {
    let mut hasher = DefaultHasher::new();
    msg.sender_node.hash(&mut hasher);
    msg.msg_id.hash(&mut hasher);
    hasher.finish()
}

impl RecentMessages {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Seen::default()),
        }
    }

    /// Record `msg`; false if it was already seen
    pub(crate) fn first_sighting(&self, msg: &ClusterMessage) -> bool {
        let id = fingerprint(msg);
        let mut seen = self.inner.lock();
        if !seen.set.insert(id) {
            return false;
        }
        seen.order.push_back(id);
        if seen.order.len() > self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.set.remove(&oldest);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::{CacheInvalidation, Direction};

    fn msg(key: &str) -> ClusterMessage {
        ClusterMessage::new(
            CacheInvalidation::key("keys", key).into(),
            "us-east-1",
            "gw-1",
            Direction::Lan,
        )
    }

    #[test]
    fn test_repeat_is_detected_across_hops() {
        let recent = RecentMessages::new(16);
        let original = msg("a");

        assert!(recent.first_sighting(&original));
        assert!(!recent.first_sighting(&original));
        assert!(!recent.first_sighting(&original.with_direction(Direction::Wan)));
        assert!(recent.first_sighting(&msg("b")));
    }

    #[test]
    fn test_same_payload_broadcast_twice_is_not_a_repeat() {
        let recent = RecentMessages::new(16);
        let mut first = msg("user-42");
        let mut second = msg("user-42");
        // Same millisecond, same payload
        second.sent_at_ms = first.sent_at_ms;

        assert!(recent.first_sighting(&first));
        assert!(recent.first_sighting(&second));

        // Only the id matters, not the hop or the payload
        first.payload = CacheInvalidation::key("keys", "other").into();
        assert!(!recent.first_sighting(&first));
    }

    #[test]
    fn test_oldest_entries_are_evicted() {
        let recent = RecentMessages::new(2);
        let first = msg("1");
        assert!(recent.first_sighting(&first));
        assert!(recent.first_sighting(&msg("2")));
        assert!(recent.first_sighting(&msg("3")));

        // "1" fell out of the window
        assert!(recent.first_sighting(&first));
    }
}
