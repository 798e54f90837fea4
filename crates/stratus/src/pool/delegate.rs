//! Hooks a pool calls into its owner.

use stratus_common::NodeDescriptor;

/// User-message hooks.
///
/// Both methods run on the pool's own tasks and must not block.
pub trait Delegate: Send + Sync {
    /// A user message arrived
    fn notify_msg(&self, msg: &[u8]);

    /// Pending user broadcasts to piggyback, each charged `overhead` bytes,
    /// totalling at most `limit` bytes
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;
}

/// Membership change hooks.
///
/// Called while the pool holds its member-table lock: implementations must
/// not call back into the pool (members, join, leave...) or they deadlock.
pub trait EventDelegate: Send + Sync {
    fn notify_join(&self, node: &NodeDescriptor);

    fn notify_leave(&self, node: &NodeDescriptor);
}
