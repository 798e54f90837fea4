//! Queue wrapper for encoded cluster messages.

use crate::pool::Broadcast;

/// An encoded [`ClusterMessage`](stratus_common::ClusterMessage) waiting in a
/// pool's broadcast queue. Messages are independent, so none invalidates
/// another.
#[derive(Debug, Clone)]
pub struct ClusterBroadcast {
    msg: Vec<u8>,
}

impl ClusterBroadcast {
    pub fn new(msg: Vec<u8>) -> Self {
        Self { msg }
    }

    pub fn boxed(msg: Vec<u8>) -> Box<dyn Broadcast> {
        Box::new(Self::new(msg))
    }
}

impl Broadcast for ClusterBroadcast {
    fn invalidates(&self, _other: &dyn Broadcast) -> bool {
        false
    }

    fn message(&self) -> &[u8] {
        &self.msg
    }
}
