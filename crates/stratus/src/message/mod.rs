//! Cluster message codec.
//!
//! A [`ClusterMessage`] travels as the opaque user payload of a pool. The
//! encoding is bincode with a hard size limit so a corrupt length prefix
//! cannot trigger a huge allocation.

mod broadcast;
mod mux;

pub use broadcast::ClusterBroadcast;
pub use mux::{Envelope, Mux, Routable};

use bincode::Options;

use stratus_common::{ClusterMessage, Result};

/// Upper bound on a decoded message (one UDP datagram)
const DECODE_LIMIT: u64 = 64 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(DECODE_LIMIT)
}

pub fn encode(msg: &ClusterMessage) -> Result<Vec<u8>> {
    Ok(options().serialize(msg)?)
}

pub fn decode(bytes: &[u8]) -> Result<ClusterMessage> {
    Ok(options().deserialize(bytes)?)
}
