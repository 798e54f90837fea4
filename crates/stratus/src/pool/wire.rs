//! Pool wire format.
//!
//! A datagram is one bincode-encoded [`Packet`]. Each entry of
//! `Packet::messages` is an independently encoded [`WireMessage`], so queued
//! broadcasts can be piggybacked without re-encoding them.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::net::SocketAddr;

use stratus_common::Result;

/// Largest UDP payload we send or accept
pub(crate) const MAX_PACKET: usize = 65_507;

/// Worst-case framing added around each compound entry
pub(crate) const COMPOUND_OVERHEAD: usize = 3;

/// Worst-case framing added when wrapping user bytes in [`WireMessage::User`]
pub(crate) const USER_OVERHEAD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum NodeStatus {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl NodeStatus {
    pub(crate) fn is_live(&self) -> bool {
        matches!(self, Self::Alive | Self::Suspect)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Alive {
    pub incarnation: u64,
    pub node: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Suspect {
    pub incarnation: u64,
    pub node: String,
    pub from: String,
}

/// `from == node` means the node left on purpose
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Dead {
    pub incarnation: u64,
    pub node: String,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PushNodeState {
    pub name: String,
    pub addr: SocketAddr,
    pub incarnation: u64,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum WireMessage {
    Ping {
        seq: u32,
        target: String,
    },
    IndirectPing {
        seq: u32,
        target: String,
        target_addr: SocketAddr,
    },
    Ack {
        seq: u32,
    },
    Alive(Alive),
    Suspect(Suspect),
    Dead(Dead),
    PushPull {
        seq: u32,
        join: bool,
        states: Vec<PushNodeState>,
    },
    PushPullReply {
        seq: u32,
        states: Vec<PushNodeState>,
    },
    User(Vec<u8>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Packet {
    pub from: String,
    pub from_addr: SocketAddr,
    pub messages: Vec<Vec<u8>>,
}

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_PACKET as u64)
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(options().serialize(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(options().deserialize(bytes)?)
}

pub(crate) fn encoded_len<T: Serialize>(value: &T) -> Result<usize> {
    Ok(options().serialized_size(value)? as usize)
}

/// Substitute the observed source IP when a peer advertises an unspecified one
pub(crate) fn fixup_addr(declared: SocketAddr, observed: SocketAddr) -> SocketAddr {
    if declared.ip().is_unspecified() {
        SocketAddr::new(observed.ip(), declared.port())
    } else {
        declared
    }
}
