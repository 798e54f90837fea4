//! Typed fan-out of inbound cluster messages.
//!
//! A [`Mux`] turns the single `on_message` callback of a cluster into
//! per-payload subscriptions:
//!
//! ```ignore
//! let mux = Arc::new(Mux::new());
//! mux.subscribe::<CacheInvalidation>(|inv| cache.evict(&inv.body));
//! let config = ClusterConfig::new("us-east-1", "gw-1").with_handler(mux.handler());
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use stratus_common::{
    CacheInvalidation, ClusterMessage, Direction, OpaqueMessage, Payload, PayloadKind,
};

use crate::cluster::MessageHandler;

/// A payload variant a [`Mux`] can route to
pub trait Routable: Clone + Send + Sync + 'static {
    const KIND: PayloadKind;

    fn extract(payload: &Payload) -> Option<&Self>;
}

impl Routable for CacheInvalidation {
    const KIND: PayloadKind = PayloadKind::CacheInvalidation;

    fn extract(payload: &Payload) -> Option<&Self> {
        match payload {
            Payload::CacheInvalidation(inner) => Some(inner),
            _ => None,
        }
    }
}

impl Routable for OpaqueMessage {
    const KIND: PayloadKind = PayloadKind::Opaque;

    fn extract(payload: &Payload) -> Option<&Self> {
        match payload {
            Payload::Opaque(inner) => Some(inner),
            _ => None,
        }
    }
}

/// A typed payload plus where it came from
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub body: T,
    pub source_region: String,
    pub sender_node: String,
    pub sent_at_ms: i64,
    pub direction: Direction,
}

type Handler = Arc<dyn Fn(&ClusterMessage) + Send + Sync>;

#[derive(Default)]
pub struct Mux {
    handlers: RwLock<HashMap<PayloadKind, Vec<Handler>>>,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one payload variant
    pub fn subscribe<T: Routable>(&self, handler: impl Fn(Envelope<T>) + Send + Sync + 'static) {
        let wrapped: Handler = Arc::new(move |msg: &ClusterMessage| {
            if let Some(body) = T::extract(&msg.payload) {
                handler(Envelope {
                    body: body.clone(),
                    source_region: msg.source_region.clone(),
                    sender_node: msg.sender_node.clone(),
                    sent_at_ms: msg.sent_at_ms,
                    direction: msg.direction,
                });
            }
        });
        self.handlers.write().entry(T::KIND).or_default().push(wrapped);
    }

    /// Hand a message to every handler subscribed to its variant
    pub fn dispatch(&self, msg: ClusterMessage) {
        let kind = msg.payload.kind();
        let handlers = self.handlers.read().get(&kind).cloned().unwrap_or_default();
        if handlers.is_empty() {
            debug!(
                payload_type = kind.as_str(),
                source_region = %msg.source_region,
                "No handler for cluster message"
            );
            return;
        }
        for handler in &handlers {
            handler(&msg);
        }
    }

    /// Callback to install as a cluster's message handler
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let mux = self.clone();
        Arc::new(move |msg| mux.dispatch(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn message(payload: Payload) -> ClusterMessage {
        ClusterMessage::new(payload, "us-east-1", "gw-1", Direction::Lan)
    }

    #[test]
    fn test_routes_by_variant() {
        let mux = Arc::new(Mux::new());
        let keys = Arc::new(Mutex::new(Vec::new()));
        let topics = Arc::new(Mutex::new(Vec::new()));

        let seen = keys.clone();
        mux.subscribe::<CacheInvalidation>(move |env| seen.lock().push(env.body.cache_name));
        let seen = topics.clone();
        mux.subscribe::<OpaqueMessage>(move |env| seen.lock().push(env.body.topic));

        let handler = mux.handler();
        handler(message(CacheInvalidation::clear_all("sessions").into()));
        handler(message(
            OpaqueMessage {
                topic: "deploy".to_string(),
                data: vec![1, 2],
            }
            .into(),
        ));

        assert_eq!(keys.lock().as_slice(), ["sessions".to_string()]);
        assert_eq!(topics.lock().as_slice(), ["deploy".to_string()]);
    }

    #[test]
    fn test_every_subscriber_sees_the_message() {
        let mux = Mux::new();
        let count = Arc::new(Mutex::new(0));
        for _ in 0..3 {
            let count = count.clone();
            mux.subscribe::<CacheInvalidation>(move |env| {
                assert_eq!(env.source_region, "us-east-1");
                *count.lock() += 1;
            });
        }

        mux.dispatch(message(CacheInvalidation::key("keys", "k1").into()));
        assert_eq!(*count.lock(), 3);
    }

    #[test]
    fn test_unhandled_variant_is_ignored() {
        let mux = Mux::new();
        mux.dispatch(message(
            OpaqueMessage {
                topic: "nobody".to_string(),
                data: Vec::new(),
            }
            .into(),
        ));
    }
}
