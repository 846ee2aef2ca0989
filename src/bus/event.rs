//! Integration event declarations and broker naming

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A payload type that travels over the bus.
///
/// `NAME` identifies the type on the wire and defaults both the exchange
/// and queue names. Events that every instance must see set `NODE_SCOPED`,
/// giving each node its own queue behind the shared fan-out exchange;
/// events that must be handled exactly once per message leave it unset so
/// the whole fleet competes on a single queue.
pub trait IntegrationEvent:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Wire identifier for this event type; unique across the system.
    const NAME: &'static str;

    /// Exchange name override.
    const EXCHANGE: Option<&'static str> = None;

    /// Queue name override (base name, before node scoping).
    const QUEUE: Option<&'static str> = None;

    /// Suffix the queue name with the node identity.
    const NODE_SCOPED: bool = false;
}

/// Resolved broker names for one event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMetadata {
    pub exchange: String,
    pub queue: String,
}

/// Derives exchange and queue names for event types.
///
/// Names are stable for the lifetime of the process, and any two instances
/// resolve the same names independently - except node-scoped queue names,
/// which embed this node's identity so each instance gets its own copy of
/// the fan-out traffic.
pub struct NamingPolicy {
    node_id: String,
    cache: DashMap<&'static str, EventMetadata>,
}

impl NamingPolicy {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            cache: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Resolve (and cache) the names for `E`.
    pub fn resolve<E: IntegrationEvent>(&self) -> EventMetadata {
        if let Some(meta) = self.cache.get(E::NAME) {
            return meta.clone();
        }

        let exchange = E::EXCHANGE.unwrap_or(E::NAME).to_string();
        let base = E::QUEUE.unwrap_or(E::NAME);
        let queue = if E::NODE_SCOPED {
            format!("{}_{}", base, self.node_id)
        } else {
            base.to_string()
        };

        let meta = EventMetadata { exchange, queue };
        self.cache.insert(E::NAME, meta.clone());
        meta
    }
}
