//! Per-event-type subscription state

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;

use super::event::IntegrationEvent;
use super::handler::{HandlerKind, Invoker};
use crate::broker::traits::BrokerChannel;
use crate::shared::types::errors::BusError;

/// Dispatches one raw payload to every currently-registered handler kind.
#[async_trait]
pub(crate) trait HandlerTable: Send + Sync {
    /// Decode the payload once, then run the full handler fan-out
    /// sequentially. An error from any step aborts the fan-out.
    async fn dispatch(&self, payload: &[u8]) -> Result<(), BusError>;

    fn remove(&self, kind: HandlerKind) -> bool;

    fn kinds(&self) -> Vec<HandlerKind>;

    fn as_any(&self) -> &dyn Any;
}

/// Handler table for one concrete event type.
pub(crate) struct TypedHandlerTable<E: IntegrationEvent> {
    invokers: DashMap<HandlerKind, Invoker<E>>,
}

impl<E: IntegrationEvent> TypedHandlerTable<E> {
    pub(crate) fn new() -> Self {
        Self {
            invokers: DashMap::new(),
        }
    }

    /// Register `kind`. Re-registering replaces the previous entry, so a
    /// kind is invoked at most once per message.
    pub(crate) fn insert(&self, kind: HandlerKind, invoker: Invoker<E>) {
        self.invokers.insert(kind, invoker);
    }
}

#[async_trait]
impl<E: IntegrationEvent> HandlerTable for TypedHandlerTable<E> {
    async fn dispatch(&self, payload: &[u8]) -> Result<(), BusError> {
        let event: E = serde_json::from_slice(payload)?;

        // Snapshot the registrations so a concurrent unsubscribe cannot
        // disturb an in-flight fan-out.
        let snapshot: Vec<(HandlerKind, Invoker<E>)> = self
            .invokers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (kind, invoker) in snapshot {
            invoker(event.clone())
                .await
                .map_err(|source| BusError::Handler { kind, source })?;
        }
        Ok(())
    }

    fn remove(&self, kind: HandlerKind) -> bool {
        self.invokers.remove(kind).is_some()
    }

    fn kinds(&self) -> Vec<HandlerKind> {
        self.invokers.iter().map(|entry| *entry.key()).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One entry per event type that has ever had a subscriber.
///
/// The channel slot is replaced in place when the consumer channel faults;
/// the handler table survives the swap. Entries are never removed, even
/// when the last handler unsubscribes (the queue keeps draining).
pub(crate) struct Subscription {
    pub(crate) channel: RwLock<Arc<dyn BrokerChannel>>,
    pub(crate) handlers: Arc<dyn HandlerTable>,
}
