//! Event handler contract and type-erased invocation

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use super::event::IntegrationEvent;
use crate::shared::types::errors::DynHandlerError;

/// Identity token for one handler implementation of a given event type.
pub type HandlerKind = &'static str;

/// Handles one integration event type.
///
/// A fresh instance is built for every delivered message by the factory
/// given at subscription time, so implementations may hold per-message
/// state. A returned error leaves the message unacknowledged and the
/// broker redelivers it; handlers must therefore tolerate duplicates.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync {
    /// Stable identity for this implementation, unique per event type.
    const KIND: HandlerKind;

    async fn handle(&self, event: E) -> Result<(), DynHandlerError>;
}

/// Type-erased invocation: builds a handler and runs it on a decoded event.
pub(crate) type Invoker<E> =
    Arc<dyn Fn(E) -> BoxFuture<'static, Result<(), DynHandlerError>> + Send + Sync>;

pub(crate) fn make_invoker<E, H, F>(factory: F) -> Invoker<E>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E> + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    Arc::new(move |event: E| {
        let handler = factory();
        Box::pin(async move { handler.handle(event).await })
    })
}
