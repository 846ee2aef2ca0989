//! Integration event bus
//!
//! Typed publish/subscribe over the broker: event declarations and naming,
//! handler registration, the per-event-type subscriptions and their
//! consumer loops, and the bus facade itself.

pub mod consumer;
pub mod event;
pub mod event_bus;
pub mod handler;
pub mod subscription;

pub use event::{EventMetadata, IntegrationEvent, NamingPolicy};
pub use event_bus::{create_event_bus, EventBus, SharedEventBus};
pub use handler::{HandlerKind, IntegrationEventHandler};
