//! # Quiz Integration Event Bus
//!
//! Typed publish/subscribe layer over a message broker for the quiz
//! backend. Decouples the quiz domain logic from the real-time notification
//! layer and tolerates broker unavailability, multi-instance deployment and
//! concurrent registration.
//!
//! Every event type gets a fan-out exchange and a durable queue. Node-scoped
//! events give each backend instance its own queue (everyone sees every
//! message); the rest share one queue fleet-wide (exactly one instance
//! handles each message). Delivery is at-least-once: messages are
//! acknowledged only after every registered handler completed, and handlers
//! must tolerate redelivery.
//!
//! ## Architecture
//!
//! - **broker**: connection and channel ports, plus the in-memory broker
//! - **bus**: event declarations, naming, subscriptions, publisher, consumer
//! - **events**: the quiz integration event types
//! - **config**: TOML configuration
//! - **shared**: error taxonomy and retry helper
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use quiz_eventbus::{create_event_bus, BusConfig, InMemoryBroker};
//! use quiz_eventbus::events::UserScoreUpdated;
//!
//! let broker = Arc::new(InMemoryBroker::new());
//! let bus = create_event_bus(broker, &BusConfig::default());
//!
//! bus.subscribe(move || ScoreBoardHandler::new(hub.clone())).await?;
//! bus.publish(&UserScoreUpdated {
//!     quiz_id: "quiz-1".into(),
//!     username: "a".into(),
//!     score: 3,
//! })
//! .await?;
//! ```

pub mod broker;
pub mod bus;
pub mod config;
pub mod events;
pub mod shared;

pub use broker::{BrokerChannel, ChannelEvent, Delivery, InMemoryBroker, PersistentConnection};
pub use bus::{
    create_event_bus, EventBus, EventMetadata, HandlerKind, IntegrationEvent,
    IntegrationEventHandler, NamingPolicy, SharedEventBus,
};
pub use config::{default_config_path, BusConfig};
pub use shared::types::errors::{BrokerError, BusError, BusResult, DynHandlerError};
