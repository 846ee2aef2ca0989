//! Broker connection layer
//!
//! Ports for the message broker the bus publishes to and consumes from,
//! plus an in-memory implementation for development and testing. The real
//! connection (e.g. an AMQP client) is supplied by the embedding
//! application.

pub mod memory;
pub mod traits;

pub use memory::InMemoryBroker;
pub use traits::{BrokerChannel, ChannelEvent, Delivery, PersistentConnection};
