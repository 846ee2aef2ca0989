//! Broker trait definitions

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::shared::types::errors::BrokerError;

/// One message taken from a queue, awaiting manual acknowledgment.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
}

/// Items surfaced by a consuming channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A message to process and acknowledge.
    Delivery(Delivery),
    /// Channel-level fault; the channel must be replaced.
    Fault(String),
}

/// A broker connection that outlives individual channels.
#[async_trait]
pub trait PersistentConnection: Send + Sync {
    /// Whether the underlying connection is currently usable.
    fn is_connected(&self) -> bool;

    /// Attempt to (re)connect. Returns whether the connection is usable
    /// afterwards.
    async fn try_connect(&self) -> bool;

    /// Open a new channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// A single broker channel.
///
/// Declares are idempotent. Publishes are persistent and fan-out: the
/// routing key is empty and every queue bound to the exchange receives a
/// copy.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_fanout_exchange(&self, exchange: &str) -> Result<(), BrokerError>;

    /// Declare a durable, non-exclusive, non-auto-delete queue.
    async fn declare_durable_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), BrokerError>;

    async fn publish(&self, exchange: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Start consuming with manual acknowledgment.
    ///
    /// The receiver is bounded with capacity one: the broker hands over at
    /// most one delivery ahead of the consumer, so a slow consumer holds
    /// back the stream rather than accumulating messages in memory.
    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<ChannelEvent>, BrokerError>;

    /// Acknowledge one delivery, removing it from the queue.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Close the channel. Unacknowledged deliveries return to their queue.
    async fn close(&self);
}
