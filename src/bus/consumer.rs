//! Consumer channel lifecycle and the receive loop
//!
//! One consumer task per subscribed event type. Deliveries are processed
//! strictly one at a time: decode, fan out to every registered handler
//! kind, then acknowledge. A failed delivery is left unacknowledged for
//! the broker to redeliver - there is no retry cap and no dead-letter
//! routing, so a permanently failing message keeps coming back.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::event::EventMetadata;
use super::subscription::Subscription;
use crate::broker::traits::{BrokerChannel, ChannelEvent, PersistentConnection};
use crate::shared::types::errors::BrokerError;

/// Delay bounds for rebuilding a faulted consumer channel.
const REBUILD_INITIAL_DELAY: Duration = Duration::from_secs(2);
const REBUILD_MAX_DELAY: Duration = Duration::from_secs(60);

/// Open a consumer channel: declare the fan-out exchange and the durable
/// queue, bind them, and start consuming.
pub(crate) async fn open_consumer_channel(
    connection: &Arc<dyn PersistentConnection>,
    meta: &EventMetadata,
) -> Result<(Arc<dyn BrokerChannel>, mpsc::Receiver<ChannelEvent>), BrokerError> {
    if !connection.is_connected() {
        connection.try_connect().await;
    }

    let channel = connection.create_channel().await?;
    channel.declare_fanout_exchange(&meta.exchange).await?;
    channel.declare_durable_queue(&meta.queue).await?;
    channel.bind_queue(&meta.queue, &meta.exchange).await?;
    let receiver = channel.consume(&meta.queue).await?;

    info!(queue = %meta.queue, exchange = %meta.exchange, "Queue bound to exchange");
    Ok((channel, receiver))
}

/// The receive loop for one subscription.
pub(crate) struct Consumer {
    connection: Arc<dyn PersistentConnection>,
    meta: EventMetadata,
    event_name: &'static str,
    subscription: Arc<Subscription>,
}

impl Consumer {
    pub(crate) fn new(
        connection: Arc<dyn PersistentConnection>,
        meta: EventMetadata,
        event_name: &'static str,
        subscription: Arc<Subscription>,
    ) -> Self {
        Self {
            connection,
            meta,
            event_name,
            subscription,
        }
    }

    pub(crate) async fn run(self, mut events: mpsc::Receiver<ChannelEvent>) {
        loop {
            match events.recv().await {
                Some(ChannelEvent::Delivery(delivery)) => {
                    debug!(
                        event = self.event_name,
                        tag = delivery.delivery_tag,
                        "Message received"
                    );
                    self.process(delivery.delivery_tag, &delivery.payload).await;
                }
                Some(ChannelEvent::Fault(reason)) => {
                    warn!(
                        event = self.event_name,
                        %reason,
                        "Consumer channel fault, replacing channel"
                    );
                    events = self.rebuild().await;
                }
                None => {
                    warn!(
                        event = self.event_name,
                        "Consumer stream ended, replacing channel"
                    );
                    events = self.rebuild().await;
                }
            }
        }
    }

    async fn process(&self, delivery_tag: u64, payload: &[u8]) {
        match self.subscription.handlers.dispatch(payload).await {
            Ok(()) => {
                let channel = Arc::clone(&*self.subscription.channel.read().await);
                match channel.ack(delivery_tag).await {
                    Ok(()) => {
                        metrics::counter!("eventbus_consumed_total", "event" => self.event_name)
                            .increment(1);
                        debug!(
                            event = self.event_name,
                            tag = delivery_tag,
                            "Message acknowledged"
                        );
                    }
                    Err(e) => {
                        warn!(
                            event = self.event_name,
                            tag = delivery_tag,
                            error = %e,
                            "Acknowledgment failed, message will be redelivered"
                        );
                    }
                }
            }
            Err(e) => {
                // Left unacknowledged on purpose: the broker redelivers it.
                metrics::counter!("eventbus_handler_failures_total", "event" => self.event_name)
                    .increment(1);
                error!(
                    event = self.event_name,
                    error = %e,
                    "Message processing failed, delivery not acknowledged"
                );
            }
        }
    }

    /// Dispose the faulted channel and open a replacement, retrying until
    /// the broker lets us back in. The handler table is untouched, so the
    /// subscription carries on where it left off.
    async fn rebuild(&self) -> mpsc::Receiver<ChannelEvent> {
        let stale = Arc::clone(&*self.subscription.channel.read().await);
        stale.close().await;

        let mut delay = REBUILD_INITIAL_DELAY;
        loop {
            match open_consumer_channel(&self.connection, &self.meta).await {
                Ok((channel, receiver)) => {
                    *self.subscription.channel.write().await = channel;
                    info!(
                        event = self.event_name,
                        queue = %self.meta.queue,
                        "Consumer channel replaced"
                    );
                    return receiver;
                }
                Err(e) => {
                    warn!(
                        event = self.event_name,
                        error = %e,
                        retry_in_s = delay.as_secs(),
                        "Channel rebuild failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(REBUILD_MAX_DELAY);
                }
            }
        }
    }
}
