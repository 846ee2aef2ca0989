//! In-memory broker implementation
//!
//! Process-local implementation of the broker ports: fan-out exchanges,
//! durable queues with competing consumers served round-robin, and manual
//! acknowledgment with redelivery. Queues outlive the channels that declare
//! them, and unacknowledged deliveries return to their queue when the
//! consuming channel closes or faults. Used for development and testing;
//! connectivity and publish failures can be injected to exercise the bus's
//! recovery paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use super::traits::{BrokerChannel, ChannelEvent, Delivery, PersistentConnection};
use crate::shared::types::errors::BrokerError;

/// Buffered deliveries per consumer; one models per-consumer prefetch.
const CONSUMER_BUFFER: usize = 1;

#[derive(Clone)]
struct ConsumerHandle {
    id: u64,
    channel_id: u64,
    sender: mpsc::Sender<ChannelEvent>,
}

#[derive(Default)]
struct ConsumerSet {
    list: Vec<ConsumerHandle>,
    /// Round-robin cursor over `list`.
    next: usize,
}

struct QueueState {
    name: String,
    messages: Mutex<VecDeque<Vec<u8>>>,
    consumers: Mutex<ConsumerSet>,
    /// Wakes the pump when messages or consumers change.
    notify: Notify,
    pump_started: AtomicBool,
}

impl QueueState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            messages: Mutex::new(VecDeque::new()),
            consumers: Mutex::new(ConsumerSet::default()),
            notify: Notify::new(),
            pump_started: AtomicBool::new(false),
        }
    }
}

struct UnackedDelivery {
    queue: String,
    payload: Vec<u8>,
    channel_id: u64,
}

struct BrokerCore {
    exchanges: DashMap<String, DashMap<String, ()>>,
    queues: DashMap<String, Arc<QueueState>>,
    unacked: DashMap<u64, UnackedDelivery>,
    connected: AtomicBool,
    reconnectable: AtomicBool,
    publish_failures: AtomicU32,
    tag_counter: AtomicU64,
    id_counter: AtomicU64,
}

impl BrokerCore {
    fn next_id(&self) -> u64 {
        self.id_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unreachable("broker is offline".to_string()))
        }
    }

    /// Return a channel's unacknowledged deliveries to their queues.
    fn requeue_for_channel(&self, channel_id: u64) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|e| e.value().channel_id == channel_id)
            .map(|e| *e.key())
            .collect();

        for tag in tags {
            if let Some((_, undelivered)) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get(&undelivered.queue) {
                    queue.messages.lock().unwrap().push_front(undelivered.payload);
                    queue.notify.notify_one();
                }
            }
        }
    }

    fn remove_consumers_of_channel(&self, channel_id: u64) {
        for queue in self.queues.iter() {
            queue.consumers.lock().unwrap().list.retain(|c| c.channel_id != channel_id);
        }
    }
}

/// Moves ready messages to consumers, one queue per task.
async fn queue_pump(core: Arc<BrokerCore>, queue: Arc<QueueState>) {
    loop {
        // A queue with no consumers keeps its messages: don't pop until
        // someone can take the delivery.
        let idle = queue.consumers.lock().unwrap().list.is_empty();
        if idle {
            queue.notify.notified().await;
            continue;
        }

        let next = queue.messages.lock().unwrap().pop_front();
        let Some(payload) = next else {
            queue.notify.notified().await;
            continue;
        };

        let target = {
            let mut consumers = queue.consumers.lock().unwrap();
            if consumers.list.is_empty() {
                None
            } else {
                let index = consumers.next % consumers.list.len();
                consumers.next = consumers.next.wrapping_add(1);
                Some(consumers.list[index].clone())
            }
        };

        let Some(consumer) = target else {
            // Consumers vanished between the check and the pick.
            queue.messages.lock().unwrap().push_front(payload);
            continue;
        };

        let tag = core.tag_counter.fetch_add(1, Ordering::SeqCst);
        core.unacked.insert(
            tag,
            UnackedDelivery {
                queue: queue.name.clone(),
                payload: payload.clone(),
                channel_id: consumer.channel_id,
            },
        );

        let delivery = ChannelEvent::Delivery(Delivery {
            delivery_tag: tag,
            payload,
        });
        if consumer.sender.send(delivery).await.is_err() {
            // Consumer went away mid-handoff: take the delivery back.
            if let Some((_, undelivered)) = core.unacked.remove(&tag) {
                queue.messages.lock().unwrap().push_front(undelivered.payload);
            }
            queue.consumers.lock().unwrap().list.retain(|c| c.id != consumer.id);
        }
    }
}

/// In-memory broker for development and testing.
pub struct InMemoryBroker {
    core: Arc<BrokerCore>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            core: Arc::new(BrokerCore {
                exchanges: DashMap::new(),
                queues: DashMap::new(),
                unacked: DashMap::new(),
                connected: AtomicBool::new(true),
                reconnectable: AtomicBool::new(true),
                publish_failures: AtomicU32::new(0),
                tag_counter: AtomicU64::new(1),
                id_counter: AtomicU64::new(1),
            }),
        }
    }

    /// Drop connectivity. Channel operations fail until reconnected.
    pub fn disconnect(&self) {
        self.core.connected.store(false, Ordering::SeqCst);
    }

    /// Whether `try_connect` is allowed to restore connectivity.
    pub fn set_reconnectable(&self, allowed: bool) {
        self.core.reconnectable.store(allowed, Ordering::SeqCst);
    }

    /// Fail the next `n` publishes with a transient error.
    pub fn fail_publishes(&self, n: u32) {
        self.core.publish_failures.store(n, Ordering::SeqCst);
    }

    /// Inject a channel-level fault into every consumer of `queue`.
    ///
    /// Their unacknowledged deliveries return to the queue, as they would
    /// when a real channel dies.
    pub async fn fault_consumers(&self, queue: &str, reason: &str) {
        let Some(queue_state) = self.core.queues.get(queue).map(|q| Arc::clone(&q)) else {
            return;
        };

        let victims: Vec<ConsumerHandle> = {
            let mut consumers = queue_state.consumers.lock().unwrap();
            std::mem::take(&mut consumers.list)
        };

        for consumer in victims {
            self.core.requeue_for_channel(consumer.channel_id);
            let _ = consumer
                .sender
                .send(ChannelEvent::Fault(reason.to_string()))
                .await;
        }
        queue_state.notify.notify_one();
    }

    /// Ready (undelivered) messages in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.core
            .queues
            .get(queue)
            .map(|q| q.messages.lock().unwrap().len())
            .unwrap_or(0)
    }

    /// Delivered but unacknowledged messages across all queues.
    pub fn in_flight(&self) -> usize {
        self.core.unacked.len()
    }

    /// Active consumers on `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.core
            .queues
            .get(queue)
            .map(|q| q.consumers.lock().unwrap().list.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistentConnection for InMemoryBroker {
    fn is_connected(&self) -> bool {
        self.core.connected.load(Ordering::SeqCst)
    }

    async fn try_connect(&self) -> bool {
        if self.core.reconnectable.load(Ordering::SeqCst) {
            self.core.connected.store(true, Ordering::SeqCst);
        }
        self.is_connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.core.ensure_connected()?;
        let channel = InMemoryChannel {
            id: self.core.next_id(),
            core: self.core.clone(),
            closed: AtomicBool::new(false),
        };
        Ok(Arc::new(channel))
    }
}

struct InMemoryChannel {
    id: u64,
    core: Arc<BrokerCore>,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.core.ensure_connected()
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_fanout_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.core
            .exchanges
            .entry(exchange.to_string())
            .or_default();
        Ok(())
    }

    async fn declare_durable_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.core
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(QueueState::new(queue)));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if !self.core.queues.contains_key(queue) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }
        let Some(bindings) = self.core.exchanges.get(exchange) else {
            return Err(BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            });
        };
        bindings.insert(queue.to_string(), ());
        Ok(())
    }

    async fn publish(&self, exchange: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let failures = &self.core.publish_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::Io("injected publish failure".to_string()));
        }

        let Some(bindings) = self.core.exchanges.get(exchange) else {
            return Err(BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            });
        };
        let bound: Vec<String> = bindings.iter().map(|e| e.key().clone()).collect();
        drop(bindings);

        for queue_name in bound {
            if let Some(queue) = self.core.queues.get(&queue_name) {
                queue.messages.lock().unwrap().push_back(payload.clone());
                queue.notify.notify_one();
            }
        }
        debug!(exchange, "message routed");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<ChannelEvent>, BrokerError> {
        self.ensure_open()?;
        let Some(queue_state) = self.core.queues.get(queue).map(|q| Arc::clone(&q)) else {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        };

        let (sender, receiver) = mpsc::channel(CONSUMER_BUFFER);
        queue_state.consumers.lock().unwrap().list.push(ConsumerHandle {
            id: self.core.next_id(),
            channel_id: self.id,
            sender,
        });

        if !queue_state.pump_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(queue_pump(self.core.clone(), queue_state.clone()));
        }
        queue_state.notify.notify_one();
        Ok(receiver)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if self.core.unacked.remove(&delivery_tag).is_none() {
            return Err(BrokerError::ChannelFault(format!(
                "unknown delivery tag {}",
                delivery_tag
            )));
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.remove_consumers_of_channel(self.id);
        self.core.requeue_for_channel(self.id);
    }
}
