//! Event bus facade
//!
//! Publishes integration events to fan-out exchanges and dispatches
//! consumed messages to registered handlers. One durable queue per event
//! type; multiple handler kinds for the same type share the queue and its
//! message stream.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::info;

use super::consumer::{open_consumer_channel, Consumer};
use super::event::{IntegrationEvent, NamingPolicy};
use super::handler::{make_invoker, HandlerKind, IntegrationEventHandler, Invoker};
use super::subscription::{Subscription, TypedHandlerTable};
use crate::broker::traits::{BrokerChannel, PersistentConnection};
use crate::config::BusConfig;
use crate::shared::types::errors::{BrokerError, BusError, BusResult};
use crate::shared::utills::retry::{retry_with_backoff, RetryConfig};

/// Integration event bus over a message broker.
///
/// Cheap to share behind an [`Arc`]; every method takes `&self` and may be
/// called concurrently from any task.
pub struct EventBus {
    connection: Arc<dyn PersistentConnection>,
    naming: NamingPolicy,
    retry: RetryConfig,
    subscriptions: DashMap<&'static str, Arc<Subscription>>,
}

impl EventBus {
    pub fn new(connection: Arc<dyn PersistentConnection>, config: &BusConfig) -> Self {
        Self {
            connection,
            naming: NamingPolicy::new(config.resolve_node_id()),
            retry: config.retry(),
            subscriptions: DashMap::new(),
        }
    }

    /// The node identity embedded in node-scoped queue names.
    pub fn node_id(&self) -> &str {
        self.naming.node_id()
    }

    /// Publish an event to its fan-out exchange.
    ///
    /// Acquires a fresh short-lived channel, declares the exchange and
    /// publishes persistently, retrying transport failures with capped
    /// exponential backoff. Serialization errors and other non-transport
    /// failures propagate immediately, with zero retries. The channel is
    /// released on every exit path; no bus state is touched.
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> BusResult<()> {
        if !self.connection.is_connected() {
            // Best effort: a failed reconnect surfaces through the publish
            // attempt below.
            self.connection.try_connect().await;
        }

        let meta = self.naming.resolve::<E>();
        let channel = self.connection.create_channel().await?;

        let result = self.publish_on(&channel, event, &meta.exchange).await;
        channel.close().await;

        if result.is_ok() {
            metrics::counter!("eventbus_published_total", "event" => E::NAME).increment(1);
            info!(event = E::NAME, exchange = %meta.exchange, "Message published");
        }
        result
    }

    async fn publish_on<E: IntegrationEvent>(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        event: &E,
        exchange: &str,
    ) -> BusResult<()> {
        channel.declare_fanout_exchange(exchange).await?;

        let payload = serde_json::to_vec(event)?;

        let op_channel = Arc::clone(channel);
        let op_exchange = exchange.to_string();
        retry_with_backoff(
            self.retry.clone(),
            move || {
                let channel = Arc::clone(&op_channel);
                let exchange = op_exchange.clone();
                let payload = payload.clone();
                async move { channel.publish(&exchange, payload).await }
            },
            |err: &BrokerError| err.is_transient(),
            E::NAME,
        )
        .await?;
        Ok(())
    }

    /// Register handler `H` for event type `E`.
    ///
    /// The first registration for `E` opens the long-lived consumer
    /// channel, declares and binds the durable queue and starts the
    /// receive loop. Later registrations only extend the handler set: all
    /// kinds share one queue and every delivery is dispatched to every
    /// registered kind. Registering the same kind again replaces it.
    ///
    /// `factory` is invoked once per delivered message to build a fresh
    /// handler instance.
    pub async fn subscribe<E, H, F>(&self, factory: F) -> BusResult<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let invoker = make_invoker(factory);

        if let Some(existing) = self.subscriptions.get(E::NAME).map(|s| Arc::clone(&s)) {
            return self.add_handler::<E>(&existing, H::KIND, invoker);
        }

        // First subscriber for this event type: open the consumer channel
        // before exposing the entry.
        let meta = self.naming.resolve::<E>();
        let (channel, receiver) = open_consumer_channel(&self.connection, &meta).await?;

        let table = Arc::new(TypedHandlerTable::<E>::new());
        table.insert(H::KIND, invoker.clone());
        let subscription = Arc::new(Subscription {
            channel: RwLock::new(Arc::clone(&channel)),
            handlers: table,
        });

        let raced = match self.subscriptions.entry(E::NAME) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&subscription));
                None
            }
        };

        if let Some(winner) = raced {
            // Another task registered this event type while our channel was
            // being opened: fold the handler into the winner's table and
            // discard the extra channel.
            channel.close().await;
            return self.add_handler::<E>(&winner, H::KIND, invoker);
        }

        let consumer = Consumer::new(
            Arc::clone(&self.connection),
            meta,
            E::NAME,
            Arc::clone(&subscription),
        );
        tokio::spawn(consumer.run(receiver));

        info!(event = E::NAME, handler = H::KIND, "Subscription created");
        Ok(())
    }

    /// Remove handler `H` from event type `E`'s subscription, if present.
    ///
    /// The queue and its channel stay open even when no handler kind
    /// remains: deliveries keep being consumed and acknowledged without
    /// any handler invocation.
    pub fn unsubscribe<E, H>(&self)
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        if let Some(subscription) = self.subscriptions.get(E::NAME) {
            if subscription.handlers.remove(H::KIND) {
                info!(event = E::NAME, handler = H::KIND, "Handler unregistered");
            }
        }
    }

    /// Handler kinds currently registered for `E`.
    pub fn handler_kinds<E: IntegrationEvent>(&self) -> Vec<HandlerKind> {
        self.subscriptions
            .get(E::NAME)
            .map(|s| s.handlers.kinds())
            .unwrap_or_default()
    }

    fn add_handler<E: IntegrationEvent>(
        &self,
        subscription: &Subscription,
        kind: HandlerKind,
        invoker: Invoker<E>,
    ) -> BusResult<()> {
        let table = subscription
            .handlers
            .as_any()
            .downcast_ref::<TypedHandlerTable<E>>()
            .ok_or(BusError::EventTypeMismatch { event: E::NAME })?;
        table.insert(kind, invoker);
        info!(event = E::NAME, handler = kind, "Handler registered");
        Ok(())
    }
}

/// Shared event bus handle.
pub type SharedEventBus = Arc<EventBus>;

/// Create a shared event bus over the given broker connection.
pub fn create_event_bus(
    connection: Arc<dyn PersistentConnection>,
    config: &BusConfig,
) -> SharedEventBus {
    Arc::new(EventBus::new(connection, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::events::{ChallengeFinished, ChallengeStarting, UserScoreUpdated};
    use crate::shared::types::errors::DynHandlerError;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recorder<E> {
        seen: Mutex<Vec<E>>,
    }

    impl<E: Clone> Recorder<E> {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn push(&self, event: E) {
            self.seen.lock().unwrap().push(event);
        }

        fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn events(&self) -> Vec<E> {
            self.seen.lock().unwrap().clone()
        }
    }

    struct ScoreHubHandler {
        seen: Arc<Recorder<UserScoreUpdated>>,
    }

    #[async_trait]
    impl IntegrationEventHandler<UserScoreUpdated> for ScoreHubHandler {
        const KIND: HandlerKind = "score_hub";

        async fn handle(&self, event: UserScoreUpdated) -> Result<(), DynHandlerError> {
            self.seen.push(event);
            Ok(())
        }
    }

    struct ScoreAuditHandler {
        seen: Arc<Recorder<UserScoreUpdated>>,
    }

    #[async_trait]
    impl IntegrationEventHandler<UserScoreUpdated> for ScoreAuditHandler {
        const KIND: HandlerKind = "score_audit";

        async fn handle(&self, event: UserScoreUpdated) -> Result<(), DynHandlerError> {
            self.seen.push(event);
            Ok(())
        }
    }

    struct StartRoundHandler {
        seen: Arc<Recorder<ChallengeStarting>>,
    }

    #[async_trait]
    impl IntegrationEventHandler<ChallengeStarting> for StartRoundHandler {
        const KIND: HandlerKind = "start_round";

        async fn handle(&self, event: ChallengeStarting) -> Result<(), DynHandlerError> {
            self.seen.push(event);
            Ok(())
        }
    }

    struct FailingFinishHandler {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl IntegrationEventHandler<ChallengeFinished> for FailingFinishHandler {
        const KIND: HandlerKind = "failing_finish";

        async fn handle(&self, _event: ChallengeFinished) -> Result<(), DynHandlerError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err("storage offline".into())
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn bus_on(broker: &Arc<InMemoryBroker>, node_id: &str) -> SharedEventBus {
        let config = BusConfig {
            node_id: Some(node_id.to_string()),
            ..BusConfig::default()
        };
        create_event_bus(broker.clone(), &config)
    }

    fn score_event() -> UserScoreUpdated {
        UserScoreUpdated {
            quiz_id: "quiz-1".to_string(),
            username: "a".to_string(),
            score: 3,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn publishes_reach_a_subscribed_handler() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus_on(&broker, "x");

        let seen = Recorder::new();
        let sink = seen.clone();
        bus.subscribe(move || ScoreHubHandler { seen: sink.clone() })
            .await
            .unwrap();

        bus.publish(&score_event()).await.unwrap();

        assert!(wait_until(|| seen.count() == 1).await);
        let received = &seen.events()[0];
        assert_eq!(received.username, "a");
        assert_eq!(received.score, 3);
        // Acknowledged once the handler completed.
        assert!(wait_until(|| broker.in_flight() == 0).await);
    }

    #[tokio::test]
    async fn handler_kinds_for_one_event_share_a_single_consumer() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus_on(&broker, "x");

        let hub = Recorder::new();
        let audit = Recorder::new();
        let hub_sink = hub.clone();
        let audit_sink = audit.clone();
        bus.subscribe(move || ScoreHubHandler { seen: hub_sink.clone() })
            .await
            .unwrap();
        bus.subscribe(move || ScoreAuditHandler { seen: audit_sink.clone() })
            .await
            .unwrap();

        assert_eq!(broker.consumer_count("UserScoreUpdated_x"), 1);
        let mut kinds = bus.handler_kinds::<UserScoreUpdated>();
        kinds.sort_unstable();
        assert_eq!(kinds, vec!["score_audit", "score_hub"]);

        bus.publish(&score_event()).await.unwrap();

        assert!(wait_until(|| hub.count() == 1 && audit.count() == 1).await);
        assert_eq!(hub.events()[0].score, audit.events()[0].score);
        assert_eq!(hub.events()[0].username, audit.events()[0].username);
    }

    #[tokio::test]
    async fn unsubscribing_one_kind_leaves_the_other_active() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus_on(&broker, "x");

        let hub = Recorder::new();
        let audit = Recorder::new();
        let hub_sink = hub.clone();
        let audit_sink = audit.clone();
        bus.subscribe(move || ScoreHubHandler { seen: hub_sink.clone() })
            .await
            .unwrap();
        bus.subscribe(move || ScoreAuditHandler { seen: audit_sink.clone() })
            .await
            .unwrap();

        bus.publish(&score_event()).await.unwrap();
        assert!(wait_until(|| hub.count() == 1 && audit.count() == 1).await);

        bus.unsubscribe::<UserScoreUpdated, ScoreHubHandler>();
        bus.publish(&score_event()).await.unwrap();

        assert!(wait_until(|| audit.count() == 2).await);
        assert_eq!(hub.count(), 1);
    }

    #[tokio::test]
    async fn node_scoped_events_fan_out_to_every_node() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus_x = bus_on(&broker, "x");
        let bus_y = bus_on(&broker, "y");

        let seen_x = Recorder::new();
        let seen_y = Recorder::new();
        let sink_x = seen_x.clone();
        let sink_y = seen_y.clone();
        bus_x
            .subscribe(move || ScoreHubHandler { seen: sink_x.clone() })
            .await
            .unwrap();
        bus_y
            .subscribe(move || ScoreHubHandler { seen: sink_y.clone() })
            .await
            .unwrap();

        bus_x.publish(&score_event()).await.unwrap();

        assert!(wait_until(|| seen_x.count() == 1 && seen_y.count() == 1).await);
        assert_eq!(seen_x.events()[0].score, 3);
        assert_eq!(seen_y.events()[0].score, 3);
    }

    #[tokio::test]
    async fn shared_queue_events_compete_across_nodes() {
        let broker = Arc::new(InMemoryBroker::new());
        let recorders: Vec<Arc<Recorder<ChallengeStarting>>> =
            (0..3).map(|_| Recorder::new()).collect();

        for recorder in &recorders {
            let bus = bus_on(&broker, "ignored");
            let sink = recorder.clone();
            bus.subscribe(move || StartRoundHandler { seen: sink.clone() })
                .await
                .unwrap();
        }
        assert_eq!(broker.consumer_count("ChallengeStarting"), 3);

        let publisher = bus_on(&broker, "publisher");
        for _ in 0..6 {
            publisher
                .publish(&ChallengeStarting {
                    quiz_id: "quiz-1".to_string(),
                    start_date: Utc::now(),
                })
                .await
                .unwrap();
        }

        let total = || recorders.iter().map(|r| r.count()).sum::<usize>();
        assert!(wait_until(|| total() == 6).await);

        // Every message went to exactly one node, spread round-robin.
        for recorder in &recorders {
            assert_eq!(recorder.count(), 2);
        }
    }

    #[tokio::test]
    async fn registering_the_same_kind_twice_invokes_it_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus_on(&broker, "x");

        let seen = Recorder::new();
        let first_sink = seen.clone();
        let second_sink = seen.clone();
        bus.subscribe(move || ScoreHubHandler {
            seen: first_sink.clone(),
        })
        .await
        .unwrap();
        bus.subscribe(move || ScoreHubHandler {
            seen: second_sink.clone(),
        })
        .await
        .unwrap();

        bus.publish(&score_event()).await.unwrap();

        assert!(wait_until(|| seen.count() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_retries_transient_failures_then_succeeds() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus_on(&broker, "x");
        broker.fail_publishes(2);

        let start = tokio::time::Instant::now();
        bus.publish(&score_event()).await.unwrap();

        // Two retries: 2s + 4s of backoff.
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_surfaces_the_transport_error_after_five_retries() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus_on(&broker, "x");
        broker.fail_publishes(6);

        let start = tokio::time::Instant::now();
        let err = bus.publish(&score_event()).await.unwrap_err();

        assert!(matches!(err, BusError::Transport(BrokerError::Io(_))));
        // Initial attempt plus five retries: 2 + 4 + 8 + 16 + 32 seconds.
        assert_eq!(start.elapsed(), Duration::from_secs(62));
    }

    #[derive(Debug, Clone, Deserialize)]
    struct Unserializable {
        _value: i32,
    }

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("cannot serialize"))
        }
    }

    impl IntegrationEvent for Unserializable {
        const NAME: &'static str = "Unserializable";
    }

    #[tokio::test(start_paused = true)]
    async fn serialization_failures_are_not_retried() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus_on(&broker, "x");

        let start = tokio::time::Instant::now();
        let err = bus.publish(&Unserializable { _value: 1 }).await.unwrap_err();

        assert!(matches!(err, BusError::Serialization(_)));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn publish_reconnects_a_dropped_connection() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus_on(&broker, "x");

        broker.disconnect();
        bus.publish(&score_event()).await.unwrap();
        assert!(broker.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_broker_fails_the_publish() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus_on(&broker, "x");

        broker.disconnect();
        broker.set_reconnectable(false);

        let start = tokio::time::Instant::now();
        let err = bus.publish(&score_event()).await.unwrap_err();

        assert!(matches!(err, BusError::Transport(BrokerError::Unreachable(_))));
        // Channel acquisition is not retried.
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn channel_fault_rebuilds_without_losing_handlers() {
        init_tracing();
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus_on(&broker, "x");

        let seen = Recorder::new();
        let sink = seen.clone();
        bus.subscribe(move || ScoreHubHandler { seen: sink.clone() })
            .await
            .unwrap();

        bus.publish(&score_event()).await.unwrap();
        assert!(wait_until(|| seen.count() == 1).await);

        broker.fault_consumers("UserScoreUpdated_x", "simulated fault").await;
        assert!(wait_until(|| broker.consumer_count("UserScoreUpdated_x") == 1).await);
        assert_eq!(bus.handler_kinds::<UserScoreUpdated>(), vec!["score_hub"]);

        bus.publish(&score_event()).await.unwrap();
        assert!(wait_until(|| seen.count() == 2).await);
    }

    #[tokio::test]
    async fn empty_subscriptions_keep_consuming_and_acking() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus_on(&broker, "x");

        let seen = Recorder::new();
        let sink = seen.clone();
        bus.subscribe(move || ScoreHubHandler { seen: sink.clone() })
            .await
            .unwrap();
        bus.unsubscribe::<UserScoreUpdated, ScoreHubHandler>();
        assert!(bus.handler_kinds::<UserScoreUpdated>().is_empty());

        bus.publish(&score_event()).await.unwrap();
        bus.publish(&score_event()).await.unwrap();

        assert!(
            wait_until(|| {
                broker.queue_depth("UserScoreUpdated_x") == 0 && broker.in_flight() == 0
            })
            .await
        );
        assert_eq!(seen.count(), 0);
        // The consumer is still there, draining.
        assert_eq!(broker.consumer_count("UserScoreUpdated_x"), 1);
    }

    #[tokio::test]
    async fn failing_handlers_leave_the_delivery_unacknowledged() {
        init_tracing();
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus_on(&broker, "x");

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        bus.subscribe(move || FailingFinishHandler {
            attempts: counter.clone(),
        })
        .await
        .unwrap();

        bus.publish(&ChallengeFinished {
            quiz_id: "quiz-1".to_string(),
        })
        .await
        .unwrap();

        assert!(wait_until(|| attempts.load(Ordering::SeqCst) == 1).await);
        assert_eq!(broker.in_flight(), 1);

        // The channel dying returns the message to the queue, and the
        // rebuilt consumer receives it again: at-least-once.
        broker.fault_consumers("ChallengeFinished_x", "simulated fault").await;
        assert!(wait_until(|| attempts.load(Ordering::SeqCst) >= 2).await);
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct FirstShape {
        a: i32,
    }

    impl IntegrationEvent for FirstShape {
        const NAME: &'static str = "DuplicateName";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SecondShape {
        b: String,
    }

    impl IntegrationEvent for SecondShape {
        const NAME: &'static str = "DuplicateName";
    }

    struct FirstShapeHandler;

    #[async_trait]
    impl IntegrationEventHandler<FirstShape> for FirstShapeHandler {
        const KIND: HandlerKind = "first_shape";

        async fn handle(&self, _event: FirstShape) -> Result<(), DynHandlerError> {
            Ok(())
        }
    }

    struct SecondShapeHandler;

    #[async_trait]
    impl IntegrationEventHandler<SecondShape> for SecondShapeHandler {
        const KIND: HandlerKind = "second_shape";

        async fn handle(&self, _event: SecondShape) -> Result<(), DynHandlerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn conflicting_payload_types_for_one_name_are_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus_on(&broker, "x");

        bus.subscribe(|| FirstShapeHandler).await.unwrap();
        let err = bus.subscribe(|| SecondShapeHandler).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::EventTypeMismatch {
                event: "DuplicateName"
            }
        ));
    }
}
