//! In-process bus backend.
//!
//! Mirrors the broker-backed bus semantics without any network dependency:
//! timers stand in for scheduled enqueue, an immediate redelivery loop
//! stands in for peek-lock redelivery, and per-subscription queues stand in
//! for broker subscriptions. The routing table is only mutated during
//! registration; steady-state dispatch reads it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dead_letter::{run_dead_letter_retry_loop, DeadLetter, DeadLetterChannel};
use crate::dispatch::{build_context, deliver, Outcome};
use crate::envelope::Envelope;
use crate::error::BusError;
use crate::handler::MessageHandler;
use crate::naming::{topic_of_subscription, validate_subscription_name};
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;
use crate::traits::MessageBus;

/// Tuning knobs for the in-memory backend.
#[derive(Debug, Clone)]
pub struct InMemoryBusConfig {
    /// In-batch delivery attempts before a message is dead-lettered.
    /// Matches the broker-side max-delivery-count provisioning default.
    pub max_delivery_count: u32,

    /// Grace period for draining in-flight handlers on close.
    pub close_grace: Duration,
}

impl Default for InMemoryBusConfig {
    fn default() -> Self {
        Self {
            max_delivery_count: 10,
            close_grace: Duration::from_secs(5),
        }
    }
}

/// One observed publish, for test probes and diagnostics.
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub topic: String,
    pub message_id: String,
    pub correlation_id: Uuid,
    pub execute_on_utc: Option<DateTime<Utc>>,
    pub retries_count: u32,
    pub route_to: Option<String>,
}

struct SubscriptionHandle {
    name: String,
    queue: mpsc::UnboundedSender<Envelope>,
}

struct BusInner {
    config: InMemoryBusConfig,
    /// topic → subscriptions; written only while registering.
    topics: RwLock<HashMap<String, Vec<SubscriptionHandle>>>,
    subscription_names: Mutex<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    in_flight: AtomicUsize,
    shutdown: Shutdown,
    publish_events: broadcast::Sender<PublishRecord>,
    closing: AtomicBool,
    closed: AtomicBool,
}

/// In-process [`MessageBus`] implementation.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_config(InMemoryBusConfig::default())
    }

    pub fn with_config(config: InMemoryBusConfig) -> Self {
        let (publish_events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(BusInner {
                config,
                topics: RwLock::new(HashMap::new()),
                subscription_names: Mutex::new(HashSet::new()),
                tasks: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                shutdown: Shutdown::new(),
                publish_events,
                closing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Observe every accepted publish (topic, id, scheduled time, counters).
    pub fn publish_events(&self) -> broadcast::Receiver<PublishRecord> {
        self.inner.publish_events.subscribe()
    }

    fn fan_out(&self, envelope: Envelope, topic: &str) {
        let topics = self
            .inner
            .topics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(subscriptions) = topics.get(topic) else {
            debug!(topic = %topic, id = %envelope.id, "no subscriptions on topic");
            return;
        };

        for subscription in subscriptions {
            if let Some(target) = &envelope.route_to {
                if target != &subscription.name {
                    continue;
                }
            }
            if subscription.queue.send(envelope.clone()).is_err() {
                warn!(
                    topic = %topic,
                    subscription = %subscription.name,
                    "subscription queue closed, message not delivered"
                );
            }
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        mut envelope: Envelope,
        topic: &str,
        execute_on_utc: Option<DateTime<Utc>>,
        correlation_id: Option<Uuid>,
    ) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if envelope.id.trim().is_empty() {
            return Err(BusError::InvalidMessage(
                "message id cannot be empty".into(),
            ));
        }
        if let Some(correlation) = correlation_id {
            envelope.correlation_id = correlation;
        }
        envelope.scheduled_enqueue_time_utc = execute_on_utc;

        info!(
            topic = %topic,
            id = %envelope.id,
            due = %execute_on_utc.map(|t| t.to_rfc3339()).unwrap_or_else(|| "now".into()),
            "publishing message"
        );

        let _ = self.inner.publish_events.send(PublishRecord {
            topic: topic.to_string(),
            message_id: envelope.id.clone(),
            correlation_id: envelope.correlation_id,
            execute_on_utc,
            retries_count: envelope.retries_count,
            route_to: envelope.route_to.clone(),
        });

        let delay = execute_on_utc
            .and_then(|due| (due - Utc::now()).to_std().ok())
            .filter(|d| !d.is_zero());

        match delay {
            Some(delay) => {
                let bus = self.clone();
                let topic = topic.to_string();
                let shutdown = self.inner.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.wait() => {}
                        _ = tokio::time::sleep(delay) => bus.fan_out(envelope, &topic),
                    }
                });
            }
            None => self.fan_out(envelope, topic),
        }
        Ok(())
    }

    async fn register_subscriber(
        &self,
        topic: &str,
        subscription: &str,
        concurrency_level: usize,
        handler: Arc<dyn MessageHandler>,
        retry_policy: Option<RetryPolicy>,
        shutdown: Shutdown,
    ) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if topic_of_subscription(subscription)? != topic {
            return Err(BusError::InvalidNaming(subscription.to_string()));
        }
        {
            let mut names = self
                .inner
                .subscription_names
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !names.insert(subscription.to_string()) {
                return Err(BusError::DuplicateSubscription(subscription.to_string()));
            }
        }

        info!(
            topic = %topic,
            subscription = %subscription,
            handler = handler.name(),
            concurrency = concurrency_level,
            retrying = retry_policy.is_some(),
            "registering subscriber"
        );

        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Envelope>();
        self.inner
            .topics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(topic.to_string())
            .or_default()
            .push(SubscriptionHandle {
                name: subscription.to_string(),
                queue: queue_tx,
            });

        // Dead-letter queue and its retry engine, when the subscription retries.
        let dead_letter_tx = match &retry_policy {
            Some(policy) => {
                let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
                let engine = run_dead_letter_retry_loop(
                    self.clone(),
                    MemoryDeadLetterChannel { queue: rx },
                    topic.to_string(),
                    subscription.to_string(),
                    policy.clone(),
                    shutdown.clone(),
                );
                let subscription = subscription.to_string();
                let bus_shutdown = self.inner.shutdown.clone();
                self.track(tokio::spawn(async move {
                    tokio::select! {
                        _ = bus_shutdown.wait() => {}
                        result = engine => match result {
                            Ok(()) | Err(BusError::Closed) => {}
                            Err(e) => error!(
                                subscription = %subscription,
                                error = %e,
                                "dead-letter retry engine terminated"
                            ),
                        }
                    }
                }));
                Some(tx)
            }
            None => None,
        };

        let bus = self.clone();
        let bus_shutdown = self.inner.shutdown.clone();
        let topic = topic.to_string();
        let subscription = subscription.to_string();
        let dispatch = tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(concurrency_level.max(1)));
            loop {
                let envelope = tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = bus_shutdown.wait() => break,
                    maybe = queue_rx.recv() => match maybe {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                let permit = tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = bus_shutdown.wait() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let bus = bus.clone();
                let handler = handler.clone();
                let policy = retry_policy.clone();
                let topic = topic.clone();
                let subscription = subscription.clone();
                let dead_letter_tx = dead_letter_tx.clone();
                bus.inner.in_flight.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _permit = permit;
                    handle_delivery(
                        &bus,
                        handler.as_ref(),
                        policy.as_ref(),
                        &topic,
                        &subscription,
                        dead_letter_tx.as_ref(),
                        envelope,
                    )
                    .await;
                    bus.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
            debug!(subscription = %subscription, "dispatch loop stopped");
        });
        self.track(dispatch);
        Ok(())
    }

    async fn setup_entities_if_not_exist(
        &self,
        topics: &[String],
        subscriptions: &[String],
    ) -> Result<(), BusError> {
        for subscription in subscriptions {
            validate_subscription_name(subscription)?;
        }
        debug!(
            topics = topics.len(),
            subscriptions = subscriptions.len(),
            "in-memory entities validated"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing in-memory bus");

        // Stop accepting new deliveries, then let in-flight handlers (and
        // their continuation publishes) drain within the grace period.
        self.inner.shutdown.trigger();
        let deadline = tokio::time::Instant::now() + self.inner.config.close_grace;
        while self.inner.in_flight.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.inner.closed.store(true, Ordering::SeqCst);

        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for mut task in tasks {
            let remaining = deadline
                .saturating_duration_since(tokio::time::Instant::now())
                .max(Duration::from_millis(50));
            if tokio::time::timeout(remaining, &mut task).await.is_err() {
                warn!("bus task did not stop within the grace period, aborting");
                task.abort();
            }
        }
        info!("in-memory bus closed");
        Ok(())
    }
}

/// One received message: immediate in-batch redelivery on transient
/// failures, then hand-off to the subscription's dead-letter queue.
async fn handle_delivery(
    bus: &InMemoryBus,
    handler: &dyn MessageHandler,
    policy: Option<&RetryPolicy>,
    topic: &str,
    subscription: &str,
    dead_letter_tx: Option<&mpsc::UnboundedSender<Envelope>>,
    envelope: Envelope,
) {
    let max_delivery_count = bus.inner.config.max_delivery_count.max(1);
    for attempt in 1..=max_delivery_count {
        let mut delivery = envelope.clone();
        delivery.delivery_count = attempt;
        let ctx = build_context(&delivery, attempt, max_delivery_count, policy);
        match deliver(bus, handler, topic, subscription, &delivery, ctx, policy).await {
            Outcome::Completed | Outcome::Permanent => return,
            Outcome::Transient => {}
        }
    }

    let mut exhausted = envelope;
    exhausted.delivery_count = max_delivery_count;
    match dead_letter_tx {
        Some(tx) => {
            warn!(
                topic = %topic,
                subscription = %subscription,
                id = %exhausted.id,
                retry_batch = exhausted.retries_count,
                "in-batch retries exhausted, dead-lettering"
            );
            if tx.send(exhausted).is_err() {
                error!(
                    subscription = %subscription,
                    "dead-letter engine is gone, dropping message"
                );
            }
        }
        None => {
            error!(
                topic = %topic,
                subscription = %subscription,
                id = %exhausted.id,
                "delivery retries exhausted and no retry policy attached, dropping message"
            );
        }
    }
}

/// Dead-letter queue access for the in-memory backend: a plain channel,
/// no peek-lock, so acknowledge is a no-op.
struct MemoryDeadLetterChannel {
    queue: mpsc::UnboundedReceiver<Envelope>,
}

#[async_trait]
impl DeadLetterChannel for MemoryDeadLetterChannel {
    async fn receive(&mut self) -> Result<Option<DeadLetter>, BusError> {
        match self.queue.recv().await {
            Some(envelope) => Ok(Some(DeadLetter {
                envelope,
                lock_token: None,
            })),
            // Sender side dropped: the subscription's dispatch loop is gone.
            None => Err(BusError::Closed),
        }
    }

    async fn acknowledge(&mut self, _lock_token: Option<Uuid>) -> Result<(), BusError> {
        Ok(())
    }
}
