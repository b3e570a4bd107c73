//! Broker-backed bus backend.
//!
//! The concrete transport lives behind the [`BrokerClient`] contract: a
//! peek-lock broker with topics, subscriptions, scheduled enqueue,
//! per-subscription dead-letter sub-queues, and administrative
//! provisioning. [`BrokerBus`] adapts any such client to the [`MessageBus`]
//! semantics — receive pumps, bounded handler pools, abandon-on-transient,
//! and the dead-letter retry engine — so pipeline code never sees the
//! transport.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
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

/// A message received under peek-lock: invisible to other receivers until
/// completed, abandoned, or the lock expires.
#[derive(Debug, Clone)]
pub struct LockedMessage {
    pub envelope: Envelope,
    pub lock_token: Uuid,
    /// Broker-maintained delivery attempt count, 1-based.
    pub delivery_count: u32,
}

/// External transport contract (the broker client is a collaborator, not
/// part of this crate): peek-lock receive on live and dead-letter
/// sub-queues, scheduled send, and idempotent entity provisioning.
///
/// `send` must honor `envelope.scheduled_enqueue_time_utc`. `abandon` makes
/// the message receivable again with an incremented delivery count; the
/// broker itself moves a message to the subscription's dead-letter queue
/// once its provisioned max delivery count is exceeded.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn send(&self, topic: &str, envelope: Envelope) -> Result<(), BusError>;

    /// Next live message for the subscription, or `None` if nothing became
    /// available within `wait`.
    async fn receive(
        &self,
        topic: &str,
        subscription: &str,
        wait: Duration,
    ) -> Result<Option<LockedMessage>, BusError>;

    /// Next message from the subscription's dead-letter sub-queue.
    async fn receive_dead_letter(
        &self,
        topic: &str,
        subscription: &str,
        wait: Duration,
    ) -> Result<Option<LockedMessage>, BusError>;

    async fn complete(&self, lock_token: Uuid) -> Result<(), BusError>;

    async fn abandon(&self, lock_token: Uuid) -> Result<(), BusError>;

    async fn create_topic_if_missing(&self, topic: &str) -> Result<(), BusError>;

    async fn create_subscription_if_missing(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<(), BusError>;

    async fn close(&self) -> Result<(), BusError>;
}

/// Tuning knobs for the broker-backed backend.
#[derive(Debug, Clone)]
pub struct BrokerBusConfig {
    /// The max-delivery-count the broker's subscriptions are provisioned
    /// with; used to compute the handler-visible in-batch budget.
    pub max_delivery_count: u32,

    /// Poll window for blocking receives; bounds shutdown latency.
    pub receive_wait: Duration,

    /// Grace period for draining in-flight handlers on close.
    pub close_grace: Duration,
}

impl Default for BrokerBusConfig {
    fn default() -> Self {
        Self {
            max_delivery_count: 10,
            receive_wait: Duration::from_millis(500),
            close_grace: Duration::from_secs(5),
        }
    }
}

struct BrokerBusInner {
    client: Arc<dyn BrokerClient>,
    config: BrokerBusConfig,
    subscription_names: Mutex<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    in_flight: AtomicUsize,
    shutdown: Shutdown,
    closing: AtomicBool,
    closed: AtomicBool,
}

/// [`MessageBus`] over an external peek-lock broker.
#[derive(Clone)]
pub struct BrokerBus {
    inner: Arc<BrokerBusInner>,
}

impl BrokerBus {
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self::with_config(client, BrokerBusConfig::default())
    }

    pub fn with_config(client: Arc<dyn BrokerClient>, config: BrokerBusConfig) -> Self {
        Self {
            inner: Arc::new(BrokerBusInner {
                client,
                config,
                subscription_names: Mutex::new(HashSet::new()),
                tasks: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                shutdown: Shutdown::new(),
                closing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
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

#[async_trait]
impl MessageBus for BrokerBus {
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
            "publishing message to broker"
        );
        self.inner.client.send(topic, envelope).await
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
            "registering broker subscriber"
        );

        if let Some(policy) = &retry_policy {
            let engine = run_dead_letter_retry_loop(
                self.clone(),
                BrokerDeadLetterChannel {
                    client: self.inner.client.clone(),
                    topic: topic.to_string(),
                    subscription: subscription.to_string(),
                    wait: self.inner.config.receive_wait,
                },
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
        }

        let bus = self.clone();
        let bus_shutdown = self.inner.shutdown.clone();
        let topic = topic.to_string();
        let subscription = subscription.to_string();
        let pump = tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(concurrency_level.max(1)));
            let wait = bus.inner.config.receive_wait;
            loop {
                let permit = tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = bus_shutdown.wait() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let received = tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = bus_shutdown.wait() => break,
                    received = bus.inner.client.receive(&topic, &subscription, wait) => received,
                };
                let locked = match received {
                    Ok(Some(locked)) => locked,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(
                            subscription = %subscription,
                            error = %e,
                            "broker receive error"
                        );
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                // The broker applies the `route_to` filter for subscriptions
                // provisioned with one; enforce it here as well so a client
                // without filter support behaves identically.
                if let Some(target) = &locked.envelope.route_to {
                    if target != &subscription {
                        if let Err(e) = bus.inner.client.complete(locked.lock_token).await {
                            warn!(error = %e, "failed to complete filtered message");
                        }
                        continue;
                    }
                }

                let bus = bus.clone();
                let handler = handler.clone();
                let policy = retry_policy.clone();
                let topic = topic.clone();
                let subscription = subscription.clone();
                bus.inner.in_flight.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _permit = permit;
                    handle_locked_delivery(&bus, handler.as_ref(), policy.as_ref(), &topic, &subscription, locked)
                        .await;
                    bus.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
            debug!(subscription = %subscription, "broker receive pump stopped");
        });
        self.track(pump);
        Ok(())
    }

    async fn setup_entities_if_not_exist(
        &self,
        topics: &[String],
        subscriptions: &[String],
    ) -> Result<(), BusError> {
        info!(
            topics = topics.len(),
            subscriptions = subscriptions.len(),
            "provisioning broker entities"
        );
        for topic in topics {
            self.inner.client.create_topic_if_missing(topic).await?;
        }
        for subscription in subscriptions {
            let topic = topic_of_subscription(subscription)?;
            self.inner
                .client
                .create_subscription_if_missing(topic, subscription)
                .await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing broker bus");

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
                warn!("broker bus task did not stop within the grace period, aborting");
                task.abort();
            }
        }
        self.inner.client.close().await?;
        info!("broker bus closed");
        Ok(())
    }
}

/// Settle one peek-locked delivery: complete on success or permanent
/// routing, abandon on transient failure so the broker redelivers (and
/// eventually dead-letters) it.
async fn handle_locked_delivery(
    bus: &BrokerBus,
    handler: &dyn MessageHandler,
    policy: Option<&RetryPolicy>,
    topic: &str,
    subscription: &str,
    locked: LockedMessage,
) {
    let mut envelope = locked.envelope;
    envelope.delivery_count = locked.delivery_count;
    let ctx = build_context(
        &envelope,
        locked.delivery_count,
        bus.inner.config.max_delivery_count,
        policy,
    );

    let outcome = deliver(bus, handler, topic, subscription, &envelope, ctx, policy).await;
    let settle = match outcome {
        Outcome::Completed | Outcome::Permanent => bus.inner.client.complete(locked.lock_token).await,
        Outcome::Transient => bus.inner.client.abandon(locked.lock_token).await,
    };
    if let Err(e) = settle {
        // The lock will expire and the broker will redeliver; at-least-once
        // semantics absorb the duplicate.
        warn!(
            subscription = %subscription,
            id = %envelope.id,
            error = %e,
            "failed to settle delivery"
        );
    }
}

/// Dead-letter queue access through the broker client.
struct BrokerDeadLetterChannel {
    client: Arc<dyn BrokerClient>,
    topic: String,
    subscription: String,
    wait: Duration,
}

#[async_trait]
impl DeadLetterChannel for BrokerDeadLetterChannel {
    async fn receive(&mut self) -> Result<Option<DeadLetter>, BusError> {
        let received = self
            .client
            .receive_dead_letter(&self.topic, &self.subscription, self.wait)
            .await?;
        Ok(received.map(|locked| DeadLetter {
            envelope: locked.envelope,
            lock_token: Some(locked.lock_token),
        }))
    }

    async fn acknowledge(&mut self, lock_token: Option<Uuid>) -> Result<(), BusError> {
        match lock_token {
            Some(token) => self.client.complete(token).await,
            None => Ok(()),
        }
    }
}
