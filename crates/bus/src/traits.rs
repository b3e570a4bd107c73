use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::BusError;
use crate::handler::MessageHandler;
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;

/// Typed publish/subscribe contract the scheduling pipeline runs on.
///
/// Delivery is at-least-once. Two interchangeable backends implement this
/// contract — [`InMemoryBus`](crate::InMemoryBus) for in-process use and
/// tests, [`BrokerBus`](crate::BrokerBus) over an external peek-lock broker
/// client — with identical observable behavior.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Enqueue a message for delivery on `topic`.
    ///
    /// `execute_on_utc` defers visibility until the given time. A fresh
    /// correlation id is attached when `correlation_id` is `None`. An
    /// envelope with an empty `id` is rejected with
    /// [`BusError::InvalidMessage`].
    async fn publish(
        &self,
        envelope: Envelope,
        topic: &str,
        execute_on_utc: Option<DateTime<Utc>>,
        correlation_id: Option<Uuid>,
    ) -> Result<(), BusError>;

    /// Attach a handler to `subscription` on `topic` with at most
    /// `concurrency_level` concurrent in-flight deliveries.
    ///
    /// When `retry_policy` is present, a dead-letter retry engine is
    /// started for the subscription: messages that exhaust in-batch
    /// delivery retries are escalated with exponential backoff and finally
    /// routed to the policy's permanent-errors topic.
    async fn register_subscriber(
        &self,
        topic: &str,
        subscription: &str,
        concurrency_level: usize,
        handler: Arc<dyn MessageHandler>,
        retry_policy: Option<RetryPolicy>,
        shutdown: Shutdown,
    ) -> Result<(), BusError>;

    /// Administrative provisioning: create missing topics/subscriptions and
    /// validate subscription naming. Idempotent.
    async fn setup_entities_if_not_exist(
        &self,
        topics: &[String],
        subscriptions: &[String],
    ) -> Result<(), BusError>;

    /// Graceful teardown: stop accepting deliveries, drain in-flight
    /// handlers within a bounded grace period, release transport resources.
    async fn close(&self) -> Result<(), BusError>;
}

#[async_trait]
impl<T: MessageBus + ?Sized> MessageBus for Arc<T> {
    async fn publish(
        &self,
        envelope: Envelope,
        topic: &str,
        execute_on_utc: Option<DateTime<Utc>>,
        correlation_id: Option<Uuid>,
    ) -> Result<(), BusError> {
        (**self)
            .publish(envelope, topic, execute_on_utc, correlation_id)
            .await
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
        (**self)
            .register_subscriber(
                topic,
                subscription,
                concurrency_level,
                handler,
                retry_policy,
                shutdown,
            )
            .await
    }

    async fn setup_entities_if_not_exist(
        &self,
        topics: &[String],
        subscriptions: &[String],
    ) -> Result<(), BusError> {
        (**self).setup_entities_if_not_exist(topics, subscriptions).await
    }

    async fn close(&self) -> Result<(), BusError> {
        (**self).close().await
    }
}
