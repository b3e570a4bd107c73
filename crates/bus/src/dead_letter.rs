//! Dead-letter retry engine.
//!
//! One loop per subscription configured with a [`RetryPolicy`]: it drains
//! the subscription's dead-letter queue, re-publishes each message back to
//! the live topic with exponential backoff and a `route_to` pin on the
//! original subscription, and escalates to the permanent-errors topic once
//! the retry budget is spent. Redeliveries within one chain are serialized —
//! the loop holds a single message at a time.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::BusError;
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;
use crate::traits::MessageBus;

/// A message pulled from a dead-letter queue, still locked by the transport.
pub(crate) struct DeadLetter {
    pub envelope: Envelope,
    /// Transport lock token; `None` for backends without peek-lock.
    pub lock_token: Option<Uuid>,
}

/// Backend-specific access to one subscription's dead-letter queue.
#[async_trait]
pub(crate) trait DeadLetterChannel: Send {
    /// Next dead-lettered message, or `None` on a poll timeout so the loop
    /// can observe shutdown.
    async fn receive(&mut self) -> Result<Option<DeadLetter>, BusError>;

    /// Remove the message from the dead-letter queue.
    async fn acknowledge(&mut self, lock_token: Option<Uuid>) -> Result<(), BusError>;
}

/// Run the retry loop until shutdown.
///
/// Transport errors while re-publishing are not retried here: the error is
/// logged loud and returned, terminating the loop, rather than silently
/// dropping the message.
pub(crate) async fn run_dead_letter_retry_loop<P, C>(
    publisher: P,
    mut channel: C,
    topic: String,
    subscription: String,
    policy: RetryPolicy,
    shutdown: Shutdown,
) -> Result<(), BusError>
where
    P: MessageBus,
    C: DeadLetterChannel,
{
    info!(
        topic = %topic,
        subscription = %subscription,
        max_retry_batches = policy.max_retry_count(),
        "dead-letter retry engine started"
    );

    loop {
        let received = tokio::select! {
            _ = shutdown.wait() => {
                info!(subscription = %subscription, "dead-letter retry engine shutting down");
                return Ok(());
            }
            received = channel.receive() => received?,
        };

        let Some(dead_letter) = received else {
            continue;
        };

        let mut envelope = dead_letter.envelope;
        let retries_count = envelope.retries_count;
        let correlation = envelope.correlation_id;

        if retries_count < policy.max_retry_count() {
            let delay = policy.delay(retries_count);
            let due = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            envelope.retries_count = retries_count + 1;
            envelope.route_to = Some(subscription.clone());

            info!(
                topic = %topic,
                subscription = %subscription,
                id = %envelope.id,
                retry_batch = retries_count + 1,
                delay_secs = delay.as_secs_f64(),
                due = %due,
                "scheduling dead-letter retry"
            );
            publisher
                .publish(envelope, &topic, Some(due), Some(correlation))
                .await?;
        } else {
            envelope.retries_count = retries_count + 1;
            envelope.route_to = None;

            error!(
                topic = %topic,
                subscription = %subscription,
                id = %envelope.id,
                retry_batches = retries_count,
                permanent_topic = %policy.permanent_errors_topic,
                "retries exhausted, moving to permanent errors"
            );
            publisher
                .publish(envelope, &policy.permanent_errors_topic, None, Some(correlation))
                .await?;
        }

        channel.acknowledge(dead_letter.lock_token).await?;
    }
}
