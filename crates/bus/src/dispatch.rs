//! Delivery state machine shared by both bus backends.
//!
//! `Received → Handling → {Success(+continuation publish) |
//! TransientFailure(redeliver) | PermanentFailure(permanent-errors topic)}`.
//! Keeping this in one place is what makes the in-memory and broker-backed
//! buses observably identical.

use tracing::{debug, error, info, warn};

use crate::envelope::Envelope;
use crate::handler::{HandlerError, JobExecutionContext, MessageHandler};
use crate::retry::RetryPolicy;
use crate::traits::MessageBus;

/// How one delivery attempt ended, from the transport's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Acknowledge the delivery; any continuation was already published.
    Completed,
    /// Leave the delivery unacknowledged so the transport redelivers it.
    Transient,
    /// Acknowledge the delivery; the message was routed to the
    /// permanent-errors destination (or dropped when none is configured).
    Permanent,
}

/// Build the handler-visible context for one delivery attempt.
///
/// `attempt` is the 1-based in-batch delivery count; `retries_count` on the
/// envelope carries the dead-letter cycle count across batches.
pub(crate) fn build_context(
    envelope: &Envelope,
    attempt: u32,
    max_in_batch: u32,
    policy: Option<&RetryPolicy>,
) -> JobExecutionContext {
    let max_retry_batches = policy.map(RetryPolicy::max_retry_count).unwrap_or(0);
    JobExecutionContext {
        retry_batches_count: envelope.retries_count,
        max_retry_batches,
        retries_in_current_batch: attempt,
        max_retries_in_batch: max_in_batch,
        is_last_retry: attempt >= max_in_batch && envelope.retries_count >= max_retry_batches,
        correlation_id: envelope.correlation_id,
    }
}

/// Run one delivery through the handler and interpret the result.
///
/// Continuations are published under the incoming message's correlation id.
/// A failed continuation publish leaves the delivery unacknowledged — the
/// redelivered message will retry the publish.
pub(crate) async fn deliver(
    publisher: &dyn MessageBus,
    handler: &dyn MessageHandler,
    topic: &str,
    subscription: &str,
    envelope: &Envelope,
    ctx: JobExecutionContext,
    policy: Option<&RetryPolicy>,
) -> Outcome {
    debug!(
        topic = %topic,
        subscription = %subscription,
        id = %envelope.id,
        handler = handler.name(),
        attempt = ctx.retries_in_current_batch,
        retry_batch = ctx.retry_batches_count,
        "delivering message"
    );

    match handler.handle(envelope.clone(), ctx).await {
        Ok(response) => {
            let status = response.status();
            match response.into_continuation() {
                Some(next) => {
                    let correlation = envelope.correlation_id;
                    let message = next.message.with_correlation(correlation);
                    match publisher
                        .publish(message, &next.topic, next.execute_on_utc, Some(correlation))
                        .await
                    {
                        Ok(()) => {
                            debug!(
                                id = %envelope.id,
                                status,
                                next_topic = %next.topic,
                                "handled, continuation published"
                            );
                            Outcome::Completed
                        }
                        Err(e) => {
                            warn!(
                                id = %envelope.id,
                                next_topic = %next.topic,
                                error = %e,
                                "continuation publish failed, leaving delivery unacknowledged"
                            );
                            Outcome::Transient
                        }
                    }
                }
                None => {
                    info!(
                        topic = %topic,
                        subscription = %subscription,
                        id = %envelope.id,
                        status,
                        "chain reached its terminal stage"
                    );
                    Outcome::Completed
                }
            }
        }
        Err(HandlerError::Permanent(reason)) => {
            error!(
                topic = %topic,
                subscription = %subscription,
                id = %envelope.id,
                handler = handler.name(),
                reason = %reason,
                "permanent handler failure"
            );
            match policy {
                Some(p) => {
                    // A redelivered message still carries its dead-letter
                    // routing pin; the permanent topic has its own
                    // subscriptions.
                    let mut poisoned = envelope.clone();
                    poisoned.route_to = None;
                    match publisher
                        .publish(
                            poisoned,
                            &p.permanent_errors_topic,
                            None,
                            Some(envelope.correlation_id),
                        )
                        .await
                    {
                        Ok(()) => Outcome::Permanent,
                        Err(e) => {
                            error!(
                                id = %envelope.id,
                                permanent_topic = %p.permanent_errors_topic,
                                error = %e,
                                "failed to route to permanent errors, leaving delivery unacknowledged"
                            );
                            Outcome::Transient
                        }
                    }
                }
                None => {
                    error!(
                        id = %envelope.id,
                        "permanent failure on a subscription without a retry policy, dropping"
                    );
                    Outcome::Permanent
                }
            }
        }
        Err(HandlerError::Transient(reason)) => {
            warn!(
                topic = %topic,
                subscription = %subscription,
                id = %envelope.id,
                handler = handler.name(),
                reason = %reason,
                "transient handler failure"
            );
            Outcome::Transient
        }
    }
}
