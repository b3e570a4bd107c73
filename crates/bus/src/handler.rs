use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::envelope::Envelope;

/// Continuation instruction: the message to publish next, where, and when.
#[derive(Debug, Clone)]
pub struct ContinueWith {
    pub message: Envelope,
    pub topic: String,
    /// When set, the continuation is delivered at this time instead of
    /// immediately.
    pub execute_on_utc: Option<DateTime<Utc>>,
}

/// What a handler decided about one delivery.
///
/// Handlers never publish messages themselves; they declare the next hop
/// through `Continue` and the hosting subscriber performs the publish. This
/// keeps the pipeline's shape inspectable from responses alone.
#[derive(Debug, Clone)]
pub enum HandlerResponse {
    /// The chain ends here with the given status code.
    Terminal { status: u16 },
    /// Publish `next` and report the given status code.
    Continue { status: u16, next: ContinueWith },
}

impl HandlerResponse {
    /// Terminal success (200).
    pub fn ok() -> Self {
        Self::Terminal { status: 200 }
    }

    /// Terminal validation conflict (409) — the chain is dropped on purpose.
    pub fn conflict() -> Self {
        Self::Terminal { status: 409 }
    }

    /// Successful continuation to the given destination.
    pub fn continue_with(
        message: Envelope,
        topic: impl Into<String>,
        execute_on_utc: Option<DateTime<Utc>>,
    ) -> Self {
        Self::Continue {
            status: 200,
            next: ContinueWith {
                message,
                topic: topic.into(),
                execute_on_utc,
            },
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Terminal { status } => *status,
            Self::Continue { status, .. } => *status,
        }
    }

    pub fn continuation(&self) -> Option<&ContinueWith> {
        match self {
            Self::Terminal { .. } => None,
            Self::Continue { next, .. } => Some(next),
        }
    }

    pub fn into_continuation(self) -> Option<ContinueWith> {
        match self {
            Self::Terminal { .. } => None,
            Self::Continue { next, .. } => Some(next),
        }
    }
}

/// Handler failure taxonomy.
///
/// A `Transient` failure leaves the delivery unacknowledged: the transport
/// redelivers it up to its in-batch limit, after which the message is
/// dead-lettered and (if the subscription retries) escalated with backoff.
/// A `Permanent` failure bypasses all remaining retry budget and routes the
/// message directly to the subscription's permanent-errors topic.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("transient handler failure: {0}")]
    Transient(String),

    #[error("permanent handler failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl std::fmt::Display) -> Self {
        Self::Transient(msg.to_string())
    }

    pub fn permanent(msg: impl std::fmt::Display) -> Self {
        Self::Permanent(msg.to_string())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Per-delivery metadata visible to a handler.
///
/// Lets business logic distinguish a first attempt from the very last one
/// (e.g. to emit a side effect only when no further retry will happen).
#[derive(Debug, Clone)]
pub struct JobExecutionContext {
    /// How many dead-letter escalation cycles this message went through.
    pub retry_batches_count: u32,
    /// Retry-policy bound on escalation cycles (0 when no policy attached).
    pub max_retry_batches: u32,
    /// Transport delivery attempt within the current batch (1-based).
    pub retries_in_current_batch: u32,
    /// Transport in-batch delivery limit.
    pub max_retries_in_batch: u32,
    /// True when both budgets are spent: failing now is final.
    pub is_last_retry: bool,
    pub correlation_id: Uuid,
}

/// A pipeline stage: consumes one delivery, returns a continuation decision.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: JobExecutionContext,
    ) -> Result<HandlerResponse, HandlerError>;

    /// Human-readable name, used in logs.
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: MessageHandler + ?Sized> MessageHandler for Arc<T> {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: JobExecutionContext,
    ) -> Result<HandlerResponse, HandlerError> {
        (**self).handle(envelope, ctx).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
