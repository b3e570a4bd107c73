use std::time::Duration;

/// Exponential backoff definition: `delay(n) = min(minimal * 2^n, maximal)`.
///
/// `n` is the zero-based count of dead-letter escalation cycles already
/// performed for the failing unit of work. `max_retry_count` bounds how many
/// times the formula is applied before the message is routed to the
/// permanent-errors topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDefinition {
    pub minimal: Duration,
    pub maximal: Duration,
    pub max_retry_count: u32,
}

impl RetryDefinition {
    pub fn new(minimal: Duration, maximal: Duration, max_retry_count: u32) -> Self {
        Self {
            minimal,
            maximal,
            max_retry_count,
        }
    }

    /// Backoff delay before the given (zero-based) retry cycle.
    ///
    /// Non-decreasing in `retries_count` and capped at `maximal`; large
    /// counts saturate at the cap instead of overflowing the shift.
    pub fn delay(&self, retries_count: u32) -> Duration {
        if retries_count >= 32 {
            return self.maximal;
        }
        match self.minimal.checked_mul(1u32 << retries_count) {
            Some(d) if d < self.maximal => d,
            _ => self.maximal,
        }
    }
}

/// Retry behavior attached to a subscription: where exhausted messages go,
/// and the backoff curve applied between dead-letter cycles.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Terminal destination once `retry.max_retry_count` cycles are spent.
    pub permanent_errors_topic: String,
    pub retry: RetryDefinition,
}

impl RetryPolicy {
    pub fn new(permanent_errors_topic: impl Into<String>, retry: RetryDefinition) -> Self {
        Self {
            permanent_errors_topic: permanent_errors_topic.into(),
            retry,
        }
    }

    pub fn delay(&self, retries_count: u32) -> Duration {
        self.retry.delay(retries_count)
    }

    pub fn max_retry_count(&self) -> u32 {
        self.retry.max_retry_count
    }
}
