use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use fahrplan_bus::{
    Envelope, HandlerError, HandlerResponse, JobExecutionContext, MessageHandler,
};

use crate::change::{ChangeType, JobChangeProvider};
use crate::job::JobWindow;
use crate::topics::window_valid_topic;

/// Gate between a due window and its execution.
///
/// Confirms with the change provider that the job definition behind the
/// window is still the one it was armed from. A changed or deleted
/// definition drops the chain with a 409 — the updated definition is
/// expected to have started a fresh chain of its own, so no alert is
/// raised. Skip flags bypass the check for directly scheduled windows and
/// force-suppressed schedules.
pub struct WindowValidator {
    change_provider: Arc<dyn JobChangeProvider>,
}

impl WindowValidator {
    pub fn new(change_provider: Arc<dyn JobChangeProvider>) -> Self {
        Self { change_provider }
    }
}

#[async_trait]
impl MessageHandler for WindowValidator {
    async fn handle(
        &self,
        envelope: Envelope,
        _ctx: JobExecutionContext,
    ) -> Result<HandlerResponse, HandlerError> {
        let window: JobWindow = envelope
            .decode()
            .map_err(|e| HandlerError::permanent(format!("undecodable job window: {e}")))?;
        let topic = window_valid_topic(&window.job.job_type);

        if window.job.skip_next_window_validation
            || window.job.schedule.force_suppress_window_validation
        {
            debug!(window = %window.window_id(), "validation suppressed");
            let message = window.to_envelope().map_err(HandlerError::permanent)?;
            return Ok(HandlerResponse::continue_with(message, topic, None));
        }

        // Provider outages are transient: the window is redelivered and
        // validated again.
        let change = self
            .change_provider
            .get_job_change_type(&window.job.rule_id, &window.job.etag)
            .await
            .map_err(HandlerError::transient)?;

        match change {
            ChangeType::Changed | ChangeType::Deleted => {
                info!(
                    window = %window.window_id(),
                    change = ?change,
                    "job definition is stale, dropping chain"
                );
                Ok(HandlerResponse::conflict())
            }
            ChangeType::NotChanged => {
                debug!(
                    window = %window.window_id(),
                    upper_bound = ?window.job.last_run_window_upper_bound,
                    "window valid"
                );
                let message = window.to_envelope().map_err(HandlerError::permanent)?;
                Ok(HandlerResponse::continue_with(message, topic, None))
            }
        }
    }

    fn name(&self) -> &str {
        "window-validator"
    }
}
