use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use fahrplan_bus::{
    Envelope, HandlerError, HandlerResponse, JobExecutionContext, MessageHandler,
};

use crate::job::{Job, JobWindow};
use crate::topics::window_ready_topic;
use crate::window::next_window;

/// Arms the next tumbling window for a periodic job.
///
/// Runs twice in the pipeline: on the scheduled topic for freshly submitted
/// jobs, and on the window-valid topic as the reschedule loop — so the
/// chain re-arms regardless of whether execution succeeds. Consumes the
/// plain [`Job`] projection of the incoming message; for a looped-back
/// window that projection already carries the advanced
/// `last_run_window_upper_bound`.
pub struct ScheduleNextRun;

#[async_trait]
impl MessageHandler for ScheduleNextRun {
    async fn handle(
        &self,
        envelope: Envelope,
        _ctx: JobExecutionContext,
    ) -> Result<HandlerResponse, HandlerError> {
        let job: Job = envelope
            .decode()
            .map_err(|e| HandlerError::permanent(format!("undecodable job: {e}")))?;

        if !job.schedule.periodic {
            debug!(id = %job.id, "one-shot job, nothing to re-arm");
            return Ok(HandlerResponse::ok());
        }

        // A broken schedule definition cannot heal on redelivery.
        let window = next_window(&job.schedule, job.last_run_window_upper_bound, Utc::now())
            .map_err(HandlerError::permanent)?;
        let Some(window) = window else {
            info!(
                rule_id = %job.rule_id,
                end = ?job.schedule.schedule_end_time,
                "schedule ended, chain terminates"
            );
            return Ok(HandlerResponse::ok());
        };

        let next = JobWindow {
            job: Job {
                last_run_window_upper_bound: Some(window.to),
                // Declared configuration, not the incoming one-shot flag:
                // a caller-set skip applies only to the window it was
                // published with.
                skip_next_window_validation: job.schedule.force_suppress_window_validation,
                ..job.clone()
            },
            from_time: window.from,
            to_time: window.to,
        };
        let due = window.to + next.job.schedule.run_delay();
        let topic = window_ready_topic(&next.job.job_type);
        let message = next.to_envelope().map_err(HandlerError::permanent)?;

        info!(
            window = %next.window_id(),
            due = %due.to_rfc3339(),
            topic = %topic,
            "next window armed"
        );
        Ok(HandlerResponse::continue_with(message, topic, Some(due)))
    }

    fn name(&self) -> &str {
        "schedule-next-run"
    }
}
