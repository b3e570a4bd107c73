//! The scheduler facade callers submit jobs through.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use fahrplan_bus::{MessageBus, Shutdown};

use crate::error::SchedulerError;
use crate::job::{Job, JobWindow};
use crate::topics::{job_scheduled_topic, validate_job_type, window_ready_topic};
use crate::window::next_window;

/// Entry point to a built pipeline. Submitting a job starts its window
/// chain; everything after that happens through the bus.
pub struct JobScheduler {
    bus: Arc<dyn MessageBus>,
    shutdown: Shutdown,
}

impl JobScheduler {
    pub(crate) fn new(bus: Arc<dyn MessageBus>, shutdown: Shutdown) -> Self {
        Self { bus, shutdown }
    }

    /// Submit a job: its first window is computed by the schedule stage and
    /// the chain re-arms itself while the schedule allows.
    pub async fn schedule_job(&self, job: &Job) -> Result<(), SchedulerError> {
        validate_job_type(&job.job_type)?;
        let message = job.to_envelope()?;
        info!(id = %job.id, rule_id = %job.rule_id, job_type = %job.job_type, "scheduling job");
        self.bus
            .publish(message, &job_scheduled_topic(&job.job_type), None, None)
            .await?;
        Ok(())
    }

    /// Run a single window of the job and never re-arm: the window is
    /// computed immediately and published straight to the window-ready
    /// topic, delivered at `execute_on_utc` (default: the window's own due
    /// time). The caller's `skip_next_window_validation` flag survives on
    /// this directly scheduled window.
    pub async fn schedule_once(
        &self,
        mut job: Job,
        execute_on_utc: Option<DateTime<Utc>>,
    ) -> Result<(), SchedulerError> {
        validate_job_type(&job.job_type)?;
        job.schedule.periodic = false;

        let Some(range) = next_window(&job.schedule, job.last_run_window_upper_bound, Utc::now())?
        else {
            warn!(
                rule_id = %job.rule_id,
                end = ?job.schedule.schedule_end_time,
                "schedule already ended, nothing to run"
            );
            return Ok(());
        };

        let window = JobWindow {
            job: Job {
                last_run_window_upper_bound: Some(range.to),
                ..job
            },
            from_time: range.from,
            to_time: range.to,
        };
        let due = execute_on_utc.unwrap_or(window.to_time + window.job.schedule.run_delay());
        let topic = window_ready_topic(&window.job.job_type);
        let message = window.to_envelope()?;

        info!(window = %window.window_id(), due = %due.to_rfc3339(), "scheduling one-shot window");
        self.bus.publish(message, &topic, Some(due), None).await?;
        Ok(())
    }

    /// Handle to the shared cancellation signal, for wiring into process
    /// signal handling.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Trigger shutdown and close the underlying bus.
    pub async fn close(&self) -> Result<(), SchedulerError> {
        self.shutdown.trigger();
        self.bus.close().await?;
        Ok(())
    }
}
