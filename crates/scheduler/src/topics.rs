//! Dynamic per-job-type topic and subscription naming.
//!
//! Topic = `<StagePrefix><JobType>`; subscription = `<Topic>_<Suffix>`, so
//! the parent topic is always recoverable as the segment before the first
//! underscore. Job types therefore must not contain underscores.

use crate::error::SchedulerError;

/// Stage prefix: submitted jobs awaiting their first/next window.
pub const JOB_SCHEDULED_PREFIX: &str = "JobScheduled";
/// Stage prefix: computed windows awaiting validation.
pub const JOB_WINDOW_READY_PREFIX: &str = "JobWindowReady";
/// Stage prefix: validated windows awaiting execution and rescheduling.
pub const JOB_WINDOW_VALID_PREFIX: &str = "JobWindowValid";

/// Terminal sink for scheduling-stage messages that exhausted retries.
pub const PERMANENT_SCHEDULING_ERRORS_TOPIC: &str = "PermanentSchedulingErrors";

pub const CREATE_WINDOW_INSTANCE_SUFFIX: &str = "CreateWindowInstance";
pub const VALIDATION_SUFFIX: &str = "Validation";
pub const SCHEDULE_NEXT_RUN_SUFFIX: &str = "ScheduleNextRun";
pub const WINDOW_EXECUTION_SUFFIX: &str = "WindowExecution";

/// Job types namespace topics and feed subscription names, so they must be
/// non-empty and underscore-free.
pub fn validate_job_type(job_type: &str) -> Result<(), SchedulerError> {
    if job_type.is_empty() || job_type.contains('_') || job_type.contains(char::is_whitespace) {
        return Err(SchedulerError::InvalidJobType(job_type.to_string()));
    }
    Ok(())
}

pub fn job_scheduled_topic(job_type: &str) -> String {
    format!("{JOB_SCHEDULED_PREFIX}{job_type}")
}

pub fn window_ready_topic(job_type: &str) -> String {
    format!("{JOB_WINDOW_READY_PREFIX}{job_type}")
}

pub fn window_valid_topic(job_type: &str) -> String {
    format!("{JOB_WINDOW_VALID_PREFIX}{job_type}")
}

pub fn subscription(topic: &str, suffix: &str) -> String {
    format!("{topic}_{suffix}")
}
