//! Job and job-window data model.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use fahrplan_bus::{BusError, Envelope};

use crate::schedule::JobSchedule;

/// Lifecycle state of a job definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    #[default]
    Enabled,
    Disabled,
    Deleted,
}

/// A schedulable unit of work.
///
/// The caller owns it until publication; afterwards each pipeline stage
/// works on its own decoded copy. `etag` changes whenever the definition is
/// updated externally and is the sole staleness signal the validator
/// consults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Caller-assigned id, stable across the whole scheduling chain.
    pub id: String,

    /// Opaque revision token of the job definition.
    #[serde(default)]
    pub etag: String,

    /// Namespaces the dynamic pipeline topics; no underscores.
    pub job_type: String,

    /// Identity of the underlying rule, stable across window instances.
    pub rule_id: String,

    /// Opaque user data handed through to the execution handler.
    #[serde(default)]
    pub payload: serde_json::Value,

    pub schedule: JobSchedule,

    /// Exclusive upper bound of the most recently emitted window. Only
    /// moves forward.
    #[serde(default)]
    pub last_run_window_upper_bound: Option<DateTime<Utc>>,

    #[serde(default)]
    pub status: JobStatus,

    /// Bypass the staleness check for a directly scheduled window.
    #[serde(default)]
    pub skip_next_window_validation: bool,
}

impl Job {
    pub fn to_envelope(&self) -> Result<Envelope, BusError> {
        Envelope::encode(
            self.id.clone(),
            self.etag.clone(),
            self.job_type.clone(),
            self,
        )
    }
}

/// One tumbling-window instance of a job: the half-open range
/// `[from_time, to_time)` this execution covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWindow {
    #[serde(flatten)]
    pub job: Job,

    pub from_time: DateTime<Utc>,
    pub to_time: DateTime<Utc>,
}

impl JobWindow {
    /// Deterministic identity of this (rule, window) pair; downstream
    /// consumers use it as an idempotency key under at-least-once delivery.
    pub fn window_id(&self) -> String {
        format!(
            "{}[{}->{}]",
            self.job.rule_id,
            self.from_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.to_time.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
    }

    pub fn to_envelope(&self) -> Result<Envelope, BusError> {
        Envelope::encode(
            self.job.id.clone(),
            self.job.etag.clone(),
            self.job.job_type.clone(),
            self,
        )
    }
}
