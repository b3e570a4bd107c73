//! Staleness detection seam.
//!
//! The validator asks an external change provider whether the job
//! definition behind a window was edited or removed since the window was
//! armed. The etag observed at arming time is the only staleness signal.

use async_trait::async_trait;

use crate::error::SchedulerError;

/// What happened to a job definition since a given etag was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    NotChanged,
    Changed,
    Deleted,
}

#[async_trait]
pub trait JobChangeProvider: Send + Sync {
    async fn get_job_change_type(
        &self,
        job_id: &str,
        etag: &str,
    ) -> Result<ChangeType, SchedulerError>;
}

/// Provider that treats every definition as current. The default when no
/// external source of truth is wired in.
pub struct NoChangeProvider;

#[async_trait]
impl JobChangeProvider for NoChangeProvider {
    async fn get_job_change_type(
        &self,
        _job_id: &str,
        _etag: &str,
    ) -> Result<ChangeType, SchedulerError> {
        Ok(ChangeType::NotChanged)
    }
}
