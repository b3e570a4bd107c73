//! Job-definition persistence seam.
//!
//! The store is an external collaborator; the pipeline only depends on the
//! trait. [`InMemoryJobStore`] backs tests and the demo worker, and
//! [`StoreChangeProvider`] derives the validator's staleness answer from
//! whatever store is plugged in.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::change::{ChangeType, JobChangeProvider};
use crate::error::SchedulerError;
use crate::job::{Job, JobStatus};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<Job>, SchedulerError>;

    /// Persist the job, assigning a fresh etag. Returns the stored copy.
    async fn upsert(&self, job: Job) -> Result<Job, SchedulerError>;
}

/// Map-backed store keyed by job id.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<Job>, SchedulerError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn upsert(&self, mut job: Job) -> Result<Job, SchedulerError> {
        job.etag = Uuid::new_v4().to_string();
        self.jobs
            .write()
            .await
            .insert(job.id.clone(), job.clone());
        Ok(job)
    }
}

/// Change provider answering from a [`JobStore`]: a missing or deleted
/// definition is `Deleted`, a different etag is `Changed`.
pub struct StoreChangeProvider {
    store: Arc<dyn JobStore>,
}

impl StoreChangeProvider {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobChangeProvider for StoreChangeProvider {
    async fn get_job_change_type(
        &self,
        job_id: &str,
        etag: &str,
    ) -> Result<ChangeType, SchedulerError> {
        match self.store.get_by_id(job_id).await? {
            None => Ok(ChangeType::Deleted),
            Some(job) if job.status == JobStatus::Deleted => Ok(ChangeType::Deleted),
            Some(job) if job.etag != etag => Ok(ChangeType::Changed),
            Some(_) => Ok(ChangeType::NotChanged),
        }
    }
}
