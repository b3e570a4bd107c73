//! Worker configuration, parsed from `fahrplan.toml`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fahrplan_bus::{RetryDefinition, RetryPolicy};

use crate::error::SchedulerError;

/// Full configuration for a fahrplan worker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Pipeline stage settings.
    #[serde(default)]
    pub scheduler: SchedulerSection,

    /// Execution-handler retry settings.
    #[serde(default)]
    pub retry: RetrySection,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Concurrency of the built-in stage subscriptions.
    #[serde(default = "default_stage_concurrency")]
    pub stage_concurrency: usize,

    /// Concurrency of the execution-handler subscription.
    #[serde(default = "default_executor_concurrency")]
    pub executor_concurrency: usize,
}

fn default_stage_concurrency() -> usize {
    3
}

fn default_executor_concurrency() -> usize {
    3
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            stage_concurrency: default_stage_concurrency(),
            executor_concurrency: default_executor_concurrency(),
        }
    }
}

/// `[retry]` section: the execution handler's dead-letter backoff curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_minimal_backoff_secs")]
    pub minimal_backoff_secs: u64,

    #[serde(default = "default_maximal_backoff_secs")]
    pub maximal_backoff_secs: u64,

    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    #[serde(default = "default_permanent_errors_topic")]
    pub permanent_errors_topic: String,
}

fn default_minimal_backoff_secs() -> u64 {
    40
}

fn default_maximal_backoff_secs() -> u64 {
    120
}

fn default_max_retry_count() -> u32 {
    3
}

fn default_permanent_errors_topic() -> String {
    "PermanentExecutionErrors".into()
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            minimal_backoff_secs: default_minimal_backoff_secs(),
            maximal_backoff_secs: default_maximal_backoff_secs(),
            max_retry_count: default_max_retry_count(),
            permanent_errors_topic: default_permanent_errors_topic(),
        }
    }
}

impl WorkerConfig {
    /// Load from a TOML file. Missing sections fall back to defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// The execution handler's retry policy per the `[retry]` section.
    pub fn execution_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.permanent_errors_topic.clone(),
            RetryDefinition::new(
                Duration::from_secs(self.retry.minimal_backoff_secs),
                Duration::from_secs(self.retry.maximal_backoff_secs),
                self.retry.max_retry_count,
            ),
        )
    }
}
