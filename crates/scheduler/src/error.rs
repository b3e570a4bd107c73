use thiserror::Error;

use fahrplan_bus::BusError;

/// Schedule definition errors — configuration problems, never retried.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("scheduled job must define run_interval_seconds or a cron expression")]
    MissingDefinition,

    #[error("run_interval_seconds must be positive, got {0}")]
    InvalidInterval(i64),

    #[error("invalid cron expression `{expression}`: {source}")]
    InvalidCron {
        expression: String,
        #[source]
        source: cron::error::Error,
    },
}

/// Errors raised by the scheduling pipeline and its builder.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("an execution handler is already registered for job type `{0}`")]
    DuplicateExecutor(String),

    #[error("invalid job type `{0}`: must be non-empty and contain no underscore")]
    InvalidJobType(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("change provider error: {0}")]
    ChangeProvider(String),

    #[error("job store error: {0}")]
    Store(String),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
