//! fahrplan-worker — demo scheduling worker on the in-memory bus.
//!
//! Upserts one job definition into an in-memory store, schedules it, and
//! echoes every executed window until ctrl-c. Useful for watching the
//! pipeline run without any broker.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fahrplan_bus::{
    Envelope, HandlerError, HandlerResponse, InMemoryBus, JobExecutionContext, MessageHandler,
};
use fahrplan_scheduler::{
    InMemoryJobStore, Job, JobSchedule, JobSchedulerBuilder, JobStatus, JobStore,
    JobWindow, StoreChangeProvider, WorkerConfig,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Demo worker: schedules one periodic job and echoes its windows.
#[derive(Parser, Debug)]
#[command(name = "fahrplan-worker", version, about)]
struct Cli {
    /// Path to fahrplan.toml config file.
    #[arg(long, env = "FAHRPLAN_CONFIG", default_value = "fahrplan.toml")]
    config: String,

    /// Job type namespace for the demo job.
    #[arg(long, env = "FAHRPLAN_JOB_TYPE", default_value = "Echo")]
    job_type: String,

    /// Window width in seconds.
    #[arg(long, env = "FAHRPLAN_INTERVAL", default_value_t = 10)]
    interval_secs: i64,
}

// ── Echo executor ───────────────────────────────────────────────────

/// Execution handler that logs each window it receives.
struct EchoWindowExecutor;

#[async_trait]
impl MessageHandler for EchoWindowExecutor {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: JobExecutionContext,
    ) -> Result<HandlerResponse, HandlerError> {
        let window: JobWindow = envelope
            .decode()
            .map_err(|e| HandlerError::permanent(format!("undecodable window: {e}")))?;
        info!(
            window = %window.window_id(),
            payload = %window.job.payload,
            attempt = ctx.retries_in_current_batch,
            "window executed"
        );
        Ok(HandlerResponse::ok())
    }

    fn name(&self) -> &str {
        "echo-window-executor"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = if Path::new(&cli.config).exists() {
        WorkerConfig::from_path(&cli.config)
            .with_context(|| format!("loading config from {}", cli.config))?
    } else {
        info!(path = %cli.config, "no config file, using defaults");
        WorkerConfig::default()
    };

    let bus = Arc::new(InMemoryBus::new());
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());

    let scheduler = JobSchedulerBuilder::new()
        .bus(bus)
        .change_provider(Arc::new(StoreChangeProvider::new(store.clone())))
        .stage_concurrency(config.scheduler.stage_concurrency)
        .add_job_executor(
            cli.job_type.clone(),
            Arc::new(EchoWindowExecutor),
            config.scheduler.executor_concurrency,
            Some(config.execution_retry_policy()),
        )
        .build()
        .await
        .context("building scheduler")?;

    let job = store
        .upsert(Job {
            id: "demo-rule".into(),
            etag: String::new(),
            job_type: cli.job_type.clone(),
            rule_id: "demo-rule".into(),
            payload: serde_json::json!({"source": "fahrplan-worker"}),
            schedule: JobSchedule {
                run_interval_seconds: Some(cli.interval_secs),
                periodic: true,
                ..Default::default()
            },
            last_run_window_upper_bound: None,
            status: JobStatus::Enabled,
            skip_next_window_validation: false,
        })
        .await
        .context("storing demo job")?;

    scheduler
        .schedule_job(&job)
        .await
        .context("scheduling demo job")?;
    info!(
        job_type = %cli.job_type,
        interval_secs = cli.interval_secs,
        "demo job scheduled, ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    info!("shutting down");
    scheduler.close().await.context("closing scheduler")?;
    Ok(())
}
