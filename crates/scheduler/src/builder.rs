//! Fluent wiring of the scheduling pipeline onto a bus.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use fahrplan_bus::{
    validate_subscription_name, MessageBus, MessageHandler, RetryDefinition, RetryPolicy,
    Shutdown,
};

use crate::change::{JobChangeProvider, NoChangeProvider};
use crate::error::SchedulerError;
use crate::pipeline::{ScheduleNextRun, WindowValidator};
use crate::scheduler::JobScheduler;
use crate::topics::{
    job_scheduled_topic, subscription, validate_job_type, window_ready_topic,
    window_valid_topic, CREATE_WINDOW_INSTANCE_SUFFIX, PERMANENT_SCHEDULING_ERRORS_TOPIC,
    SCHEDULE_NEXT_RUN_SUFFIX, VALIDATION_SUFFIX, WINDOW_EXECUTION_SUFFIX,
};

/// Backoff applied to the built-in validator subscription.
fn scheduling_retry_policy() -> RetryPolicy {
    RetryPolicy::new(
        PERMANENT_SCHEDULING_ERRORS_TOPIC,
        RetryDefinition::new(Duration::from_secs(40), Duration::from_secs(120), 3),
    )
}

struct ExecutorRegistration {
    job_type: String,
    handler: Arc<dyn MessageHandler>,
    concurrency_level: usize,
    retry_policy: Option<RetryPolicy>,
}

struct SubHandlerRegistration {
    topic: String,
    subscription: String,
    handler: Arc<dyn MessageHandler>,
    concurrency_level: usize,
    retry_policy: Option<RetryPolicy>,
}

/// Builds a [`JobScheduler`]: provisions the dynamic per-job-type entities
/// and registers the four pipeline stages plus any extra handlers.
///
/// At most one execution handler may be registered per job type; a second
/// registration fails at build time.
pub struct JobSchedulerBuilder {
    bus: Option<Arc<dyn MessageBus>>,
    change_provider: Arc<dyn JobChangeProvider>,
    shutdown: Shutdown,
    scheduling_workers: bool,
    stage_concurrency: usize,
    executors: Vec<ExecutorRegistration>,
    sub_handlers: Vec<SubHandlerRegistration>,
}

impl JobSchedulerBuilder {
    pub fn new() -> Self {
        Self {
            bus: None,
            change_provider: Arc::new(NoChangeProvider),
            shutdown: Shutdown::new(),
            scheduling_workers: true,
            stage_concurrency: 3,
            executors: Vec::new(),
            sub_handlers: Vec::new(),
        }
    }

    /// The bus everything runs on. Required.
    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Source of staleness answers for the validator (default: everything
    /// is current).
    pub fn change_provider(mut self, provider: Arc<dyn JobChangeProvider>) -> Self {
        self.change_provider = provider;
        self
    }

    /// Shared cancellation signal for every registered subscription.
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Whether to register the built-in scheduling stages (default: true).
    /// Disable on processes that only host execution handlers.
    pub fn scheduling_workers(mut self, enabled: bool) -> Self {
        self.scheduling_workers = enabled;
        self
    }

    /// Concurrency of the built-in stage subscriptions (default: 3).
    pub fn stage_concurrency(mut self, concurrency: usize) -> Self {
        self.stage_concurrency = concurrency.max(1);
        self
    }

    /// Register the execution handler for one job type.
    pub fn add_job_executor(
        mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        concurrency_level: usize,
        retry_policy: Option<RetryPolicy>,
    ) -> Self {
        self.executors.push(ExecutorRegistration {
            job_type: job_type.into(),
            handler,
            concurrency_level,
            retry_policy,
        });
        self
    }

    /// Register an extra handler on an arbitrary topic — e.g. a consumer of
    /// an execution handler's continuation topic.
    pub fn add_sub_handler(
        mut self,
        topic: impl Into<String>,
        subscription: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        concurrency_level: usize,
        retry_policy: Option<RetryPolicy>,
    ) -> Self {
        self.sub_handlers.push(SubHandlerRegistration {
            topic: topic.into(),
            subscription: subscription.into(),
            handler,
            concurrency_level,
            retry_policy,
        });
        self
    }

    pub async fn build(self) -> Result<JobScheduler, SchedulerError> {
        let bus = self
            .bus
            .ok_or_else(|| SchedulerError::Configuration("no bus configured".into()))?;

        let mut seen_types = HashSet::new();
        for executor in &self.executors {
            validate_job_type(&executor.job_type)?;
            if !seen_types.insert(executor.job_type.clone()) {
                return Err(SchedulerError::DuplicateExecutor(executor.job_type.clone()));
            }
        }
        for registration in &self.sub_handlers {
            validate_subscription_name(&registration.subscription)
                .map_err(SchedulerError::Bus)?;
        }

        // Entity set: every stage topic/subscription per job type, the
        // scheduling permanent-errors sink, and whatever the registrations
        // bring along.
        let mut topics = BTreeSet::from([PERMANENT_SCHEDULING_ERRORS_TOPIC.to_string()]);
        let mut subscriptions = BTreeSet::new();
        for executor in &self.executors {
            let scheduled = job_scheduled_topic(&executor.job_type);
            let ready = window_ready_topic(&executor.job_type);
            let valid = window_valid_topic(&executor.job_type);

            subscriptions.insert(subscription(&scheduled, CREATE_WINDOW_INSTANCE_SUFFIX));
            subscriptions.insert(subscription(&ready, VALIDATION_SUFFIX));
            subscriptions.insert(subscription(&valid, SCHEDULE_NEXT_RUN_SUFFIX));
            subscriptions.insert(subscription(&valid, WINDOW_EXECUTION_SUFFIX));
            topics.insert(scheduled);
            topics.insert(ready);
            topics.insert(valid);

            if let Some(policy) = &executor.retry_policy {
                topics.insert(policy.permanent_errors_topic.clone());
            }
        }
        for registration in &self.sub_handlers {
            topics.insert(registration.topic.clone());
            subscriptions.insert(registration.subscription.clone());
            if let Some(policy) = &registration.retry_policy {
                topics.insert(policy.permanent_errors_topic.clone());
            }
        }

        let topics: Vec<String> = topics.into_iter().collect();
        let subscriptions: Vec<String> = subscriptions.into_iter().collect();
        bus.setup_entities_if_not_exist(&topics, &subscriptions).await?;

        if self.scheduling_workers {
            for executor in &self.executors {
                let scheduled = job_scheduled_topic(&executor.job_type);
                let ready = window_ready_topic(&executor.job_type);
                let valid = window_valid_topic(&executor.job_type);

                bus.register_subscriber(
                    &scheduled,
                    &subscription(&scheduled, CREATE_WINDOW_INSTANCE_SUFFIX),
                    self.stage_concurrency,
                    Arc::new(ScheduleNextRun),
                    None,
                    self.shutdown.clone(),
                )
                .await?;

                bus.register_subscriber(
                    &ready,
                    &subscription(&ready, VALIDATION_SUFFIX),
                    self.stage_concurrency,
                    Arc::new(WindowValidator::new(self.change_provider.clone())),
                    Some(scheduling_retry_policy()),
                    self.shutdown.clone(),
                )
                .await?;

                // The reschedule loop: arms the following window no matter
                // how execution fares.
                bus.register_subscriber(
                    &valid,
                    &subscription(&valid, SCHEDULE_NEXT_RUN_SUFFIX),
                    self.stage_concurrency,
                    Arc::new(ScheduleNextRun),
                    None,
                    self.shutdown.clone(),
                )
                .await?;
            }
        }

        for executor in self.executors {
            let valid = window_valid_topic(&executor.job_type);
            bus.register_subscriber(
                &valid,
                &subscription(&valid, WINDOW_EXECUTION_SUFFIX),
                executor.concurrency_level,
                executor.handler,
                executor.retry_policy,
                self.shutdown.clone(),
            )
            .await?;
        }

        for registration in self.sub_handlers {
            bus.register_subscriber(
                &registration.topic,
                &registration.subscription,
                registration.concurrency_level,
                registration.handler,
                registration.retry_policy,
                self.shutdown.clone(),
            )
            .await?;
        }

        info!(
            topics = topics.len(),
            subscriptions = subscriptions.len(),
            "job scheduler built"
        );
        Ok(JobScheduler::new(bus, self.shutdown))
    }
}

impl Default for JobSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use fahrplan_bus::{
        Envelope, HandlerError, HandlerResponse, InMemoryBus, JobExecutionContext,
    };

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn handle(
            &self,
            _envelope: Envelope,
            _ctx: JobExecutionContext,
        ) -> Result<HandlerResponse, HandlerError> {
            Ok(HandlerResponse::ok())
        }

        fn name(&self) -> &str {
            "noop"
        }
    }

    fn executor_policy() -> RetryPolicy {
        RetryPolicy::new(
            "ExecutionErrors",
            RetryDefinition::new(Duration::from_secs(1), Duration::from_secs(4), 2),
        )
    }

    #[tokio::test]
    async fn build_requires_a_bus() {
        let result = JobSchedulerBuilder::new().build().await;
        assert!(matches!(result, Err(SchedulerError::Configuration(_))));
    }

    #[tokio::test]
    async fn duplicate_executor_fails_at_build() {
        let bus = Arc::new(InMemoryBus::new());
        let result = JobSchedulerBuilder::new()
            .bus(bus)
            .add_job_executor("Heartbeat", Arc::new(NoopHandler), 1, Some(executor_policy()))
            .add_job_executor("Heartbeat", Arc::new(NoopHandler), 1, None)
            .build()
            .await;
        assert!(matches!(result, Err(SchedulerError::DuplicateExecutor(t)) if t == "Heartbeat"));
    }

    #[tokio::test]
    async fn invalid_job_type_fails_at_build() {
        let bus = Arc::new(InMemoryBus::new());
        let result = JobSchedulerBuilder::new()
            .bus(bus)
            .add_job_executor("Heart_Beat", Arc::new(NoopHandler), 1, None)
            .build()
            .await;
        assert!(matches!(result, Err(SchedulerError::InvalidJobType(_))));
    }

    #[tokio::test]
    async fn malformed_sub_handler_name_fails_at_build() {
        let bus = Arc::new(InMemoryBus::new());
        let result = JobSchedulerBuilder::new()
            .bus(bus)
            .add_sub_handler("Output", "NoSeparator", Arc::new(NoopHandler), 1, None)
            .build()
            .await;
        assert!(matches!(result, Err(SchedulerError::Bus(_))));
    }

    #[tokio::test]
    async fn distinct_job_types_coexist() {
        let bus = Arc::new(InMemoryBus::new());
        let scheduler = JobSchedulerBuilder::new()
            .bus(bus)
            .add_job_executor("Heartbeat", Arc::new(NoopHandler), 1, Some(executor_policy()))
            .add_job_executor("Report", Arc::new(NoopHandler), 2, None)
            .add_sub_handler("Output", "Output_Sink", Arc::new(NoopHandler), 1, None)
            .build()
            .await
            .unwrap();
        scheduler.close().await.unwrap();
    }
}
