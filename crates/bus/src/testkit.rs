//! Test doubles and the backend conformance suite.
//!
//! Both bus implementations must pass [`conformance::run_all`]; the suite
//! is what keeps their observable behavior identical.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::handler::{HandlerError, HandlerResponse, JobExecutionContext, MessageHandler};

pub(crate) fn test_envelope(id: &str) -> Envelope {
    Envelope::encode(id, "etag-1", "Test", &"payload").unwrap()
}

/// Handler that records every delivery and succeeds terminally.
pub(crate) fn probe_handler() -> (
    Arc<dyn MessageHandler>,
    mpsc::UnboundedReceiver<(Envelope, JobExecutionContext)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ProbeHandler { tx }), rx)
}

struct ProbeHandler {
    tx: mpsc::UnboundedSender<(Envelope, JobExecutionContext)>,
}

#[async_trait]
impl MessageHandler for ProbeHandler {
    async fn handle(
        &self,
        envelope: Envelope,
        ctx: JobExecutionContext,
    ) -> Result<HandlerResponse, HandlerError> {
        let _ = self.tx.send((envelope, ctx));
        Ok(HandlerResponse::ok())
    }

    fn name(&self) -> &str {
        "probe"
    }
}

/// Handler that always fails transiently, counting invocations.
pub(crate) fn failing_handler() -> (Arc<dyn MessageHandler>, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    (
        Arc::new(FailingHandler {
            calls: calls.clone(),
        }),
        calls,
    )
}

struct FailingHandler {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(
        &self,
        _envelope: Envelope,
        _ctx: JobExecutionContext,
    ) -> Result<HandlerResponse, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::transient("simulated transient failure"))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Handler that always fails permanently, counting invocations.
pub(crate) fn permanent_failing_handler() -> (Arc<dyn MessageHandler>, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    (
        Arc::new(PermanentFailingHandler {
            calls: calls.clone(),
        }),
        calls,
    )
}

struct PermanentFailingHandler {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl MessageHandler for PermanentFailingHandler {
    async fn handle(
        &self,
        _envelope: Envelope,
        _ctx: JobExecutionContext,
    ) -> Result<HandlerResponse, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::permanent("simulated poison message"))
    }

    fn name(&self) -> &str {
        "permanent-failing"
    }
}

/// Handler that continues to a fixed topic with a derived message id.
pub(crate) fn continuing_handler(next_topic: &str) -> Arc<dyn MessageHandler> {
    Arc::new(ContinuingHandler {
        next_topic: next_topic.to_string(),
    })
}

struct ContinuingHandler {
    next_topic: String,
}

#[async_trait]
impl MessageHandler for ContinuingHandler {
    async fn handle(
        &self,
        envelope: Envelope,
        _ctx: JobExecutionContext,
    ) -> Result<HandlerResponse, HandlerError> {
        let next = Envelope::encode(
            format!("{}-next", envelope.id),
            envelope.etag.clone(),
            envelope.job_type.clone(),
            &"continued",
        )
        .map_err(HandlerError::permanent)?;
        Ok(HandlerResponse::continue_with(
            next,
            self.next_topic.clone(),
            None,
        ))
    }

    fn name(&self) -> &str {
        "continuing"
    }
}

// ── FakeBroker ───────────────────────────────────────────────────────

pub(crate) use fake_broker::FakeBroker;

mod fake_broker {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::broker::{BrokerClient, LockedMessage};
    use crate::envelope::Envelope;
    use crate::error::BusError;

    /// Minimal peek-lock broker for exercising [`crate::BrokerBus`]:
    /// per-subscription live and dead-letter queues, scheduled visibility,
    /// delivery counting, and automatic dead-lettering past the
    /// max-delivery-count — the behavior the real broker is provisioned
    /// for.
    pub(crate) struct FakeBroker {
        max_delivery_count: u32,
        state: Mutex<State>,
    }

    #[derive(Default)]
    struct State {
        topics: HashMap<String, HashMap<String, SubQueues>>,
        locks: HashMap<Uuid, LockedEntry>,
    }

    #[derive(Default)]
    struct SubQueues {
        live: VecDeque<QueuedMessage>,
        dead: VecDeque<QueuedMessage>,
    }

    struct QueuedMessage {
        envelope: Envelope,
        delivery_count: u32,
    }

    struct LockedEntry {
        topic: String,
        subscription: String,
        message: QueuedMessage,
        from_dead_letter: bool,
    }

    impl FakeBroker {
        pub(crate) fn new(max_delivery_count: u32) -> Self {
            Self {
                max_delivery_count,
                state: Mutex::new(State::default()),
            }
        }

        fn try_receive(
            &self,
            topic: &str,
            subscription: &str,
            dead_letter: bool,
        ) -> Option<LockedMessage> {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let now = Utc::now();

            let queues = state
                .topics
                .get_mut(topic)
                .and_then(|subs| subs.get_mut(subscription))?;
            let queue = if dead_letter {
                &mut queues.dead
            } else {
                &mut queues.live
            };

            let position = queue.iter().position(|queued| {
                queued
                    .envelope
                    .scheduled_enqueue_time_utc
                    .map(|due| due <= now)
                    .unwrap_or(true)
            })?;
            let mut message = queue.remove(position)?;
            message.delivery_count += 1;

            let lock_token = Uuid::new_v4();
            let locked = LockedMessage {
                envelope: message.envelope.clone(),
                lock_token,
                delivery_count: message.delivery_count,
            };
            state.locks.insert(
                lock_token,
                LockedEntry {
                    topic: topic.to_string(),
                    subscription: subscription.to_string(),
                    message,
                    from_dead_letter: dead_letter,
                },
            );
            Some(locked)
        }

        async fn receive_with_wait(
            &self,
            topic: &str,
            subscription: &str,
            wait: Duration,
            dead_letter: bool,
        ) -> Result<Option<LockedMessage>, BusError> {
            let deadline = tokio::time::Instant::now() + wait;
            loop {
                if let Some(locked) = self.try_receive(topic, subscription, dead_letter) {
                    return Ok(Some(locked));
                }
                if tokio::time::Instant::now() >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    #[async_trait]
    impl BrokerClient for FakeBroker {
        async fn send(&self, topic: &str, envelope: Envelope) -> Result<(), BusError> {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let subs = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| BusError::Transport(format!("unknown topic `{topic}`")))?;
            for queues in subs.values_mut() {
                queues.live.push_back(QueuedMessage {
                    envelope: envelope.clone(),
                    delivery_count: 0,
                });
            }
            Ok(())
        }

        async fn receive(
            &self,
            topic: &str,
            subscription: &str,
            wait: Duration,
        ) -> Result<Option<LockedMessage>, BusError> {
            self.receive_with_wait(topic, subscription, wait, false).await
        }

        async fn receive_dead_letter(
            &self,
            topic: &str,
            subscription: &str,
            wait: Duration,
        ) -> Result<Option<LockedMessage>, BusError> {
            self.receive_with_wait(topic, subscription, wait, true).await
        }

        async fn complete(&self, lock_token: Uuid) -> Result<(), BusError> {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state
                .locks
                .remove(&lock_token)
                .map(|_| ())
                .ok_or_else(|| BusError::Transport("unknown lock token".into()))
        }

        async fn abandon(&self, lock_token: Uuid) -> Result<(), BusError> {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let entry = state
                .locks
                .remove(&lock_token)
                .ok_or_else(|| BusError::Transport("unknown lock token".into()))?;

            let exhausted =
                !entry.from_dead_letter && entry.message.delivery_count >= self.max_delivery_count;
            if let Some(queues) = state
                .topics
                .get_mut(&entry.topic)
                .and_then(|subs| subs.get_mut(&entry.subscription))
            {
                if entry.from_dead_letter {
                    queues.dead.push_back(entry.message);
                } else if exhausted {
                    queues.dead.push_back(entry.message);
                } else {
                    queues.live.push_back(entry.message);
                }
            }
            Ok(())
        }

        async fn create_topic_if_missing(&self, topic: &str) -> Result<(), BusError> {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.topics.entry(topic.to_string()).or_default();
            Ok(())
        }

        async fn create_subscription_if_missing(
            &self,
            topic: &str,
            subscription: &str,
        ) -> Result<(), BusError> {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state
                .topics
                .entry(topic.to_string())
                .or_default()
                .entry(subscription.to_string())
                .or_default();
            Ok(())
        }

        async fn close(&self) -> Result<(), BusError> {
            Ok(())
        }
    }
}

// ── Conformance suite ────────────────────────────────────────────────

pub(crate) mod conformance {
    use std::future::Future;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use tokio::time::timeout;
    use uuid::Uuid;

    use super::{
        continuing_handler, failing_handler, permanent_failing_handler, probe_handler,
        test_envelope,
    };
    use crate::error::BusError;
    use crate::retry::{RetryDefinition, RetryPolicy};
    use crate::shutdown::Shutdown;
    use crate::traits::MessageBus;

    const TIMEOUT: Duration = Duration::from_secs(10);
    const SETTLE: Duration = Duration::from_millis(300);

    fn quick_policy(permanent_topic: &str, max_retry_count: u32) -> RetryPolicy {
        RetryPolicy::new(
            permanent_topic,
            RetryDefinition::new(
                Duration::from_millis(10),
                Duration::from_millis(40),
                max_retry_count,
            ),
        )
    }

    /// Run every conformance case against a fresh bus per case.
    ///
    /// The factory must produce buses whose in-batch delivery limit is 2,
    /// so the retry cases stay fast.
    pub(crate) async fn run_all<F, Fut>(make_bus: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Arc<dyn MessageBus>>,
    {
        fan_out_to_all_subscriptions(make_bus().await).await;
        scheduled_publish_is_delayed(make_bus().await).await;
        continuation_propagates_correlation(make_bus().await).await;
        route_to_restricts_delivery(make_bus().await).await;
        permanent_failure_routes_directly(make_bus().await).await;
        dead_letter_escalation_to_permanent_errors(make_bus().await).await;
        empty_id_is_rejected(make_bus().await).await;
    }

    async fn fan_out_to_all_subscriptions(bus: Arc<dyn MessageBus>) {
        bus.setup_entities_if_not_exist(
            &["Alpha".into()],
            &["Alpha_One".into(), "Alpha_Two".into()],
        )
        .await
        .unwrap();

        let (first, mut first_rx) = probe_handler();
        let (second, mut second_rx) = probe_handler();
        let shutdown = Shutdown::new();
        bus.register_subscriber("Alpha", "Alpha_One", 1, first, None, shutdown.clone())
            .await
            .unwrap();
        bus.register_subscriber("Alpha", "Alpha_Two", 1, second, None, shutdown.clone())
            .await
            .unwrap();

        let correlation = Uuid::new_v4();
        bus.publish(test_envelope("m1"), "Alpha", None, Some(correlation))
            .await
            .unwrap();

        let (delivered, ctx) = timeout(TIMEOUT, first_rx.recv())
            .await
            .expect("first subscription should receive the message")
            .unwrap();
        assert_eq!(delivered.id, "m1");
        assert_eq!(delivered.correlation_id, correlation);
        assert_eq!(ctx.correlation_id, correlation);

        let (delivered, _) = timeout(TIMEOUT, second_rx.recv())
            .await
            .expect("second subscription should receive the message")
            .unwrap();
        assert_eq!(delivered.id, "m1");
        assert_eq!(delivered.correlation_id, correlation);

        bus.close().await.unwrap();
    }

    async fn scheduled_publish_is_delayed(bus: Arc<dyn MessageBus>) {
        bus.setup_entities_if_not_exist(&["Beta".into()], &["Beta_Main".into()])
            .await
            .unwrap();
        let (handler, mut rx) = probe_handler();
        bus.register_subscriber("Beta", "Beta_Main", 1, handler, None, Shutdown::new())
            .await
            .unwrap();

        let due = Utc::now() + chrono::Duration::milliseconds(400);
        bus.publish(test_envelope("m1"), "Beta", Some(due), None)
            .await
            .unwrap();

        assert!(
            timeout(Duration::from_millis(150), rx.recv()).await.is_err(),
            "message must not be visible before its scheduled time"
        );

        let (delivered, _) = timeout(TIMEOUT, rx.recv())
            .await
            .expect("message should arrive once due")
            .unwrap();
        assert_eq!(delivered.id, "m1");
        assert!(Utc::now() >= due - chrono::Duration::milliseconds(50));

        bus.close().await.unwrap();
    }

    async fn continuation_propagates_correlation(bus: Arc<dyn MessageBus>) {
        bus.setup_entities_if_not_exist(
            &["First".into(), "Second".into()],
            &["First_Stage".into(), "Second_Sink".into()],
        )
        .await
        .unwrap();

        let shutdown = Shutdown::new();
        bus.register_subscriber(
            "First",
            "First_Stage",
            1,
            continuing_handler("Second"),
            None,
            shutdown.clone(),
        )
        .await
        .unwrap();
        let (sink, mut sink_rx) = probe_handler();
        bus.register_subscriber("Second", "Second_Sink", 1, sink, None, shutdown.clone())
            .await
            .unwrap();

        let correlation = Uuid::new_v4();
        bus.publish(test_envelope("m1"), "First", None, Some(correlation))
            .await
            .unwrap();

        let (delivered, _) = timeout(TIMEOUT, sink_rx.recv())
            .await
            .expect("continuation should reach the sink")
            .unwrap();
        assert_eq!(delivered.id, "m1-next");
        assert_eq!(
            delivered.correlation_id, correlation,
            "continuations must carry the originating correlation id"
        );

        bus.close().await.unwrap();
    }

    async fn route_to_restricts_delivery(bus: Arc<dyn MessageBus>) {
        bus.setup_entities_if_not_exist(
            &["Gamma".into()],
            &["Gamma_One".into(), "Gamma_Two".into()],
        )
        .await
        .unwrap();

        let (first, mut first_rx) = probe_handler();
        let (second, mut second_rx) = probe_handler();
        let shutdown = Shutdown::new();
        bus.register_subscriber("Gamma", "Gamma_One", 1, first, None, shutdown.clone())
            .await
            .unwrap();
        bus.register_subscriber("Gamma", "Gamma_Two", 1, second, None, shutdown.clone())
            .await
            .unwrap();

        let mut envelope = test_envelope("m1");
        envelope.route_to = Some("Gamma_Two".into());
        bus.publish(envelope, "Gamma", None, None).await.unwrap();

        let (delivered, _) = timeout(TIMEOUT, second_rx.recv())
            .await
            .expect("targeted subscription should receive the message")
            .unwrap();
        assert_eq!(delivered.id, "m1");

        assert!(
            timeout(SETTLE, first_rx.recv()).await.is_err(),
            "non-targeted subscription must not receive a routed message"
        );

        bus.close().await.unwrap();
    }

    async fn permanent_failure_routes_directly(bus: Arc<dyn MessageBus>) {
        bus.setup_entities_if_not_exist(
            &["Work".into(), "PermErrors".into()],
            &["Work_Main".into(), "PermErrors_Probe".into()],
        )
        .await
        .unwrap();

        let (handler, calls) = permanent_failing_handler();
        let shutdown = Shutdown::new();
        bus.register_subscriber(
            "Work",
            "Work_Main",
            1,
            handler,
            Some(quick_policy("PermErrors", 3)),
            shutdown.clone(),
        )
        .await
        .unwrap();
        let (probe, mut probe_rx) = probe_handler();
        bus.register_subscriber("PermErrors", "PermErrors_Probe", 1, probe, None, shutdown.clone())
            .await
            .unwrap();

        bus.publish(test_envelope("m1"), "Work", None, None)
            .await
            .unwrap();

        let (delivered, _) = timeout(TIMEOUT, probe_rx.recv())
            .await
            .expect("permanent failure should reach the permanent-errors topic")
            .unwrap();
        assert_eq!(delivered.id, "m1");
        assert_eq!(
            delivered.retries_count, 0,
            "a permanent failure must not consume retry budget"
        );

        tokio::time::sleep(SETTLE).await;
        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "a permanent failure must not be retried"
        );

        bus.close().await.unwrap();
    }

    async fn dead_letter_escalation_to_permanent_errors(bus: Arc<dyn MessageBus>) {
        bus.setup_entities_if_not_exist(
            &["Work".into(), "PermErrors".into()],
            &["Work_Main".into(), "PermErrors_Probe".into()],
        )
        .await
        .unwrap();

        let (handler, calls) = failing_handler();
        let shutdown = Shutdown::new();
        bus.register_subscriber(
            "Work",
            "Work_Main",
            1,
            handler,
            Some(quick_policy("PermErrors", 1)),
            shutdown.clone(),
        )
        .await
        .unwrap();
        let (probe, mut probe_rx) = probe_handler();
        bus.register_subscriber("PermErrors", "PermErrors_Probe", 1, probe, None, shutdown.clone())
            .await
            .unwrap();

        bus.publish(test_envelope("m1"), "Work", None, None)
            .await
            .unwrap();

        // Batch 1 (2 deliveries) → dead-letter → backoff retry batch 2
        // (2 deliveries) → dead-letter → budget spent → permanent errors.
        let (delivered, _) = timeout(TIMEOUT, probe_rx.recv())
            .await
            .expect("exhausted message should reach the permanent-errors topic")
            .unwrap();
        assert_eq!(delivered.id, "m1");
        assert_eq!(
            delivered.retries_count, 2,
            "one escalation cycle plus the final audit increment"
        );

        tokio::time::sleep(SETTLE).await;
        assert_eq!(
            calls.load(Ordering::SeqCst),
            4,
            "two batches of two in-batch deliveries each"
        );
        assert!(
            timeout(SETTLE, probe_rx.recv()).await.is_err(),
            "the message must reach the permanent-errors topic exactly once"
        );

        bus.close().await.unwrap();
    }

    async fn empty_id_is_rejected(bus: Arc<dyn MessageBus>) {
        let mut envelope = test_envelope("will-be-cleared");
        envelope.id = String::new();
        let result = bus.publish(envelope, "Anywhere", None, None).await;
        assert!(matches!(result, Err(BusError::InvalidMessage(_))));
        bus.close().await.unwrap();
    }
}
