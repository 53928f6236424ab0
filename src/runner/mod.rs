//! Runners drive messagers.
//!
//! [`Runner`] owns broker subscriptions, dispatches each delivery to the
//! messager bound to its topic and acks or nacks based on the outcome. It
//! also implements the takeover protocol (see [`takeover`]).
//! [`GeneratorRunner`] feeds a messager from a local sequence instead.

mod generator;
pub mod takeover;

pub use generator::GeneratorRunner;
pub use takeover::{Suspension, TakeoverMessage};

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

use crate::broker::{
    BrokerClient, BrokerError, Consumer, DeadLetterPolicy, Message, MessageListener, Producer,
    Properties, SubscribeOptions, SubscriptionType, now_ms,
};
use crate::config::RunnerConfig;
use crate::messagers::{Failures, MessagerRegistry};
use crate::observability::{self, MetricsSnapshot, RunnerMetrics};

pub const DEFAULT_DEBUG_TOPIC: &str = "pipeline-debugging";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("No messagers registered")]
    NoMessagers,

    #[error("Debug topic '{0}' is also bound to a messager")]
    DebugTopicBound(String),
}

#[derive(Debug, Clone, bon::Builder)]
pub struct RunnerOptions {
    /// Shared by every instance of the component
    #[builder(into)]
    pub subscription_name: String,
    /// Suspend the other instances and take their traffic
    #[builder(default)]
    pub takeover_mode: bool,
    /// Consumers per topic
    #[builder(default = 1)]
    pub threads: usize,
    #[builder(into, default = env!("CARGO_PKG_NAME").to_string())]
    pub component_name: String,
    #[builder(into, default = DEFAULT_DEBUG_TOPIC.to_string())]
    pub debug_topic: String,
    #[builder(default = Duration::from_secs(5))]
    pub suspend_window: Duration,
    #[builder(default = 3)]
    pub max_redeliveries: u32,
    #[builder(default = Duration::from_secs(30))]
    pub redelivery_delay: Duration,
    /// Stop once this many messages were handled
    pub max_messages: Option<u64>,
    /// Stop after this many main loop iterations
    pub max_loops: Option<u64>,
}

impl From<&RunnerConfig> for RunnerOptions {
    fn from(config: &RunnerConfig) -> Self {
        RunnerOptions::builder()
            .subscription_name(config.subscription_name.clone())
            .takeover_mode(config.takeover_mode)
            .threads(config.threads)
            .component_name(config.component_name.clone())
            .debug_topic(config.debug_topic.clone())
            .suspend_window(config.suspend_window.as_duration())
            .max_redeliveries(config.max_redeliveries)
            .redelivery_delay(config.redelivery_delay.as_duration())
            .maybe_max_messages(config.max_messages)
            .build()
    }
}

impl RunnerOptions {
    fn dead_letter_topic(&self) -> String {
        format!("dead-letter-{}", self.subscription_name)
    }
}

/// Listener shared by every consumer of a runner
struct Dispatcher {
    registry: MessagerRegistry,
    options: RunnerOptions,
    suspension: Suspension,
    /// Messager consumers; the lock also serialises pause and resume
    owned: Mutex<Vec<Arc<dyn Consumer>>>,
    metrics: RunnerMetrics,
    handled: AtomicU64,
}

#[async_trait]
impl MessageListener for Dispatcher {
    async fn received(&self, consumer: Arc<dyn Consumer>, message: Message) {
        let topic = message.topic_name().to_string();

        if !self.options.takeover_mode && topic == self.options.debug_topic {
            self.handle_takeover(consumer.as_ref(), &message).await;
        } else {
            self.handle_message(&topic, consumer.as_ref(), message).await;
        }
    }
}

impl Dispatcher {
    async fn handle_message(&self, topic: &str, consumer: &dyn Consumer, message: Message) {
        let messager = match self.registry.get(topic) {
            Ok(messager) => messager,
            Err(err) => {
                warn!(topic, id = %message.id, error = %err, "Dropping message");
                if let Err(err) = consumer.acknowledge(&message).await {
                    error!(topic, id = %message.id, error = %err, "Failed to acknowledge");
                }
                return;
            }
        };

        let span = tracing::info_span!(
            "consume",
            subscription = %self.options.subscription_name,
            topic,
            id = %message.id,
            redelivery = message.redelivery_count,
            baggage = tracing::field::Empty,
        );
        let parent = observability::extract_context(&message.properties);
        observability::attach_baggage(&span, &parent);
        if let Err(err) = span.set_parent(parent) {
            debug!(topic, id = %message.id, error = %err, "Trace context not attached");
        }

        let input = message.clone();
        let outcome = tokio::spawn(
            async move {
                debug!("Processing message");
                messager.consume(&input).await
            }
            .instrument(span),
        )
        .await;
        let failures = match outcome {
            Ok(failures) => failures,
            Err(err) => {
                error!(topic, id = %message.id, error = %err, "Messager panicked");
                Failures::permanent()
            }
        };

        self.settle(topic, consumer, &message, &failures).await;
        self.handled.fetch_add(1, Ordering::SeqCst);
    }

    async fn settle(&self, topic: &str, consumer: &dyn Consumer, message: &Message, failures: &Failures) {
        let result = if failures.any_temporary() {
            warn!(topic, id = %message.id, ?failures, "Temporary failure, requesting redelivery");
            self.metrics.message_negatively_acknowledged();
            consumer.negative_acknowledge(message).await
        } else {
            if failures.any_permanent() {
                error!(topic, id = %message.id, ?failures, "Permanent failure, message will not be retried");
                self.metrics.permanent_failure();
            }
            self.metrics.message_acknowledged();
            consumer.acknowledge(message).await
        };

        if let Err(err) = result {
            error!(topic, id = %message.id, error = %err, "Failed to settle message");
        }
    }

    async fn handle_takeover(&self, consumer: &dyn Consumer, message: &Message) {
        if let Err(err) = consumer.acknowledge(message).await {
            warn!(id = %message.id, error = %err, "Failed to acknowledge takeover message");
        }

        let request: TakeoverMessage = match serde_json::from_slice(message.data()) {
            Ok(request) => request,
            Err(err) => {
                warn!(id = %message.id, error = %err, "Ignoring malformed takeover message");
                return;
            }
        };
        if request.suspend_subscription != self.options.subscription_name {
            debug!(subscription = %request.suspend_subscription, "Takeover for another subscription");
            return;
        }

        self.suspend(message.publish_time_ms).await;
    }

    async fn suspend(&self, publish_time_ms: u64) {
        let owned = self.owned.lock().await;
        let until = self.suspension.extend(publish_time_ms, self.options.suspend_window);
        self.metrics.takeover();
        warn!(
            subscription = %self.options.subscription_name,
            remaining_ms = until.saturating_sub(now_ms()),
            "Takeover active, pausing message reception"
        );
        for consumer in owned.iter() {
            consumer.pause().await;
        }
    }

    async fn tick(&self, now_ms: u64) -> bool {
        let owned = self.owned.lock().await;
        if !self.suspension.try_end(now_ms) {
            return false;
        }
        for consumer in owned.iter() {
            consumer.resume().await;
        }
        warn!(subscription = %self.options.subscription_name, "Takeover ended");
        true
    }
}

/// Subscribes messagers to their topics and processes deliveries until
/// shut down.
///
/// Each (topic, thread slot) pair gets its own shared consumer, so the
/// broker client delivers to the dispatcher concurrently. The main loop
/// only ends expired suspensions, sends takeover broadcasts and watches the
/// message limit.
pub struct Runner {
    client: Arc<dyn BrokerClient>,
    dispatcher: Arc<Dispatcher>,
    instance_id: Uuid,
    debug_consumer: Option<Arc<dyn Consumer>>,
    takeover_producer: Option<Arc<dyn Producer>>,
    started: bool,
}

impl Runner {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        registry: MessagerRegistry,
        options: RunnerOptions,
    ) -> Self {
        Self {
            client,
            dispatcher: Arc::new(Dispatcher {
                registry,
                options,
                suspension: Suspension::new(),
                owned: Mutex::new(Vec::new()),
                metrics: RunnerMetrics::new(),
                handled: AtomicU64::new(0),
            }),
            instance_id: Uuid::new_v4(),
            debug_consumer: None,
            takeover_producer: None,
            started: false,
        }
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.dispatcher.options
    }

    /// Register all consumers. Called by `run_until` if not done already.
    pub async fn start(&mut self) -> Result<(), RunnerError> {
        if self.started {
            return Ok(());
        }
        let dispatcher = self.dispatcher.clone();
        let options = &dispatcher.options;
        if dispatcher.registry.is_empty() {
            return Err(RunnerError::NoMessagers);
        }
        if dispatcher.registry.has_topic(&options.debug_topic) {
            return Err(RunnerError::DebugTopicBound(options.debug_topic.clone()));
        }
        let listener: Arc<dyn MessageListener> = dispatcher.clone();

        for (topic, messager) in dispatcher.registry.iter() {
            for slot in 0..options.threads.max(1) {
                let mut subscription = SubscribeOptions::new(
                    topic,
                    &options.subscription_name,
                    format!("{}-{}", options.component_name, slot),
                );
                subscription.subscription_type = SubscriptionType::Shared;
                subscription.dead_letter_policy = Some(DeadLetterPolicy {
                    max_redeliveries: options.max_redeliveries,
                    dead_letter_topic: options.dead_letter_topic(),
                });
                subscription.negative_ack_redelivery_delay = options.redelivery_delay;
                subscription.schema = messager.schema();

                let consumer = self.client.subscribe(subscription, listener.clone()).await?;
                let mut owned = dispatcher.owned.lock().await;
                if dispatcher.suspension.is_suspended(now_ms()) {
                    consumer.pause().await;
                }
                owned.push(consumer);
            }
        }

        if options.takeover_mode {
            let producer = self
                .client
                .create_producer(
                    &options.debug_topic,
                    &format!("{}-takeover", options.subscription_name),
                )
                .await?;
            self.takeover_producer = Some(producer);
        } else {
            // Exclusive and unique per instance, so every replica sees every broadcast
            let mut subscription = SubscribeOptions::new(
                &options.debug_topic,
                format!("{}-takeover-{}", options.subscription_name, self.instance_id),
                format!("{}-takeover", options.component_name),
            );
            subscription.subscription_type = SubscriptionType::Exclusive;
            self.debug_consumer = Some(self.client.subscribe(subscription, listener).await?);
        }

        self.started = true;
        info!(
            subscription = %options.subscription_name,
            topics = ?dispatcher.registry.topics().collect::<Vec<_>>(),
            threads = options.threads,
            takeover_mode = options.takeover_mode,
            "Runner started"
        );
        Ok(())
    }

    /// Run until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<(), RunnerError> {
        self.run_until(shutdown_signal()).await
    }

    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), RunnerError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;

        let period = (self.options().suspend_window / 2).max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut loops = 0u64;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = interval.tick() => {
                    self.tick(now_ms()).await;
                    self.send_takeover().await;

                    if let Some(limit) = self.options().max_messages
                        && self.handled() >= limit
                    {
                        info!(limit, "Message limit reached");
                        break;
                    }
                    loops += 1;
                    if self.options().max_loops.is_some_and(|max| loops >= max) {
                        break;
                    }
                }
            }
        }

        self.close().await;
        Ok(())
    }

    /// One main loop step: resume consumers if the suspension has expired.
    /// Returns whether a resume was issued.
    pub async fn tick(&self, now_ms: u64) -> bool {
        self.dispatcher.tick(now_ms).await
    }

    async fn send_takeover(&self) {
        let Some(producer) = &self.takeover_producer else {
            return;
        };
        let request = TakeoverMessage::new(&self.options().subscription_name);
        let payload = match serde_json::to_vec(&request) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "Failed to encode takeover message");
                return;
            }
        };
        match producer.send(payload, Properties::new()).await {
            Ok(id) => debug!(%id, "Sent takeover message"),
            Err(err) => warn!(error = %err, "Failed to send takeover message"),
        }
    }

    pub fn is_suspended(&self, now_ms: u64) -> bool {
        self.dispatcher.suspension.is_suspended(now_ms)
    }

    pub fn suspended_until_ms(&self) -> Option<u64> {
        self.dispatcher.suspension.deadline_ms()
    }

    /// Messages taken to an ack or nack decision so far
    pub fn handled(&self) -> u64 {
        self.dispatcher.handled.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.dispatcher.metrics.snapshot()
    }

    pub async fn close(&self) {
        let owned = self.dispatcher.owned.lock().await;
        for consumer in owned.iter().chain(self.debug_consumer.iter()) {
            if let Err(err) = consumer.close().await {
                warn!(consumer = consumer.name(), error = %err, "Failed to close consumer");
            }
        }
        info!(metrics = ?self.metrics(), "Runner stopped");
    }
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
