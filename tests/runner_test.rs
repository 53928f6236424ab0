//! Runner dispatch, takeover and generator behaviour over the in-memory broker

use async_trait::async_trait;
use catalogue_pipeline::broker::memory::MemoryBroker;
use catalogue_pipeline::broker::{Message, Properties, SubscriptionType, now_ms};
use catalogue_pipeline::error::FailureKind;
use catalogue_pipeline::messagers::{
    Action, CatalogueChangeMessage, Failures, Messager, MessagerContext, MessagerError,
    MessagerRegistry,
};
use catalogue_pipeline::runner::{
    GeneratorRunner, Runner, RunnerError, RunnerOptions, TakeoverMessage,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SUBSCRIPTION: &str = "stac-ingester";
const DEBUG_TOPIC: &str = "pipeline-debugging";

/// Outcome chosen by the payload: "ok", "temporary", "permanent" or "panic"
struct Scripted {
    context: MessagerContext,
}

#[async_trait]
impl Messager<Message> for Scripted {
    async fn process_msg(&self, msg: &Message) -> Result<Vec<Action>, MessagerError> {
        match msg.data() {
            b"ok" => Ok(vec![]),
            b"temporary" => Err(MessagerError::temporary("busy")),
            b"permanent" => Err(MessagerError::invalid("bad payload")),
            b"panic" => panic!("messager bug"),
            other => Err(MessagerError::invalid(String::from_utf8_lossy(other))),
        }
    }

    fn gen_empty_catalogue_message(
        &self,
        _msg: &Message,
    ) -> Result<CatalogueChangeMessage, MessagerError> {
        Ok(CatalogueChangeMessage::new("out", "scripted", "/"))
    }

    fn context(&self) -> &MessagerContext {
        &self.context
    }
}

fn registry(topics: &[&str]) -> MessagerRegistry {
    topics.iter().fold(MessagerRegistry::new(), |registry, topic| {
        registry.with(
            *topic,
            Arc::new(Scripted {
                context: MessagerContext::default(),
            }),
        )
    })
}

fn options(threads: usize) -> RunnerOptions {
    RunnerOptions::builder()
        .subscription_name(SUBSCRIPTION)
        .component_name("ingester")
        .threads(threads)
        .build()
}

fn takeover(subscription: &str) -> Vec<u8> {
    serde_json::to_vec(&TakeoverMessage::new(subscription)).unwrap()
}

#[tokio::test]
async fn test_one_consumer_per_topic_and_slot() {
    let broker = MemoryBroker::new();
    let mut runner = Runner::new(
        Arc::new(broker.clone()),
        registry(&["harvested", "transformed"]),
        options(2),
    );
    runner.start().await.unwrap();

    for topic in ["harvested", "transformed"] {
        let consumers = broker.consumers(topic);
        let names: Vec<_> = consumers.iter().map(|c| c.options().consumer_name.clone()).collect();
        assert_eq!(names, vec!["ingester-0", "ingester-1"]);

        for consumer in consumers {
            let options = consumer.options();
            assert_eq!(options.subscription_name, SUBSCRIPTION);
            assert_eq!(options.subscription_type, SubscriptionType::Shared);
            assert_eq!(options.negative_ack_redelivery_delay, Duration::from_secs(30));
            let policy = options.dead_letter_policy.clone().unwrap();
            assert_eq!(policy.max_redeliveries, 3);
            assert_eq!(policy.dead_letter_topic, "dead-letter-stac-ingester");
        }
    }

    let debug = broker.consumers(DEBUG_TOPIC);
    assert_eq!(debug.len(), 1);
    assert_eq!(debug[0].options().subscription_type, SubscriptionType::Exclusive);
    assert!(debug[0]
        .options()
        .subscription_name
        .starts_with("stac-ingester-takeover-"));
}

#[tokio::test]
async fn test_replicas_each_get_takeover_subscription() {
    let broker = MemoryBroker::new();
    let mut first = Runner::new(Arc::new(broker.clone()), registry(&["harvested"]), options(1));
    let mut second = Runner::new(Arc::new(broker.clone()), registry(&["harvested"]), options(1));

    first.start().await.unwrap();
    second.start().await.unwrap();

    assert_eq!(broker.consumers(DEBUG_TOPIC).len(), 2);
}

#[tokio::test]
async fn test_ack_unless_temporary() {
    let broker = MemoryBroker::new();
    let mut runner = Runner::new(Arc::new(broker.clone()), registry(&["harvested"]), options(1));
    runner.start().await.unwrap();

    let ok = broker.publish("harvested", "ok").await;
    let permanent = broker.publish("harvested", "permanent").await;
    let temporary = broker.publish("harvested", "temporary").await;

    let consumer = &broker.consumers("harvested")[0];
    assert_eq!(consumer.acknowledged(), vec![ok, permanent]);
    assert_eq!(consumer.negatively_acknowledged(), vec![temporary]);

    let metrics = runner.metrics();
    assert_eq!(metrics.acknowledged, 2);
    assert_eq!(metrics.negatively_acknowledged, 1);
    assert_eq!(metrics.permanent_failures, 1);
    assert_eq!(runner.handled(), 3);
}

#[tokio::test]
async fn test_panicking_messager_is_acknowledged_as_permanent() {
    let broker = MemoryBroker::new();
    let mut runner = Runner::new(Arc::new(broker.clone()), registry(&["harvested"]), options(1));
    runner.start().await.unwrap();

    let id = broker.publish("harvested", "panic").await;

    assert_eq!(broker.consumers("harvested")[0].acknowledged(), vec![id]);
    assert_eq!(runner.metrics().permanent_failures, 1);
}

#[tokio::test]
async fn test_takeover_pauses_then_resumes_once() {
    let broker = MemoryBroker::new();
    let mut runner = Runner::new(Arc::new(broker.clone()), registry(&["harvested"]), options(2));
    runner.start().await.unwrap();

    let t = now_ms();
    let window = 5_000;
    broker
        .publish_with(DEBUG_TOPIC, takeover(SUBSCRIPTION), Properties::new(), t)
        .await;

    let consumers = broker.consumers("harvested");
    assert_eq!(consumers.len(), 2);
    for consumer in &consumers {
        assert_eq!(consumer.pause_calls(), 1);
        assert!(consumer.is_paused());
    }
    assert_eq!(runner.suspended_until_ms(), Some(t + window));
    assert_eq!(broker.consumers(DEBUG_TOPIC)[0].acknowledged().len(), 1);

    // Held back while suspended
    broker.publish("harvested", "ok").await;
    assert_eq!(runner.handled(), 0);

    assert!(!runner.tick(t + window - 1).await);
    assert!(consumers.iter().all(|c| c.resume_calls() == 0));

    assert!(runner.tick(t + window).await);
    assert!(!runner.tick(t + window + 1_000).await);
    for consumer in &consumers {
        assert_eq!(consumer.resume_calls(), 1);
        assert!(!consumer.is_paused());
    }
    assert_eq!(runner.handled(), 1);
    assert_eq!(runner.suspended_until_ms(), None);
    assert_eq!(runner.metrics().takeovers, 1);
}

#[tokio::test]
async fn test_later_broadcast_extends_suspension() {
    let broker = MemoryBroker::new();
    let mut runner = Runner::new(Arc::new(broker.clone()), registry(&["harvested"]), options(1));
    runner.start().await.unwrap();

    let t = now_ms();
    broker
        .publish_with(DEBUG_TOPIC, takeover(SUBSCRIPTION), Properties::new(), t)
        .await;
    broker
        .publish_with(DEBUG_TOPIC, takeover(SUBSCRIPTION), Properties::new(), t + 2_500)
        .await;

    assert_eq!(runner.suspended_until_ms(), Some(t + 7_500));
    assert!(!runner.tick(t + 5_000).await);
    assert!(runner.tick(t + 7_500).await);
}

#[tokio::test]
async fn test_takeover_for_other_subscription_is_ignored() {
    let broker = MemoryBroker::new();
    let mut runner = Runner::new(Arc::new(broker.clone()), registry(&["harvested"]), options(1));
    runner.start().await.unwrap();

    broker.publish(DEBUG_TOPIC, takeover("annotations-ingester")).await;
    broker.publish(DEBUG_TOPIC, "not json").await;

    assert_eq!(broker.consumers("harvested")[0].pause_calls(), 0);
    assert_eq!(runner.suspended_until_ms(), None);
    assert_eq!(broker.consumers(DEBUG_TOPIC)[0].acknowledged().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_takeover_mode_broadcasts_and_suspends_replicas() {
    let broker = MemoryBroker::new();
    let mut replica = Runner::new(Arc::new(broker.clone()), registry(&["harvested"]), options(1));
    replica.start().await.unwrap();

    let takeover_options = RunnerOptions::builder()
        .subscription_name(SUBSCRIPTION)
        .takeover_mode(true)
        .max_loops(2)
        .build();
    let developer = Runner::new(
        Arc::new(broker.clone()),
        registry(&["harvested"]),
        takeover_options,
    );
    developer
        .run_until(std::future::pending::<()>())
        .await
        .unwrap();

    let broadcasts = broker.published(DEBUG_TOPIC);
    assert_eq!(broadcasts.len(), 2);
    let request: TakeoverMessage = serde_json::from_slice(broadcasts[0].data()).unwrap();
    assert_eq!(request.suspend_subscription, SUBSCRIPTION);

    // Only the replica listens on the debug topic
    assert_eq!(broker.consumers(DEBUG_TOPIC).len(), 1);
    assert!(replica.is_suspended(now_ms()));
}

#[tokio::test]
async fn test_run_stops_at_message_limit() {
    let broker = MemoryBroker::new();
    let limited = RunnerOptions::builder()
        .subscription_name(SUBSCRIPTION)
        .max_messages(2)
        .build();
    let mut runner = Runner::new(Arc::new(broker.clone()), registry(&["harvested"]), limited);
    runner.start().await.unwrap();

    broker.publish("harvested", "ok").await;
    broker.publish("harvested", "ok").await;

    runner.run_until(std::future::pending::<()>()).await.unwrap();

    assert!(broker.consumers("harvested").iter().all(|c| c.is_closed()));
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let broker = MemoryBroker::new();
    let runner = Runner::new(Arc::new(broker.clone()), registry(&["harvested"]), options(1));

    runner.run_until(async {}).await.unwrap();

    assert!(broker.consumers("harvested")[0].is_closed());
    assert!(broker.consumers(DEBUG_TOPIC)[0].is_closed());
}

#[tokio::test]
async fn test_start_requires_messagers() {
    let mut runner = Runner::new(
        Arc::new(MemoryBroker::new()),
        MessagerRegistry::new(),
        options(1),
    );
    assert!(runner.start().await.is_err());
}

#[tokio::test]
async fn test_start_rejects_messager_on_debug_topic() {
    let broker = MemoryBroker::new();
    let mut runner = Runner::new(
        Arc::new(broker.clone()),
        registry(&["harvested", DEBUG_TOPIC]),
        options(1),
    );

    let err = runner.start().await.unwrap_err();

    assert!(matches!(err, RunnerError::DebugTopicBound(ref topic) if topic == DEBUG_TOPIC));
    assert!(broker.consumers("harvested").is_empty());
}

/// Records every batch and fails items divisible by three per key
struct BatchRecorder {
    context: MessagerContext,
    batches: Mutex<Vec<Vec<u32>>>,
}

impl BatchRecorder {
    fn new() -> Self {
        Self {
            context: MessagerContext::default(),
            batches: Mutex::new(Vec::new()),
        }
    }

    fn batches(&self) -> Vec<Vec<u32>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Messager<Vec<u32>> for BatchRecorder {
    async fn process_msg(&self, batch: &Vec<u32>) -> Result<Vec<Action>, MessagerError> {
        self.batches.lock().unwrap().push(batch.clone());
        if batch.contains(&99) {
            return Err(MessagerError::temporary("sentinel"));
        }
        if batch.contains(&13) {
            panic!("unlucky batch");
        }
        Ok(batch
            .iter()
            .filter(|n| *n % 3 == 0)
            .map(|n| Action::key_failure(n.to_string(), FailureKind::Permanent))
            .collect())
    }

    fn gen_empty_catalogue_message(
        &self,
        _batch: &Vec<u32>,
    ) -> Result<CatalogueChangeMessage, MessagerError> {
        Ok(CatalogueChangeMessage::new("out", "generator", "/"))
    }

    fn context(&self) -> &MessagerContext {
        &self.context
    }
}

#[tokio::test]
async fn test_generator_batches_in_order() {
    let messager = Arc::new(BatchRecorder::new());
    let runner = GeneratorRunner::<u32, _>::new(messager.clone()).with_batch_size(2);

    let failures = runner.consume(0..7).await;

    assert_eq!(
        messager.batches(),
        vec![vec![0, 1], vec![2, 3], vec![4, 5], vec![6]]
    );
    let mut expected = Failures::default();
    for key in ["0", "3", "6"] {
        expected.record_key(key, FailureKind::Permanent);
    }
    assert_eq!(failures, expected);
}

#[tokio::test]
async fn test_generator_worker_pool_consumes_everything() {
    let messager = Arc::new(BatchRecorder::new());
    let runner = GeneratorRunner::<u32, _>::new(messager.clone())
        .with_threads(3)
        .with_batch_size(2);

    let failures = runner.consume(0..7).await;

    let mut batches = messager.batches();
    batches.sort();
    assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4, 5], vec![6]]);

    let mut keys = failures.key_permanent.clone();
    keys.sort();
    assert_eq!(keys, vec!["0", "3", "6"]);
    assert!(!failures.any_temporary());
}

#[tokio::test]
async fn test_generator_merges_temporary_failures() {
    let messager = Arc::new(BatchRecorder::new());
    let runner = GeneratorRunner::<u32, _>::new(messager.clone())
        .with_threads(1)
        .with_batch_size(3);

    let failures = runner.consume([1, 99, 2, 4]).await;

    assert!(failures.temporary);
    assert_eq!(messager.batches(), vec![vec![1, 99, 2], vec![4]]);
    assert!(failures.key_permanent.is_empty());
}

#[tokio::test]
async fn test_generator_inline_panic_is_permanent() {
    let messager = Arc::new(BatchRecorder::new());
    let runner = GeneratorRunner::<u32, _>::new(messager.clone());

    let failures = runner.consume([1, 13, 2]).await;

    assert!(failures.permanent);
    assert!(!failures.temporary);
    assert_eq!(messager.batches(), vec![vec![1], vec![13], vec![2]]);
}

#[tokio::test]
async fn test_generator_pooled_panic_keeps_worker_alive() {
    let messager = Arc::new(BatchRecorder::new());
    let runner = GeneratorRunner::<u32, _>::new(messager.clone()).with_threads(1);

    let failures = runner.consume([13, 1, 3]).await;

    assert!(failures.permanent);
    assert_eq!(messager.batches(), vec![vec![13], vec![1], vec![3]]);
    assert_eq!(failures.key_permanent, vec!["3"]);
}
