//! In-process broker for tests and local development.
//!
//! Implements the subset of broker behaviour the runner relies on: shared
//! (round-robin) and exclusive subscriptions, pause/resume with a backlog,
//! negative acknowledgement with delayed redelivery, and dead-lettering once
//! the redelivery limit is exceeded. Delivery happens inline on the
//! publishing task, which keeps tests deterministic.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

use super::{
    BrokerClient, BrokerError, Consumer, Message, MessageId, MessageListener, Producer,
    Properties, Result, SubscribeOptions, SubscriptionType, now_ms,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cheap to clone; clones share topics and subscriptions.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, Vec<SubscriptionState>>>,
    published: Mutex<Vec<Message>>,
    next_id: AtomicU64,
}

struct SubscriptionState {
    name: String,
    subscription_type: SubscriptionType,
    consumers: Vec<Arc<MemoryConsumer>>,
    next: usize,
}

impl SubscriptionState {
    fn pick(&mut self) -> Option<Arc<MemoryConsumer>> {
        let open: Vec<_> = self
            .consumers
            .iter()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .cloned()
            .collect();
        if open.is_empty() {
            return None;
        }

        let consumer = match self.subscription_type {
            SubscriptionType::Exclusive => open[0].clone(),
            SubscriptionType::Shared => open[self.next % open.len()].clone(),
        };
        self.next = self.next.wrapping_add(1);
        Some(consumer)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish with the current time as publish timestamp
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> MessageId {
        self.inner
            .publish(topic, payload.into(), Properties::new(), now_ms())
            .await
    }

    pub async fn publish_with(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        properties: Properties,
        publish_time_ms: u64,
    ) -> MessageId {
        self.inner
            .publish(topic, payload.into(), properties, publish_time_ms)
            .await
    }

    /// Every message published to `topic` so far, in publish order
    pub fn published(&self, topic: &str) -> Vec<Message> {
        lock(&self.inner.published)
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Consumers registered on `topic` across all subscriptions
    pub fn consumers(&self, topic: &str) -> Vec<Arc<MemoryConsumer>> {
        lock(&self.inner.topics)
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .flat_map(|s| s.consumers.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Inner {
    async fn publish(
        self: &Arc<Self>,
        topic: &str,
        payload: Bytes,
        properties: Properties,
        publish_time_ms: u64,
    ) -> MessageId {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let message = Message {
            id,
            topic: topic.to_string(),
            payload,
            publish_time_ms,
            properties,
            redelivery_count: 0,
        };

        lock(&self.published).push(message.clone());

        let targets: Vec<Arc<MemoryConsumer>> = {
            let mut topics = lock(&self.topics);
            topics
                .get_mut(topic)
                .map(|subs| subs.iter_mut().filter_map(|s| s.pick()).collect())
                .unwrap_or_default()
        };

        debug!(topic, %id, subscriptions = targets.len(), "Message published");

        for consumer in targets {
            consumer.deliver(message.clone()).await;
        }

        id
    }

    async fn redeliver(self: &Arc<Self>, topic: &str, subscription: &str, message: Message) {
        let target = {
            let mut topics = lock(&self.topics);
            topics
                .get_mut(topic)
                .and_then(|subs| subs.iter_mut().find(|s| s.name == subscription))
                .and_then(|s| s.pick())
        };

        match target {
            Some(consumer) => consumer.deliver(message).await,
            None => warn!(topic, subscription, id = %message.id, "No consumer left for redelivery"),
        }
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn subscribe(
        &self,
        options: SubscribeOptions,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Arc<dyn Consumer>> {
        let consumer = Arc::new(MemoryConsumer {
            options: options.clone(),
            listener,
            broker: Arc::downgrade(&self.inner),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            backlog: Mutex::new(VecDeque::new()),
            acknowledged: Mutex::new(Vec::new()),
            negatively_acknowledged: Mutex::new(Vec::new()),
            pause_calls: AtomicUsize::new(0),
            resume_calls: AtomicUsize::new(0),
        });

        let mut topics = lock(&self.inner.topics);
        let subscriptions = topics.entry(options.topic.clone()).or_default();

        match subscriptions
            .iter_mut()
            .find(|s| s.name == options.subscription_name)
        {
            Some(existing) => {
                if existing.subscription_type == SubscriptionType::Exclusive
                    || options.subscription_type == SubscriptionType::Exclusive
                {
                    return Err(BrokerError::SubscribeFailed {
                        topic: options.topic,
                        reason: format!(
                            "subscription '{}' is exclusive",
                            options.subscription_name
                        ),
                    });
                }
                existing.consumers.push(consumer.clone());
            }
            None => subscriptions.push(SubscriptionState {
                name: options.subscription_name.clone(),
                subscription_type: options.subscription_type,
                consumers: vec![consumer.clone()],
                next: 0,
            }),
        }

        info!(
            topic = %options.topic,
            subscription = %options.subscription_name,
            consumer = %options.consumer_name,
            "Subscribed"
        );

        Ok(consumer)
    }

    async fn create_producer(
        &self,
        topic: &str,
        producer_name: &str,
    ) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(MemoryProducer {
            topic: topic.to_string(),
            name: producer_name.to_string(),
            inner: self.inner.clone(),
        }))
    }
}

/// Producer publishing straight into a [`MemoryBroker`]
pub struct MemoryProducer {
    topic: String,
    name: String,
    inner: Arc<Inner>,
}

#[async_trait]
impl Producer for MemoryProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, payload: Vec<u8>, properties: Properties) -> Result<MessageId> {
        debug!(producer = %self.name, topic = %self.topic, size = payload.len(), "Sending");
        Ok(self
            .inner
            .publish(&self.topic, Bytes::from(payload), properties, now_ms())
            .await)
    }
}

/// Consumer handle that records what the runner did with it
pub struct MemoryConsumer {
    options: SubscribeOptions,
    listener: Arc<dyn MessageListener>,
    broker: Weak<Inner>,
    paused: AtomicBool,
    closed: AtomicBool,
    backlog: Mutex<VecDeque<Message>>,
    acknowledged: Mutex<Vec<MessageId>>,
    negatively_acknowledged: Mutex<Vec<MessageId>>,
    pause_calls: AtomicUsize,
    resume_calls: AtomicUsize,
}

impl MemoryConsumer {
    pub fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    pub fn acknowledged(&self) -> Vec<MessageId> {
        lock(&self.acknowledged).clone()
    }

    pub fn negatively_acknowledged(&self) -> Vec<MessageId> {
        lock(&self.negatively_acknowledged).clone()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pause_calls(&self) -> usize {
        self.pause_calls.load(Ordering::SeqCst)
    }

    pub fn resume_calls(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }

    pub fn backlog_len(&self) -> usize {
        lock(&self.backlog).len()
    }

    async fn deliver(self: Arc<Self>, message: Message) {
        if self.is_closed() {
            return;
        }

        if self.is_paused() {
            lock(&self.backlog).push_back(message);
            return;
        }

        let listener = self.listener.clone();
        listener.received(self, message).await;
    }

    fn self_arc(&self) -> Option<Arc<MemoryConsumer>> {
        let broker = self.broker.upgrade()?;
        let topics = lock(&broker.topics);
        topics
            .get(&self.options.topic)?
            .iter()
            .flat_map(|s| s.consumers.iter())
            .find(|c| std::ptr::eq(c.as_ref(), self))
            .cloned()
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    fn name(&self) -> &str {
        &self.options.consumer_name
    }

    fn topic(&self) -> &str {
        &self.options.topic
    }

    async fn acknowledge(&self, message: &Message) -> Result<()> {
        lock(&self.acknowledged).push(message.id);
        Ok(())
    }

    async fn negative_acknowledge(&self, message: &Message) -> Result<()> {
        lock(&self.negatively_acknowledged).push(message.id);

        let Some(broker) = self.broker.upgrade() else {
            return Err(BrokerError::Closed("broker".to_string()));
        };

        if let Some(policy) = &self.options.dead_letter_policy
            && message.redelivery_count >= policy.max_redeliveries
        {
            warn!(
                id = %message.id,
                dead_letter_topic = %policy.dead_letter_topic,
                "Redelivery limit reached, dead-lettering"
            );
            let topic = policy.dead_letter_topic.clone();
            let message = message.clone();
            tokio::spawn(async move {
                broker
                    .publish(&topic, message.payload, message.properties, message.publish_time_ms)
                    .await;
            });
            return Ok(());
        }

        let mut redelivered = message.clone();
        redelivered.redelivery_count += 1;
        let delay = self.options.negative_ack_redelivery_delay;
        let topic = self.options.topic.clone();
        let subscription = self.options.subscription_name.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            broker.redeliver(&topic, &subscription, redelivered).await;
        });

        Ok(())
    }

    async fn pause(&self) {
        self.pause_calls.fetch_add(1, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);
    }

    async fn resume(&self) {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);

        let Some(this) = self.self_arc() else {
            return;
        };

        loop {
            let next = lock(&self.backlog).pop_front();
            match next {
                Some(message) => this.clone().deliver(message).await,
                None => break,
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
