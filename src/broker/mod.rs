//! Message broker abstraction
//!
//! The runner and messagers only talk to the broker through these traits, so
//! a client (Pulsar or otherwise) is injected at process start. [`memory`]
//! provides an in-process implementation for tests and local development.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::{Classify, FailureKind};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Subscribe failed for topic {topic}: {reason}")]
    SubscribeFailed { topic: String, reason: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("{0} is closed")]
    Closed(String),
}

impl Classify for BrokerError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            BrokerError::PublishFailed(_)
            | BrokerError::ConnectionError(_)
            | BrokerError::Timeout(_) => FailureKind::Temporary,
            BrokerError::SubscribeFailed { .. }
            | BrokerError::Schema(_)
            | BrokerError::Closed(_) => FailureKind::Permanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Opaque key/value pairs carried alongside a payload (trace context etc.)
pub type Properties = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message as delivered by the broker
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    /// Fully qualified topic, e.g. `persistent://public/default/harvested`
    pub topic: String,
    pub payload: Bytes,
    /// Milliseconds since the Unix epoch
    pub publish_time_ms: u64,
    pub properties: Properties,
    pub redelivery_count: u32,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId(0),
            topic: topic.into(),
            payload: payload.into(),
            publish_time_ms: now_ms(),
            properties: Properties::new(),
            redelivery_count: 0,
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn with_publish_time_ms(mut self, publish_time_ms: u64) -> Self {
        self.publish_time_ms = publish_time_ms;
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Last path segment of the topic, which is how messagers are bound
    pub fn topic_name(&self) -> &str {
        self.topic.rsplit('/').next().unwrap_or(&self.topic)
    }

    pub fn data(&self) -> &[u8] {
        &self.payload
    }
}

/// Wire schema a consumer is registered with
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Schema {
    /// Opaque bytes, decoded by the messager itself
    #[default]
    Bytes,
    /// JSON documents of a named record type
    Json { name: String },
}

impl Schema {
    pub fn json(name: impl Into<String>) -> Self {
        Schema::Json { name: name.into() }
    }
}

/// Encoder/decoder for payloads of type `T` under a JSON schema
pub struct JsonCodec<T> {
    schema: Schema,
    _payload: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCodec").field("schema", &self.schema).finish()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self {
            schema: self.schema.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> JsonCodec<T> {
    pub fn new(schema_name: impl Into<String>) -> Self {
        Self {
            schema: Schema::json(schema_name),
            _payload: PhantomData,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn encode(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| BrokerError::Schema(e.to_string()))
    }

    pub fn decode(&self, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data).map_err(|e| BrokerError::Schema(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionType {
    /// Competing consumers: each message goes to one consumer
    #[default]
    Shared,
    /// A single consumer receives every message
    Exclusive,
}

/// Redelivery limits before a message is moved to the dead-letter topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    pub max_redeliveries: u32,
    pub dead_letter_topic: String,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub topic: String,
    pub subscription_name: String,
    pub consumer_name: String,
    pub subscription_type: SubscriptionType,
    pub dead_letter_policy: Option<DeadLetterPolicy>,
    pub negative_ack_redelivery_delay: Duration,
    pub schema: Schema,
}

impl SubscribeOptions {
    pub fn new(
        topic: impl Into<String>,
        subscription_name: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            subscription_name: subscription_name.into(),
            consumer_name: consumer_name.into(),
            subscription_type: SubscriptionType::Shared,
            dead_letter_policy: None,
            negative_ack_redelivery_delay: Duration::from_secs(30),
            schema: Schema::Bytes,
        }
    }
}

/// Callback invoked for each delivered message. May be called concurrently.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn received(&self, consumer: Arc<dyn Consumer>, message: Message);
}

/// A live subscription handle
#[async_trait]
pub trait Consumer: Send + Sync {
    fn name(&self) -> &str;

    fn topic(&self) -> &str;

    async fn acknowledge(&self, message: &Message) -> Result<()>;

    /// Ask for redelivery after the subscription's configured delay
    async fn negative_acknowledge(&self, message: &Message) -> Result<()>;

    /// Stop invoking the listener. Idempotent.
    async fn pause(&self);

    /// Resume invoking the listener, delivering anything held back. Idempotent.
    async fn resume(&self);

    async fn close(&self) -> Result<()>;
}

/// Message producer for publishing to one topic
#[async_trait]
pub trait Producer: Send + Sync {
    fn topic(&self) -> &str;

    async fn send(&self, payload: Vec<u8>, properties: Properties) -> Result<MessageId>;
}

/// Connection to a broker, shared by every subscription of a process
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn subscribe(
        &self,
        options: SubscribeOptions,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Arc<dyn Consumer>>;

    async fn create_producer(&self, topic: &str, producer_name: &str)
    -> Result<Arc<dyn Producer>>;
}

/// Current Unix timestamp in milliseconds
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
