use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::executor;
use super::types::{Action, CatalogueChangeMessage, Failures};
use crate::broker::{BrokerError, Producer, Schema};
use crate::config::StorageConfig;
use crate::error::{AnyError, Classify, FailureKind};
use crate::storage::{ObjectStores, StorageError};

/// Errors raised while turning a message into actions
#[derive(Debug, Error)]
pub enum MessagerError {
    /// Explicit retry-worthy condition
    #[error("temporary failure: {0}")]
    Temporary(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("{0}")]
    Other(#[from] AnyError),
}

impl MessagerError {
    pub fn temporary(reason: impl Into<String>) -> Self {
        MessagerError::Temporary(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        MessagerError::InvalidMessage(reason.into())
    }
}

impl Classify for MessagerError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            MessagerError::Temporary(_) => FailureKind::Temporary,
            MessagerError::Storage(err) => err.failure_kind(),
            MessagerError::Broker(err) => err.failure_kind(),
            MessagerError::InvalidMessage(_)
            | MessagerError::Json(_)
            | MessagerError::Unsupported(_)
            | MessagerError::Other(_) => FailureKind::Permanent,
        }
    }
}

/// Collaborators a messager executes its actions against.
///
/// Built once at process start and shared by every concurrent `consume`.
#[derive(Clone, Default)]
pub struct MessagerContext {
    pub stores: ObjectStores,
    /// Bucket catalogue entries go to unless an action names another
    pub output_bucket: String,
    /// Prepended verbatim to every catalogue path
    pub output_prefix: String,
    /// Where change notifications are published; `None` disables them
    pub producer: Option<Arc<dyn Producer>>,
}

impl fmt::Debug for MessagerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagerContext")
            .field("stores", &self.stores)
            .field("output_bucket", &self.output_bucket)
            .field("output_prefix", &self.output_prefix)
            .field("producer", &self.producer.as_ref().map(|p| p.topic().to_string()))
            .finish()
    }
}

impl MessagerContext {
    pub fn new(stores: ObjectStores, output_bucket: impl Into<String>) -> Self {
        Self {
            stores,
            output_bucket: output_bucket.into(),
            output_prefix: String::new(),
            producer: None,
        }
    }

    pub fn from_config(config: &StorageConfig) -> crate::storage::Result<Self> {
        let stores = ObjectStores::from_config(config)?;
        Ok(Self::new(stores, config.output_bucket.clone())
            .with_output_prefix(config.output_prefix.clone()))
    }

    pub fn with_output_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.output_prefix = prefix.into();
        self
    }

    pub fn with_producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.producer = Some(producer);
        self
    }
}

/// Converts one input message into durable side effects.
///
/// Implementations supply [`process_msg`](Messager::process_msg) and
/// [`gen_empty_catalogue_message`](Messager::gen_empty_catalogue_message);
/// [`consume`](Messager::consume) executes the returned actions, publishes
/// the resulting change notification and reduces every error to a
/// [`Failures`] value. `consume` is called concurrently for different
/// messages, so per-message state must stay local to the call.
#[async_trait]
pub trait Messager<M: Send + Sync>: Send + Sync {
    async fn process_msg(&self, msg: &M) -> Result<Vec<Action>, MessagerError>;

    /// Notification header for `msg` with empty key lists. Must not have
    /// side effects.
    fn gen_empty_catalogue_message(
        &self,
        msg: &M,
    ) -> Result<CatalogueChangeMessage, MessagerError>;

    fn context(&self) -> &MessagerContext;

    /// Wire schema consumers of this messager are registered with
    fn schema(&self) -> Schema {
        Schema::Bytes
    }

    fn is_temporary_error(&self, err: &MessagerError) -> bool {
        err.is_temporary()
    }

    /// Process, execute and announce. Never fails; the outcome is the
    /// returned [`Failures`].
    async fn consume(&self, msg: &M) -> Failures {
        executor::consume(self, msg).await
    }
}
