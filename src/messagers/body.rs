//! Fetches the body of each changed entry before handing it on

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::time::Duration;

use super::catalogue::{CatalogueChangeHandler, ChangedEntry};
use super::traits::MessagerError;
use super::types::Action;
use crate::error::Classify;
use crate::storage::{self, ObjectStores};

/// Attempts made while a freshly announced object is not yet visible
pub const NOT_FOUND_ATTEMPTS: u32 = 3;

/// Content of a changed entry: parsed JSON when possible, text otherwise
#[derive(Debug, Clone, PartialEq)]
pub enum EntryBody {
    Json(Value),
    Text(String),
}

impl EntryBody {
    pub fn parse(bytes: &[u8]) -> Self {
        match serde_json::from_slice(bytes) {
            Ok(value) => EntryBody::Json(value),
            Err(_) => EntryBody::Text(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            EntryBody::Json(value) => Some(value),
            EntryBody::Text(_) => None,
        }
    }
}

#[async_trait]
pub trait CatalogueBodyHandler: Send + Sync {
    async fn process_update_body(
        &self,
        body: EntryBody,
        entry: &ChangedEntry,
    ) -> Result<Vec<Action>, MessagerError>;

    async fn process_delete(&self, entry: &ChangedEntry) -> Result<Vec<Action>, MessagerError>;

    fn is_temporary_error(&self, err: &MessagerError) -> bool {
        err.is_temporary()
    }
}

/// [`CatalogueChangeHandler`] that downloads updated entries.
///
/// A change notification can arrive before the object it names is readable,
/// so not-found is retried a few times before being reported.
pub struct BodyFetcher<H> {
    handler: H,
    stores: ObjectStores,
    retry_delay: Duration,
}

impl<H: CatalogueBodyHandler> BodyFetcher<H> {
    pub fn new(handler: H, stores: ObjectStores) -> Self {
        Self {
            handler,
            stores,
            retry_delay: Duration::ZERO,
        }
    }

    /// Pause between not-found attempts (none by default)
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub async fn fetch(&self, bucket: &str, key: &str) -> storage::Result<Bytes> {
        let mut attempt = 1;
        loop {
            match self.stores.get(bucket, key).await {
                Err(err) if err.is_not_found() && attempt < NOT_FOUND_ATTEMPTS => {
                    tracing::warn!(bucket, key, attempt, "Object not found yet, retrying");
                    attempt += 1;
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl<H: CatalogueBodyHandler> CatalogueChangeHandler for BodyFetcher<H> {
    async fn process_update(&self, entry: &ChangedEntry) -> Result<Vec<Action>, MessagerError> {
        let bytes = self.fetch(&entry.bucket, &entry.key).await?;
        let body = EntryBody::parse(&bytes);
        self.handler.process_update_body(body, entry).await
    }

    async fn process_delete(&self, entry: &ChangedEntry) -> Result<Vec<Action>, MessagerError> {
        self.handler.process_delete(entry).await
    }

    fn is_temporary_error(&self, err: &MessagerError) -> bool {
        self.handler.is_temporary_error(err)
    }
}
