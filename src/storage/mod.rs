//! Object storage abstraction for catalogue entries and artefacts
//! Uses Apache Arrow object_store crate

use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore, PutOptions, PutPayload,
    path::Path as StoragePath,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{StorageConfig, StorageProvider};
use crate::error::{Classify, FailureKind};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("No object store registered for bucket '{0}'")]
    UnknownBucket(String),

    #[error("Object store error: {0}")]
    ObjectStore(#[source] object_store::Error),
}

impl StorageError {
    fn from_store(bucket: &str, key: &str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            other => StorageError::ObjectStore(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

impl Classify for StorageError {
    /// object_store folds connection failures, timeouts, throttling and any
    /// HTTP status it has no variant for into `Generic`. A 4xx status found
    /// in the error chain is a client-side condition; anything else there is
    /// worth retrying.
    fn failure_kind(&self) -> FailureKind {
        match self {
            StorageError::NotFound { .. } | StorageError::UnknownBucket(_) => {
                FailureKind::Permanent
            }
            StorageError::ObjectStore(err) => match err {
                object_store::Error::Generic { .. } => match response_status(err) {
                    Some(status) if (400..500).contains(&status) => FailureKind::Permanent,
                    _ => FailureKind::Temporary,
                },
                object_store::Error::JoinError { .. } => FailureKind::Temporary,
                _ => FailureKind::Permanent,
            },
        }
    }
}

/// First HTTP status reported anywhere in an error chain
fn response_status(err: &(dyn std::error::Error + 'static)) -> Option<u16> {
    std::iter::successors(Some(err), |e| e.source())
        .find_map(|e| status_in_message(&e.to_string()))
}

/// Reads the code following the word "status", as in
/// "Server returned non-2xx status code: 400 Bad Request"
fn status_in_message(message: &str) -> Option<u16> {
    let lower = message.to_ascii_lowercase();
    let (_, rest) = lower.split_once("status")?;
    rest.split(|c: char| !c.is_ascii_digit())
        .filter(|token| !token.is_empty())
        .take(2)
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .find(|code| (100..600).contains(code))
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

/// Named buckets, each backed by any object_store implementation.
///
/// Cheap to clone; all clones share the same underlying clients, which are
/// safe to use from concurrent `consume` calls.
#[derive(Clone, Default)]
pub struct ObjectStores {
    buckets: Arc<BTreeMap<String, Arc<dyn ObjectStore>>>,
}

impl std::fmt::Debug for ObjectStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStores")
            .field("buckets", &self.buckets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ObjectStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the store backing `bucket`
    pub fn with_bucket(mut self, bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Arc::make_mut(&mut self.buckets).insert(bucket.into(), store);
        self
    }

    /// Create in-memory buckets for testing/development
    pub fn in_memory<I, S>(buckets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        buckets.into_iter().fold(Self::new(), |stores, bucket| {
            stores.with_bucket(bucket, Arc::new(InMemory::new()))
        })
    }

    /// Build one client per configured bucket (output bucket plus inputs)
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let mut stores = Self::new();

        for bucket in config.bucket_names() {
            let store: Arc<dyn ObjectStore> = match config.provider {
                StorageProvider::Memory => Arc::new(InMemory::new()),
                StorageProvider::Local => {
                    let root = config.local_root.join(&bucket);
                    std::fs::create_dir_all(&root).map_err(|e| {
                        StorageError::ObjectStore(object_store::Error::Generic {
                            store: "LocalFileSystem",
                            source: Box::new(e),
                        })
                    })?;
                    Arc::new(
                        LocalFileSystem::new_with_prefix(&root)
                            .map_err(StorageError::ObjectStore)?,
                    )
                }
                StorageProvider::S3 => {
                    let mut builder = AmazonS3Builder::from_env().with_bucket_name(&bucket);
                    if let Some(region) = &config.region {
                        builder = builder.with_region(region);
                    }
                    if let Some(endpoint) = &config.endpoint {
                        builder = builder.with_endpoint(endpoint).with_allow_http(true);
                    }
                    if let (Some(key), Some(secret)) = (&config.access_key, &config.secret_key) {
                        builder = builder
                            .with_access_key_id(key)
                            .with_secret_access_key(secret);
                    }
                    Arc::new(builder.build().map_err(StorageError::ObjectStore)?)
                }
            };

            tracing::debug!(bucket = %bucket, provider = ?config.provider, "Registered object store");
            stores = stores.with_bucket(bucket, store);
        }

        Ok(stores)
    }

    pub fn contains(&self, bucket: &str) -> bool {
        self.buckets.contains_key(bucket)
    }

    fn store(&self, bucket: &str) -> Result<&Arc<dyn ObjectStore>> {
        self.buckets
            .get(bucket)
            .ok_or_else(|| StorageError::UnknownBucket(bucket.to_string()))
    }

    /// Download an object
    pub async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let store = self.store(bucket)?;
        let path = StoragePath::from(key);

        let result = store
            .get(&path)
            .await
            .map_err(|e| StorageError::from_store(bucket, key, e))?;
        let bytes = result
            .bytes()
            .await
            .map_err(|e| StorageError::from_store(bucket, key, e))?;

        tracing::debug!(bucket, key, size = bytes.len(), "Downloaded from storage");

        Ok(bytes)
    }

    /// Upload an object with its content type and optional cache directive
    pub async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        cache_control: Option<&str>,
    ) -> Result<()> {
        let store = self.store(bucket)?;
        let path = StoragePath::from(key);
        let size = body.len();

        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from(content_type.to_string()),
        );
        if let Some(cache_control) = cache_control {
            attributes.insert(
                Attribute::CacheControl,
                AttributeValue::from(cache_control.to_string()),
            );
        }
        let opts = PutOptions {
            attributes,
            ..Default::default()
        };

        store
            .put_opts(&path, PutPayload::from(body), opts)
            .await
            .map_err(|e| StorageError::from_store(bucket, key, e))?;

        tracing::info!(bucket, key, size, "Uploaded to storage");

        Ok(())
    }

    /// Delete an object. Deleting something already absent succeeds.
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let store = self.store(bucket)?;
        let path = StoragePath::from(key);

        match store.delete(&path).await {
            Ok(()) => {}
            Err(object_store::Error::NotFound { .. }) => {
                tracing::debug!(bucket, key, "Object already absent");
            }
            Err(e) => return Err(StorageError::from_store(bucket, key, e)),
        }

        tracing::info!(bucket, key, "Deleted from storage");

        Ok(())
    }

    /// Check if key exists
    pub async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let store = self.store(bucket)?;
        let path = StoragePath::from(key);

        match store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::from_store(bucket, key, e)),
        }
    }
}
