//! Fan-out over the keys of a catalogue change message

use async_trait::async_trait;

use super::body::{BodyFetcher, CatalogueBodyHandler};
use super::stac::{StacFilter, StacHandler};
use super::traits::{Messager, MessagerContext, MessagerError};
use super::types::{Action, CatalogueChangeMessage};
use crate::broker::Message;
use crate::error::{Classify, FailureKind};

/// One key of an incoming change message, split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedEntry {
    /// Store holding the changed object
    pub bucket: String,
    /// Full key as it appeared in the message
    pub key: String,
    /// Key without its stage prefix
    pub cat_path: String,
    pub source: String,
    pub target: String,
}

/// Per-key processing for [`CatalogueChangeMessager`].
///
/// Added and updated keys both go to `process_update`.
#[async_trait]
pub trait CatalogueChangeHandler: Send + Sync {
    async fn process_update(&self, entry: &ChangedEntry) -> Result<Vec<Action>, MessagerError>;

    async fn process_delete(&self, entry: &ChangedEntry) -> Result<Vec<Action>, MessagerError>;

    fn is_temporary_error(&self, err: &MessagerError) -> bool {
        err.is_temporary()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Update,
    Delete,
}

/// Messager for pipeline stages that react to catalogue change messages.
///
/// The input envelope is decoded as a whole; a malformed envelope fails the
/// message permanently. After that each key is handled on its own, and a
/// failing key becomes a keyed [`Action::Failure`] without stopping the
/// others.
pub struct CatalogueChangeMessager<H> {
    handler: H,
    context: MessagerContext,
}

impl<H: CatalogueChangeHandler> CatalogueChangeMessager<H> {
    pub fn new(handler: H, context: MessagerContext) -> Self {
        Self { handler, context }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn decode(data: &[u8]) -> Result<CatalogueChangeMessage, MessagerError> {
        serde_json::from_slice(data).map_err(|e| MessagerError::invalid(e.to_string()))
    }

    /// Run the handler over every key, in added, updated, deleted order
    pub async fn process_change(&self, change: &CatalogueChangeMessage) -> Vec<Action> {
        let keys = change
            .added_keys
            .iter()
            .chain(&change.updated_keys)
            .map(|key| (key, ChangeKind::Update))
            .chain(change.deleted_keys.iter().map(|key| (key, ChangeKind::Delete)));

        let mut actions = Vec::new();
        for (key, kind) in keys {
            actions.extend(self.process_key(change, key, kind).await);
        }
        actions
    }

    async fn process_key(
        &self,
        change: &CatalogueChangeMessage,
        key: &str,
        kind: ChangeKind,
    ) -> Vec<Action> {
        let cat_path = match key.split_once('/') {
            Some((prefix, path)) if !prefix.is_empty() => path,
            _ => {
                tracing::error!(key, "Key has no stage prefix");
                return vec![Action::key_failure(key, FailureKind::Permanent)];
            }
        };
        let entry = ChangedEntry {
            bucket: change.bucket_name.clone(),
            key: key.to_string(),
            cat_path: cat_path.to_string(),
            source: change.source.clone(),
            target: change.target.clone(),
        };

        let result = match kind {
            ChangeKind::Update => self.handler.process_update(&entry).await,
            ChangeKind::Delete => self.handler.process_delete(&entry).await,
        };
        match result {
            Ok(actions) => actions,
            Err(err) => {
                let kind = self.classify(&err);
                tracing::error!(key, error = %err, %kind, "Failed to process key");
                vec![Action::key_failure(key, kind)]
            }
        }
    }

    fn classify(&self, err: &MessagerError) -> FailureKind {
        match err {
            MessagerError::Storage(err) => err.failure_kind(),
            MessagerError::Temporary(_) => FailureKind::Temporary,
            other if self.handler.is_temporary_error(other) => FailureKind::Temporary,
            _ => FailureKind::Permanent,
        }
    }
}

impl<H: CatalogueBodyHandler> CatalogueChangeMessager<BodyFetcher<H>> {
    /// Messager whose handler receives the fetched body of each changed entry
    pub fn with_body_handler(handler: H, context: MessagerContext) -> Self {
        let fetcher = BodyFetcher::new(handler, context.stores.clone());
        Self::new(fetcher, context)
    }
}

impl<H: StacHandler> CatalogueChangeMessager<BodyFetcher<StacFilter<H>>> {
    /// Messager whose handler only sees STAC documents
    pub fn with_stac_handler(handler: H, context: MessagerContext) -> Self {
        Self::with_body_handler(StacFilter::new(handler), context)
    }
}

#[async_trait]
impl<H: CatalogueChangeHandler> Messager<Message> for CatalogueChangeMessager<H> {
    async fn process_msg(&self, msg: &Message) -> Result<Vec<Action>, MessagerError> {
        let change = Self::decode(msg.data())?;
        tracing::debug!(
            bucket = %change.bucket_name,
            added = change.added_keys.len(),
            updated = change.updated_keys.len(),
            deleted = change.deleted_keys.len(),
            "Processing catalogue change"
        );
        Ok(self.process_change(&change).await)
    }

    fn gen_empty_catalogue_message(
        &self,
        msg: &Message,
    ) -> Result<CatalogueChangeMessage, MessagerError> {
        let change = Self::decode(msg.data())?;
        Ok(CatalogueChangeMessage {
            bucket_name: self.context.output_bucket.clone(),
            ..change.without_keys()
        })
    }

    fn context(&self) -> &MessagerContext {
        &self.context
    }

    fn is_temporary_error(&self, err: &MessagerError) -> bool {
        self.handler.is_temporary_error(err)
    }
}
