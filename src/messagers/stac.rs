use async_trait::async_trait;
use serde_json::{Map, Value};

use super::body::{CatalogueBodyHandler, EntryBody};
use super::catalogue::ChangedEntry;
use super::traits::MessagerError;
use super::types::Action;
use crate::error::Classify;

/// Field whose presence marks a JSON object as a STAC document
pub const STAC_VERSION_FIELD: &str = "stac_version";

#[async_trait]
pub trait StacHandler: Send + Sync {
    async fn process_update_stac(
        &self,
        doc: Map<String, Value>,
        entry: &ChangedEntry,
    ) -> Result<Vec<Action>, MessagerError>;

    async fn process_delete(&self, entry: &ChangedEntry) -> Result<Vec<Action>, MessagerError>;

    fn is_temporary_error(&self, err: &MessagerError) -> bool {
        err.is_temporary()
    }
}

/// Drops every updated body that is not a STAC document
pub struct StacFilter<H> {
    handler: H,
}

impl<H: StacHandler> StacFilter<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

#[async_trait]
impl<H: StacHandler> CatalogueBodyHandler for StacFilter<H> {
    async fn process_update_body(
        &self,
        body: EntryBody,
        entry: &ChangedEntry,
    ) -> Result<Vec<Action>, MessagerError> {
        match body {
            EntryBody::Json(Value::Object(doc)) if doc.contains_key(STAC_VERSION_FIELD) => {
                self.handler.process_update_stac(doc, entry).await
            }
            _ => {
                tracing::debug!(key = %entry.key, "Not a STAC document, skipping");
                Ok(Vec::new())
            }
        }
    }

    async fn process_delete(&self, entry: &ChangedEntry) -> Result<Vec<Action>, MessagerError> {
        self.handler.process_delete(entry).await
    }

    fn is_temporary_error(&self, err: &MessagerError) -> bool {
        self.handler.is_temporary_error(err)
    }
}
