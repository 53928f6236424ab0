//! Messager for typed JSON payloads that are not catalogue changes

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::traits::{Messager, MessagerContext, MessagerError};
use super::types::{Action, CatalogueChangeMessage};
use crate::broker::{JsonCodec, Message, Schema};
use crate::error::Classify;

#[async_trait]
pub trait PayloadHandler<T>: Send + Sync {
    async fn process_payload(&self, payload: T) -> Result<Vec<Action>, MessagerError>;

    fn is_temporary_error(&self, err: &MessagerError) -> bool {
        err.is_temporary()
    }
}

/// Decodes each message with a [`JsonCodec`] and hands the value on.
///
/// Consumers are registered with the codec's schema. This family does not
/// announce catalogue changes: catalogue entry actions are still written,
/// but the notification fails to build and the message is marked permanent.
pub struct JsonMessager<T, H> {
    codec: JsonCodec<T>,
    handler: H,
    context: MessagerContext,
}

impl<T, H> JsonMessager<T, H>
where
    T: Serialize + DeserializeOwned + Send + Sync,
    H: PayloadHandler<T>,
{
    pub fn new(schema_name: impl Into<String>, handler: H, context: MessagerContext) -> Self {
        Self {
            codec: JsonCodec::new(schema_name),
            handler,
            context,
        }
    }

    pub fn codec(&self) -> &JsonCodec<T> {
        &self.codec
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

#[async_trait]
impl<T, H> Messager<Message> for JsonMessager<T, H>
where
    T: Serialize + DeserializeOwned + Send + Sync,
    H: PayloadHandler<T>,
{
    async fn process_msg(&self, msg: &Message) -> Result<Vec<Action>, MessagerError> {
        let payload = self
            .codec
            .decode(msg.data())
            .map_err(|e| MessagerError::invalid(e.to_string()))?;
        self.handler.process_payload(payload).await
    }

    fn gen_empty_catalogue_message(
        &self,
        _msg: &Message,
    ) -> Result<CatalogueChangeMessage, MessagerError> {
        Err(MessagerError::Unsupported(
            "JSON payload messagers do not announce catalogue changes",
        ))
    }

    fn context(&self) -> &MessagerContext {
        &self.context
    }

    fn schema(&self) -> Schema {
        self.codec.schema().clone()
    }

    fn is_temporary_error(&self, err: &MessagerError) -> bool {
        self.handler.is_temporary_error(err)
    }
}
