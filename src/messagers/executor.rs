//! Executes actions against the object store and announces the result

use super::traits::{Messager, MessagerContext, MessagerError};
use super::types::{
    Action, CatalogueChanges, CatalogueEntryAction, DirectBlobAction,
    FailureAction, Failures,
};
use crate::broker::Properties;
use crate::error::{Classify, FailureKind};
use crate::observability;
use crate::storage::StorageError;

/// Applies a message's actions, collecting the touched catalogue keys and
/// any failures. One executor per `consume` call.
#[derive(Debug)]
pub struct ActionExecutor<'a> {
    context: &'a MessagerContext,
    changes: CatalogueChanges,
    failures: Failures,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(context: &'a MessagerContext) -> Self {
        Self {
            context,
            changes: CatalogueChanges::default(),
            failures: Failures::default(),
        }
    }

    pub async fn execute_all(&mut self, actions: impl IntoIterator<Item = Action>) {
        for action in actions {
            self.execute(action).await;
        }
    }

    pub async fn execute(&mut self, action: Action) {
        match action {
            Action::CatalogueEntry(entry) => self.execute_entry(entry).await,
            Action::Blob(blob) => self.execute_blob(blob).await,
            Action::Failure(failure) => self.record_failure(failure),
        }
    }

    pub fn changes(&self) -> &CatalogueChanges {
        &self.changes
    }

    pub fn failures(&self) -> &Failures {
        &self.failures
    }

    pub fn finish(self) -> (CatalogueChanges, Failures) {
        (self.changes, self.failures)
    }

    async fn execute_entry(&mut self, action: CatalogueEntryAction) {
        let bucket = action
            .bucket
            .unwrap_or_else(|| self.context.output_bucket.clone());
        let context = self.context;
        let key = format!("{}{}", context.output_prefix, action.cat_path);
        let stores = &context.stores;

        match action.body {
            Some(body) => {
                let existed = match stores.exists(&bucket, &key).await {
                    Ok(existed) => existed,
                    Err(err) => return self.store_failure(&bucket, &key, err),
                };
                let written = stores
                    .put(
                        &bucket,
                        &key,
                        body,
                        &action.content_type,
                        action.cache_control.as_deref(),
                    )
                    .await;
                if let Err(err) = written {
                    return self.store_failure(&bucket, &key, err);
                }
                if existed {
                    self.changes.updated.push(key);
                } else {
                    self.changes.added.push(key);
                }
            }
            None => {
                if let Err(err) = stores.delete(&bucket, &key).await {
                    return self.store_failure(&bucket, &key, err);
                }
                self.changes.deleted.push(key);
            }
        }
    }

    async fn execute_blob(&mut self, action: DirectBlobAction) {
        let bucket = action
            .bucket
            .unwrap_or_else(|| self.context.output_bucket.clone());
        let stores = &self.context.stores;
        let result = match action.body {
            Some(body) => {
                stores
                    .put(
                        &bucket,
                        &action.key,
                        body,
                        &action.content_type,
                        action.cache_control.as_deref(),
                    )
                    .await
            }
            None => stores.delete(&bucket, &action.key).await,
        };
        if let Err(err) = result {
            self.store_failure(&bucket, &action.key, err);
        }
    }

    fn record_failure(&mut self, failure: FailureAction) {
        match failure.key {
            Some(key) => {
                tracing::warn!(key = %key, kind = %failure.kind, "Key failed");
                self.failures.record_key(key, failure.kind);
            }
            None => {
                tracing::warn!(kind = %failure.kind, "Message failed");
                self.failures.record(failure.kind);
            }
        }
    }

    fn store_failure(&mut self, bucket: &str, key: &str, err: StorageError) {
        let kind = err.failure_kind();
        tracing::error!(bucket, key, error = %err, %kind, "Storage operation failed");
        self.failures.record(kind);
    }
}

/// Body of [`Messager::consume`]
pub async fn consume<M, T>(messager: &T, msg: &M) -> Failures
where
    M: Send + Sync,
    T: Messager<M> + ?Sized,
{
    let actions = match messager.process_msg(msg).await {
        Ok(actions) => actions,
        Err(err) => {
            let kind = if matches!(err, MessagerError::Temporary(_))
                || messager.is_temporary_error(&err)
            {
                FailureKind::Temporary
            } else {
                FailureKind::Permanent
            };
            tracing::error!(error = %err, %kind, "Failed to process message");
            let mut failures = Failures::default();
            failures.record(kind);
            return failures;
        }
    };

    tracing::debug!(actions = actions.len(), "Executing actions");
    let mut executor = ActionExecutor::new(messager.context());
    executor.execute_all(actions).await;
    let (changes, mut failures) = executor.finish();

    if !changes.is_empty()
        && let Err(kind) = announce(messager, msg, changes).await
    {
        failures.record(kind);
    }

    failures
}

async fn announce<M, T>(messager: &T, msg: &M, changes: CatalogueChanges) -> Result<(), FailureKind>
where
    M: Send + Sync,
    T: Messager<M> + ?Sized,
{
    let Some(producer) = messager.context().producer.as_ref() else {
        tracing::warn!(
            added = changes.added.len(),
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            "No producer configured, catalogue change not announced"
        );
        return Ok(());
    };

    let header = messager.gen_empty_catalogue_message(msg).map_err(|err| {
        tracing::error!(error = %err, "Failed to build catalogue change message");
        FailureKind::Permanent
    })?;
    let notification = changes.into_message(header);
    let payload = serde_json::to_vec(&notification).map_err(|err| {
        tracing::error!(error = %err, "Failed to encode catalogue change message");
        FailureKind::Permanent
    })?;

    let mut properties = Properties::new();
    observability::inject_current_context(&mut properties);

    match producer.send(payload, properties).await {
        Ok(id) => {
            tracing::info!(
                topic = producer.topic(),
                message_id = %id,
                added = notification.added_keys.len(),
                updated = notification.updated_keys.len(),
                deleted = notification.deleted_keys.len(),
                "Published catalogue change"
            );
            Ok(())
        }
        Err(err) => {
            let kind = err.failure_kind();
            tracing::error!(topic = producer.topic(), error = %err, %kind, "Failed to publish catalogue change");
            Err(kind)
        }
    }
}
