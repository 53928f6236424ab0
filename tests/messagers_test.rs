//! End-to-end behaviour of `Messager::consume` against in-memory collaborators

use async_trait::async_trait;
use bytes::Bytes;
use catalogue_pipeline::broker::memory::MemoryBroker;
use catalogue_pipeline::broker::{
    BrokerClient, BrokerError, JsonCodec, Message, MessageId, Producer, Properties,
};
use catalogue_pipeline::messagers::{
    Action, CatalogueChangeHandler, CatalogueChangeMessage, CatalogueChangeMessager,
    ChangedEntry, Failures, Messager, MessagerContext, MessagerError, StacHandler,
};
use catalogue_pipeline::storage::ObjectStores;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const OUTPUT_TOPIC: &str = "transformed";

struct Copier;

#[async_trait]
impl CatalogueChangeHandler for Copier {
    async fn process_update(&self, entry: &ChangedEntry) -> Result<Vec<Action>, MessagerError> {
        if entry.cat_path.ends_with("broken") {
            return Err(MessagerError::invalid("cannot transform"));
        }
        Ok(vec![Action::write_entry(&entry.cat_path, r#"{"copied": true}"#)])
    }

    async fn process_delete(&self, entry: &ChangedEntry) -> Result<Vec<Action>, MessagerError> {
        Ok(vec![Action::delete_entry(&entry.cat_path)])
    }
}

async fn context(broker: &MemoryBroker) -> MessagerContext {
    let producer = broker
        .create_producer(OUTPUT_TOPIC, "test-producer")
        .await
        .unwrap();
    MessagerContext::new(ObjectStores::in_memory(["in", "out"]), "out")
        .with_output_prefix("cat/")
        .with_producer(producer)
}

fn change_message(added: &[&str], updated: &[&str], deleted: &[&str]) -> Message {
    let mut change = CatalogueChangeMessage::new("in", "harvester", "/");
    change.id = Some("change-1".to_string());
    change.workspace = Some("ws".to_string());
    change.added_keys = added.iter().map(|k| k.to_string()).collect();
    change.updated_keys = updated.iter().map(|k| k.to_string()).collect();
    change.deleted_keys = deleted.iter().map(|k| k.to_string()).collect();
    Message::new(
        "persistent://public/default/harvested",
        serde_json::to_vec(&change).unwrap(),
    )
}

fn notifications(broker: &MemoryBroker) -> Vec<CatalogueChangeMessage> {
    broker
        .published(OUTPUT_TOPIC)
        .iter()
        .map(|m| serde_json::from_slice(m.data()).unwrap())
        .collect()
}

async fn seed(stores: &ObjectStores, bucket: &str, key: &str, body: &'static str) {
    stores
        .put(bucket, key, Bytes::from_static(body.as_bytes()), "application/json", None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_new_entry_is_announced_as_added() {
    let broker = MemoryBroker::new();
    let messager = CatalogueChangeMessager::new(Copier, context(&broker).await);

    let failures = messager.consume(&change_message(&["h/a"], &[], &[])).await;

    assert!(failures.is_empty());
    let sent = notifications(&broker);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].added_keys, vec!["cat/a"]);
    assert!(sent[0].updated_keys.is_empty());
    assert!(sent[0].deleted_keys.is_empty());
    assert_eq!(sent[0].bucket_name, "out");
    assert_eq!(sent[0].id.as_deref(), Some("change-1"));
    assert_eq!(sent[0].source, "harvester");
    assert!(messager.context().stores.exists("out", "cat/a").await.unwrap());
}

#[tokio::test]
async fn test_existing_entry_is_announced_as_updated() {
    let broker = MemoryBroker::new();
    let messager = CatalogueChangeMessager::new(Copier, context(&broker).await);
    seed(&messager.context().stores, "out", "cat/path/k1", "{}").await;

    let failures = messager
        .consume(&change_message(&[], &["stage/path/k1"], &[]))
        .await;

    assert!(failures.is_empty());
    let sent = notifications(&broker);
    assert_eq!(sent[0].updated_keys, vec!["cat/path/k1"]);
    assert!(sent[0].added_keys.is_empty());
    assert!(sent[0].deleted_keys.is_empty());
    assert_eq!(
        messager.context().stores.get("out", "cat/path/k1").await.unwrap(),
        Bytes::from_static(br#"{"copied": true}"#)
    );
}

#[tokio::test]
async fn test_deleted_entry_is_removed_and_announced() {
    let broker = MemoryBroker::new();
    let messager = CatalogueChangeMessager::new(Copier, context(&broker).await);
    seed(&messager.context().stores, "out", "cat/a", "{}").await;

    let failures = messager.consume(&change_message(&[], &[], &["h/a"])).await;

    assert!(failures.is_empty());
    assert_eq!(notifications(&broker)[0].deleted_keys, vec!["cat/a"]);
    assert!(!messager.context().stores.exists("out", "cat/a").await.unwrap());
}

#[tokio::test]
async fn test_failing_key_does_not_block_sibling() {
    let broker = MemoryBroker::new();
    let messager = CatalogueChangeMessager::new(Copier, context(&broker).await);

    let failures = messager
        .consume(&change_message(&["h/broken", "h/good"], &[], &[]))
        .await;

    assert_eq!(failures.key_permanent, vec!["h/broken"]);
    assert!(failures.key_temporary.is_empty());
    assert!(!failures.permanent);
    assert!(!failures.any_temporary());
    assert!(messager.context().stores.exists("out", "cat/good").await.unwrap());
    assert_eq!(notifications(&broker)[0].added_keys, vec!["cat/good"]);
}

#[tokio::test]
async fn test_nothing_announced_without_changes() {
    let broker = MemoryBroker::new();
    let messager = CatalogueChangeMessager::new(Copier, context(&broker).await);

    let failures = messager.consume(&change_message(&["h/broken"], &[], &[])).await;

    assert!(failures.any_permanent());
    assert!(notifications(&broker).is_empty());
}

#[tokio::test]
async fn test_missing_producer_only_skips_announcement() {
    let context = MessagerContext::new(ObjectStores::in_memory(["out"]), "out");
    let messager = CatalogueChangeMessager::new(Copier, context);

    let failures = messager.consume(&change_message(&["h/a"], &[], &[])).await;

    assert!(failures.is_empty());
    assert!(messager.context().stores.exists("out", "a").await.unwrap());
}

struct Unreachable;

#[async_trait]
impl Producer for Unreachable {
    fn topic(&self) -> &str {
        OUTPUT_TOPIC
    }

    async fn send(&self, _payload: Vec<u8>, _properties: Properties) -> Result<MessageId, BrokerError> {
        Err(BrokerError::ConnectionError("broker unreachable".to_string()))
    }
}

#[tokio::test]
async fn test_publish_failure_is_temporary() {
    let context = MessagerContext::new(ObjectStores::in_memory(["out"]), "out")
        .with_producer(Arc::new(Unreachable));
    let messager = CatalogueChangeMessager::new(Copier, context);

    let failures = messager.consume(&change_message(&["h/a"], &[], &[])).await;

    assert!(failures.temporary);
    assert!(!failures.permanent);
}

/// Messager whose `process_msg` outcome is fixed up front
struct Scripted {
    context: MessagerContext,
    outcome: fn() -> Result<Vec<Action>, MessagerError>,
}

#[async_trait]
impl Messager<Message> for Scripted {
    async fn process_msg(&self, _msg: &Message) -> Result<Vec<Action>, MessagerError> {
        (self.outcome)()
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

fn scripted(outcome: fn() -> Result<Vec<Action>, MessagerError>) -> Scripted {
    Scripted {
        context: MessagerContext::new(ObjectStores::in_memory(["out"]), "out"),
        outcome,
    }
}

#[tokio::test]
async fn test_temporary_signal_executes_nothing() {
    let messager = scripted(|| Err(MessagerError::temporary("upstream busy")));

    let failures = messager.consume(&Message::new("t", "{}")).await;

    assert_eq!(failures, Failures::temporary());
}

#[tokio::test]
async fn test_unrelated_error_is_permanent() {
    let messager = scripted(|| {
        let err: Box<dyn std::error::Error + Send + Sync> = "unexpected".into();
        Err(MessagerError::Other(err))
    });

    let failures = messager.consume(&Message::new("t", "{}")).await;

    assert_eq!(failures, Failures::permanent());
}

#[tokio::test]
async fn test_actions_run_in_order() {
    let messager = scripted(|| {
        Ok(vec![
            Action::write_entry("x", "{}"),
            Action::delete_entry("x"),
            Action::write_blob("raw/x", "payload"),
        ])
    });

    let failures = messager.consume(&Message::new("t", "{}")).await;

    assert!(failures.is_empty());
    let stores = &messager.context().stores;
    assert!(!stores.exists("out", "x").await.unwrap());
    assert!(stores.exists("out", "raw/x").await.unwrap());
}

#[derive(Default)]
struct StacCounter {
    calls: AtomicUsize,
}

#[async_trait]
impl StacHandler for StacCounter {
    async fn process_update_stac(
        &self,
        doc: Map<String, Value>,
        entry: &ChangedEntry,
    ) -> Result<Vec<Action>, MessagerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Action::write_entry(
            &entry.cat_path,
            serde_json::to_vec(&doc)?,
        )])
    }

    async fn process_delete(&self, _entry: &ChangedEntry) -> Result<Vec<Action>, MessagerError> {
        Ok(vec![])
    }
}

#[tokio::test]
async fn test_stac_messager_ignores_other_documents() {
    let broker = MemoryBroker::new();
    let context = context(&broker).await;
    seed(&context.stores, "in", "h/readme.txt", "not json at all").await;
    seed(&context.stores, "in", "h/feature.json", r#"{"type": "Feature"}"#).await;
    seed(&context.stores, "in", "h/item.json", r#"{"stac_version": "1.0.0", "id": "item"}"#).await;

    let messager = CatalogueChangeMessager::with_stac_handler(StacCounter::default(), context);
    let failures = messager
        .consume(&change_message(
            &[],
            &["h/readme.txt", "h/feature.json", "h/item.json"],
            &[],
        ))
        .await;

    assert!(failures.is_empty());
    assert_eq!(messager.handler().handler().handler().calls.load(Ordering::SeqCst), 1);
    assert_eq!(notifications(&broker)[0].added_keys, vec!["cat/item.json"]);
}

#[tokio::test]
async fn test_stac_messager_reports_missing_body_per_key() {
    let broker = MemoryBroker::new();
    let messager =
        CatalogueChangeMessager::with_stac_handler(StacCounter::default(), context(&broker).await);

    let failures = messager.consume(&change_message(&["h/missing.json"], &[], &[])).await;

    assert_eq!(failures.key_permanent, vec!["h/missing.json"]);
    assert!(notifications(&broker).is_empty());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BillingEvent {
    workspace: String,
    item: String,
    quantity: f64,
}

#[test]
fn test_json_schema_round_trip() {
    let codec = JsonCodec::<BillingEvent>::new("BillingEvent");
    let event = BillingEvent {
        workspace: "ws".to_string(),
        item: "cpu-seconds".to_string(),
        quantity: 12.5,
    };

    let decoded = codec.decode(&codec.encode(&event).unwrap()).unwrap();

    assert_eq!(decoded, event);
}
