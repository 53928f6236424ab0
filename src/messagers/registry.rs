use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::traits::Messager;
use crate::broker::Message;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no messager bound to topic: {0}")]
    NotFound(String),
}

/// Binding of topic names (last topic path segment) to messagers
#[derive(Clone, Default)]
pub struct MessagerRegistry {
    messagers: BTreeMap<String, Arc<dyn Messager<Message>>>,
}

impl fmt::Debug for MessagerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagerRegistry")
            .field("topics", &self.messagers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MessagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, topic: impl Into<String>, messager: Arc<dyn Messager<Message>>) {
        self.messagers.insert(topic.into(), messager);
    }

    pub fn with(mut self, topic: impl Into<String>, messager: Arc<dyn Messager<Message>>) -> Self {
        self.register(topic, messager);
        self
    }

    pub fn get(&self, topic: &str) -> Result<Arc<dyn Messager<Message>>, RegistryError> {
        self.messagers
            .get(topic)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(topic.to_string()))
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.messagers.contains_key(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.messagers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Messager<Message>>)> {
        self.messagers.iter().map(|(topic, m)| (topic.as_str(), m))
    }

    pub fn len(&self) -> usize {
        self.messagers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messagers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messagers::{
        Action, CatalogueChangeMessage, MessagerContext, MessagerError,
    };
    use async_trait::async_trait;

    struct Noop(MessagerContext);

    #[async_trait]
    impl Messager<Message> for Noop {
        async fn process_msg(&self, _msg: &Message) -> Result<Vec<Action>, MessagerError> {
            Ok(vec![])
        }

        fn gen_empty_catalogue_message(
            &self,
            _msg: &Message,
        ) -> Result<CatalogueChangeMessage, MessagerError> {
            Ok(CatalogueChangeMessage::new("out", "noop", "/"))
        }

        fn context(&self) -> &MessagerContext {
            &self.0
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = MessagerRegistry::new()
            .with("harvested", Arc::new(Noop(MessagerContext::default())))
            .with("transformed", Arc::new(Noop(MessagerContext::default())));

        assert_eq!(registry.len(), 2);
        assert!(registry.has_topic("harvested"));
        assert!(registry.get("harvested").is_ok());
        assert!(matches!(
            registry.get("unknown"),
            Err(RegistryError::NotFound(topic)) if topic == "unknown"
        ));
        assert_eq!(registry.topics().collect::<Vec<_>>(), vec!["harvested", "transformed"]);
    }
}
