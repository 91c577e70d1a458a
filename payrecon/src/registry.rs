use payrecon_types::{MessageType, OutboxHandler};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps each outbox message type to the handler that delivers it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageType, Arc<dyn OutboxHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    #[must_use]
    pub fn with_handler<H>(mut self, message_type: MessageType, handler: H) -> Self
    where
        H: OutboxHandler + 'static,
    {
        let _ = self.handlers.insert(message_type, Arc::new(handler));
        self
    }

    /// Register an already shared handler.
    #[must_use]
    pub fn with_shared_handler(
        mut self,
        message_type: MessageType,
        handler: Arc<dyn OutboxHandler>,
    ) -> Self {
        let _ = self.handlers.insert(message_type, handler);
        self
    }

    pub fn get(&self, message_type: &MessageType) -> Option<Arc<dyn OutboxHandler>> {
        self.handlers.get(message_type).cloned()
    }

    /// Registered message types in sorted order.
    pub fn message_types(&self) -> Vec<MessageType> {
        let mut types: Vec<MessageType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("message_types", &self.message_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use payrecon_types::{HandlerError, OutboxMessage};

    struct Noop;

    #[async_trait]
    impl OutboxHandler for Noop {
        async fn handle(&self, _message: &OutboxMessage) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn lookup_by_message_type() {
        let created = MessageType::try_new("PaymentCaptured").unwrap();
        let registry = HandlerRegistry::new().with_handler(created.clone(), Noop);

        assert!(registry.get(&created).is_some());
        assert!(registry
            .get(&MessageType::try_new("Unknown").unwrap())
            .is_none());
    }

    #[test]
    fn message_types_are_sorted() {
        let registry = HandlerRegistry::new()
            .with_handler(MessageType::try_new("b").unwrap(), Noop)
            .with_handler(MessageType::try_new("a").unwrap(), Noop);

        let names: Vec<String> = registry
            .message_types()
            .into_iter()
            .map(MessageType::into_inner)
            .collect();
        assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
    }
}
