//! Mock message bus implementation for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BusError, BusMessage, Envelope, MessageBus, MessageHandler, Result, Subscription};

/// Mock message bus for testing. Records every published envelope.
#[derive(Default)]
pub struct MockMessageBus {
    published: RwLock<Vec<Envelope>>,
    fail_on_publish: RwLock<bool>,
}

impl MockMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn published(&self) -> Vec<Envelope> {
        self.published.read().await.clone()
    }

    /// Decoded payloads of every published envelope of type `M`.
    pub async fn published_of<M: BusMessage>(&self) -> Vec<M> {
        self.published
            .read()
            .await
            .iter()
            .filter_map(|e| e.decode::<M>().ok())
            .collect()
    }

    pub async fn take_published(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl MessageBus for MockMessageBus {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        self.published.write().await.push(envelope);
        Ok(())
    }

    async fn subscribe(
        &self,
        _subscription: Subscription,
        _handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        Err(BusError::SubscribeNotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Address;
    use crate::error::HandlerError;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping(u32);

    impl BusMessage for Ping {
        const MESSAGE_TYPE: &'static str = "test.Ping";
    }

    #[tokio::test]
    async fn test_mock_bus_publish() {
        let bus = MockMessageBus::new();
        bus.publish(Envelope::new(&Ping(1), Address::controller()).unwrap())
            .await
            .unwrap();

        assert_eq!(bus.published_count().await, 1);
        assert_eq!(bus.published_of::<Ping>().await, vec![Ping(1)]);
    }

    #[tokio::test]
    async fn test_mock_bus_fail_on_publish() {
        let bus = MockMessageBus::new();
        bus.set_fail_on_publish(true).await;

        let result = bus
            .publish(Envelope::new(&Ping(1), Address::controller()).unwrap())
            .await;

        assert!(result.is_err());
        assert_eq!(bus.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_mock_bus_subscribe_not_supported() {
        struct DummyHandler;
        impl MessageHandler for DummyHandler {
            fn handle(
                &self,
                _envelope: Arc<Envelope>,
            ) -> futures::future::BoxFuture<'static, std::result::Result<(), HandlerError>>
            {
                Box::pin(async { Ok(()) })
            }
        }

        let bus = MockMessageBus::new();
        let result = bus
            .subscribe(
                Subscription::role(crate::routing::Role::Controller),
                Arc::new(DummyHandler),
            )
            .await;
        assert!(matches!(result, Err(BusError::SubscribeNotSupported)));
    }
}
