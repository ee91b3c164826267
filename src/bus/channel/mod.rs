//! In-memory channel-based message bus for standalone mode.
//!
//! Each subscription owns an unbounded mpsc queue fed by `publish`, and a
//! consumer task that hands every envelope to the subscribed handler on its
//! own task. Bounding concurrency is the handler's job (see `Dispatcher`).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};

use super::{Envelope, MessageBus, MessageHandler, Result, Subscription};

struct Subscriber {
    subscription: Subscription,
    sender: mpsc::UnboundedSender<Arc<Envelope>>,
}

/// In-memory message bus. Clones share the same subscriber registry.
#[derive(Clone, Default)]
pub struct ChannelMessageBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl ChannelMessageBus {
    pub fn new() -> Self {
        info!("Channel message bus initialized");
        Self::default()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    fn spawn_consumer(
        subscription: Subscription,
        mut receiver: mpsc::UnboundedReceiver<Arc<Envelope>>,
        handler: Arc<dyn MessageHandler>,
    ) {
        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                debug!(
                    message_type = %envelope.message_type,
                    envelope_id = %envelope.id,
                    role = %subscription.role,
                    "Received envelope via channel"
                );
                let message_type = envelope.message_type.clone();
                let handling = handler.handle(envelope);
                tokio::spawn(async move {
                    if let Err(e) = handling.await {
                        error!(message_type = %message_type, error = %e, "Handler failed");
                    }
                });
            }
            info!(role = %subscription.role, "Channel closed, stopping consumer");
        });
    }
}

#[async_trait]
impl MessageBus for ChannelMessageBus {
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(message_type = %envelope.message_type, destination = %envelope.destination)
    )]
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let envelope = Arc::new(envelope);
        let mut delivered = 0usize;
        {
            let mut subscribers = self.subscribers.write().await;
            // Drop subscribers whose consumer has gone away.
            subscribers.retain(|s| !s.sender.is_closed());
            for subscriber in subscribers
                .iter()
                .filter(|s| s.subscription.matches(&envelope.destination))
            {
                if subscriber.sender.send(Arc::clone(&envelope)).is_ok() {
                    delivered += 1;
                }
            }
        }

        if delivered == 0 {
            // Nobody listening is fine for fire-and-forget events.
            debug!("Published envelope (no receivers)");
        } else {
            debug!(receivers = delivered, "Published envelope to channel");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subscription: Subscription,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let count = {
            let mut subscribers = self.subscribers.write().await;
            subscribers.push(Subscriber {
                subscription: subscription.clone(),
                sender,
            });
            subscribers.len()
        };
        info!(
            role = %subscription.role,
            agent = ?subscription.agent,
            subscriber_count = count,
            "Handler subscribed to channel bus"
        );
        Self::spawn_consumer(subscription, receiver, handler);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
