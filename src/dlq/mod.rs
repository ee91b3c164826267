//! Dead Letter Queue (DLQ) infrastructure.
//!
//! Messages whose handler failed for good (retries exhausted, or an error
//! that retrying cannot fix) are published here for manual review and
//! replay. The operation they belong to stays non-terminal until someone
//! resolves it.
//!
//! ## Topic Naming
//!
//! DLQ topics follow the pattern: `catlet.dlq.{role}`, keyed by the role the
//! failed envelope was addressed to.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::Envelope;
use crate::error::ErrorClass;
use crate::routing::Role;

/// DLQ topic prefix. Full topic: `{prefix}.{role}`
pub const DLQ_TOPIC_PREFIX: &str = "catlet.dlq";

/// Build the DLQ topic name for a role.
pub fn dlq_topic_for_role(role: Role) -> String {
    format!("{}.{}", DLQ_TOPIC_PREFIX, role)
}

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Failed to publish to DLQ: {0}")]
    PublishFailed(String),
}

/// A message that could not be handled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The envelope as it was delivered.
    pub envelope: Envelope,
    /// Human-readable reason for rejection.
    pub reason: String,
    /// Class of the final error, e.g. `transient_infra`.
    pub error_class: String,
    /// Handling attempts made, including the first.
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
    /// Which component gave up on the message.
    pub source_component: String,
    /// Additional context.
    pub metadata: HashMap<String, String>,
}

impl DeadLetter {
    /// Dead letter for a handler failure.
    pub fn from_handler_failure(
        envelope: &Envelope,
        error: &str,
        class: ErrorClass,
        attempts: u32,
        source_component: &str,
    ) -> Self {
        let reason = if class.is_retryable() {
            format!("Handling failed after {} attempts: {}", attempts, error)
        } else {
            format!("Handling failed ({}): {}", class, error)
        };

        Self {
            envelope: envelope.clone(),
            reason,
            error_class: class.to_string(),
            attempts,
            occurred_at: Utc::now(),
            source_component: source_component.to_string(),
            metadata: HashMap::new(),
        }
    }

    /// Add metadata to the dead letter.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Get the DLQ topic for this dead letter.
    pub fn topic(&self) -> String {
        dlq_topic_for_role(self.envelope.destination.role)
    }
}

/// Trait for publishing messages to a dead letter queue.
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;

    /// Check if the publisher is configured and ready.
    fn is_configured(&self) -> bool {
        true
    }
}

/// No-op DLQ publisher that logs but doesn't actually send anywhere.
pub struct NoopDeadLetterPublisher;

#[async_trait]
impl DeadLetterPublisher for NoopDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        warn!(
            topic = %dead_letter.topic(),
            message_type = %dead_letter.envelope.message_type,
            envelope_id = %dead_letter.envelope.id,
            reason = %dead_letter.reason,
            source = %dead_letter.source_component,
            "DLQ not configured, logging dead letter"
        );
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// In-memory DLQ publisher using a channel.
///
/// Used for standalone mode and testing.
pub struct ChannelDeadLetterPublisher {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterPublisher {
    /// Returns the publisher and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        info!(
            topic = %dead_letter.topic(),
            reason = %dead_letter.reason,
            "Publishing to channel DLQ"
        );
        self.sender
            .send(dead_letter)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Address, BusMessage};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

    impl BusMessage for Ping {
        const MESSAGE_TYPE: &'static str = "test.Ping";
    }

    fn envelope() -> Envelope {
        Envelope::new(&Ping, Address::role(Role::VmHostAgent)).unwrap()
    }

    #[test]
    fn test_topic_uses_destination_role() {
        let dl = DeadLetter::from_handler_failure(
            &envelope(),
            "boom",
            ErrorClass::Validation,
            1,
            "controller",
        );
        assert_eq!(dl.topic(), "catlet.dlq.vm_host_agent");
    }

    #[test]
    fn test_reason_mentions_attempts_for_retryable() {
        let dl = DeadLetter::from_handler_failure(
            &envelope(),
            "db down",
            ErrorClass::TransientInfra,
            4,
            "controller",
        );
        assert!(dl.reason.contains("4 attempts"));
        assert_eq!(dl.error_class, "transient_infra");

        let dl = DeadLetter::from_handler_failure(
            &envelope(),
            "no route",
            ErrorClass::Configuration,
            1,
            "controller",
        );
        assert!(dl.reason.contains("configuration"));
    }

    #[test]
    fn test_with_metadata() {
        let dl = DeadLetter::from_handler_failure(
            &envelope(),
            "boom",
            ErrorClass::Validation,
            1,
            "controller",
        )
        .with_metadata("operation_id", "abc");
        assert_eq!(dl.metadata.get("operation_id").unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_noop_publisher() {
        let publisher = NoopDeadLetterPublisher;
        assert!(!publisher.is_configured());

        let dl = DeadLetter::from_handler_failure(
            &envelope(),
            "boom",
            ErrorClass::Validation,
            1,
            "controller",
        );
        assert!(publisher.publish(dl).await.is_ok());
    }

    #[tokio::test]
    async fn test_channel_publisher() {
        let (publisher, mut receiver) = ChannelDeadLetterPublisher::new();
        assert!(publisher.is_configured());

        let env = envelope();
        let dl = DeadLetter::from_handler_failure(&env, "boom", ErrorClass::Validation, 1, "saga");
        publisher.publish(dl).await.unwrap();

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.envelope.id, env.id);
        assert_eq!(received.source_component, "saga");
    }

    #[tokio::test]
    async fn test_channel_publisher_closed_receiver() {
        let (publisher, receiver) = ChannelDeadLetterPublisher::new();
        drop(receiver);

        let dl = DeadLetter::from_handler_failure(
            &envelope(),
            "boom",
            ErrorClass::Validation,
            1,
            "controller",
        );
        assert!(matches!(
            publisher.publish(dl).await,
            Err(DlqError::PublishFailed(_))
        ));
    }
}
