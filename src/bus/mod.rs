//! Message bus for controller and agent traffic.
//!
//! This module contains:
//! - `BusMessage` trait: a serializable message with a stable type name
//! - `Envelope`: what actually crosses the bus (type name, JSON payload, addressing)
//! - `MessageHandler` / `MessageBus` traits
//! - `MessageSender`: consults the routing table and handles reply-to
//! - `Dispatcher`: bounded worker pool with retry and dead-lettering
//! - Implementations: in-memory channel bus, mock

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Classify, ErrorClass, HandlerError};
use crate::routing::{Role, RoutingError};

#[cfg(feature = "channel")]
pub mod channel;
pub mod dispatch;
pub mod mock;
mod sender;

#[cfg(feature = "channel")]
pub use channel::ChannelMessageBus;
pub use dispatch::Dispatcher;
pub use mock::MockMessageBus;
pub use sender::MessageSender;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Subscribe not supported for this bus type")]
    SubscribeNotSupported,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Expected message type '{expected}', got '{actual}'")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },

    #[error("Message {0} has no reply-to address")]
    MissingReplyTo(Uuid),

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

impl Classify for BusError {
    fn class(&self) -> ErrorClass {
        match self {
            BusError::Connection(_) | BusError::Publish(_) | BusError::Subscribe(_) => {
                ErrorClass::TransientInfra
            }
            BusError::Serialization(_) => ErrorClass::Validation,
            BusError::SubscribeNotSupported
            | BusError::TypeMismatch { .. }
            | BusError::MissingReplyTo(_) => ErrorClass::Configuration,
            BusError::Routing(e) => e.class(),
        }
    }
}

/// A message that can travel on the bus.
///
/// `MESSAGE_TYPE` is the logical type name carried on the wire and used as
/// the routing key. It must be unique across the process.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const MESSAGE_TYPE: &'static str;
}

/// Where an envelope is delivered: a role, optionally narrowed to one agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl Address {
    pub fn role(role: Role) -> Self {
        Self { role, agent: None }
    }

    pub fn agent(role: Role, agent: impl Into<String>) -> Self {
        Self {
            role,
            agent: Some(agent.into()),
        }
    }

    pub fn controller() -> Self {
        Self::role(Role::Controller)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.agent {
            Some(agent) => write!(f, "{}/{}", self.role, agent),
            None => write!(f, "{}", self.role),
        }
    }
}

/// What a consumer listens for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub role: Role,
    /// `None` consumes every message for the role.
    pub agent: Option<String>,
}

impl Subscription {
    pub fn role(role: Role) -> Self {
        Self { role, agent: None }
    }

    pub fn agent(role: Role, agent: impl Into<String>) -> Self {
        Self {
            role,
            agent: Some(agent.into()),
        }
    }

    /// Whether an envelope addressed to `destination` is delivered to this subscription.
    ///
    /// An envelope addressed to a role without an agent reaches every
    /// subscriber of that role.
    pub fn matches(&self, destination: &Address) -> bool {
        if self.role != destination.role {
            return false;
        }
        match (&self.agent, &destination.agent) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => true,
        }
    }
}

/// A message in transit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub message_type: String,
    pub destination: Address,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Address>,
    /// Stable correlation id of the saga instance the message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new<M: BusMessage>(message: &M, destination: Address) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            message_type: M::MESSAGE_TYPE.to_string(),
            destination,
            payload: serde_json::to_value(message)?,
            reply_to: None,
            correlation_id: None,
            sent_at: Utc::now(),
        })
    }

    pub fn with_reply_to(mut self, reply_to: Address) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn is<M: BusMessage>(&self) -> bool {
        self.message_type == M::MESSAGE_TYPE
    }

    /// Decode the payload, checking the type name first.
    pub fn decode<M: BusMessage>(&self) -> Result<M> {
        if !self.is::<M>() {
            return Err(BusError::TypeMismatch {
                expected: M::MESSAGE_TYPE,
                actual: self.message_type.clone(),
            });
        }
        Ok(M::deserialize(&self.payload)?)
    }
}

/// Handler for messages delivered by the bus.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, envelope: Arc<Envelope>)
        -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

/// Interface for message delivery between controller and agents.
///
/// Delivery is at-least-once: handlers must tolerate redelivery.
///
/// Implementations:
/// - `ChannelMessageBus`: in-process, for standalone mode and tests
/// - `MockMessageBus`: records published envelopes
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver an envelope to every subscription matching its destination.
    async fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Register a handler for envelopes matching `subscription`.
    async fn subscribe(
        &self,
        subscription: Subscription,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests;
