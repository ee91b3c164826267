//! Command and event routing.
//!
//! Maps a message type to the logical roles that must receive it,
//! independent of how a transport names its queues or topics. Commands
//! have exactly one recipient role; events have zero or more subscriber
//! roles. The table is built once at startup and validated against the
//! set of message types the process declares: a declared type without a
//! route fails startup, never a later send.
//!
//! Direct replies travel on the envelope's reply-to address and never
//! consult this table.

mod catalog;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bus::BusMessage;
use crate::error::{Classify, ErrorClass};

pub use catalog::{default_routing_table, DEFAULT_REQUIRED_TYPES};

/// Logical recipient of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Orchestrator instances running sagas and the task tracker.
    Controller,
    /// Host agents driving VMs, disks and the local gene pool.
    VmHostAgent,
    /// Agents applying virtual network plans.
    NetworkAgent,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Controller => "controller",
            Role::VmHostAgent => "vm_host_agent",
            Role::NetworkAgent => "network_agent",
        };
        f.write_str(name)
    }
}

/// Resolved routing for one message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Intended for exactly one primary role.
    Command { recipient: Role },
    /// Fanned out to every subscriber role.
    Event { subscribers: Vec<Role> },
}

impl Route {
    /// Every role that receives a message routed this way.
    pub fn roles(&self) -> Vec<Role> {
        match self {
            Route::Command { recipient } => vec![*recipient],
            Route::Event { subscribers } => subscribers.clone(),
        }
    }
}

/// Errors raised while building or consulting the routing table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("Message type '{0}' has no routing metadata")]
    MissingRoute(String),

    #[error("Message type '{0}' is routed more than once")]
    DuplicateRoute(String),

    #[error("Message type '{0}' is not in the routing table")]
    UnknownMessageType(String),

    #[error("Message type '{message_type}' is {actual}, expected {expected}")]
    WrongKind {
        message_type: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl Classify for RoutingError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Configuration
    }
}

/// Immutable message type to route mapping.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<String, Route>,
}

impl RoutingTable {
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::default()
    }

    /// Route for a message type.
    pub fn classify(&self, message_type: &str) -> Result<&Route, RoutingError> {
        self.routes
            .get(message_type)
            .ok_or_else(|| RoutingError::UnknownMessageType(message_type.to_string()))
    }

    /// Recipient of a command type.
    pub fn recipient(&self, message_type: &str) -> Result<Role, RoutingError> {
        match self.classify(message_type)? {
            Route::Command { recipient } => Ok(*recipient),
            Route::Event { .. } => Err(RoutingError::WrongKind {
                message_type: message_type.to_string(),
                expected: "a command",
                actual: "an event",
            }),
        }
    }

    /// Subscribers of an event type.
    pub fn subscribers(&self, message_type: &str) -> Result<&[Role], RoutingError> {
        match self.classify(message_type)? {
            Route::Event { subscribers } => Ok(subscribers),
            Route::Command { .. } => Err(RoutingError::WrongKind {
                message_type: message_type.to_string(),
                expected: "an event",
                actual: "a command",
            }),
        }
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.routes.contains_key(message_type)
    }

    /// Routed message types, sorted.
    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// Collects routes and the message types that must be routed.
#[derive(Debug, Default)]
pub struct RoutingTableBuilder {
    routes: Vec<(String, Route)>,
    required: Vec<String>,
}

impl RoutingTableBuilder {
    pub fn command<M: BusMessage>(self, recipient: Role) -> Self {
        self.route(M::MESSAGE_TYPE, Route::Command { recipient })
    }

    pub fn event<M: BusMessage>(self, subscribers: &[Role]) -> Self {
        self.route(
            M::MESSAGE_TYPE,
            Route::Event {
                subscribers: subscribers.to_vec(),
            },
        )
    }

    /// Route a message type known only by name.
    pub fn route(mut self, message_type: impl Into<String>, route: Route) -> Self {
        self.routes.push((message_type.into(), route));
        self
    }

    /// Declare a message type that the process sends and therefore must be routed.
    pub fn require(mut self, message_type: impl Into<String>) -> Self {
        self.required.push(message_type.into());
        self
    }

    pub fn require_all<I, S>(mut self, message_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required
            .extend(message_types.into_iter().map(Into::into));
        self
    }

    /// Validate and freeze the table.
    pub fn build(self) -> Result<RoutingTable, RoutingError> {
        let mut routes = HashMap::with_capacity(self.routes.len());
        for (message_type, route) in self.routes {
            if routes.contains_key(&message_type) {
                return Err(RoutingError::DuplicateRoute(message_type));
            }
            routes.insert(message_type, route);
        }

        if let Some(missing) = self.required.iter().find(|t| !routes.contains_key(*t)) {
            return Err(RoutingError::MissingRoute(missing.clone()));
        }

        Ok(RoutingTable { routes })
    }
}
