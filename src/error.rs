//! Error classification shared by all message handlers.
//!
//! Every module keeps its own `thiserror` enum. `ErrorClass` maps them onto
//! the handling policy the dispatcher applies: transient infrastructure
//! failures are retried with backoff, everything else goes straight to the
//! dead-letter path (or, inside a saga step, becomes a terminal failure).

use crate::bus::BusError;
use crate::interfaces::{LockError, StorageError};
use crate::routing::RoutingError;
use crate::saga::SagaError;
use crate::tasks::{PayloadError, ProtocolError};

/// Handling class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input. Never retried.
    Validation,
    /// Lock acquisition or task deadline expired.
    Timeout,
    /// Bus or store I/O. Retried with bounded backoff, then dead-lettered.
    TransientInfra,
    /// Agent-reported failure. Surfaced on the operation, never retried.
    TerminalTaskFailure,
    /// Missing routing metadata or unknown payload tag.
    Configuration,
}

impl ErrorClass {
    /// Whether the dispatcher should redeliver the message.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::TransientInfra | ErrorClass::Timeout)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Timeout => "timeout",
            ErrorClass::TransientInfra => "transient_infra",
            ErrorClass::TerminalTaskFailure => "terminal_task_failure",
            ErrorClass::Configuration => "configuration",
        };
        f.write_str(name)
    }
}

/// Implemented by every error that can escape a message handler.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Error returned by a bus message handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Saga(#[from] SagaError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

impl Classify for HandlerError {
    fn class(&self) -> ErrorClass {
        match self {
            HandlerError::Bus(e) => e.class(),
            HandlerError::Storage(e) => e.class(),
            HandlerError::Lock(e) => e.class(),
            HandlerError::Saga(e) => e.class(),
            HandlerError::Protocol(e) => e.class(),
            HandlerError::Payload(e) => e.class(),
            HandlerError::Routing(e) => e.class(),
        }
    }
}
