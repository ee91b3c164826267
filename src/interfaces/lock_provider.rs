//! Distributed lock provider interface.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Classify, ErrorClass};

/// Errors that can occur acquiring or releasing a lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Timed out after {timeout:?} waiting for lock '{name}'")]
    Timeout { name: String, timeout: Duration },

    #[error("Lock scope already disposed")]
    Disposed,

    #[error("Lock backend error: {0}")]
    Backend(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Classify for LockError {
    fn class(&self) -> ErrorClass {
        match self {
            LockError::Timeout { .. } => ErrorClass::Timeout,
            LockError::Disposed => ErrorClass::Configuration,
            LockError::Backend(_) => ErrorClass::TransientInfra,
            #[cfg(feature = "sqlite")]
            LockError::Database(_) => ErrorClass::TransientInfra,
        }
    }
}

/// A held lock. Dropping it without `release` leaves expiry to the backend.
#[async_trait]
pub trait DistributedLockHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn release(self: Box<Self>) -> Result<(), LockError>;
}

/// Named locks shared by every orchestrator instance.
///
/// Implementations:
/// - `MemoryLockProvider`: single process
/// - `SqliteLockProvider`: lease rows in a shared database
#[async_trait]
pub trait DistributedLockProvider: Send + Sync {
    /// Block until `name` is acquired or `timeout` elapses.
    async fn acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Box<dyn DistributedLockHandle>, LockError>;
}
