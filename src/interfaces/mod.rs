//! Abstract interfaces for orchestrator collaborators.
//!
//! These traits define the contracts for:
//! - Operation and task storage
//! - Saga state storage (with outbox and task deadlines)
//! - Distributed locks

pub mod lock_provider;
pub mod operation_store;
pub mod saga_store;

pub use lock_provider::{DistributedLockHandle, DistributedLockProvider, LockError};
pub use operation_store::{OperationStore, StorageError};
pub use saga_store::{SagaCommit, SagaRecord, SagaStatus, SagaStore, TaskDeadline};
