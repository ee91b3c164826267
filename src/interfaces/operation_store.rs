//! Operation storage interface.

use async_trait::async_trait;

use crate::error::{Classify, ErrorClass};
use crate::operations::{
    LogEntry, Operation, OperationId, OperationStatus, OperationTask, Resource, TaskId, TaskStatus,
};
use crate::tasks::TypedPayload;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Record already exists: {0}")]
    Duplicate(String),

    #[error("Version conflict for saga {saga_id}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        saga_id: TaskId,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl Classify for StorageError {
    fn class(&self) -> ErrorClass {
        match self {
            StorageError::OperationNotFound(_)
            | StorageError::TaskNotFound(_)
            | StorageError::Duplicate(_)
            | StorageError::Serialization(_)
            | StorageError::InvalidUuid(_)
            | StorageError::InvalidData(_) => ErrorClass::Validation,
            // A concurrent writer won; reloading and re-running the step resolves it.
            StorageError::VersionConflict { .. } => ErrorClass::TransientInfra,
            #[cfg(feature = "sqlite")]
            StorageError::Database(_) => ErrorClass::TransientInfra,
            StorageError::Unavailable(_) => ErrorClass::TransientInfra,
        }
    }
}

/// Interface for Operation and OperationTask persistence.
///
/// Status changes are compare-and-set: each transition names the status it
/// expects to move from and reports whether it won, so concurrent or
/// redelivered events resolve to exactly one winner.
///
/// Implementations:
/// - `MockOperationStore`: in-memory, for tests and `storage.type: memory`
/// - `SqliteOperationStore`: SQLite storage
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Persist a new operation together with its root task, atomically.
    async fn create_operation(&self, operation: &Operation, root_task: &OperationTask)
        -> Result<()>;

    /// Operation with its resources and log entries.
    async fn get_operation(&self, id: OperationId) -> Result<Option<Operation>>;

    /// All operations, oldest first.
    async fn list_operations(&self) -> Result<Vec<Operation>>;

    /// Insert a task. Returns `false` if a task with the same id already exists.
    async fn insert_task(&self, task: &OperationTask) -> Result<bool>;

    async fn get_task(&self, id: TaskId) -> Result<Option<OperationTask>>;

    /// Tasks of an operation, in creation order.
    async fn list_tasks(&self, operation_id: OperationId) -> Result<Vec<OperationTask>>;

    /// Move a task from Created to Accepted, recording the agent.
    async fn accept_task(&self, id: TaskId, agent_name: &str) -> Result<bool>;

    /// Move a task from `from` to the terminal status `to`, storing its result.
    async fn finish_task(
        &self,
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        result: Option<&TypedPayload>,
    ) -> Result<bool>;

    /// Move an operation from `from` to `to` and set its status message.
    async fn transition_operation(
        &self,
        id: OperationId,
        from: OperationStatus,
        to: OperationStatus,
        message: &str,
    ) -> Result<bool>;

    /// Append a log entry. Returns `false` if the entry id was already recorded.
    async fn append_log_entry(&self, entry: &LogEntry) -> Result<bool>;

    /// Attach resources to an operation, ignoring ones already attached.
    async fn add_resources(&self, id: OperationId, resources: &[Resource]) -> Result<()>;
}
