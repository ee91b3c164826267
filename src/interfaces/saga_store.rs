//! Saga state storage interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::operation_store::Result;
use crate::bus::Envelope;
use crate::operations::{OperationId, TaskId, TaskReference};

/// Lifecycle of a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Running,
    Completed,
    Failed,
}

impl SagaStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SagaStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SagaStatus::Running),
            "completed" => Some(SagaStatus::Completed),
            "failed" => Some(SagaStatus::Failed),
            _ => None,
        }
    }
}

/// Persisted state of one saga instance, keyed by the id of the task it runs as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub saga_id: TaskId,
    pub saga_type: String,
    pub operation_id: OperationId,
    /// Incremented on every commit.
    pub version: u64,
    /// Saga-specific state.
    pub state: serde_json::Value,
    pub status: SagaStatus,
    /// Entities whose locks every step of this saga holds.
    pub references: Vec<TaskReference>,
    /// Child tasks dispatched and not yet resolved.
    pub pending: Vec<TaskId>,
    /// Envelopes committed with the last step and not yet published.
    pub outbox: Vec<Envelope>,
    pub updated_at: DateTime<Utc>,
}

/// Deadline for an outstanding child task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDeadline {
    pub task_id: TaskId,
    pub saga_id: TaskId,
    pub operation_id: OperationId,
    pub deadline: DateTime<Utc>,
}

/// One saga step's worth of writes, applied atomically.
#[derive(Debug, Clone)]
pub struct SagaCommit {
    /// New record; its `version` must be `expected_version + 1` (or 1 for a new saga).
    pub record: SagaRecord,
    /// `None` when the saga must not exist yet.
    pub expected_version: Option<u64>,
    pub add_deadlines: Vec<TaskDeadline>,
    pub remove_deadlines: Vec<TaskId>,
}

/// Interface for saga state persistence.
///
/// Implementations:
/// - `MockSagaStore`: in-memory
/// - `SqliteSagaStore`: SQLite storage
#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn load(&self, saga_id: TaskId) -> Result<Option<SagaRecord>>;

    /// Apply a step. Fails with `StorageError::VersionConflict` if another
    /// writer committed since the record was loaded.
    async fn commit(&self, commit: SagaCommit) -> Result<()>;

    /// Empty the outbox of `saga_id` if it is still at `version`.
    async fn clear_outbox(&self, saga_id: TaskId, version: u64) -> Result<bool>;

    /// Deadlines at or before `now`, earliest first.
    async fn expired_deadlines(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<TaskDeadline>>;

    async fn remove_deadline(&self, task_id: TaskId) -> Result<()>;
}
