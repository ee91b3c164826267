//! Applies task protocol events to the operation store.
//!
//! Enforces the per-task state machine Created -> Accepted -> {Completed |
//! Failed}. Every status change is a compare-and-set, so redelivered and
//! racing events resolve to one winner: the first terminal event is stored
//! with its payload, later ones are reported as duplicates carrying the
//! stored winner.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    failure_message, OperationTaskAcceptedEvent, OperationTaskProgressEvent,
    OperationTaskStatusEvent,
};
use crate::error::{Classify, ErrorClass};
use crate::interfaces::{OperationStore, StorageError};
use crate::operations::{LogEntry, OperationId, OperationStatus, OperationTask, TaskId, TaskStatus};

/// Errors applying a protocol event.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Task {0} has not been accepted yet")]
    NotYetAccepted(TaskId),

    #[error("Unknown task {0}")]
    UnknownTask(TaskId),

    #[error("Task {task_id} belongs to operation {actual}, event names {expected}")]
    OperationMismatch {
        task_id: TaskId,
        expected: OperationId,
        actual: OperationId,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Classify for ProtocolError {
    fn class(&self) -> ErrorClass {
        match self {
            // Accepted is in flight; redelivery will find it applied.
            ProtocolError::NotYetAccepted(_) => ErrorClass::TransientInfra,
            ProtocolError::UnknownTask(_) | ProtocolError::OperationMismatch { .. } => {
                ErrorClass::Validation
            }
            ProtocolError::Storage(e) => e.class(),
        }
    }
}

/// Outcome of a terminal status event.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResolution {
    /// This event resolved the task.
    First(OperationTask),
    /// The task was already terminal; carries the stored winner.
    Duplicate(OperationTask),
}

impl TaskResolution {
    pub fn task(&self) -> &OperationTask {
        match self {
            TaskResolution::First(t) | TaskResolution::Duplicate(t) => t,
        }
    }

    pub fn into_task(self) -> OperationTask {
        match self {
            TaskResolution::First(t) | TaskResolution::Duplicate(t) => t,
        }
    }

    pub fn is_first(&self) -> bool {
        matches!(self, TaskResolution::First(_))
    }
}

/// Applies protocol events to tasks and, for root tasks, to their operation.
#[derive(Clone)]
pub struct TaskTracker {
    store: Arc<dyn OperationStore>,
}

impl TaskTracker {
    pub fn new(store: Arc<dyn OperationStore>) -> Self {
        Self { store }
    }

    /// Record that an agent accepted a task. Returns `false` for a duplicate.
    #[tracing::instrument(
        name = "task.accepted",
        skip_all,
        fields(task_id = %event.task_id, agent = %event.agent_name)
    )]
    pub async fn on_accepted(
        &self,
        event: &OperationTaskAcceptedEvent,
    ) -> Result<bool, ProtocolError> {
        let task = self.load(event.task_id, event.operation_id).await?;
        let accepted = self.store.accept_task(task.id, &event.agent_name).await?;
        if !accepted {
            debug!(status = %task.status, "Duplicate or late accept ignored");
        }
        if task.is_root() {
            // Idempotent, so a redelivery after a crash still moves the operation.
            if self
                .store
                .transition_operation(
                    task.operation_id,
                    OperationStatus::Queued,
                    OperationStatus::Running,
                    "",
                )
                .await?
            {
                info!(operation_id = %task.operation_id, "Operation running");
            }
        }
        Ok(accepted)
    }

    /// Append a progress message to the operation log. Never changes task state.
    #[tracing::instrument(name = "task.progress", skip_all, fields(task_id = %event.task_id))]
    pub async fn on_progress(
        &self,
        event: &OperationTaskProgressEvent,
    ) -> Result<bool, ProtocolError> {
        let task = self.load(event.task_id, event.operation_id).await?;
        if task.status == TaskStatus::Created {
            return Err(ProtocolError::NotYetAccepted(task.id));
        }
        let entry = LogEntry {
            id: event.id,
            operation_id: task.operation_id,
            task_id: Some(task.id),
            message: event.message.clone(),
            timestamp: event.timestamp,
        };
        Ok(self.store.append_log_entry(&entry).await?)
    }

    /// Apply a terminal event; the first one per task wins.
    #[tracing::instrument(
        name = "task.status",
        skip_all,
        fields(task_id = %event.task_id, failed = event.operation_failed)
    )]
    pub async fn on_status(
        &self,
        event: &OperationTaskStatusEvent,
    ) -> Result<TaskResolution, ProtocolError> {
        let mut task = self.load(event.task_id, event.operation_id).await?;
        if task.status == TaskStatus::Created && !event.is_timeout() {
            return Err(ProtocolError::NotYetAccepted(task.id));
        }

        let target = if event.operation_failed {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        let result = event.result();

        // Statuses only move forward, so this settles within two rounds.
        let won = loop {
            if task.status.is_terminal() {
                break false;
            }
            if self
                .store
                .finish_task(task.id, task.status, target, result.as_ref())
                .await?
            {
                break true;
            }
            task = self.load(event.task_id, event.operation_id).await?;
        };

        let stored = self.load(event.task_id, event.operation_id).await?;
        if won {
            info!(status = %stored.status, "Task resolved");
        } else {
            warn!(
                stored_status = %stored.status,
                "Terminal event for already resolved task ignored, first terminal event wins"
            );
        }

        if stored.is_root() {
            self.resolve_operation(&stored).await?;
        }

        Ok(if won {
            TaskResolution::First(stored)
        } else {
            TaskResolution::Duplicate(stored)
        })
    }

    async fn resolve_operation(&self, root: &OperationTask) -> Result<(), ProtocolError> {
        let (status, message) = match root.status {
            TaskStatus::Completed => {
                (OperationStatus::Completed, "Operation completed".to_string())
            }
            TaskStatus::Failed => (OperationStatus::Failed, failure_message(root.result.as_ref())),
            _ => return Ok(()),
        };
        for from in [OperationStatus::Running, OperationStatus::Queued] {
            if self
                .store
                .transition_operation(root.operation_id, from, status, &message)
                .await?
            {
                info!(operation_id = %root.operation_id, status = %status, "Operation resolved");
                break;
            }
        }
        Ok(())
    }

    async fn load(
        &self,
        task_id: TaskId,
        operation_id: OperationId,
    ) -> Result<OperationTask, ProtocolError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(ProtocolError::UnknownTask(task_id))?;
        if task.operation_id != operation_id {
            return Err(ProtocolError::OperationMismatch {
                task_id,
                expected: operation_id,
                actual: task.operation_id,
            });
        }
        Ok(task)
    }
}
