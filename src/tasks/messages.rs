//! Task dispatch protocol messages.
//!
//! Every message carries the operation and task ids plus the id of the saga
//! task that dispatched it (`initiating_task_id`), which is how replies find
//! their way back to the right saga instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{PayloadError, TypedPayload};
use crate::bus::BusMessage;
use crate::operations::{OperationId, TaskId};

/// Controller to agent: execute one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateNewOperationTaskCommand {
    pub command_type: String,
    pub command_data: serde_json::Value,
    pub operation_id: OperationId,
    pub task_id: TaskId,
    #[serde(default)]
    pub initiating_task_id: Option<TaskId>,
}

impl BusMessage for CreateNewOperationTaskCommand {
    const MESSAGE_TYPE: &'static str = "task.CreateNewOperationTaskCommand";
}

impl CreateNewOperationTaskCommand {
    pub fn new(
        command: TypedPayload,
        operation_id: OperationId,
        task_id: TaskId,
        initiating_task_id: Option<TaskId>,
    ) -> Self {
        Self {
            command_type: command.type_name,
            command_data: command.data,
            operation_id,
            task_id,
            initiating_task_id,
        }
    }

    pub fn wrap<M: BusMessage>(
        command: &M,
        operation_id: OperationId,
        task_id: TaskId,
        initiating_task_id: Option<TaskId>,
    ) -> Result<Self, PayloadError> {
        Ok(Self::new(
            TypedPayload::encode(command)?,
            operation_id,
            task_id,
            initiating_task_id,
        ))
    }

    pub fn command(&self) -> TypedPayload {
        TypedPayload::new(self.command_type.clone(), self.command_data.clone())
    }

    pub fn accepted(&self, agent_name: impl Into<String>) -> OperationTaskAcceptedEvent {
        OperationTaskAcceptedEvent {
            operation_id: self.operation_id,
            task_id: self.task_id,
            initiating_task_id: self.initiating_task_id,
            agent_name: agent_name.into(),
        }
    }

    pub fn progress(&self, message: impl Into<String>) -> OperationTaskProgressEvent {
        OperationTaskProgressEvent {
            id: Uuid::new_v4(),
            operation_id: self.operation_id,
            task_id: self.task_id,
            initiating_task_id: self.initiating_task_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn completed(&self, result: Option<TypedPayload>) -> OperationTaskStatusEvent {
        OperationTaskStatusEvent::new(
            self.operation_id,
            self.task_id,
            self.initiating_task_id,
            false,
            result,
        )
    }

    pub fn failed(&self, error: TypedPayload) -> OperationTaskStatusEvent {
        OperationTaskStatusEvent::new(
            self.operation_id,
            self.task_id,
            self.initiating_task_id,
            true,
            Some(error),
        )
    }
}

/// Agent to controller: the task is durably queued on the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationTaskAcceptedEvent {
    pub operation_id: OperationId,
    pub task_id: TaskId,
    #[serde(default)]
    pub initiating_task_id: Option<TaskId>,
    pub agent_name: String,
}

impl BusMessage for OperationTaskAcceptedEvent {
    const MESSAGE_TYPE: &'static str = "task.OperationTaskAcceptedEvent";
}

/// Agent to controller: advisory progress, appended to the operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationTaskProgressEvent {
    /// Log entry id; redelivery of the same event appends nothing.
    pub id: Uuid,
    pub operation_id: OperationId,
    pub task_id: TaskId,
    #[serde(default)]
    pub initiating_task_id: Option<TaskId>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage for OperationTaskProgressEvent {
    const MESSAGE_TYPE: &'static str = "task.OperationTaskProgressEvent";
}

/// Agent to controller: the single terminal event of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationTaskStatusEvent {
    pub operation_id: OperationId,
    pub task_id: TaskId,
    #[serde(default)]
    pub initiating_task_id: Option<TaskId>,
    pub operation_failed: bool,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub message_data: Option<serde_json::Value>,
}

impl BusMessage for OperationTaskStatusEvent {
    const MESSAGE_TYPE: &'static str = "task.OperationTaskStatusEvent";
}

impl OperationTaskStatusEvent {
    pub fn new(
        operation_id: OperationId,
        task_id: TaskId,
        initiating_task_id: Option<TaskId>,
        operation_failed: bool,
        result: Option<TypedPayload>,
    ) -> Self {
        let (message_type, message_data) = match result {
            Some(p) => (Some(p.type_name), Some(p.data)),
            None => (None, None),
        };
        Self {
            operation_id,
            task_id,
            initiating_task_id,
            operation_failed,
            message_type,
            message_data,
        }
    }

    /// The result or error payload, if the event carries one.
    pub fn result(&self) -> Option<TypedPayload> {
        self.message_type.as_ref().map(|type_name| {
            TypedPayload::new(
                type_name.clone(),
                self.message_data.clone().unwrap_or(serde_json::Value::Null),
            )
        })
    }

    /// Whether this is a failure synthesized by the deadline scheduler.
    pub fn is_timeout(&self) -> bool {
        self.operation_failed && self.message_type.as_deref() == Some(TaskTimedOut::MESSAGE_TYPE)
    }
}

/// Error payload of a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
    #[serde(default)]
    pub error_class: Option<String>,
}

impl BusMessage for ErrorData {
    const MESSAGE_TYPE: &'static str = "task.ErrorData";
}

impl ErrorData {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_class: None,
        }
    }

    pub fn with_class(mut self, class: impl ToString) -> Self {
        self.error_class = Some(class.to_string());
        self
    }
}

/// Failure payload synthesized when a task misses its deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTimedOut {
    pub task_id: TaskId,
    pub deadline: DateTime<Utc>,
}

impl BusMessage for TaskTimedOut {
    const MESSAGE_TYPE: &'static str = "task.TaskTimedOut";
}

/// Human readable description of a failure payload.
pub fn failure_message(error: Option<&TypedPayload>) -> String {
    match error {
        Some(p) if p.is::<ErrorData>() => p
            .decode::<ErrorData>()
            .map(|e| e.message)
            .unwrap_or_else(|_| "task failed".to_string()),
        Some(p) if p.is::<TaskTimedOut>() => match p.decode::<TaskTimedOut>() {
            Ok(t) => format!("task {} timed out at {}", t.task_id, t.deadline),
            Err(_) => "task timed out".to_string(),
        },
        Some(p) => format!("task failed with {}", p.type_name),
        None => "task failed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catlets::PrepareGeneCommand;
    use crate::genes::{GeneIdentifier, GeneIdentifierWithType, GeneType};

    fn command() -> CreateNewOperationTaskCommand {
        let gene = GeneIdentifier::parse("gene:acme/os/1.0:sda").into_result().unwrap();
        CreateNewOperationTaskCommand::wrap(
            &PrepareGeneCommand {
                agent_name: "host-1".to_string(),
                gene: GeneIdentifierWithType::new(GeneType::Volume, gene),
            },
            OperationId::new(),
            TaskId::new(),
            Some(TaskId::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_command_carries_type_name_and_data() {
        let cmd = command();
        assert_eq!(cmd.command_type, PrepareGeneCommand::MESSAGE_TYPE);
        let inner: PrepareGeneCommand = cmd.command().decode().unwrap();
        assert_eq!(inner.agent_name, "host-1");
    }

    #[test]
    fn test_replies_keep_correlation() {
        let cmd = command();
        let accepted = cmd.accepted("host-1");
        assert_eq!(accepted.task_id, cmd.task_id);
        assert_eq!(accepted.initiating_task_id, cmd.initiating_task_id);

        let status = cmd.failed(TypedPayload::encode(&ErrorData::new("disk full")).unwrap());
        assert!(status.operation_failed);
        assert!(!status.is_timeout());
        assert_eq!(failure_message(status.result().as_ref()), "disk full");
    }

    #[test]
    fn test_completed_without_result() {
        let status = command().completed(None);
        assert!(!status.operation_failed);
        assert!(status.result().is_none());
    }

    #[test]
    fn test_timeout_payload_is_recognized() {
        let cmd = command();
        let timed_out = TaskTimedOut {
            task_id: cmd.task_id,
            deadline: Utc::now(),
        };
        let status = cmd.failed(TypedPayload::encode(&timed_out).unwrap());
        assert!(status.is_timeout());
        assert!(failure_message(status.result().as_ref()).contains("timed out"));
    }
}
