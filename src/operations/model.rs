//! Operation and task records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::TypedPayload;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identifier of an operation.
    OperationId
);
uuid_id!(
    /// Identifier of an operation task. A saga instance is keyed by the id of
    /// the task it runs as.
    TaskId
);

/// Error for status strings that do not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseStatusError {
    kind: &'static str,
    value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseStatusError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

string_enum!(OperationStatus, "operation status", {
    Queued => "queued",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }
}

/// Lifecycle of an operation task. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Accepted,
    Completed,
    Failed,
}

string_enum!(TaskStatus, "task status", {
    Created => "created",
    Accepted => "accepted",
    Completed => "completed",
    Failed => "failed",
});

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether `next` is a forward move from this status.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Created, TaskStatus::Accepted) => true,
            (TaskStatus::Created | TaskStatus::Accepted, s) => s.is_terminal(),
            _ => false,
        }
    }
}

/// Kind of managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Catlet,
    VirtualDisk,
    VirtualNetwork,
}

string_enum!(ResourceType, "resource type", {
    Catlet => "catlet",
    VirtualDisk => "virtual_disk",
    VirtualNetwork => "virtual_network",
});

/// A managed entity touched by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resource {
    pub resource_type: ResourceType,
    pub id: Uuid,
}

impl Resource {
    pub fn new(resource_type: ResourceType, id: Uuid) -> Self {
        Self { resource_type, id }
    }
}

/// Higher-level entity a task pertains to. Names the distributed lock that
/// serializes work on that entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskReference {
    Project { project_id: Uuid },
    ProjectMember { project_id: Uuid, member_id: String },
    Catlet { catlet_id: Uuid },
}

impl TaskReference {
    pub fn lock_name(&self) -> String {
        match self {
            TaskReference::Project { project_id } => format!("project:{project_id}"),
            TaskReference::ProjectMember {
                project_id,
                member_id,
            } => format!("project:{project_id}:member:{member_id}"),
            TaskReference::Catlet { catlet_id } => format!("catlet:{catlet_id}"),
        }
    }
}

/// Best-effort progress trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub operation_id: OperationId,
    pub task_id: Option<TaskId>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        operation_id: OperationId,
        task_id: Option<TaskId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_id,
            task_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Audit record of externally requested work. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub status: OperationStatus,
    pub status_message: String,
    pub resources: Vec<Resource>,
    pub log_entries: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    /// A freshly queued operation, optionally attached to its target resource.
    pub fn queued(id: OperationId, target: Option<Resource>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: OperationStatus::Queued,
            status_message: String::new(),
            resources: target.into_iter().collect(),
            log_entries: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One step of an operation executed by an agent (or by a saga on the controller).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationTask {
    pub id: TaskId,
    pub operation_id: OperationId,
    /// The saga task that dispatched this task. `None` for the root task.
    pub parent_task_id: Option<TaskId>,
    /// Set once an agent accepts the task.
    pub agent_name: Option<String>,
    pub command: TypedPayload,
    pub status: TaskStatus,
    /// Result or error payload of the terminal event that won.
    pub result: Option<TypedPayload>,
    pub reference: Option<TaskReference>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OperationTask {
    pub fn new(
        id: TaskId,
        operation_id: OperationId,
        parent_task_id: Option<TaskId>,
        command: TypedPayload,
        reference: Option<TaskReference>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            operation_id,
            parent_task_id,
            agent_name: None,
            command,
            status: TaskStatus::Created,
            result: None,
            reference,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_task_id.is_none()
    }
}
