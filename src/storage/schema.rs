//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Operations table schema.
#[derive(Iden)]
pub enum Operations {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "status"]
    Status,
    #[iden = "status_message"]
    StatusMessage,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Resources attached to operations.
#[derive(Iden)]
pub enum OperationResources {
    Table,
    #[iden = "operation_id"]
    OperationId,
    #[iden = "resource_type"]
    ResourceType,
    #[iden = "resource_id"]
    ResourceId,
}

/// Operation log entries.
#[derive(Iden)]
pub enum OperationLogEntries {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "operation_id"]
    OperationId,
    #[iden = "task_id"]
    TaskId,
    #[iden = "message"]
    Message,
    #[iden = "timestamp"]
    Timestamp,
}

/// Operation tasks table schema.
#[derive(Iden)]
pub enum OperationTasks {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "operation_id"]
    OperationId,
    #[iden = "parent_task_id"]
    ParentTaskId,
    #[iden = "agent_name"]
    AgentName,
    #[iden = "command_type"]
    CommandType,
    #[iden = "command_data"]
    CommandData,
    #[iden = "status"]
    Status,
    #[iden = "result_type"]
    ResultType,
    #[iden = "result_data"]
    ResultData,
    #[iden = "reference"]
    Reference,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Saga instances.
#[derive(Iden)]
pub enum Sagas {
    Table,
    #[iden = "saga_id"]
    SagaId,
    #[iden = "saga_type"]
    SagaType,
    #[iden = "operation_id"]
    OperationId,
    #[iden = "version"]
    Version,
    #[iden = "state"]
    State,
    #[iden = "status"]
    Status,
    #[iden = "task_references"]
    TaskReferences,
    #[iden = "pending"]
    Pending,
    #[iden = "outbox"]
    Outbox,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Outstanding child task deadlines.
#[derive(Iden)]
pub enum TaskDeadlines {
    Table,
    #[iden = "task_id"]
    TaskId,
    #[iden = "saga_id"]
    SagaId,
    #[iden = "operation_id"]
    OperationId,
    #[iden = "deadline"]
    Deadline,
}

/// Lease-based distributed locks.
#[derive(Iden)]
pub enum DistributedLocks {
    Table,
    #[iden = "name"]
    Name,
    #[iden = "holder"]
    Holder,
    #[iden = "expires_at"]
    ExpiresAt,
}

/// SQL for the operation store tables, one statement each.
pub const CREATE_OPERATION_TABLES: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS operations (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    status_message TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)"#,
    r#"
CREATE TABLE IF NOT EXISTS operation_resources (
    operation_id TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    PRIMARY KEY (operation_id, resource_type, resource_id)
)"#,
    r#"
CREATE TABLE IF NOT EXISTS operation_log_entries (
    id TEXT PRIMARY KEY,
    operation_id TEXT NOT NULL,
    task_id TEXT,
    message TEXT NOT NULL,
    timestamp TEXT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS idx_log_entries_operation ON operation_log_entries(operation_id)",
    r#"
CREATE TABLE IF NOT EXISTS operation_tasks (
    id TEXT PRIMARY KEY,
    operation_id TEXT NOT NULL,
    parent_task_id TEXT,
    agent_name TEXT,
    command_type TEXT NOT NULL,
    command_data TEXT NOT NULL,
    status TEXT NOT NULL,
    result_type TEXT,
    result_data TEXT,
    reference TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_operation ON operation_tasks(operation_id)",
];

/// SQL for the saga store tables, one statement each.
pub const CREATE_SAGA_TABLES: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS sagas (
    saga_id TEXT PRIMARY KEY,
    saga_type TEXT NOT NULL,
    operation_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    state TEXT NOT NULL,
    status TEXT NOT NULL,
    task_references TEXT NOT NULL,
    pending TEXT NOT NULL,
    outbox TEXT NOT NULL,
    updated_at TEXT NOT NULL
)"#,
    r#"
CREATE TABLE IF NOT EXISTS task_deadlines (
    task_id TEXT PRIMARY KEY,
    saga_id TEXT NOT NULL,
    operation_id TEXT NOT NULL,
    deadline TEXT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS idx_task_deadlines_deadline ON task_deadlines(deadline)",
];

/// SQL for the lock lease table.
pub const CREATE_LOCK_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS distributed_locks (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
)"#;
