//! Mock OperationStore implementation for testing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::interfaces::operation_store::{OperationStore, Result, StorageError};
use crate::operations::{
    LogEntry, Operation, OperationId, OperationStatus, OperationTask, Resource, TaskId, TaskStatus,
};
use crate::tasks::TypedPayload;

#[derive(Default)]
struct Tables {
    operations: HashMap<OperationId, Operation>,
    operation_order: Vec<OperationId>,
    tasks: HashMap<TaskId, OperationTask>,
    task_order: Vec<TaskId>,
    transitions: HashMap<OperationId, usize>,
}

/// Mock operation store that keeps everything in memory.
#[derive(Default)]
pub struct MockOperationStore {
    tables: RwLock<Tables>,
    fail_on_create: RwLock<bool>,
    fail_on_write: RwLock<bool>,
}

impl MockOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_create(&self, fail: bool) {
        *self.fail_on_create.write().await = fail;
    }

    /// Fail every mutating call other than `create_operation`.
    pub async fn set_fail_on_write(&self, fail: bool) {
        *self.fail_on_write.write().await = fail;
    }

    /// Number of successful status transitions applied to an operation.
    pub async fn operation_transitions(&self, id: OperationId) -> usize {
        self.tables
            .read()
            .await
            .transitions
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn operation_count(&self) -> usize {
        self.tables.read().await.operations.len()
    }

    async fn check_write(&self) -> Result<()> {
        if *self.fail_on_write.read().await {
            return Err(StorageError::Unavailable("Mock write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OperationStore for MockOperationStore {
    async fn create_operation(
        &self,
        operation: &Operation,
        root_task: &OperationTask,
    ) -> Result<()> {
        if *self.fail_on_create.read().await {
            return Err(StorageError::Unavailable("Mock create failure".to_string()));
        }
        let mut tables = self.tables.write().await;
        if tables.operations.contains_key(&operation.id) {
            return Err(StorageError::Duplicate(format!("operation {}", operation.id)));
        }
        if tables.tasks.contains_key(&root_task.id) {
            return Err(StorageError::Duplicate(format!("task {}", root_task.id)));
        }
        tables.operations.insert(operation.id, operation.clone());
        tables.operation_order.push(operation.id);
        tables.tasks.insert(root_task.id, root_task.clone());
        tables.task_order.push(root_task.id);
        Ok(())
    }

    async fn get_operation(&self, id: OperationId) -> Result<Option<Operation>> {
        Ok(self.tables.read().await.operations.get(&id).cloned())
    }

    async fn list_operations(&self) -> Result<Vec<Operation>> {
        let tables = self.tables.read().await;
        Ok(tables
            .operation_order
            .iter()
            .filter_map(|id| tables.operations.get(id).cloned())
            .collect())
    }

    async fn insert_task(&self, task: &OperationTask) -> Result<bool> {
        self.check_write().await?;
        let mut tables = self.tables.write().await;
        if !tables.operations.contains_key(&task.operation_id) {
            return Err(StorageError::OperationNotFound(task.operation_id));
        }
        if tables.tasks.contains_key(&task.id) {
            return Ok(false);
        }
        tables.tasks.insert(task.id, task.clone());
        tables.task_order.push(task.id);
        Ok(true)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<OperationTask>> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, operation_id: OperationId) -> Result<Vec<OperationTask>> {
        let tables = self.tables.read().await;
        Ok(tables
            .task_order
            .iter()
            .filter_map(|id| tables.tasks.get(id))
            .filter(|t| t.operation_id == operation_id)
            .cloned()
            .collect())
    }

    async fn accept_task(&self, id: TaskId, agent_name: &str) -> Result<bool> {
        self.check_write().await?;
        let mut tables = self.tables.write().await;
        let task = tables.tasks.get_mut(&id).ok_or(StorageError::TaskNotFound(id))?;
        if task.status != TaskStatus::Created {
            return Ok(false);
        }
        task.status = TaskStatus::Accepted;
        task.agent_name = Some(agent_name.to_string());
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn finish_task(
        &self,
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        result: Option<&TypedPayload>,
    ) -> Result<bool> {
        self.check_write().await?;
        let mut tables = self.tables.write().await;
        let task = tables.tasks.get_mut(&id).ok_or(StorageError::TaskNotFound(id))?;
        if task.status != from || !from.can_transition_to(to) {
            return Ok(false);
        }
        task.status = to;
        task.result = result.cloned();
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn transition_operation(
        &self,
        id: OperationId,
        from: OperationStatus,
        to: OperationStatus,
        message: &str,
    ) -> Result<bool> {
        self.check_write().await?;
        let mut tables = self.tables.write().await;
        let operation = tables
            .operations
            .get_mut(&id)
            .ok_or(StorageError::OperationNotFound(id))?;
        if operation.status != from {
            return Ok(false);
        }
        operation.status = to;
        operation.status_message = message.to_string();
        operation.updated_at = Utc::now();
        *tables.transitions.entry(id).or_default() += 1;
        Ok(true)
    }

    async fn append_log_entry(&self, entry: &LogEntry) -> Result<bool> {
        self.check_write().await?;
        let mut tables = self.tables.write().await;
        let operation = tables
            .operations
            .get_mut(&entry.operation_id)
            .ok_or(StorageError::OperationNotFound(entry.operation_id))?;
        if operation.log_entries.iter().any(|e| e.id == entry.id) {
            return Ok(false);
        }
        operation.log_entries.push(entry.clone());
        Ok(true)
    }

    async fn add_resources(&self, id: OperationId, resources: &[Resource]) -> Result<()> {
        self.check_write().await?;
        let mut tables = self.tables.write().await;
        let operation = tables
            .operations
            .get_mut(&id)
            .ok_or(StorageError::OperationNotFound(id))?;
        for resource in resources {
            if !operation.resources.contains(resource) {
                operation.resources.push(*resource);
            }
        }
        Ok(())
    }
}
