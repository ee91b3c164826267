//! Operation Manager: starts operations and reads them back.

use std::sync::Arc;

use tracing::{error, info};

use super::{Operation, OperationId, OperationTask, Resource, TaskId, TaskReference};
use crate::bus::{BusError, BusMessage, MessageSender};
use crate::error::{Classify, ErrorClass};
use crate::interfaces::{OperationStore, StorageError};
use crate::tasks::{CreateNewOperationTaskCommand, PayloadError, TypedPayload};

/// Errors from starting or reading operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl Classify for ManagerError {
    fn class(&self) -> ErrorClass {
        match self {
            ManagerError::Storage(e) => e.class(),
            ManagerError::Bus(e) => e.class(),
            ManagerError::Payload(e) => e.class(),
        }
    }
}

/// Entry point for callers that request work.
#[derive(Clone)]
pub struct OperationManager {
    store: Arc<dyn OperationStore>,
    sender: MessageSender,
}

impl OperationManager {
    pub fn new(store: Arc<dyn OperationStore>, sender: MessageSender) -> Self {
        Self { store, sender }
    }

    /// Start an operation for `command`.
    ///
    /// The operation is stored queued, together with a root task carrying the
    /// command, before the command is sent. If the write fails nothing is
    /// sent. The command is addressed before the write, so an unrouted
    /// command type fails without leaving a record behind.
    #[tracing::instrument(
        name = "operation.start",
        skip_all,
        fields(message_type = M::MESSAGE_TYPE)
    )]
    pub async fn start_new<M: BusMessage>(
        &self,
        command: &M,
        target: Option<Resource>,
        reference: Option<TaskReference>,
    ) -> Result<Operation, ManagerError> {
        let operation_id = OperationId::new();
        let task_id = TaskId::new();
        let payload = TypedPayload::encode(command)?;

        let task_command =
            CreateNewOperationTaskCommand::new(payload.clone(), operation_id, task_id, None);
        let envelope = self.sender.task_command_envelope(&task_command, None)?;

        let operation = Operation::queued(operation_id, target);
        let root_task = OperationTask::new(task_id, operation_id, None, payload, reference);
        self.store.create_operation(&operation, &root_task).await?;

        if let Err(e) = self.sender.publish_envelopes(vec![envelope]).await {
            error!(
                operation_id = %operation_id,
                task_id = %task_id,
                error = %e,
                "Operation stored but initiating command not sent"
            );
            return Err(e.into());
        }

        info!(operation_id = %operation_id, task_id = %task_id, "Operation started");
        Ok(operation)
    }

    /// Operation with its resources and log entries.
    pub async fn get(&self, id: OperationId) -> Result<Option<Operation>, ManagerError> {
        Ok(self.store.get_operation(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Operation>, ManagerError> {
        Ok(self.store.list_operations().await?)
    }

    /// Every task of an operation, root first.
    pub async fn tasks(&self, id: OperationId) -> Result<Vec<OperationTask>, ManagerError> {
        Ok(self.store.list_tasks(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Address, MockMessageBus};
    use crate::catlets::UpdateCatletCommand;
    use crate::operations::{OperationStatus, ResourceType, TaskStatus};
    use crate::routing::{default_routing_table, RoutingTable};
    use crate::storage::MockOperationStore;
    use uuid::Uuid;

    fn update_catlet() -> UpdateCatletCommand {
        UpdateCatletCommand {
            catlet_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            agent_name: "host-1".to_string(),
            config: Default::default(),
        }
    }

    fn manager(
        routes: RoutingTable,
    ) -> (Arc<MockOperationStore>, Arc<MockMessageBus>, OperationManager) {
        let store = Arc::new(MockOperationStore::new());
        let bus = Arc::new(MockMessageBus::new());
        let sender = MessageSender::new(bus.clone(), Arc::new(routes));
        let manager = OperationManager::new(store.clone(), sender);
        (store, bus, manager)
    }

    #[tokio::test]
    async fn test_start_new_persists_then_sends() {
        let (store, bus, manager) = manager(default_routing_table().unwrap());
        let command = update_catlet();
        let target = Resource::new(ResourceType::Catlet, command.catlet_id);

        let operation = manager
            .start_new(&command, Some(target), None)
            .await
            .unwrap();

        assert_eq!(operation.status, OperationStatus::Queued);
        let stored = manager.get(operation.id).await.unwrap().unwrap();
        assert_eq!(stored.resources, vec![target]);

        let tasks = manager.tasks(operation.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].is_root());
        assert_eq!(tasks[0].status, TaskStatus::Created);

        let sent = bus.published_of::<CreateNewOperationTaskCommand>().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].operation_id, operation.id);
        assert_eq!(sent[0].task_id, tasks[0].id);
        assert_eq!(sent[0].command_type, UpdateCatletCommand::MESSAGE_TYPE);
        assert_eq!(bus.published().await[0].destination, Address::controller());
        assert_eq!(store.operation_count().await, 1);
    }

    #[tokio::test]
    async fn test_store_failure_sends_nothing() {
        let (store, bus, manager) = manager(default_routing_table().unwrap());
        store.set_fail_on_create(true).await;

        let result = manager.start_new(&update_catlet(), None, None).await;

        assert!(matches!(result, Err(ManagerError::Storage(_))));
        assert_eq!(bus.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_unrouted_command_stores_nothing() {
        let (store, bus, manager) = manager(RoutingTable::default());

        let result = manager.start_new(&update_catlet(), None, None).await;

        assert_eq!(result.unwrap_err().class(), ErrorClass::Configuration);
        assert_eq!(store.operation_count().await, 0);
        assert_eq!(bus.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_failure_leaves_operation_queued() {
        let (_, bus, manager) = manager(default_routing_table().unwrap());
        bus.set_fail_on_publish(true).await;

        let result = manager.start_new(&update_catlet(), None, None).await;
        assert_eq!(result.unwrap_err().class(), ErrorClass::TransientInfra);

        let operations = manager.list().await.unwrap();
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].status, OperationStatus::Queued);
    }
}
