//! Task deadline scheduler.
//!
//! Periodically looks for outstanding child tasks past their deadline and
//! fails them with a synthesized `TaskTimedOut` status event. The event goes
//! through the regular status path, so the first terminal event still wins:
//! an agent reply that arrives later is ignored, and a timeout that races a
//! real reply loses if the reply got there first.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::bus::MessageSender;
use crate::error::HandlerError;
use crate::interfaces::{SagaStore, TaskDeadline};
use crate::tasks::{OperationTaskStatusEvent, TaskTimedOut, TypedPayload};

const DEFAULT_BATCH: usize = 100;

/// Fails tasks that missed their deadline.
pub struct DeadlineScheduler {
    sagas: Arc<dyn SagaStore>,
    sender: MessageSender,
    check_interval: Duration,
    batch: usize,
}

impl DeadlineScheduler {
    pub fn new(sagas: Arc<dyn SagaStore>, sender: MessageSender, check_interval: Duration) -> Self {
        Self {
            sagas,
            sender,
            check_interval,
            batch: DEFAULT_BATCH,
        }
    }

    /// Publish a timeout for every expired deadline, up to one batch.
    ///
    /// Returns the number of timeouts published. A deadline is removed only
    /// after its timeout is published; a crash in between publishes it again,
    /// which the status path drops as a duplicate.
    pub async fn check_once(&self) -> Result<usize, HandlerError> {
        let expired = self.sagas.expired_deadlines(Utc::now(), self.batch).await?;
        if expired.is_empty() {
            return Ok(0);
        }
        info!(count = expired.len(), "Found expired task deadlines");

        for deadline in &expired {
            self.time_out(deadline).await?;
        }
        Ok(expired.len())
    }

    async fn time_out(&self, deadline: &TaskDeadline) -> Result<(), HandlerError> {
        let timed_out = TaskTimedOut {
            task_id: deadline.task_id,
            deadline: deadline.deadline,
        };
        let event = OperationTaskStatusEvent::new(
            deadline.operation_id,
            deadline.task_id,
            Some(deadline.saga_id),
            true,
            Some(TypedPayload::encode(&timed_out)?),
        );
        debug!(
            task_id = %deadline.task_id,
            saga_id = %deadline.saga_id,
            deadline = %deadline.deadline,
            "Task timed out"
        );
        self.sender.publish_event(&event).await?;
        self.sagas.remove_deadline(deadline.task_id).await?;
        Ok(())
    }

    /// Run the scheduler loop. Never returns; errors are logged and retried
    /// on the next tick.
    pub async fn run(&self) {
        info!(check_interval = ?self.check_interval, "Starting deadline scheduler");

        let mut ticker = interval(self.check_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.check_once().await {
                error!(error = %e, "Deadline check failed");
            }
        }
    }

    /// Run the scheduler on a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockMessageBus;
    use crate::interfaces::{SagaCommit, SagaRecord, SagaStatus};
    use crate::operations::{OperationId, TaskId};
    use crate::routing::default_routing_table;
    use crate::storage::MockSagaStore;

    fn scheduler() -> (Arc<MockSagaStore>, Arc<MockMessageBus>, DeadlineScheduler) {
        let sagas = Arc::new(MockSagaStore::new());
        let bus = Arc::new(MockMessageBus::new());
        let sender = MessageSender::new(bus.clone(), Arc::new(default_routing_table().unwrap()));
        let scheduler = DeadlineScheduler::new(sagas.clone(), sender, Duration::from_millis(10));
        (sagas, bus, scheduler)
    }

    async fn add_deadline(
        sagas: &MockSagaStore,
        offset: chrono::Duration,
    ) -> TaskDeadline {
        let saga_id = TaskId::new();
        let operation_id = OperationId::new();
        let deadline = TaskDeadline {
            task_id: TaskId::new(),
            saga_id,
            operation_id,
            deadline: Utc::now() + offset,
        };
        sagas
            .commit(SagaCommit {
                record: SagaRecord {
                    saga_id,
                    saga_type: "test".to_string(),
                    operation_id,
                    version: 1,
                    state: serde_json::Value::Null,
                    status: SagaStatus::Running,
                    references: vec![],
                    pending: vec![deadline.task_id],
                    outbox: vec![],
                    updated_at: Utc::now(),
                },
                expected_version: None,
                add_deadlines: vec![deadline.clone()],
                remove_deadlines: vec![],
            })
            .await
            .unwrap();
        deadline
    }

    #[tokio::test]
    async fn test_expired_deadline_publishes_timeout() {
        let (sagas, bus, scheduler) = scheduler();
        let expired = add_deadline(&sagas, chrono::Duration::seconds(-1)).await;
        add_deadline(&sagas, chrono::Duration::hours(1)).await;

        assert_eq!(scheduler.check_once().await.unwrap(), 1);

        let events = bus.published_of::<OperationTaskStatusEvent>().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].task_id, expired.task_id);
        assert_eq!(events[0].initiating_task_id, Some(expired.saga_id));
        assert!(events[0].is_timeout());
        assert_eq!(sagas.deadline_count().await, 1);

        assert_eq!(scheduler.check_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_deadline() {
        let (sagas, bus, scheduler) = scheduler();
        add_deadline(&sagas, chrono::Duration::seconds(-1)).await;

        bus.set_fail_on_publish(true).await;
        assert!(scheduler.check_once().await.is_err());
        assert_eq!(sagas.deadline_count().await, 1);

        bus.set_fail_on_publish(false).await;
        assert_eq!(scheduler.check_once().await.unwrap(), 1);
        assert_eq!(sagas.deadline_count().await, 0);
    }

    #[tokio::test]
    async fn test_spawned_scheduler_fires() {
        let (sagas, bus, scheduler) = scheduler();
        add_deadline(&sagas, chrono::Duration::seconds(-1)).await;

        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert_eq!(bus.published_count().await, 1);
        assert_eq!(sagas.deadline_count().await, 0);
    }
}
