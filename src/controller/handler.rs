//! Controller-side message handling.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::bus::{BusMessage, Envelope, MessageHandler};
use crate::error::HandlerError;
use crate::interfaces::SagaStore;
use crate::routing::RoutingError;
use crate::saga::{SagaError, SagaRegistry};
use crate::tasks::{
    CreateNewOperationTaskCommand, OperationTaskAcceptedEvent, OperationTaskProgressEvent,
    OperationTaskStatusEvent, TaskTracker,
};

/// Routes controller-bound envelopes to the task tracker and the sagas.
///
/// - `CreateNewOperationTaskCommand` starts the saga registered for the
///   command it carries
/// - accepted and progress events go to the tracker
/// - a status event is resolved by the tracker first; the stored winner is
///   then fed to the saga that dispatched the task, if any
#[derive(Clone)]
pub struct ControllerHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    tracker: TaskTracker,
    sagas: Arc<dyn SagaStore>,
    registry: SagaRegistry,
}

impl ControllerHandler {
    pub fn new(tracker: TaskTracker, sagas: Arc<dyn SagaStore>, registry: SagaRegistry) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                tracker,
                sagas,
                registry,
            }),
        }
    }
}

impl HandlerInner {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match envelope.message_type.as_str() {
            CreateNewOperationTaskCommand::MESSAGE_TYPE => {
                let command: CreateNewOperationTaskCommand = envelope.decode()?;
                let saga = self
                    .registry
                    .for_command(&command.command_type)
                    .ok_or_else(|| SagaError::UnknownSaga(command.command_type.clone()))?;
                saga.start(&command).await
            }
            OperationTaskAcceptedEvent::MESSAGE_TYPE => {
                let event: OperationTaskAcceptedEvent = envelope.decode()?;
                self.tracker.on_accepted(&event).await?;
                Ok(())
            }
            OperationTaskProgressEvent::MESSAGE_TYPE => {
                let event: OperationTaskProgressEvent = envelope.decode()?;
                self.tracker.on_progress(&event).await?;
                Ok(())
            }
            OperationTaskStatusEvent::MESSAGE_TYPE => {
                let event: OperationTaskStatusEvent = envelope.decode()?;
                self.on_status(&event).await
            }
            other => Err(RoutingError::UnknownMessageType(other.to_string()).into()),
        }
    }

    async fn on_status(&self, event: &OperationTaskStatusEvent) -> Result<(), HandlerError> {
        let resolution = self.tracker.on_status(event).await?;
        let task = resolution.into_task();

        let Some(saga_id) = task.parent_task_id else {
            return Ok(());
        };

        // Duplicates are forwarded too: if the saga step after the first
        // resolution never ran, this is where it gets its result.
        let record = self
            .sagas
            .load(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;
        let saga = self
            .registry
            .for_saga_type(&record.saga_type)
            .ok_or_else(|| SagaError::UnknownSaga(record.saga_type.clone()))?;

        debug!(saga_id = %saga_id, task_id = %task.id, "Feeding task result to saga");
        saga.task_finished(saga_id, task).await
    }
}

impl MessageHandler for ControllerHandler {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.handle(&envelope).await })
    }
}
