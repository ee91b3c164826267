//! Saga runtime: one atomic, crash-recoverable step per handled message.
//!
//! A step for instance `saga_id`:
//! 1. serialize with other steps of the same instance in this process
//! 2. take the distributed locks of the instance's task references
//! 3. (re)load the record and publish anything left in its outbox
//! 4. drop the message if it was already applied
//! 5. run the pure step function
//! 6. insert child tasks, then commit state, deadlines and outbox together
//!    (versioned, so a concurrent writer elsewhere makes this step retry)
//! 7. publish the outbox and clear it
//!
//! Saga records are never deleted; a finished instance is kept with a
//! terminal status so late messages can be recognized and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::{Saga, SagaContext, SagaError, SagaMessage, SagaOutcome, Transition};
use crate::bus::{Envelope, MessageSender};
use crate::error::{ErrorClass, HandlerError};
use crate::interfaces::{
    DistributedLockProvider, OperationStore, SagaCommit, SagaRecord, SagaStatus, SagaStore,
    TaskDeadline,
};
use crate::locks::LockScopeHolder;
use crate::operations::{OperationId, OperationTask, TaskId, TaskReference};
use crate::tasks::{
    CreateNewOperationTaskCommand, ErrorData, OperationTaskAcceptedEvent, OperationTaskStatusEvent,
    TypedPayload,
};

/// Runtime knobs shared by every saga type.
#[derive(Debug, Clone)]
pub struct SagaSettings {
    /// Agent name reported when the controller accepts a saga task.
    pub controller_name: String,
    /// How long a dispatched task may take to reach a terminal status.
    pub task_deadline: Duration,
    pub lock_timeout: Duration,
}

/// Type-erased saga runtime, as the controller sees it.
#[async_trait]
pub trait SagaHandler: Send + Sync {
    fn saga_type(&self) -> &'static str;

    /// Type of the command that starts an instance.
    fn command_type(&self) -> &'static str;

    /// Task command types the saga dispatches.
    fn dispatched_types(&self) -> &'static [&'static str];

    /// Start (or, on redelivery, resume) the instance for a saga task.
    async fn start(&self, command: &CreateNewOperationTaskCommand) -> Result<(), HandlerError>;

    /// Feed the stored outcome of a finished child task to its saga.
    async fn task_finished(&self, saga_id: TaskId, task: OperationTask)
        -> Result<(), HandlerError>;
}

/// Sagas keyed by starting command type and by saga type.
#[derive(Default, Clone)]
pub struct SagaRegistry {
    by_command: HashMap<&'static str, Arc<dyn SagaHandler>>,
    by_type: HashMap<&'static str, Arc<dyn SagaHandler>>,
}

impl SagaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, handler: Arc<dyn SagaHandler>) -> Self {
        self.by_command.insert(handler.command_type(), handler.clone());
        self.by_type.insert(handler.saga_type(), handler);
        self
    }

    pub fn for_command(&self, command_type: &str) -> Option<&Arc<dyn SagaHandler>> {
        self.by_command.get(command_type)
    }

    pub fn for_saga_type(&self, saga_type: &str) -> Option<&Arc<dyn SagaHandler>> {
        self.by_type.get(saga_type)
    }

    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn SagaHandler>> {
        self.by_type.values()
    }
}

/// In-process mutex per key; entries are dropped once nobody holds or waits.
#[derive(Default)]
struct KeyedMutex {
    entries: Mutex<HashMap<TaskId, Arc<Mutex<()>>>>,
}

impl KeyedMutex {
    async fn lock(&self, key: TaskId) -> OwnedMutexGuard<()> {
        let entry = self.entries.lock().await.entry(key).or_default().clone();
        entry.lock_owned().await
    }

    async fn release(&self, key: TaskId, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut entries = self.entries.lock().await;
        if entries.get(&key).is_some_and(|e| Arc::strong_count(e) == 1) {
            entries.remove(&key);
        }
    }
}

enum StepInput<C> {
    Start {
        command: Result<C, SagaError>,
        initiating_task_id: Option<TaskId>,
    },
    Finished(OperationTask),
}

/// Drives instances of one saga type.
pub struct SagaRuntime<S: Saga> {
    saga: S,
    operations: Arc<dyn OperationStore>,
    sagas: Arc<dyn SagaStore>,
    locks: Arc<dyn DistributedLockProvider>,
    sender: MessageSender,
    settings: SagaSettings,
    instances: KeyedMutex,
}

impl<S: Saga> SagaRuntime<S> {
    pub fn new(
        saga: S,
        operations: Arc<dyn OperationStore>,
        sagas: Arc<dyn SagaStore>,
        locks: Arc<dyn DistributedLockProvider>,
        sender: MessageSender,
        settings: SagaSettings,
    ) -> Self {
        Self {
            saga,
            operations,
            sagas,
            locks,
            sender,
            settings,
            instances: KeyedMutex::default(),
        }
    }

    async fn run(
        &self,
        saga_id: TaskId,
        operation_id: OperationId,
        input: StepInput<S::Command>,
    ) -> Result<(), HandlerError> {
        let guard = self.instances.lock(saga_id).await;
        let result = self.run_locked(saga_id, operation_id, input).await;
        self.instances.release(saga_id, guard).await;
        result
    }

    async fn run_locked(
        &self,
        saga_id: TaskId,
        operation_id: OperationId,
        input: StepInput<S::Command>,
    ) -> Result<(), HandlerError> {
        let existing = self.sagas.load(saga_id).await?;

        let references = match (&existing, &input) {
            (Some(record), _) => record.references.clone(),
            (None, StepInput::Start { command: Ok(c), .. }) => self.saga.references(c),
            (None, StepInput::Start { command: Err(_), .. }) => Vec::new(),
            (None, StepInput::Finished(_)) => return Err(SagaError::NotFound(saga_id).into()),
        };

        let scope = LockScopeHolder::new(self.locks.clone());
        let result = self
            .step_in_scope(&scope, saga_id, operation_id, &references, input)
            .await;
        if let Err(e) = scope.dispose().await {
            warn!(saga_id = %saga_id, error = %e, "Failed to release saga locks");
        }
        result
    }

    async fn step_in_scope(
        &self,
        scope: &LockScopeHolder,
        saga_id: TaskId,
        operation_id: OperationId,
        references: &[TaskReference],
        input: StepInput<S::Command>,
    ) -> Result<(), HandlerError> {
        for reference in references {
            scope
                .acquire_lock(&reference.lock_name(), self.settings.lock_timeout)
                .await?;
        }

        // Another holder of these locks may have stepped since the first load.
        let existing = self.sagas.load(saga_id).await?;
        if let Some(record) = &existing {
            self.flush_outbox(record).await?;
        }

        let ctx = SagaContext {
            saga_id,
            operation_id,
        };

        match (existing, input) {
            (Some(_), StepInput::Start { .. }) => {
                debug!(saga_id = %saga_id, "Saga already started");
                Ok(())
            }
            (
                None,
                StepInput::Start {
                    command,
                    initiating_task_id,
                },
            ) => {
                self.start_instance(&ctx, references.to_vec(), command, initiating_task_id)
                    .await
            }
            (Some(record), StepInput::Finished(task)) => {
                if record.status.is_terminal() {
                    debug!(saga_id = %saga_id, task_id = %task.id, "Saga already finished");
                    return Ok(());
                }
                if !record.pending.contains(&task.id) {
                    debug!(saga_id = %saga_id, task_id = %task.id, "Task result already applied");
                    return Ok(());
                }
                self.advance(&ctx, record, task).await
            }
            (None, StepInput::Finished(_)) => Err(SagaError::NotFound(saga_id).into()),
        }
    }

    async fn start_instance(
        &self,
        ctx: &SagaContext,
        references: Vec<TaskReference>,
        command: Result<S::Command, SagaError>,
        initiating_task_id: Option<TaskId>,
    ) -> Result<(), HandlerError> {
        let step = command.and_then(|c| self.saga.step(ctx, None, SagaMessage::Started(c)));

        let record = SagaRecord {
            saga_id: ctx.saga_id,
            saga_type: S::NAME.to_string(),
            operation_id: ctx.operation_id,
            version: 0,
            state: serde_json::Value::Null,
            status: SagaStatus::Running,
            references,
            pending: Vec::new(),
            outbox: Vec::new(),
            updated_at: Utc::now(),
        };

        let accepted = OperationTaskAcceptedEvent {
            operation_id: ctx.operation_id,
            task_id: ctx.saga_id,
            initiating_task_id,
            agent_name: self.settings.controller_name.clone(),
        };
        let outbox = self.sender.event_envelopes(&accepted)?;

        info!(
            saga_id = %ctx.saga_id,
            operation_id = %ctx.operation_id,
            saga_type = S::NAME,
            "Saga started"
        );
        self.apply(ctx, record, None, None, step, outbox).await
    }

    async fn advance(
        &self,
        ctx: &SagaContext,
        record: SagaRecord,
        task: OperationTask,
    ) -> Result<(), HandlerError> {
        let finished = task.id;
        let step = serde_json::from_value::<S::State>(record.state.clone())
            .map_err(SagaError::from)
            .and_then(|state| {
                self.saga
                    .step(ctx, Some(state), SagaMessage::TaskFinished(task))
            });
        let expected = Some(record.version);
        self.apply(ctx, record, expected, Some(finished), step, Vec::new())
            .await
    }

    /// Persist the outcome of a step and publish what it produced.
    #[tracing::instrument(
        name = "saga.step",
        skip_all,
        fields(saga_id = %ctx.saga_id, saga_type = S::NAME)
    )]
    async fn apply(
        &self,
        ctx: &SagaContext,
        mut record: SagaRecord,
        expected_version: Option<u64>,
        finished: Option<TaskId>,
        step: Result<Transition<S::State>, SagaError>,
        mut outbox: Vec<Envelope>,
    ) -> Result<(), HandlerError> {
        let (state, dispatch, outcome) = match step {
            Ok(t) => (Some(t.state), t.dispatch, t.outcome),
            Err(e) => {
                warn!(error = %e, "Saga step failed, failing saga");
                let message = e.to_string();
                (None, Vec::new(), SagaOutcome::Fail { message })
            }
        };
        if let Some(state) = state {
            record.state = serde_json::to_value(&state).map_err(SagaError::from)?;
        }

        let mut remove_deadlines = Vec::new();
        if let Some(task_id) = finished {
            record.pending.retain(|id| *id != task_id);
            remove_deadlines.push(task_id);
        }

        let deadline = Utc::now()
            + chrono::Duration::from_std(self.settings.task_deadline)
                .unwrap_or_else(|_| chrono::Duration::days(1));
        let mut add_deadlines = Vec::with_capacity(dispatch.len());
        for task in dispatch {
            let task_id = ctx.child_task_id(&task.key);
            let child = OperationTask::new(
                task_id,
                ctx.operation_id,
                Some(ctx.saga_id),
                task.command.clone(),
                task.reference,
            );
            if !self.operations.insert_task(&child).await? {
                debug!(task_id = %task_id, "Child task already recorded");
            }

            let command = CreateNewOperationTaskCommand::new(
                task.command,
                ctx.operation_id,
                task_id,
                Some(ctx.saga_id),
            );
            outbox.push(
                self.sender
                    .task_command_envelope(&command, task.agent.as_deref())?,
            );
            if !record.pending.contains(&task_id) {
                record.pending.push(task_id);
            }
            add_deadlines.push(TaskDeadline {
                task_id,
                saga_id: ctx.saga_id,
                operation_id: ctx.operation_id,
                deadline,
            });
        }

        match outcome {
            SagaOutcome::Continue => {}
            SagaOutcome::Complete { result, resources } => {
                if !resources.is_empty() {
                    self.operations
                        .add_resources(ctx.operation_id, &resources)
                        .await?;
                }
                let status = self.own_status(ctx, false, result).await?;
                outbox.extend(self.sender.event_envelopes(&status)?);
                record.status = SagaStatus::Completed;
                info!("Saga completed");
            }
            SagaOutcome::Fail { message } => {
                let error = TypedPayload::encode(
                    &ErrorData::new(message.clone()).with_class(ErrorClass::TerminalTaskFailure),
                )?;
                let status = self.own_status(ctx, true, Some(error)).await?;
                outbox.extend(self.sender.event_envelopes(&status)?);
                record.status = SagaStatus::Failed;
                warn!(reason = %message, "Saga failed");
            }
        }
        if record.status.is_terminal() {
            remove_deadlines.append(&mut record.pending);
            add_deadlines.clear();
        }

        record.version = expected_version.map_or(1, |v| v + 1);
        record.outbox = outbox;
        record.updated_at = Utc::now();

        self.sagas
            .commit(SagaCommit {
                record: record.clone(),
                expected_version,
                add_deadlines,
                remove_deadlines,
            })
            .await?;

        self.flush_outbox(&record).await
    }

    /// Terminal status event for the saga's own task.
    async fn own_status(
        &self,
        ctx: &SagaContext,
        failed: bool,
        result: Option<TypedPayload>,
    ) -> Result<OperationTaskStatusEvent, HandlerError> {
        let parent = self
            .operations
            .get_task(ctx.saga_id)
            .await?
            .and_then(|t| t.parent_task_id);
        Ok(OperationTaskStatusEvent::new(
            ctx.operation_id,
            ctx.saga_id,
            parent,
            failed,
            result,
        ))
    }

    async fn flush_outbox(&self, record: &SagaRecord) -> Result<(), HandlerError> {
        if record.outbox.is_empty() {
            return Ok(());
        }
        debug!(
            saga_id = %record.saga_id,
            count = record.outbox.len(),
            "Publishing saga outbox"
        );
        self.sender.publish_envelopes(record.outbox.clone()).await?;
        self.sagas.clear_outbox(record.saga_id, record.version).await?;
        Ok(())
    }
}

#[async_trait]
impl<S: Saga> SagaHandler for SagaRuntime<S> {
    fn saga_type(&self) -> &'static str {
        S::NAME
    }

    fn command_type(&self) -> &'static str {
        <S::Command as crate::bus::BusMessage>::MESSAGE_TYPE
    }

    fn dispatched_types(&self) -> &'static [&'static str] {
        self.saga.dispatched_types()
    }

    async fn start(&self, command: &CreateNewOperationTaskCommand) -> Result<(), HandlerError> {
        let decoded = command.command().decode::<S::Command>().map_err(SagaError::from);
        self.run(
            command.task_id,
            command.operation_id,
            StepInput::Start {
                command: decoded,
                initiating_task_id: command.initiating_task_id,
            },
        )
        .await
    }

    async fn task_finished(
        &self,
        saga_id: TaskId,
        task: OperationTask,
    ) -> Result<(), HandlerError> {
        let operation_id = task.operation_id;
        self.run(saga_id, operation_id, StepInput::Finished(task)).await
    }
}
