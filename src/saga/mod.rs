//! Saga step functions and their runtime.
//!
//! A saga drives one multi-step operation. It runs as a task of that
//! operation (usually the root task), and every child task it dispatches
//! carries the saga's task id as `initiating_task_id`, so replies correlate
//! back to the instance.
//!
//! A saga type is a pure step function:
//! `(context, state?, message) -> (state, tasks to dispatch, outcome)`.
//! The runtime (`SagaRuntime`) does everything with side effects: loading and
//! persisting state, taking locks, sending messages and deadlines.

mod deadline;
mod runtime;
mod update_catlet;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::bus::BusMessage;
use crate::error::{Classify, ErrorClass};
use crate::operations::{OperationId, OperationTask, Resource, TaskId, TaskReference};
use crate::tasks::{PayloadError, TypedPayload};

pub use deadline::DeadlineScheduler;
pub use runtime::{SagaHandler, SagaRegistry, SagaRuntime, SagaSettings};
pub use update_catlet::{UpdateCatletPhase, UpdateCatletSaga, UpdateCatletState};

/// Errors raised by saga step functions.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("Saga '{saga_type}' cannot handle {message} while {state}")]
    IllegalTransition {
        saga_type: &'static str,
        state: String,
        message: String,
    },

    #[error("Unexpected result for task {task_id}: {reason}")]
    UnexpectedResult { task_id: TaskId, reason: String },

    #[error("Invalid saga input: {0}")]
    InvalidInput(String),

    #[error("Saga {0} not found")]
    NotFound(TaskId),

    #[error("No saga handles '{0}'")]
    UnknownSaga(String),

    #[error("Saga state could not be (de)serialized: {0}")]
    State(#[from] serde_json::Error),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl Classify for SagaError {
    fn class(&self) -> ErrorClass {
        match self {
            SagaError::UnknownSaga(_) => ErrorClass::Configuration,
            SagaError::Payload(e) => e.class(),
            _ => ErrorClass::Validation,
        }
    }
}

/// Identity of the instance a step runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SagaContext {
    pub saga_id: TaskId,
    pub operation_id: OperationId,
}

impl SagaContext {
    /// Id of the child task dispatched under `key`.
    ///
    /// Derived from the saga id, so re-running a step yields the same ids
    /// and a redelivered message cannot dispatch a task twice.
    pub fn child_task_id(&self, key: &str) -> TaskId {
        TaskId(Uuid::new_v5(self.saga_id.as_uuid(), key.as_bytes()))
    }
}

/// Input to a step.
#[derive(Debug, Clone)]
pub enum SagaMessage<C> {
    /// The initiating command. Only ever seen with no prior state.
    Started(C),
    /// A dispatched child task reached its terminal status.
    TaskFinished(OperationTask),
}

/// A child task to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchTask {
    /// Stable within the saga instance; see `SagaContext::child_task_id`.
    pub key: String,
    pub command: TypedPayload,
    /// Narrow delivery to one agent of the recipient role.
    pub agent: Option<String>,
    pub reference: Option<TaskReference>,
}

impl DispatchTask {
    pub fn new<M: BusMessage>(key: impl Into<String>, command: &M) -> Result<Self, SagaError> {
        Ok(Self {
            key: key.into(),
            command: TypedPayload::encode(command)?,
            agent: None,
            reference: None,
        })
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_reference(mut self, reference: TaskReference) -> Self {
        self.reference = Some(reference);
        self
    }
}

/// What happens to the instance after a step.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaOutcome {
    /// Wait for outstanding tasks.
    Continue,
    /// Succeed the saga task with an optional result, attaching `resources`
    /// to the operation.
    Complete {
        result: Option<TypedPayload>,
        resources: Vec<Resource>,
    },
    /// Fail the saga task.
    Fail { message: String },
}

/// Result of one step.
#[derive(Debug, Clone)]
pub struct Transition<S> {
    pub state: S,
    pub dispatch: Vec<DispatchTask>,
    pub outcome: SagaOutcome,
}

impl<S> Transition<S> {
    pub fn continue_with(state: S, dispatch: Vec<DispatchTask>) -> Self {
        Self {
            state,
            dispatch,
            outcome: SagaOutcome::Continue,
        }
    }

    pub fn complete(state: S, result: Option<TypedPayload>, resources: Vec<Resource>) -> Self {
        Self {
            state,
            dispatch: Vec::new(),
            outcome: SagaOutcome::Complete { result, resources },
        }
    }

    pub fn fail(state: S, message: impl Into<String>) -> Self {
        Self {
            state,
            dispatch: Vec::new(),
            outcome: SagaOutcome::Fail {
                message: message.into(),
            },
        }
    }
}

/// A saga type.
///
/// `step` must be deterministic in its inputs: the runtime may call it again
/// with the same state and message after a crash or redelivery.
pub trait Saga: Send + Sync + 'static {
    /// Command that starts an instance.
    type Command: BusMessage;
    /// Persisted per-instance state.
    type State: Serialize + DeserializeOwned + Send + Sync;

    /// Saga type name, stored with each instance.
    const NAME: &'static str;

    /// Command types this saga dispatches as tasks. Each must be routed.
    fn dispatched_types(&self) -> &'static [&'static str];

    /// Entities whose locks every step of the instance holds.
    fn references(&self, command: &Self::Command) -> Vec<TaskReference>;

    fn step(
        &self,
        ctx: &SagaContext,
        state: Option<Self::State>,
        message: SagaMessage<Self::Command>,
    ) -> Result<Transition<Self::State>, SagaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_task_id_is_stable_per_saga() {
        let ctx = SagaContext {
            saga_id: TaskId::new(),
            operation_id: OperationId::new(),
        };
        assert_eq!(ctx.child_task_id("vm"), ctx.child_task_id("vm"));
        assert_ne!(ctx.child_task_id("vm"), ctx.child_task_id("networks"));

        let other = SagaContext {
            saga_id: TaskId::new(),
            ..ctx
        };
        assert_ne!(ctx.child_task_id("vm"), other.child_task_id("vm"));
    }

    #[test]
    fn test_step_errors_are_not_retryable() {
        let err = SagaError::InvalidInput("bad".to_string());
        assert!(!err.class().is_retryable());
        assert_eq!(
            SagaError::UnknownSaga("x".to_string()).class(),
            ErrorClass::Configuration
        );
    }
}
