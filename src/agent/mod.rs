//! Agent-side task protocol runtime.
//!
//! An agent subscribes to its role (optionally narrowed to its own name) and
//! receives `CreateNewOperationTaskCommand`s. For each one the runtime:
//! 1. replies `OperationTaskAcceptedEvent`
//! 2. runs the handler registered for the inner command type, which may
//!    report progress through its `TaskContext`
//! 3. replies exactly one `OperationTaskStatusEvent` with the result or error
//!
//! Replies go to the command's reply-to address, or to the routed
//! subscribers of the event when it has none. Delivery is at-least-once, so
//! handlers must be idempotent per task id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::bus::{BusError, BusMessage, Envelope, MessageHandler, MessageSender};
use crate::error::{Classify, ErrorClass, HandlerError};
use crate::operations::{OperationId, TaskId};
use crate::tasks::{CreateNewOperationTaskCommand, ErrorData, PayloadError, TypedPayload};

/// Errors raised by agent task handlers.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The work itself failed; reported to the controller, never retried.
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl Classify for AgentError {
    fn class(&self) -> ErrorClass {
        match self {
            AgentError::Failed(_) => ErrorClass::TerminalTaskFailure,
            AgentError::Payload(e) => e.class(),
            AgentError::Bus(e) => e.class(),
        }
    }
}

/// What a handler sees of the task it executes.
pub struct TaskContext {
    agent_name: String,
    command: CreateNewOperationTaskCommand,
    envelope: Arc<Envelope>,
    sender: MessageSender,
}

impl TaskContext {
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn operation_id(&self) -> OperationId {
        self.command.operation_id
    }

    pub fn task_id(&self) -> TaskId {
        self.command.task_id
    }

    /// Append a progress message to the operation log. Best effort.
    pub async fn report_progress(&self, message: impl Into<String>) -> Result<(), BusError> {
        let event = self.command.progress(message);
        send_reply(&self.sender, &self.envelope, &event).await
    }
}

/// Executes one agent-side command type.
#[async_trait]
pub trait AgentTaskHandler: Send + Sync {
    /// Command type name this handler executes.
    fn command_type(&self) -> &'static str;

    /// Run the command; `Ok` carries the optional result payload.
    async fn execute(
        &self,
        ctx: &TaskContext,
        command: TypedPayload,
    ) -> Result<Option<TypedPayload>, AgentError>;
}

struct AgentInner {
    name: String,
    sender: MessageSender,
    handlers: HashMap<&'static str, Arc<dyn AgentTaskHandler>>,
}

/// Task protocol runtime for one agent.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<AgentInner>,
}

impl AgentRuntime {
    pub fn new(name: impl Into<String>, sender: MessageSender) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                name: name.into(),
                sender,
                handlers: HashMap::new(),
            }),
        }
    }

    /// Register a handler. Must be called before the runtime is subscribed.
    pub fn with_handler(mut self, handler: Arc<dyn AgentTaskHandler>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.handlers.insert(handler.command_type(), handler);
        } else {
            warn!(
                command_type = handler.command_type(),
                "Agent runtime already shared, handler not registered"
            );
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Command types this agent executes.
    pub fn command_types(&self) -> Vec<&'static str> {
        self.inner.handlers.keys().copied().collect()
    }
}

impl AgentInner {
    #[tracing::instrument(
        name = "agent.task",
        skip_all,
        fields(agent = %self.name, task_id = tracing::field::Empty)
    )]
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), HandlerError> {
        let command: CreateNewOperationTaskCommand = envelope.decode()?;
        tracing::Span::current().record("task_id", tracing::field::display(command.task_id));

        send_reply(&self.sender, &envelope, &command.accepted(self.name.clone())).await?;
        debug!(command_type = %command.command_type, "Task accepted");

        let status = match self.handlers.get(command.command_type.as_str()) {
            None => {
                warn!(command_type = %command.command_type, "No handler for command type");
                let error = ErrorData::new(format!(
                    "agent '{}' cannot execute '{}'",
                    self.name, command.command_type
                ))
                .with_class(ErrorClass::Configuration);
                command.failed(TypedPayload::encode(&error)?)
            }
            Some(handler) => {
                let ctx = TaskContext {
                    agent_name: self.name.clone(),
                    command: command.clone(),
                    envelope: Arc::clone(&envelope),
                    sender: self.sender.clone(),
                };
                match handler.execute(&ctx, command.command()).await {
                    Ok(result) => {
                        info!(operation_id = %command.operation_id, "Task completed");
                        command.completed(result)
                    }
                    Err(e) => {
                        warn!(operation_id = %command.operation_id, error = %e, "Task failed");
                        let error = ErrorData::new(e.to_string()).with_class(e.class());
                        command.failed(TypedPayload::encode(&error)?)
                    }
                }
            }
        };

        send_reply(&self.sender, &envelope, &status).await?;
        Ok(())
    }
}

impl MessageHandler for AgentRuntime {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.handle(envelope).await })
    }
}

async fn send_reply<M: BusMessage>(
    sender: &MessageSender,
    original: &Envelope,
    message: &M,
) -> Result<(), BusError> {
    if original.reply_to.is_some() {
        sender.reply(original, message).await
    } else {
        sender.publish_event(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Address, MockMessageBus};
    use crate::catlets::{PrepareGeneCommand, PrepareGeneResponse, UpdateCatletVmCommand};
    use crate::genes::{GeneIdentifier, GeneIdentifierWithType, GeneType};
    use crate::routing::{default_routing_table, Role};
    use crate::tasks::{
        failure_message, OperationTaskAcceptedEvent, OperationTaskProgressEvent,
        OperationTaskStatusEvent,
    };

    struct PrepareGene;

    #[async_trait]
    impl AgentTaskHandler for PrepareGene {
        fn command_type(&self) -> &'static str {
            PrepareGeneCommand::MESSAGE_TYPE
        }

        async fn execute(
            &self,
            ctx: &TaskContext,
            command: TypedPayload,
        ) -> Result<Option<TypedPayload>, AgentError> {
            let command: PrepareGeneCommand = command.decode()?;
            ctx.report_progress(format!("pulling {}", command.gene.identifier))
                .await?;
            if command.gene.identifier.to_string().contains("broken") {
                return Err(AgentError::Failed("gene not found".to_string()));
            }
            Ok(Some(TypedPayload::encode(&PrepareGeneResponse {
                gene: command.gene,
            })?))
        }
    }

    fn runtime() -> (Arc<MockMessageBus>, AgentRuntime) {
        let bus = Arc::new(MockMessageBus::new());
        let sender = MessageSender::new(bus.clone(), Arc::new(default_routing_table().unwrap()));
        let runtime = AgentRuntime::new("host-1", sender).with_handler(Arc::new(PrepareGene));
        (bus, runtime)
    }

    fn task_envelope(gene: &str) -> (CreateNewOperationTaskCommand, Arc<Envelope>) {
        let gene = GeneIdentifier::parse(gene).into_result().unwrap();
        let command = CreateNewOperationTaskCommand::wrap(
            &PrepareGeneCommand {
                agent_name: "host-1".to_string(),
                gene: GeneIdentifierWithType::new(GeneType::Volume, gene),
            },
            OperationId::new(),
            TaskId::new(),
            Some(TaskId::new()),
        )
        .unwrap();
        let envelope = Envelope::new(&command, Address::agent(Role::VmHostAgent, "host-1"))
            .unwrap()
            .with_reply_to(Address::controller());
        (command, Arc::new(envelope))
    }

    #[tokio::test]
    async fn test_task_is_accepted_then_completed() {
        let (bus, runtime) = runtime();
        let (command, envelope) = task_envelope("gene:acme/os/1.0:sda");

        runtime.handle(envelope).await.unwrap();

        let published = bus.published().await;
        assert_eq!(published.len(), 3);
        assert!(published[0].is::<OperationTaskAcceptedEvent>());
        assert!(published[1].is::<OperationTaskProgressEvent>());
        assert!(published[2].is::<OperationTaskStatusEvent>());
        assert!(published.iter().all(|e| e.destination == Address::controller()));

        let accepted: OperationTaskAcceptedEvent = published[0].decode().unwrap();
        assert_eq!(accepted.agent_name, "host-1");
        assert_eq!(accepted.initiating_task_id, command.initiating_task_id);

        let status: OperationTaskStatusEvent = published[2].decode().unwrap();
        assert!(!status.operation_failed);
        assert!(status.result().unwrap().is::<PrepareGeneResponse>());
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported() {
        let (bus, runtime) = runtime();
        let (_, envelope) = task_envelope("gene:acme/broken/1.0:sda");

        runtime.handle(envelope).await.unwrap();

        let status = bus.published_of::<OperationTaskStatusEvent>().await;
        assert_eq!(status.len(), 1);
        assert!(status[0].operation_failed);
        assert_eq!(failure_message(status[0].result().as_ref()), "gene not found");
        let error: ErrorData = status[0].result().unwrap().decode().unwrap();
        assert_eq!(error.error_class.as_deref(), Some("terminal_task_failure"));
    }

    #[tokio::test]
    async fn test_unknown_command_type_fails_task() {
        let (bus, runtime) = runtime();
        let command = CreateNewOperationTaskCommand::wrap(
            &UpdateCatletVmCommand {
                agent_name: "host-1".to_string(),
                catlet_id: uuid::Uuid::new_v4(),
                config: Default::default(),
            },
            OperationId::new(),
            TaskId::new(),
            None,
        )
        .unwrap();
        let envelope = Envelope::new(&command, Address::role(Role::VmHostAgent)).unwrap();

        runtime.handle(Arc::new(envelope)).await.unwrap();

        // Without reply-to the events follow the routing table to the controller.
        let published = bus.published().await;
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|e| e.destination == Address::controller()));
        let status: OperationTaskStatusEvent = published[1].decode().unwrap();
        assert!(status.operation_failed);
    }

    #[tokio::test]
    async fn test_non_task_envelope_is_rejected() {
        let (bus, runtime) = runtime();
        let event =
            OperationTaskStatusEvent::new(OperationId::new(), TaskId::new(), None, false, None);
        let envelope = Envelope::new(&event, Address::role(Role::VmHostAgent)).unwrap();

        let result = runtime.handle(Arc::new(envelope)).await;
        assert!(matches!(result, Err(HandlerError::Bus(BusError::TypeMismatch { .. }))));
        assert_eq!(bus.published_count().await, 0);
    }

    #[test]
    fn test_registered_command_types() {
        let (_, runtime) = runtime();
        assert_eq!(runtime.name(), "host-1");
        assert_eq!(runtime.command_types(), vec![PrepareGeneCommand::MESSAGE_TYPE]);
    }
}
