//! Routed sending on top of a `MessageBus`.

use std::sync::Arc;

use tracing::debug;

use super::{Address, BusError, BusMessage, Envelope, MessageBus, Result};
use crate::routing::RoutingTable;
use crate::tasks::CreateNewOperationTaskCommand;

/// Addresses messages through the routing table and publishes them.
///
/// Envelopes are built separately from publishing so a saga can persist
/// them in its outbox before they are sent.
#[derive(Clone)]
pub struct MessageSender {
    bus: Arc<dyn MessageBus>,
    routes: Arc<RoutingTable>,
}

impl MessageSender {
    pub fn new(bus: Arc<dyn MessageBus>, routes: Arc<RoutingTable>) -> Self {
        Self { bus, routes }
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Envelope for a command, addressed to its recipient role.
    pub fn command_envelope<M: BusMessage>(&self, command: &M) -> Result<Envelope> {
        let recipient = self.routes.recipient(M::MESSAGE_TYPE)?;
        Envelope::new(command, Address::role(recipient))
    }

    /// Envelope for a task command, addressed by the type of the command it carries.
    ///
    /// Replies come back to the controller.
    pub fn task_command_envelope(
        &self,
        command: &CreateNewOperationTaskCommand,
        agent: Option<&str>,
    ) -> Result<Envelope> {
        let recipient = self.routes.recipient(&command.command_type)?;
        let destination = match agent {
            Some(agent) => Address::agent(recipient, agent),
            None => Address::role(recipient),
        };
        let mut envelope =
            Envelope::new(command, destination)?.with_reply_to(Address::controller());
        if let Some(initiating) = command.initiating_task_id {
            envelope = envelope.with_correlation_id(initiating.to_string());
        }
        Ok(envelope)
    }

    /// One envelope per subscriber role of an event. Empty if nobody subscribes.
    pub fn event_envelopes<M: BusMessage>(&self, event: &M) -> Result<Vec<Envelope>> {
        self.routes
            .subscribers(M::MESSAGE_TYPE)?
            .iter()
            .map(|role| Envelope::new(event, Address::role(*role)))
            .collect()
    }

    pub async fn send_command<M: BusMessage>(&self, command: &M) -> Result<()> {
        let envelope = self.command_envelope(command)?;
        self.bus.publish(envelope).await
    }

    pub async fn send_task_command(
        &self,
        command: &CreateNewOperationTaskCommand,
        agent: Option<&str>,
    ) -> Result<()> {
        let envelope = self.task_command_envelope(command, agent)?;
        self.bus.publish(envelope).await
    }

    pub async fn publish_event<M: BusMessage>(&self, event: &M) -> Result<()> {
        let envelopes = self.event_envelopes(event)?;
        self.publish_envelopes(envelopes).await
    }

    /// Reply directly to the sender of `original`, bypassing the routing table.
    pub async fn reply<M: BusMessage>(&self, original: &Envelope, message: &M) -> Result<()> {
        let destination = original
            .reply_to
            .clone()
            .ok_or(BusError::MissingReplyTo(original.id))?;
        let mut envelope = Envelope::new(message, destination)?;
        envelope.correlation_id = original.correlation_id.clone();
        self.bus.publish(envelope).await
    }

    /// Publish prepared envelopes in order, stopping at the first failure.
    pub async fn publish_envelopes(&self, envelopes: Vec<Envelope>) -> Result<()> {
        for envelope in envelopes {
            debug!(
                message_type = %envelope.message_type,
                destination = %envelope.destination,
                "Sending"
            );
            self.bus.publish(envelope).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockMessageBus;
    use crate::catlets::{PrepareGeneCommand, UpdateCatletCommand};
    use crate::genes::{GeneIdentifier, GeneIdentifierWithType, GeneType};
    use crate::operations::{OperationId, TaskId};
    use crate::routing::{default_routing_table, Role};
    use crate::tasks::OperationTaskStatusEvent;

    fn sender() -> (Arc<MockMessageBus>, MessageSender) {
        let bus = Arc::new(MockMessageBus::new());
        let routes = Arc::new(default_routing_table().unwrap());
        (bus.clone(), MessageSender::new(bus, routes))
    }

    fn prepare_gene() -> PrepareGeneCommand {
        PrepareGeneCommand {
            agent_name: "host-1".to_string(),
            gene: GeneIdentifierWithType::new(
                GeneType::Volume,
                GeneIdentifier::parse("gene:acme/os/1.0:sda").into_result().unwrap(),
            ),
        }
    }

    #[tokio::test]
    async fn test_task_command_routed_by_inner_type() {
        let (bus, sender) = sender();
        let saga = TaskId::new();
        let command = CreateNewOperationTaskCommand::wrap(
            &prepare_gene(),
            OperationId::new(),
            TaskId::new(),
            Some(saga),
        )
        .unwrap();

        sender.send_task_command(&command, Some("host-1")).await.unwrap();

        let published = bus.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].destination,
            Address::agent(Role::VmHostAgent, "host-1")
        );
        assert_eq!(published[0].reply_to, Some(Address::controller()));
        assert_eq!(published[0].correlation_id, Some(saga.to_string()));
        assert!(published[0].is::<CreateNewOperationTaskCommand>());
    }

    #[tokio::test]
    async fn test_event_fans_out_to_subscribers() {
        let (bus, sender) = sender();
        let event =
            OperationTaskStatusEvent::new(OperationId::new(), TaskId::new(), None, false, None);

        sender.publish_event(&event).await.unwrap();

        let published = bus.published_of::<OperationTaskStatusEvent>().await;
        assert_eq!(published, vec![event]);
    }

    #[tokio::test]
    async fn test_unrouted_type_is_configuration_error() {
        let bus = Arc::new(MockMessageBus::new());
        let sender = MessageSender::new(bus.clone(), Arc::new(RoutingTable::default()));

        let result = sender.send_command(&prepare_gene()).await;
        assert!(matches!(result, Err(BusError::Routing(_))));
        assert_eq!(bus.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_reply_requires_reply_to() {
        let (bus, sender) = sender();
        let original = sender.command_envelope(&prepare_gene()).unwrap();
        let event =
            OperationTaskStatusEvent::new(OperationId::new(), TaskId::new(), None, false, None);

        let result = sender.reply(&original, &event).await;
        assert!(matches!(result, Err(BusError::MissingReplyTo(_))));

        let original = original.with_reply_to(Address::controller());
        sender.reply(&original, &event).await.unwrap();
        assert_eq!(bus.published_count().await, 1);
    }

    #[tokio::test]
    async fn test_command_envelope_for_saga_start() {
        let (_, sender) = sender();
        let command = UpdateCatletCommand {
            catlet_id: uuid::Uuid::new_v4(),
            project_id: uuid::Uuid::new_v4(),
            agent_name: "host-1".to_string(),
            config: Default::default(),
        };
        let envelope = sender.command_envelope(&command).unwrap();
        assert_eq!(envelope.destination, Address::controller());
    }
}
