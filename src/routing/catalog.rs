//! Routes for the messages this crate exchanges.

use super::{Role, RoutingError, RoutingTable};
use crate::bus::BusMessage;
use crate::catlets::{
    PrepareGeneCommand, UpdateCatletCommand, UpdateCatletNetworksCommand, UpdateCatletVmCommand,
};
use crate::tasks::{
    OperationTaskAcceptedEvent, OperationTaskProgressEvent, OperationTaskStatusEvent,
};

/// Message types the controller and agents send. Each must be routed.
pub const DEFAULT_REQUIRED_TYPES: &[&str] = &[
    UpdateCatletCommand::MESSAGE_TYPE,
    PrepareGeneCommand::MESSAGE_TYPE,
    UpdateCatletVmCommand::MESSAGE_TYPE,
    UpdateCatletNetworksCommand::MESSAGE_TYPE,
    OperationTaskAcceptedEvent::MESSAGE_TYPE,
    OperationTaskProgressEvent::MESSAGE_TYPE,
    OperationTaskStatusEvent::MESSAGE_TYPE,
];

/// Routing table for the built-in sagas and the task protocol.
///
/// Task commands are routed by the type of the command they carry, so
/// the inner command types appear here rather than the task envelope.
pub fn default_routing_table() -> Result<RoutingTable, RoutingError> {
    RoutingTable::builder()
        .command::<UpdateCatletCommand>(Role::Controller)
        .command::<PrepareGeneCommand>(Role::VmHostAgent)
        .command::<UpdateCatletVmCommand>(Role::VmHostAgent)
        .command::<UpdateCatletNetworksCommand>(Role::NetworkAgent)
        .event::<OperationTaskAcceptedEvent>(&[Role::Controller])
        .event::<OperationTaskProgressEvent>(&[Role::Controller])
        .event::<OperationTaskStatusEvent>(&[Role::Controller])
        .require_all(DEFAULT_REQUIRED_TYPES.iter().copied())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_routes_every_required_type() {
        let table = default_routing_table().unwrap();
        for message_type in DEFAULT_REQUIRED_TYPES {
            assert!(table.contains(message_type), "{message_type} not routed");
        }
        assert_eq!(
            table.recipient(PrepareGeneCommand::MESSAGE_TYPE).unwrap(),
            Role::VmHostAgent
        );
        assert_eq!(
            table
                .recipient(UpdateCatletNetworksCommand::MESSAGE_TYPE)
                .unwrap(),
            Role::NetworkAgent
        );
    }
}
