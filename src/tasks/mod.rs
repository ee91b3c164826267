//! Task dispatch protocol.
//!
//! Per task: Created -> Accepted -> {Completed | Failed}. Progress events
//! are advisory. Accepted must be observed before progress or a terminal
//! event for the same task; the only exception is a timeout synthesized by
//! the controller for a task that never got accepted.

mod messages;
mod payload;
mod tracker;

pub use messages::{
    failure_message, CreateNewOperationTaskCommand, ErrorData, OperationTaskAcceptedEvent,
    OperationTaskProgressEvent, OperationTaskStatusEvent, TaskTimedOut,
};
pub use payload::{PayloadError, PayloadRegistry, TypedPayload};
pub use tracker::{ProtocolError, TaskResolution, TaskTracker};
