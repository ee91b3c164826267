//! Operations: the audit record of externally requested work.
//!
//! An operation is created queued with a root task that carries the
//! initiating command. The root task's protocol events move the operation
//! to running and then to its terminal status.

mod manager;
mod model;

pub use manager::{ManagerError, OperationManager};
pub use model::{
    LogEntry, Operation, OperationId, OperationStatus, OperationTask, ParseStatusError, Resource,
    ResourceType, TaskId, TaskReference, TaskStatus,
};
