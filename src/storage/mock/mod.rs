//! Mock storage implementations for testing and `storage.type: memory`.

mod operation_store;
mod saga_store;

pub use operation_store::MockOperationStore;
pub use saga_store::MockSagaStore;
