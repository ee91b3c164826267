//! Storage implementations.

use std::sync::Arc;

use tracing::info;

use crate::config::{LockConfig, StorageConfig, StorageType};
use crate::interfaces::{DistributedLockProvider, OperationStore, SagaStore};
use crate::locks::MemoryLockProvider;

pub mod mock;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use mock::{MockOperationStore, MockSagaStore};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteOperationStore, SqliteSagaStore};

/// Stores and lock provider sharing one backend.
#[derive(Clone)]
pub struct Stores {
    pub operations: Arc<dyn OperationStore>,
    pub sagas: Arc<dyn SagaStore>,
    pub locks: Arc<dyn DistributedLockProvider>,
}

impl Stores {
    /// In-memory stores for a single process.
    pub fn memory() -> Self {
        Self {
            operations: Arc::new(MockOperationStore::new()),
            sagas: Arc::new(MockSagaStore::new()),
            locks: Arc::new(MemoryLockProvider::new()),
        }
    }
}

/// Initialize storage based on configuration.
pub async fn init_storage(
    config: &StorageConfig,
    lock: &LockConfig,
) -> Result<Stores, Box<dyn std::error::Error + Send + Sync>> {
    info!(storage_type = ?config.storage_type, path = %config.path, "Initializing storage");

    match config.storage_type {
        StorageType::Memory => Ok(Stores::memory()),
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)?;
            }

            let pool = sqlite::connect(&config.path).await?;

            let operations = SqliteOperationStore::new(pool.clone());
            operations.init().await?;

            let sagas = SqliteSagaStore::new(pool.clone());
            sagas.init().await?;

            let locks = crate::locks::SqliteLockProvider::new(pool, lock.clone());
            locks.init().await?;

            Ok(Stores {
                operations: Arc::new(operations),
                sagas: Arc::new(sagas),
                locks: Arc::new(locks),
            })
        }
        #[cfg(not(feature = "sqlite"))]
        StorageType::Sqlite => {
            let _ = lock;
            tracing::error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err("SQLite feature not enabled".into())
        }
    }
}
