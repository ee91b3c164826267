//! Distributed lock scope holder.
//!
//! One `LockScopeHolder` lives for one message-handling unit of work. Locks
//! named by task references are taken through it so they span both the
//! state mutation and the message emission of that unit, and are released
//! together, newest first, when the scope ends.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::interfaces::{DistributedLockHandle, DistributedLockProvider, LockError};

pub use memory::MemoryLockProvider;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLockProvider;

#[derive(Default)]
struct ScopeState {
    held: HashSet<String>,
    handles: Vec<Box<dyn DistributedLockHandle>>,
    disposed: bool,
}

/// Named locks acquired during one unit of work.
pub struct LockScopeHolder {
    provider: Arc<dyn DistributedLockProvider>,
    state: Mutex<ScopeState>,
}

impl LockScopeHolder {
    pub fn new(provider: Arc<dyn DistributedLockProvider>) -> Self {
        Self {
            provider,
            state: Mutex::new(ScopeState::default()),
        }
    }

    /// Acquire `name` for the rest of this scope.
    ///
    /// Returns immediately if the scope already holds `name`. The gate is held
    /// while deciding and acquiring, so concurrent callers asking for the same
    /// name cause a single underlying acquisition.
    #[tracing::instrument(name = "lock.acquire", skip(self), fields(lock = %name))]
    pub async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<(), LockError> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Err(LockError::Disposed);
        }
        if state.held.contains(name) {
            return Ok(());
        }

        let handle = self.provider.acquire(name, timeout).await?;
        debug!("Lock acquired");
        state.held.insert(name.to_string());
        state.handles.push(handle);
        Ok(())
    }

    /// Whether this scope currently holds `name`.
    pub async fn holds(&self, name: &str) -> bool {
        self.state.lock().await.held.contains(name)
    }

    /// Release every held lock, newest first. Later calls do nothing.
    ///
    /// All handles are released even if some releases fail; the first
    /// failure is returned.
    pub async fn dispose(&self) -> Result<(), LockError> {
        let handles = {
            let mut state = self.state.lock().await;
            if state.disposed {
                return Ok(());
            }
            state.disposed = true;
            state.held.clear();
            std::mem::take(&mut state.handles)
        };
        release_in_reverse(handles).await
    }
}

async fn release_in_reverse(handles: Vec<Box<dyn DistributedLockHandle>>) -> Result<(), LockError> {
    let mut first_error = None;
    for handle in handles.into_iter().rev() {
        let name = handle.name().to_string();
        if let Err(e) = handle.release().await {
            warn!(lock = %name, error = %e, "Failed to release lock");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

impl Drop for LockScopeHolder {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.disposed || state.handles.is_empty() {
            return;
        }
        state.disposed = true;
        let handles = std::mem::take(&mut state.handles);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = release_in_reverse(handles).await;
                });
            }
            Err(_) => {
                warn!(
                    count = handles.len(),
                    "Lock scope dropped outside a runtime; leaving locks to expire"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_reacquire_is_idempotent() {
        let provider = Arc::new(MemoryLockProvider::new());
        let scope = LockScopeHolder::new(provider.clone());

        scope.acquire_lock("project:1", TIMEOUT).await.unwrap();
        scope.acquire_lock("project:1", TIMEOUT).await.unwrap();

        assert_eq!(provider.acquisition_count(), 1);
        assert!(scope.holds("project:1").await);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_same_name_acquires_once() {
        let provider = Arc::new(MemoryLockProvider::new());
        let scope = Arc::new(LockScopeHolder::new(provider.clone()));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let scope = scope.clone();
                tokio::spawn(async move { scope.acquire_lock("project:1", TIMEOUT).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(provider.acquisition_count(), 1);
    }

    #[tokio::test]
    async fn test_dispose_releases_in_reverse_order() {
        let provider = Arc::new(MemoryLockProvider::new());
        let scope = LockScopeHolder::new(provider.clone());

        for name in ["A", "B", "C"] {
            scope.acquire_lock(name, TIMEOUT).await.unwrap();
        }
        scope.dispose().await.unwrap();

        assert_eq!(provider.released().await, vec!["C", "B", "A"]);
    }

    #[tokio::test]
    async fn test_dispose_twice_releases_once() {
        let provider = Arc::new(MemoryLockProvider::new());
        let scope = LockScopeHolder::new(provider.clone());

        scope.acquire_lock("A", TIMEOUT).await.unwrap();
        scope.dispose().await.unwrap();
        scope.dispose().await.unwrap();

        assert_eq!(provider.released().await, vec!["A"]);
    }

    #[tokio::test]
    async fn test_acquire_after_dispose_fails() {
        let scope = LockScopeHolder::new(Arc::new(MemoryLockProvider::new()));
        scope.dispose().await.unwrap();

        let result = scope.acquire_lock("A", TIMEOUT).await;
        assert!(matches!(result, Err(LockError::Disposed)));
    }

    #[tokio::test]
    async fn test_second_scope_times_out_while_first_holds() {
        let provider = Arc::new(MemoryLockProvider::new());
        let first = LockScopeHolder::new(provider.clone());
        let second = LockScopeHolder::new(provider.clone());

        first.acquire_lock("project:1", TIMEOUT).await.unwrap();
        let result = second
            .acquire_lock("project:1", Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(LockError::Timeout { .. })));

        first.dispose().await.unwrap();
        second.acquire_lock("project:1", TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_releases_held_locks() {
        let provider = Arc::new(MemoryLockProvider::new());
        {
            let scope = LockScopeHolder::new(provider.clone());
            scope.acquire_lock("A", TIMEOUT).await.unwrap();
            scope.acquire_lock("B", TIMEOUT).await.unwrap();
        }

        for _ in 0..50 {
            if provider.released().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(provider.released().await, vec!["B", "A"]);
    }
}
