//! In-process lock provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::interfaces::{DistributedLockHandle, DistributedLockProvider, LockError};

/// Lock provider for a single orchestrator process.
///
/// Keeps a count of underlying acquisitions and the order of releases.
#[derive(Default)]
pub struct MemoryLockProvider {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    acquisitions: AtomicUsize,
    releases: Arc<Mutex<Vec<String>>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful acquisitions so far.
    pub fn acquisition_count(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Names released so far, in release order.
    pub async fn released(&self) -> Vec<String> {
        self.releases.lock().await.clone()
    }
}

#[async_trait]
impl DistributedLockProvider for MemoryLockProvider {
    async fn acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Box<dyn DistributedLockHandle>, LockError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(name.to_string()).or_default().clone()
        };

        let guard = tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| LockError::Timeout {
                name: name.to_string(),
                timeout,
            })?;
        self.acquisitions.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryLockHandle {
            name: name.to_string(),
            guard,
            releases: self.releases.clone(),
        }))
    }
}

struct MemoryLockHandle {
    name: String,
    guard: OwnedMutexGuard<()>,
    releases: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl DistributedLockHandle for MemoryLockHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn release(self: Box<Self>) -> Result<(), LockError> {
        let MemoryLockHandle {
            name,
            guard,
            releases,
        } = *self;
        releases.lock().await.push(name);
        drop(guard);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_distinct_names_do_not_block() {
        let provider = MemoryLockProvider::new();
        let a = provider.acquire("a", Duration::from_millis(10)).await.unwrap();
        let b = provider.acquire("b", Duration::from_millis(10)).await.unwrap();

        assert_eq!(a.name(), "a");
        assert_eq!(b.name(), "b");
        assert_eq!(provider.acquisition_count(), 2);
    }

    #[tokio::test]
    async fn test_release_unblocks_waiter() {
        let provider = Arc::new(MemoryLockProvider::new());
        let held = provider.acquire("a", Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.acquire("a", Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        held.release().await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.name(), "a");
        assert_eq!(provider.released().await, vec!["a"]);
    }
}
