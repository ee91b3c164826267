//! Mock SagaStore implementation for testing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::interfaces::operation_store::{Result, StorageError};
use crate::interfaces::{SagaCommit, SagaRecord, SagaStore, TaskDeadline};
use crate::operations::TaskId;

#[derive(Default)]
struct Tables {
    sagas: HashMap<TaskId, SagaRecord>,
    deadlines: HashMap<TaskId, TaskDeadline>,
}

/// Mock saga store that keeps records and deadlines in memory.
#[derive(Default)]
pub struct MockSagaStore {
    tables: RwLock<Tables>,
    fail_on_commit: RwLock<bool>,
    commits: RwLock<usize>,
}

impl MockSagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_commit(&self, fail: bool) {
        *self.fail_on_commit.write().await = fail;
    }

    /// Number of successful commits.
    pub async fn commit_count(&self) -> usize {
        *self.commits.read().await
    }

    pub async fn deadline_count(&self) -> usize {
        self.tables.read().await.deadlines.len()
    }
}

#[async_trait]
impl SagaStore for MockSagaStore {
    async fn load(&self, saga_id: TaskId) -> Result<Option<SagaRecord>> {
        Ok(self.tables.read().await.sagas.get(&saga_id).cloned())
    }

    async fn commit(&self, commit: SagaCommit) -> Result<()> {
        if *self.fail_on_commit.read().await {
            return Err(StorageError::Unavailable("Mock commit failure".to_string()));
        }
        let mut tables = self.tables.write().await;
        let saga_id = commit.record.saga_id;
        let actual = tables.sagas.get(&saga_id).map(|r| r.version);
        if actual != commit.expected_version {
            return Err(StorageError::VersionConflict {
                saga_id,
                expected: commit.expected_version,
                actual,
            });
        }
        for task_id in &commit.remove_deadlines {
            tables.deadlines.remove(task_id);
        }
        for deadline in commit.add_deadlines {
            tables.deadlines.insert(deadline.task_id, deadline);
        }
        tables.sagas.insert(saga_id, commit.record);
        *self.commits.write().await += 1;
        Ok(())
    }

    async fn clear_outbox(&self, saga_id: TaskId, version: u64) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.sagas.get_mut(&saga_id) {
            Some(record) if record.version == version => {
                record.outbox.clear();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expired_deadlines(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskDeadline>> {
        let tables = self.tables.read().await;
        let mut expired: Vec<TaskDeadline> = tables
            .deadlines
            .values()
            .filter(|d| d.deadline <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|d| d.deadline);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn remove_deadline(&self, task_id: TaskId) -> Result<()> {
        self.tables.write().await.deadlines.remove(&task_id);
        Ok(())
    }
}
