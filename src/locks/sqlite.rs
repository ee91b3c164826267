//! Lease-based lock provider on a shared SQLite database.
//!
//! A lock is a row keyed by name carrying a random holder id and an expiry.
//! Acquisition deletes an expired row for the name, then inserts with
//! `ON CONFLICT DO NOTHING`; exactly one contender's insert lands. Release
//! deletes the row only if the holder id still matches, so a holder whose
//! lease expired cannot release a successor's lock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::SqlitePool;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::interfaces::{DistributedLockHandle, DistributedLockProvider, LockError};
use crate::storage::schema::{DistributedLocks, CREATE_LOCK_TABLE};

/// Lease lock provider shared by every orchestrator instance on one database.
pub struct SqliteLockProvider {
    pool: SqlitePool,
    config: LockConfig,
}

impl SqliteLockProvider {
    pub fn new(pool: SqlitePool, config: LockConfig) -> Self {
        Self { pool, config }
    }

    /// Create the lock table if it doesn't exist.
    pub async fn init(&self) -> Result<(), LockError> {
        sqlx::query(CREATE_LOCK_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    async fn try_acquire(&self, name: &str, holder: &str) -> Result<bool, LockError> {
        let now = Utc::now().timestamp_millis();
        let ttl =
            i64::try_from(self.config.lease_ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);

        let expired = Query::delete()
            .from_table(DistributedLocks::Table)
            .and_where(Expr::col(DistributedLocks::Name).eq(name))
            .and_where(Expr::col(DistributedLocks::ExpiresAt).lte(now))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&expired).execute(&self.pool).await?;

        let insert = Query::insert()
            .into_table(DistributedLocks::Table)
            .columns([
                DistributedLocks::Name,
                DistributedLocks::Holder,
                DistributedLocks::ExpiresAt,
            ])
            .values_panic([name.into(), holder.into(), now.saturating_add(ttl).into()])
            .on_conflict(
                OnConflict::column(DistributedLocks::Name)
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&insert).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl DistributedLockProvider for SqliteLockProvider {
    async fn acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Box<dyn DistributedLockHandle>, LockError> {
        let holder = Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            if self.try_acquire(name, &holder).await? {
                debug!(lock = %name, holder = %holder, "Lease acquired");
                return Ok(Box::new(SqliteLockHandle {
                    pool: self.pool.clone(),
                    name: name.to_string(),
                    holder,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }
}

struct SqliteLockHandle {
    pool: SqlitePool,
    name: String,
    holder: String,
}

#[async_trait]
impl DistributedLockHandle for SqliteLockHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn release(self: Box<Self>) -> Result<(), LockError> {
        let query = Query::delete()
            .from_table(DistributedLocks::Table)
            .and_where(Expr::col(DistributedLocks::Name).eq(self.name.as_str()))
            .and_where(Expr::col(DistributedLocks::Holder).eq(self.holder.as_str()))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            debug!(lock = %self.name, "Lease already expired or taken over");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::connect;
    use tempfile::TempDir;

    async fn provider(dir: &TempDir, lease_ttl_secs: u64) -> SqliteLockProvider {
        let path = dir.path().join("locks.db");
        let pool = connect(path.to_str().unwrap()).await.unwrap();
        let provider = SqliteLockProvider::new(
            pool,
            LockConfig {
                lease_ttl_secs,
                poll_interval_ms: 5,
            },
        );
        provider.init().await.unwrap();
        provider
    }

    #[tokio::test]
    async fn test_held_lock_blocks_until_released() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir, 60).await;

        let held = provider.acquire("project:1", Duration::from_millis(50)).await.unwrap();
        let blocked = provider.acquire("project:1", Duration::from_millis(30)).await;
        assert!(matches!(blocked, Err(LockError::Timeout { .. })));

        held.release().await.unwrap();
        let next = provider.acquire("project:1", Duration::from_millis(50)).await.unwrap();
        assert_eq!(next.name(), "project:1");
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir, 0).await;

        let stale = provider.acquire("catlet:1", Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fresh = provider.acquire("catlet:1", Duration::from_millis(50)).await.unwrap();

        stale.release().await.unwrap();
        assert_eq!(fresh.name(), "catlet:1");
    }
}
