//! SQLite SagaStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::{format_timestamp, parse_timestamp};
use crate::interfaces::operation_store::{Result, StorageError};
use crate::interfaces::{SagaCommit, SagaRecord, SagaStatus, SagaStore, TaskDeadline};
use crate::operations::TaskId;
use crate::storage::schema::{Sagas, TaskDeadlines, CREATE_SAGA_TABLES};

/// SQLite implementation of SagaStore.
pub struct SqliteSagaStore {
    pool: SqlitePool,
}

impl SqliteSagaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables if they don't exist.
    pub async fn init(&self) -> Result<()> {
        for statement in CREATE_SAGA_TABLES {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn current_version(conn: &mut SqliteConnection, saga_id: TaskId) -> Result<Option<u64>> {
        let query = Query::select()
            .column(Sagas::Version)
            .from(Sagas::Table)
            .and_where(Expr::col(Sagas::SagaId).eq(saga_id.to_string()))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        Ok(match row {
            Some(row) => Some(row.try_get::<i64, _>("version")? as u64),
            None => None,
        })
    }

    async fn apply(conn: &mut SqliteConnection, commit: &SagaCommit) -> Result<()> {
        let record = &commit.record;
        let actual = Self::current_version(conn, record.saga_id).await?;
        if actual != commit.expected_version {
            return Err(StorageError::VersionConflict {
                saga_id: record.saga_id,
                expected: commit.expected_version,
                actual,
            });
        }

        let query = Query::insert()
            .into_table(Sagas::Table)
            .columns([
                Sagas::SagaId,
                Sagas::SagaType,
                Sagas::OperationId,
                Sagas::Version,
                Sagas::State,
                Sagas::Status,
                Sagas::TaskReferences,
                Sagas::Pending,
                Sagas::Outbox,
                Sagas::UpdatedAt,
            ])
            .values_panic([
                record.saga_id.to_string().into(),
                record.saga_type.clone().into(),
                record.operation_id.to_string().into(),
                (record.version as i64).into(),
                record.state.to_string().into(),
                record.status.as_str().into(),
                serde_json::to_string(&record.references)?.into(),
                serde_json::to_string(&record.pending)?.into(),
                serde_json::to_string(&record.outbox)?.into(),
                format_timestamp(&record.updated_at).into(),
            ])
            .on_conflict(
                OnConflict::column(Sagas::SagaId)
                    .update_columns([
                        Sagas::Version,
                        Sagas::State,
                        Sagas::Status,
                        Sagas::TaskReferences,
                        Sagas::Pending,
                        Sagas::Outbox,
                        Sagas::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&mut *conn).await?;

        for task_id in &commit.remove_deadlines {
            let query = Query::delete()
                .from_table(TaskDeadlines::Table)
                .and_where(Expr::col(TaskDeadlines::TaskId).eq(task_id.to_string()))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;
        }

        for deadline in &commit.add_deadlines {
            let query = Query::insert()
                .into_table(TaskDeadlines::Table)
                .columns([
                    TaskDeadlines::TaskId,
                    TaskDeadlines::SagaId,
                    TaskDeadlines::OperationId,
                    TaskDeadlines::Deadline,
                ])
                .values_panic([
                    deadline.task_id.to_string().into(),
                    deadline.saga_id.to_string().into(),
                    deadline.operation_id.to_string().into(),
                    format_timestamp(&deadline.deadline).into(),
                ])
                .on_conflict(
                    OnConflict::column(TaskDeadlines::TaskId)
                        .update_column(TaskDeadlines::Deadline)
                        .to_owned(),
                )
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;
        }

        Ok(())
    }

    fn row_to_record(row: &SqliteRow) -> Result<SagaRecord> {
        let status: String = row.try_get("status")?;
        Ok(SagaRecord {
            saga_id: row.try_get::<String, _>("saga_id")?.parse()?,
            saga_type: row.try_get("saga_type")?,
            operation_id: row.try_get::<String, _>("operation_id")?.parse()?,
            version: row.try_get::<i64, _>("version")? as u64,
            state: serde_json::from_str(&row.try_get::<String, _>("state")?)?,
            status: SagaStatus::parse(&status)
                .ok_or_else(|| StorageError::InvalidData(format!("bad saga status '{}'", status)))?,
            references: serde_json::from_str(&row.try_get::<String, _>("task_references")?)?,
            pending: serde_json::from_str(&row.try_get::<String, _>("pending")?)?,
            outbox: serde_json::from_str(&row.try_get::<String, _>("outbox")?)?,
            updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        })
    }
}

#[async_trait]
impl SagaStore for SqliteSagaStore {
    async fn load(&self, saga_id: TaskId) -> Result<Option<SagaRecord>> {
        let query = Query::select()
            .expr(Expr::cust("*"))
            .from(Sagas::Table)
            .and_where(Expr::col(Sagas::SagaId).eq(saga_id.to_string()))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| Self::row_to_record(&row))
            .transpose()
    }

    async fn commit(&self, commit: SagaCommit) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match Self::apply(&mut conn, &commit).await {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn clear_outbox(&self, saga_id: TaskId, version: u64) -> Result<bool> {
        let query = Query::update()
            .table(Sagas::Table)
            .values([(Sagas::Outbox, "[]".into())])
            .and_where(Expr::col(Sagas::SagaId).eq(saga_id.to_string()))
            .and_where(Expr::col(Sagas::Version).eq(version as i64))
            .to_string(SqliteQueryBuilder);
        Ok(sqlx::query(&query).execute(&self.pool).await?.rows_affected() == 1)
    }

    async fn expired_deadlines(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskDeadline>> {
        let query = Query::select()
            .columns([
                TaskDeadlines::TaskId,
                TaskDeadlines::SagaId,
                TaskDeadlines::OperationId,
                TaskDeadlines::Deadline,
            ])
            .from(TaskDeadlines::Table)
            .and_where(Expr::col(TaskDeadlines::Deadline).lte(format_timestamp(&now)))
            .order_by(TaskDeadlines::Deadline, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let mut deadlines = Vec::with_capacity(rows.len());
        for row in rows {
            deadlines.push(TaskDeadline {
                task_id: row.try_get::<String, _>("task_id")?.parse()?,
                saga_id: row.try_get::<String, _>("saga_id")?.parse()?,
                operation_id: row.try_get::<String, _>("operation_id")?.parse()?,
                deadline: parse_timestamp(&row.try_get::<String, _>("deadline")?)?,
            });
        }
        Ok(deadlines)
    }

    async fn remove_deadline(&self, task_id: TaskId) -> Result<()> {
        let query = Query::delete()
            .from_table(TaskDeadlines::Table)
            .and_where(Expr::col(TaskDeadlines::TaskId).eq(task_id.to_string()))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Address, Envelope};
    use crate::operations::{OperationId, TaskReference};
    use crate::storage::sqlite::connect;
    use crate::tasks::ErrorData;

    async fn store() -> (SqliteSagaStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sagas.db");
        let pool = connect(path.to_str().unwrap()).await.unwrap();
        let store = SqliteSagaStore::new(pool);
        store.init().await.unwrap();
        (store, dir)
    }

    fn record(saga_id: TaskId, version: u64) -> SagaRecord {
        SagaRecord {
            saga_id,
            saga_type: "update_catlet".to_string(),
            operation_id: OperationId::new(),
            version,
            state: serde_json::json!({"stage": "preparing_genes"}),
            status: SagaStatus::Running,
            references: vec![TaskReference::Project {
                project_id: uuid::Uuid::new_v4(),
            }],
            pending: vec![TaskId::new()],
            outbox: vec![Envelope::new(&ErrorData::new("x"), Address::controller()).unwrap()],
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_commit_load_and_clear_outbox() {
        let (store, _dir) = store().await;
        let id = TaskId::new();
        let first = record(id, 1);
        store
            .commit(SagaCommit {
                record: first.clone(),
                expected_version: None,
                add_deadlines: vec![],
                remove_deadlines: vec![],
            })
            .await
            .unwrap();

        let loaded = store.load(id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.references, first.references);
        assert_eq!(loaded.outbox.len(), 1);

        assert!(!store.clear_outbox(id, 2).await.unwrap());
        assert!(store.clear_outbox(id, 1).await.unwrap());
        assert!(store.load(id).await.unwrap().unwrap().outbox.is_empty());
    }

    #[tokio::test]
    async fn test_version_conflict_rolls_back_deadlines() {
        let (store, _dir) = store().await;
        let id = TaskId::new();
        store
            .commit(SagaCommit {
                record: record(id, 1),
                expected_version: None,
                add_deadlines: vec![],
                remove_deadlines: vec![],
            })
            .await
            .unwrap();

        let deadline = TaskDeadline {
            task_id: TaskId::new(),
            saga_id: id,
            operation_id: OperationId::new(),
            deadline: Utc::now(),
        };
        let err = store
            .commit(SagaCommit {
                record: record(id, 1),
                expected_version: None,
                add_deadlines: vec![deadline],
                remove_deadlines: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::VersionConflict { actual: Some(1), .. }));
        assert!(store.expired_deadlines(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deadlines_expire_in_order() {
        let (store, _dir) = store().await;
        use chrono::SubsecRound;

        let id = TaskId::new();
        // Stored timestamps keep microseconds.
        let now = Utc::now().trunc_subsecs(6);
        let early = TaskDeadline {
            task_id: TaskId::new(),
            saga_id: id,
            operation_id: OperationId::new(),
            deadline: now - chrono::Duration::seconds(10),
        };
        let late = TaskDeadline {
            deadline: now + chrono::Duration::seconds(60),
            task_id: TaskId::new(),
            ..early.clone()
        };
        store
            .commit(SagaCommit {
                record: record(id, 1),
                expected_version: None,
                add_deadlines: vec![late, early.clone()],
                remove_deadlines: vec![],
            })
            .await
            .unwrap();

        assert_eq!(store.expired_deadlines(now, 10).await.unwrap(), vec![early.clone()]);
        store.remove_deadline(early.task_id).await.unwrap();
        assert!(store.expired_deadlines(now, 10).await.unwrap().is_empty());
    }
}
