//! SQLite OperationStore implementation.

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{format_timestamp, parse_enum, parse_timestamp};
use crate::interfaces::operation_store::{OperationStore, Result, StorageError};
use crate::operations::{
    LogEntry, Operation, OperationId, OperationStatus, OperationTask, Resource, TaskId,
    TaskReference, TaskStatus,
};
use crate::storage::schema::{
    OperationLogEntries, OperationResources, OperationTasks, Operations, CREATE_OPERATION_TABLES,
};
use crate::tasks::TypedPayload;

/// SQLite implementation of OperationStore.
pub struct SqliteOperationStore {
    pool: SqlitePool,
}

impl SqliteOperationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables if they don't exist.
    pub async fn init(&self) -> Result<()> {
        for statement in CREATE_OPERATION_TABLES {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert_operation(
        conn: &mut SqliteConnection,
        operation: &Operation,
        root_task: &OperationTask,
    ) -> Result<()> {
        let query = Query::insert()
            .into_table(Operations::Table)
            .columns([
                Operations::Id,
                Operations::Status,
                Operations::StatusMessage,
                Operations::CreatedAt,
                Operations::UpdatedAt,
            ])
            .values_panic([
                operation.id.to_string().into(),
                operation.status.as_str().into(),
                operation.status_message.clone().into(),
                format_timestamp(&operation.created_at).into(),
                format_timestamp(&operation.updated_at).into(),
            ])
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&mut *conn).await?;

        for resource in &operation.resources {
            sqlx::query(&Self::resource_insert(operation.id, resource))
                .execute(&mut *conn)
                .await?;
        }

        sqlx::query(&Self::task_insert(root_task)?)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    fn resource_insert(operation_id: OperationId, resource: &Resource) -> String {
        Query::insert()
            .into_table(OperationResources::Table)
            .columns([
                OperationResources::OperationId,
                OperationResources::ResourceType,
                OperationResources::ResourceId,
            ])
            .values_panic([
                operation_id.to_string().into(),
                resource.resource_type.as_str().into(),
                resource.id.to_string().into(),
            ])
            .on_conflict(
                OnConflict::columns([
                    OperationResources::OperationId,
                    OperationResources::ResourceType,
                    OperationResources::ResourceId,
                ])
                .do_nothing()
                .to_owned(),
            )
            .to_string(SqliteQueryBuilder)
    }

    fn task_insert(task: &OperationTask) -> Result<String> {
        let reference = task
            .reference
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let (result_type, result_data) = match &task.result {
            Some(p) => (Some(p.type_name.clone()), Some(p.data.to_string())),
            None => (None, None),
        };
        Ok(Query::insert()
            .into_table(OperationTasks::Table)
            .columns([
                OperationTasks::Id,
                OperationTasks::OperationId,
                OperationTasks::ParentTaskId,
                OperationTasks::AgentName,
                OperationTasks::CommandType,
                OperationTasks::CommandData,
                OperationTasks::Status,
                OperationTasks::ResultType,
                OperationTasks::ResultData,
                OperationTasks::Reference,
                OperationTasks::CreatedAt,
                OperationTasks::UpdatedAt,
            ])
            .values_panic([
                task.id.to_string().into(),
                task.operation_id.to_string().into(),
                task.parent_task_id.map(|id| id.to_string()).into(),
                task.agent_name.clone().into(),
                task.command.type_name.clone().into(),
                task.command.data.to_string().into(),
                task.status.as_str().into(),
                result_type.into(),
                result_data.into(),
                reference.into(),
                format_timestamp(&task.created_at).into(),
                format_timestamp(&task.updated_at).into(),
            ])
            .on_conflict(OnConflict::column(OperationTasks::Id).do_nothing().to_owned())
            .to_string(SqliteQueryBuilder))
    }

    fn row_to_task(row: &SqliteRow) -> Result<OperationTask> {
        let parent: Option<String> = row.try_get("parent_task_id")?;
        let reference: Option<String> = row.try_get("reference")?;
        let result_type: Option<String> = row.try_get("result_type")?;
        let result_data: Option<String> = row.try_get("result_data")?;
        let command_data: String = row.try_get("command_data")?;

        let result = match result_type {
            Some(type_name) => {
                let data = match result_data {
                    Some(d) => serde_json::from_str(&d)?,
                    None => serde_json::Value::Null,
                };
                Some(TypedPayload::new(type_name, data))
            }
            None => None,
        };
        let reference: Option<TaskReference> =
            reference.map(|r| serde_json::from_str(&r)).transpose()?;

        Ok(OperationTask {
            id: row.try_get::<String, _>("id")?.parse()?,
            operation_id: row.try_get::<String, _>("operation_id")?.parse()?,
            parent_task_id: parent.map(|p| p.parse()).transpose()?,
            agent_name: row.try_get("agent_name")?,
            command: TypedPayload::new(
                row.try_get::<String, _>("command_type")?,
                serde_json::from_str(&command_data)?,
            ),
            status: parse_enum(&row.try_get::<String, _>("status")?, "task status")?,
            result,
            reference,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        })
    }

    fn row_to_operation(row: &SqliteRow) -> Result<Operation> {
        Ok(Operation {
            id: row.try_get::<String, _>("id")?.parse()?,
            status: parse_enum(&row.try_get::<String, _>("status")?, "operation status")?,
            status_message: row.try_get("status_message")?,
            resources: Vec::new(),
            log_entries: Vec::new(),
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        })
    }

    async fn load_children(&self, operation: &mut Operation) -> Result<()> {
        let id = operation.id.to_string();

        let query = Query::select()
            .columns([OperationResources::ResourceType, OperationResources::ResourceId])
            .from(OperationResources::Table)
            .and_where(Expr::col(OperationResources::OperationId).eq(id.as_str()))
            .to_string(SqliteQueryBuilder);
        for row in sqlx::query(&query).fetch_all(&self.pool).await? {
            let resource_type =
                parse_enum(&row.try_get::<String, _>("resource_type")?, "resource type")?;
            let resource_id: Uuid = row.try_get::<String, _>("resource_id")?.parse()?;
            operation.resources.push(Resource::new(resource_type, resource_id));
        }
        operation.resources.sort();

        let query = Query::select()
            .columns([
                OperationLogEntries::Id,
                OperationLogEntries::TaskId,
                OperationLogEntries::Message,
                OperationLogEntries::Timestamp,
            ])
            .from(OperationLogEntries::Table)
            .and_where(Expr::col(OperationLogEntries::OperationId).eq(id.as_str()))
            .order_by(OperationLogEntries::Timestamp, Order::Asc)
            .to_string(SqliteQueryBuilder);
        for row in sqlx::query(&query).fetch_all(&self.pool).await? {
            let task_id: Option<String> = row.try_get("task_id")?;
            operation.log_entries.push(LogEntry {
                id: row.try_get::<String, _>("id")?.parse()?,
                operation_id: operation.id,
                task_id: task_id.map(|t| t.parse()).transpose()?,
                message: row.try_get("message")?,
                timestamp: parse_timestamp(&row.try_get::<String, _>("timestamp")?)?,
            });
        }
        Ok(())
    }

    async fn operation_exists(&self, id: OperationId) -> Result<bool> {
        let query = Query::select()
            .column(Operations::Id)
            .from(Operations::Table)
            .and_where(Expr::col(Operations::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);
        Ok(sqlx::query(&query).fetch_optional(&self.pool).await?.is_some())
    }

    async fn require_task(&self, id: TaskId) -> Result<()> {
        match self.get_task(id).await? {
            Some(_) => Ok(()),
            None => Err(StorageError::TaskNotFound(id)),
        }
    }
}

#[async_trait]
impl OperationStore for SqliteOperationStore {
    async fn create_operation(
        &self,
        operation: &Operation,
        root_task: &OperationTask,
    ) -> Result<()> {
        // BEGIN IMMEDIATE takes the write lock upfront so concurrent writers queue
        // instead of failing to upgrade.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match Self::insert_operation(&mut conn, operation, root_task).await {
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

    async fn get_operation(&self, id: OperationId) -> Result<Option<Operation>> {
        let query = Query::select()
            .columns([
                Operations::Id,
                Operations::Status,
                Operations::StatusMessage,
                Operations::CreatedAt,
                Operations::UpdatedAt,
            ])
            .from(Operations::Table)
            .and_where(Expr::col(Operations::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };
        let mut operation = Self::row_to_operation(&row)?;
        self.load_children(&mut operation).await?;
        Ok(Some(operation))
    }

    async fn list_operations(&self) -> Result<Vec<Operation>> {
        let query = Query::select()
            .columns([
                Operations::Id,
                Operations::Status,
                Operations::StatusMessage,
                Operations::CreatedAt,
                Operations::UpdatedAt,
            ])
            .from(Operations::Table)
            .order_by(Operations::CreatedAt, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let mut operations = Vec::with_capacity(rows.len());
        for row in rows {
            let mut operation = Self::row_to_operation(&row)?;
            self.load_children(&mut operation).await?;
            operations.push(operation);
        }
        Ok(operations)
    }

    async fn insert_task(&self, task: &OperationTask) -> Result<bool> {
        if !self.operation_exists(task.operation_id).await? {
            return Err(StorageError::OperationNotFound(task.operation_id));
        }
        let result = sqlx::query(&Self::task_insert(task)?)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<OperationTask>> {
        let query = Query::select()
            .expr(Expr::cust("*"))
            .from(OperationTasks::Table)
            .and_where(Expr::col(OperationTasks::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| Self::row_to_task(&row))
            .transpose()
    }

    async fn list_tasks(&self, operation_id: OperationId) -> Result<Vec<OperationTask>> {
        let query = Query::select()
            .expr(Expr::cust("*"))
            .from(OperationTasks::Table)
            .and_where(Expr::col(OperationTasks::OperationId).eq(operation_id.to_string()))
            .order_by(OperationTasks::CreatedAt, Order::Asc)
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(Self::row_to_task)
            .collect()
    }

    async fn accept_task(&self, id: TaskId, agent_name: &str) -> Result<bool> {
        let query = Query::update()
            .table(OperationTasks::Table)
            .values([
                (OperationTasks::Status, TaskStatus::Accepted.as_str().into()),
                (OperationTasks::AgentName, agent_name.into()),
                (OperationTasks::UpdatedAt, format_timestamp(&Utc::now()).into()),
            ])
            .and_where(Expr::col(OperationTasks::Id).eq(id.to_string()))
            .and_where(Expr::col(OperationTasks::Status).eq(TaskStatus::Created.as_str()))
            .to_string(SqliteQueryBuilder);

        if sqlx::query(&query).execute(&self.pool).await?.rows_affected() == 1 {
            return Ok(true);
        }
        self.require_task(id).await?;
        Ok(false)
    }

    async fn finish_task(
        &self,
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        result: Option<&TypedPayload>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let (result_type, result_data) = match result {
            Some(p) => (Some(p.type_name.clone()), Some(p.data.to_string())),
            None => (None, None),
        };
        let query = Query::update()
            .table(OperationTasks::Table)
            .values([
                (OperationTasks::Status, to.as_str().into()),
                (OperationTasks::ResultType, result_type.into()),
                (OperationTasks::ResultData, result_data.into()),
                (OperationTasks::UpdatedAt, format_timestamp(&Utc::now()).into()),
            ])
            .and_where(Expr::col(OperationTasks::Id).eq(id.to_string()))
            .and_where(Expr::col(OperationTasks::Status).eq(from.as_str()))
            .to_string(SqliteQueryBuilder);

        if sqlx::query(&query).execute(&self.pool).await?.rows_affected() == 1 {
            return Ok(true);
        }
        self.require_task(id).await?;
        Ok(false)
    }

    async fn transition_operation(
        &self,
        id: OperationId,
        from: OperationStatus,
        to: OperationStatus,
        message: &str,
    ) -> Result<bool> {
        let query = Query::update()
            .table(Operations::Table)
            .values([
                (Operations::Status, to.as_str().into()),
                (Operations::StatusMessage, message.into()),
                (Operations::UpdatedAt, format_timestamp(&Utc::now()).into()),
            ])
            .and_where(Expr::col(Operations::Id).eq(id.to_string()))
            .and_where(Expr::col(Operations::Status).eq(from.as_str()))
            .to_string(SqliteQueryBuilder);

        if sqlx::query(&query).execute(&self.pool).await?.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.operation_exists(id).await? {
            return Err(StorageError::OperationNotFound(id));
        }
        Ok(false)
    }

    async fn append_log_entry(&self, entry: &LogEntry) -> Result<bool> {
        if !self.operation_exists(entry.operation_id).await? {
            return Err(StorageError::OperationNotFound(entry.operation_id));
        }
        let query = Query::insert()
            .into_table(OperationLogEntries::Table)
            .columns([
                OperationLogEntries::Id,
                OperationLogEntries::OperationId,
                OperationLogEntries::TaskId,
                OperationLogEntries::Message,
                OperationLogEntries::Timestamp,
            ])
            .values_panic([
                entry.id.to_string().into(),
                entry.operation_id.to_string().into(),
                entry.task_id.map(|t| t.to_string()).into(),
                entry.message.clone().into(),
                format_timestamp(&entry.timestamp).into(),
            ])
            .on_conflict(OnConflict::column(OperationLogEntries::Id).do_nothing().to_owned())
            .to_string(SqliteQueryBuilder);

        Ok(sqlx::query(&query).execute(&self.pool).await?.rows_affected() == 1)
    }

    async fn add_resources(&self, id: OperationId, resources: &[Resource]) -> Result<()> {
        if !self.operation_exists(id).await? {
            return Err(StorageError::OperationNotFound(id));
        }
        for resource in resources {
            sqlx::query(&Self::resource_insert(id, resource))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}
