//! SQLite implementations of storage interfaces.

mod operation_store;
mod saga_store;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;

use crate::interfaces::operation_store::{Result, StorageError};

pub use operation_store::SqliteOperationStore;
pub use saga_store::SqliteSagaStore;

/// Open (creating if needed) the database file at `path`.
pub async fn connect(path: &str) -> std::result::Result<SqlitePool, sqlx::Error> {
    SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path)).await
}

/// Fixed-width UTC timestamps, so lexical order matches time order.
pub(crate) fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidData(format!("bad timestamp '{}': {}", value, e)))
}

pub(crate) fn parse_enum<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| StorageError::InvalidData(format!("bad {} '{}'", what, value)))
}
