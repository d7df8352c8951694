//! SQLite pool construction and schema bootstrap.

mod schema;
pub mod testing;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::VaultError;

/// Create a pool with WAL mode and foreign-key enforcement, then bring the
/// schema up to date.
#[tracing::instrument(skip(config))]
pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool, VaultError> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| VaultError::Config(format!("invalid database URL: {e}")))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    tracing::debug!("database pool created");
    Ok(pool)
}

pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, VaultError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| VaultError::Internal(format!("invalid {column}: {e}")))
}

/// Validate a caller-supplied id before it reaches a query.
pub(crate) fn parse_id(kind: &str, id: &str) -> Result<Uuid, VaultError> {
    Uuid::parse_str(id).map_err(|_| VaultError::InvalidInput(format!("invalid {kind} id: {id:?}")))
}

/// Create every table the engine needs. Idempotent.
#[tracing::instrument(skip(pool))]
pub async fn migrate(pool: &SqlitePool) -> Result<(), VaultError> {
    let mut tx = pool.begin().await?;
    for statement in schema::STATEMENTS {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    tracing::debug!(statements = schema::STATEMENTS.len(), "schema ready");
    Ok(())
}
