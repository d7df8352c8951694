//! Key-value repository over the `system_config` table.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;

use crate::error::VaultError;

#[async_trait]
pub trait SystemConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, VaultError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), VaultError>;
    async fn delete(&self, key: &str) -> Result<bool, VaultError>;
}

#[derive(Clone)]
pub struct SystemConfigRepository {
    pool: SqlitePool,
}

impl SystemConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SystemConfigStore for SystemConfigRepository {
    #[tracing::instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>, VaultError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM system_config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    #[tracing::instrument(skip(self, value))]
    async fn set(&self, key: &str, value: &str) -> Result<(), VaultError> {
        sqlx::query(
            r#"
            INSERT INTO system_config (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::debug!(key, "system config written");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<bool, VaultError> {
        let result = sqlx::query("DELETE FROM system_config WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
