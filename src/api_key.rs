//! API key credentials.
//!
//! The raw key is returned once by [`ApiKeyStore::create_api_key`] and only
//! its salted hash is stored. Because each hash has its own salt there is no
//! indexed lookup: [`ApiKeyStore::verify_api_key`] checks every stored hash,
//! which is linear in the number of keys.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::db::{parse_id, parse_timestamp};
use crate::engine::{CryptoEngine, DEFAULT_API_KEY_PREFIX};
use crate::error::VaultError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Returned by [`ApiKeyStore::create_api_key`]; `key` is not retrievable later.
#[derive(Debug, Clone)]
pub struct CreatedApiKey {
    pub api_key: ApiKey,
    pub key: String,
}

fn parse_api_key_row(row: &SqliteRow) -> Result<ApiKey, VaultError> {
    let created_at: String = row.try_get("created_at")?;
    let last_used_at: Option<String> = row.try_get("last_used_at")?;
    Ok(ApiKey {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        created_at: parse_timestamp("created_at", &created_at)?,
        last_used_at: last_used_at
            .map(|s| parse_timestamp("last_used_at", &s))
            .transpose()?,
    })
}

#[derive(Debug, Clone)]
pub struct ApiKeyStore {
    pool: SqlitePool,
    crypto: CryptoEngine,
}

impl ApiKeyStore {
    pub fn new(pool: SqlitePool, crypto: CryptoEngine) -> Self {
        Self { pool, crypto }
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_api_key(&self, user_id: &str, name: &str) -> Result<CreatedApiKey, VaultError> {
        parse_id("user", user_id)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(VaultError::InvalidInput("API key name must not be empty".to_string()));
        }

        let key = self.crypto.generate_api_key(DEFAULT_API_KEY_PREFIX)?;
        let key_hash = self.crypto.secure_hash(&key)?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO api_keys (id, user_id, name, key_hash, created_at)
            SELECT ?, id, ?, ?, ? FROM users WHERE id = ?
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(&key_hash)
        .bind(now.to_rfc3339())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(VaultError::NotFound(format!("user {user_id}")));
        }

        tracing::debug!(api_key_id = %id, user_id, "API key created");
        Ok(CreatedApiKey {
            api_key: ApiKey {
                id,
                user_id: user_id.to_string(),
                name: name.to_string(),
                created_at: now,
                last_used_at: None,
            },
            key,
        })
    }

    /// The matching key, with `last_used_at` refreshed, or `None`.
    #[tracing::instrument(skip(self, raw_key))]
    pub async fn verify_api_key(&self, raw_key: &str) -> Result<Option<ApiKey>, VaultError> {
        let rows = sqlx::query(
            "SELECT id, user_id, name, key_hash, created_at, last_used_at FROM api_keys",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let key_hash: String = row.try_get("key_hash")?;
            if !self.crypto.verify_secure_hash(raw_key, &key_hash) {
                continue;
            }

            let mut api_key = parse_api_key_row(row)?;
            let now = Utc::now();
            sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
                .bind(now.to_rfc3339())
                .bind(&api_key.id)
                .execute(&self.pool)
                .await?;
            api_key.last_used_at = Some(now);
            tracing::debug!(api_key_id = %api_key.id, "API key verified");
            return Ok(Some(api_key));
        }
        Ok(None)
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_api_keys(&self, user_id: &str) -> Result<Vec<ApiKey>, VaultError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, name, created_at, last_used_at
            FROM api_keys
            WHERE user_id = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_api_key_row).collect()
    }

    /// Only deletes keys belonging to `user_id`.
    #[tracing::instrument(skip(self))]
    pub async fn delete_api_key(&self, user_id: &str, api_key_id: &str) -> Result<bool, VaultError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ? AND user_id = ?")
            .bind(api_key_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CryptoConfig;
    use crate::db::testing::{insert_test_user, test_pool};

    async fn setup() -> (ApiKeyStore, String) {
        let pool = test_pool().await;
        let user = insert_test_user(&pool, "dev@example.com").await;
        let crypto = CryptoEngine::ephemeral(&CryptoConfig {
            hash_iterations: 1_000,
            ..CryptoConfig::default()
        });
        (ApiKeyStore::new(pool, crypto), user)
    }

    #[tokio::test]
    async fn raw_key_verifies_once_created() {
        let (store, user) = setup().await;
        let created = store.create_api_key(&user, "ci").await.unwrap();
        assert!(created.key.starts_with("ak_"));

        let verified = store.verify_api_key(&created.key).await.unwrap().unwrap();
        assert_eq!(verified.id, created.api_key.id);
        assert!(verified.last_used_at.is_some());

        assert_eq!(store.verify_api_key("ak_bogus").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_and_delete_are_user_scoped() {
        let (store, user) = setup().await;
        let a = store.create_api_key(&user, "a").await.unwrap();
        store.create_api_key(&user, "b").await.unwrap();

        let names: Vec<String> = store
            .list_api_keys(&user)
            .await
            .unwrap()
            .into_iter()
            .map(|k| k.name)
            .collect();
        assert_eq!(names.len(), 2);

        let stranger = Uuid::new_v4().to_string();
        assert!(!store.delete_api_key(&stranger, &a.api_key.id).await.unwrap());
        assert!(store.delete_api_key(&user, &a.api_key.id).await.unwrap());
        assert_eq!(store.verify_api_key(&a.key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let (store, _) = setup().await;
        assert!(matches!(
            store.create_api_key(&Uuid::new_v4().to_string(), "x").await,
            Err(VaultError::NotFound(_))
        ));
    }
}
