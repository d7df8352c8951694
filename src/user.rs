//! Users referenced by projects, permissions and API keys.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::crypto::spawn_kdf;
use crate::db::{parse_id, parse_timestamp};
use crate::engine::CryptoEngine;
use crate::error::VaultError;

/// Public view of a user; the password hash never leaves this module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

fn parse_user_row(row: &SqliteRow) -> Result<User, VaultError> {
    let created_at: String = row.try_get("created_at")?;
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}

#[derive(Debug, Clone)]
pub struct UserStore {
    pool: SqlitePool,
    crypto: CryptoEngine,
}

impl UserStore {
    pub fn new(pool: SqlitePool, crypto: CryptoEngine) -> Self {
        Self { pool, crypto }
    }

    /// Emails are stored lowercased; a duplicate is `Conflict`.
    #[tracing::instrument(skip(self, password))]
    pub async fn create_user(
        &self,
        email: &str,
        display_name: &str,
        password: &str,
    ) -> Result<User, VaultError> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(VaultError::InvalidInput(format!("invalid email: {email:?}")));
        }
        if password.is_empty() {
            return Err(VaultError::InvalidInput("password must not be empty".to_string()));
        }
        let display_name = match display_name.trim() {
            "" => email.clone(),
            name => name.to_string(),
        };

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let (crypto, secret) = (self.crypto.clone(), password.to_string());
        let password_hash = spawn_kdf(move || crypto.hash(&secret)).await?;

        sqlx::query(
            r#"
            INSERT INTO users (id, email, display_name, password_hash, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&email)
        .bind(&display_name)
        .bind(&password_hash)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::debug!(user_id = %id, "user created");
        Ok(User {
            id,
            email,
            display_name,
            created_at: now,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>, VaultError> {
        parse_id("user", user_id)?;
        let row = sqlx::query("SELECT id, email, display_name, created_at FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_user_row).transpose()
    }

    /// The user when `password` matches, `None` otherwise (unknown email
    /// included).
    #[tracing::instrument(skip(self, password))]
    pub async fn verify_password(&self, email: &str, password: &str) -> Result<Option<User>, VaultError> {
        let row = sqlx::query(
            "SELECT id, email, display_name, password_hash, created_at FROM users WHERE email = ?",
        )
        .bind(email.trim().to_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let hash: String = row.try_get("password_hash")?;
        let (crypto, secret) = (self.crypto.clone(), password.to_string());
        if !spawn_kdf(move || Ok(crypto.verify(&secret, &hash))).await? {
            return Ok(None);
        }
        parse_user_row(&row).map(Some)
    }
}
