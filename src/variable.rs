//! Variable storage with encryption policy.
//!
//! Values of sensitive variables are stored as envelopes produced by the
//! [`CryptoEngine`]; every read path hands plaintext back to the caller.
//! `sensitive` and `encrypted` are stored as two independent flags: the
//! first records the classification, the second what is actually on disk.
//!
//! Authorization is not checked here. Callers run
//! [`PermissionEngine::check_permission`](crate::permission::PermissionEngine::check_permission)
//! first (`viewer` to read, `editor` to write).

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::codec::{self, Format};
use crate::config::StoreConfig;
use crate::db::{parse_id, parse_timestamp};
use crate::engine::CryptoEngine;
use crate::envelope::ALGORITHM_LABEL;
use crate::error::{CryptoError, VaultError};

const COLUMNS: &str =
    "id, environment_id, key, value, encrypted, sensitive, description, created_at, updated_at";

/// A variable as seen by callers: `value` is always plaintext, or the
/// configured placeholder when a listing could not decrypt it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub id: String,
    pub environment_id: String,
    pub key: String,
    pub value: String,
    pub encrypted: bool,
    pub sensitive: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SetVariableOptions {
    /// Overrides the name-based sensitivity heuristic.
    pub sensitive: Option<bool>,
    /// `None` keeps an existing description on update.
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportResult {
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// A row exactly as stored.
struct StoredVariable {
    id: String,
    environment_id: String,
    key: String,
    value: String,
    encrypted: bool,
    sensitive: bool,
    description: Option<String>,
    created_at: String,
    updated_at: String,
}

impl StoredVariable {
    fn from_row(row: &SqliteRow) -> Result<Self, VaultError> {
        Ok(Self {
            id: row.try_get("id")?,
            environment_id: row.try_get("environment_id")?,
            key: row.try_get("key")?,
            value: row.try_get("value")?,
            encrypted: row.try_get("encrypted")?,
            sensitive: row.try_get("sensitive")?,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_variable(self, value: String) -> Result<Variable, VaultError> {
        Ok(Variable {
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
            id: self.id,
            environment_id: self.environment_id,
            key: self.key,
            value,
            encrypted: self.encrypted,
            sensitive: self.sensitive,
            description: self.description,
        })
    }
}

/// A value ready to be written: already encrypted when it has to be.
struct PreparedValue<'a> {
    key: &'a str,
    stored: String,
    encrypted: bool,
    sensitive: bool,
    description: Option<&'a str>,
}

/// A listed row whose value could not be decrypted carries the placeholder
/// and `readable == false`.
struct Listed {
    variable: Variable,
    readable: bool,
}

#[derive(Debug, Clone)]
pub struct VariableStore {
    pool: SqlitePool,
    crypto: CryptoEngine,
    batch_size: usize,
    placeholder: String,
}

impl VariableStore {
    pub fn new(pool: SqlitePool, crypto: CryptoEngine, config: &StoreConfig) -> Self {
        Self {
            pool,
            crypto,
            batch_size: config.batch_size.max(1),
            placeholder: config.decryption_placeholder.clone(),
        }
    }

    pub fn crypto(&self) -> &CryptoEngine {
        &self.crypto
    }

    // -----------------------------------------------------------------------
    // Single-variable operations
    // -----------------------------------------------------------------------

    /// Insert or update `key` in the environment.
    ///
    /// Sensitivity comes from `options.sensitive` when given, otherwise from
    /// the key name. Sensitive values are encrypted under the active key.
    /// The returned variable carries the plaintext value.
    #[tracing::instrument(skip(self, value, options))]
    pub async fn set_variable(
        &self,
        env_id: &str,
        key: &str,
        value: &str,
        options: &SetVariableOptions,
    ) -> Result<Variable, VaultError> {
        self.ensure_environment(env_id).await?;
        let key = normalize_key(key)?;
        let sensitive = options
            .sensitive
            .unwrap_or_else(|| self.crypto.is_sensitive_value(key, &[]));
        let prepared = self.prepare(key, value, sensitive, options.description.as_deref())?;

        let mut conn = self.pool.acquire().await?;
        let row = upsert(&mut conn, env_id, &prepared).await?;
        let variable = StoredVariable::from_row(&row)?.into_variable(value.to_string())?;

        tracing::debug!(key, encrypted = variable.encrypted, "variable set");
        Ok(variable)
    }

    /// `None` when the key is absent. A value that fails to decrypt is an
    /// error here, unlike in listings.
    #[tracing::instrument(skip(self))]
    pub async fn get_variable(&self, env_id: &str, key: &str) -> Result<Option<Variable>, VaultError> {
        self.ensure_environment(env_id).await?;
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM variables WHERE environment_id = ? AND key = ?"
        ))
        .bind(env_id)
        .bind(key.trim())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let stored = StoredVariable::from_row(&row)?;
        let value = if stored.encrypted {
            self.crypto.decrypt(&stored.value)?
        } else {
            stored.value.clone()
        };
        Ok(Some(stored.into_variable(value)?))
    }

    /// All variables ordered by key, optionally filtered to keys containing
    /// `pattern` (SQL `LIKE` semantics, so ASCII case-insensitive).
    #[tracing::instrument(skip(self))]
    pub async fn list_variables(
        &self,
        env_id: &str,
        pattern: Option<&str>,
    ) -> Result<Vec<Variable>, VaultError> {
        self.ensure_environment(env_id).await?;
        let like = pattern.map(|p| format!("%{}%", like_escape(p)));
        let listed = self.list_matching(env_id, like.as_deref()).await?;
        Ok(listed.into_iter().map(|l| l.variable).collect())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_variable(&self, env_id: &str, key: &str) -> Result<bool, VaultError> {
        self.ensure_environment(env_id).await?;
        let result = sqlx::query("DELETE FROM variables WHERE environment_id = ? AND key = ?")
            .bind(env_id)
            .bind(key.trim())
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            tracing::debug!(key, "variable deleted");
        }
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Bulk operations
    // -----------------------------------------------------------------------

    /// Upsert many variables. Each batch of `store.batch_size` keys commits
    /// in its own transaction, so a failing batch leaves earlier batches in
    /// place. Blank keys are skipped. Returns the number of keys written.
    #[tracing::instrument(skip(self, entries, options), fields(count = entries.len()))]
    pub async fn set_variables(
        &self,
        env_id: &str,
        entries: &BTreeMap<String, String>,
        options: &SetVariableOptions,
    ) -> Result<usize, VaultError> {
        self.ensure_environment(env_id).await?;
        let entries: Vec<(&str, &str)> = entries
            .iter()
            .map(|(k, v)| (k.trim(), v.as_str()))
            .filter(|(k, _)| !k.is_empty())
            .collect();

        let mut processed = 0;
        for batch in entries.chunks(self.batch_size) {
            let prepared = batch
                .iter()
                .map(|(key, value)| {
                    let sensitive = options
                        .sensitive
                        .unwrap_or_else(|| self.crypto.is_sensitive_value(key, &[]));
                    self.prepare(key, value, sensitive, options.description.as_deref())
                })
                .collect::<Result<Vec<_>, _>>()?;

            let mut tx = self.pool.begin().await?;
            for item in &prepared {
                upsert(&mut tx, env_id, item).await?;
            }
            tx.commit().await?;
            processed += prepared.len();
        }

        tracing::debug!(processed, "variables set");
        Ok(processed)
    }

    /// Serialize every readable variable. Entries whose value cannot be
    /// decrypted are left out rather than exported as the placeholder.
    #[tracing::instrument(skip(self))]
    pub async fn export_variables(&self, env_id: &str, format: Format) -> Result<String, VaultError> {
        self.ensure_environment(env_id).await?;
        let listed = self.list_matching(env_id, None).await?;
        codec::export(
            listed
                .iter()
                .filter(|l| l.readable)
                .map(|l| (l.variable.key.as_str(), l.variable.value.as_str())),
            format,
        )
    }

    /// Parse `data` and set each entry. Per-entry problems, parse errors
    /// included, are collected into `errors`; the remaining entries are
    /// still imported.
    #[tracing::instrument(skip(self, data))]
    pub async fn import_variables(
        &self,
        env_id: &str,
        data: &str,
        format: Format,
    ) -> Result<ImportResult, VaultError> {
        self.ensure_environment(env_id).await?;
        let doc = codec::parse(data, format)?;

        let mut result = ImportResult {
            errors: doc.errors,
            ..ImportResult::default()
        };
        for (key, value) in &doc.entries {
            if key.trim().is_empty() {
                result.skipped += 1;
                continue;
            }
            match self
                .set_variable(env_id, key, value, &SetVariableOptions::default())
                .await
            {
                Ok(_) => result.imported += 1,
                Err(e) => result.errors.push(format!("{key}: {e}")),
            }
        }

        tracing::debug!(
            imported = result.imported,
            skipped = result.skipped,
            errors = result.errors.len(),
            "variables imported"
        );
        Ok(result)
    }

    /// Copy variables from one environment into another, batched like
    /// [`set_variables`](Self::set_variables). Encrypted values are
    /// re-encrypted under the active key. With `overwrite == false` keys
    /// that already exist in the target are left alone. Values that cannot
    /// be decrypted are not copied.
    #[tracing::instrument(skip(self))]
    pub async fn copy_variables(
        &self,
        source_env_id: &str,
        target_env_id: &str,
        overwrite: bool,
    ) -> Result<usize, VaultError> {
        self.ensure_environment(source_env_id).await?;
        self.ensure_environment(target_env_id).await?;

        let existing: HashSet<String> = if overwrite {
            HashSet::new()
        } else {
            sqlx::query_scalar::<_, String>("SELECT key FROM variables WHERE environment_id = ?")
                .bind(target_env_id)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .collect()
        };

        let source = self.list_matching(source_env_id, None).await?;
        let candidates: Vec<&Variable> = source
            .iter()
            .filter(|l| l.readable && !existing.contains(&l.variable.key))
            .map(|l| &l.variable)
            .collect();

        let mut copied = 0;
        for batch in candidates.chunks(self.batch_size) {
            let mut prepared = Vec::with_capacity(batch.len());
            for v in batch {
                let mut item =
                    self.prepare(&v.key, &v.value, v.encrypted, v.description.as_deref())?;
                item.sensitive = v.sensitive;
                prepared.push(item);
            }

            let mut tx = self.pool.begin().await?;
            for item in &prepared {
                upsert(&mut tx, target_env_id, item).await?;
            }
            tx.commit().await?;
            copied += prepared.len();
        }

        tracing::debug!(copied, "variables copied");
        Ok(copied)
    }

    /// Variables whose key starts with `prefix`, ordered by key.
    #[tracing::instrument(skip(self))]
    pub async fn get_variables_by_prefix(
        &self,
        env_id: &str,
        prefix: &str,
    ) -> Result<Vec<Variable>, VaultError> {
        self.ensure_environment(env_id).await?;
        let like = format!("{}%", like_escape(prefix));
        let listed = self.list_matching(env_id, Some(&like)).await?;
        Ok(listed.into_iter().map(|l| l.variable).collect())
    }

    /// Delete every variable whose key starts with `prefix`. An empty prefix
    /// is rejected.
    #[tracing::instrument(skip(self))]
    pub async fn delete_variables_by_prefix(
        &self,
        env_id: &str,
        prefix: &str,
    ) -> Result<u64, VaultError> {
        self.ensure_environment(env_id).await?;
        if prefix.is_empty() {
            return Err(VaultError::InvalidInput("prefix must not be empty".to_string()));
        }
        let result = sqlx::query(
            "DELETE FROM variables WHERE environment_id = ? AND key LIKE ? ESCAPE '\\'",
        )
        .bind(env_id)
        .bind(format!("{}%", like_escape(prefix)))
        .execute(&self.pool)
        .await?;

        tracing::debug!(deleted = result.rows_affected(), prefix, "variables deleted by prefix");
        Ok(result.rows_affected())
    }

    /// Rewrite every value encrypted under `old_key_id` with the active key,
    /// which must be `new_key_id`. Runs in independent batches; a value that
    /// fails to decrypt is logged and left untouched. Returns the number of
    /// rows rewritten.
    #[tracing::instrument(skip(self))]
    pub async fn reencrypt_all(&self, old_key_id: &str, new_key_id: &str) -> Result<usize, VaultError> {
        let active = self.crypto.active_key()?;
        if active.id != new_key_id {
            return Err(VaultError::InvalidInput(format!(
                "key {new_key_id} is not the active key"
            )));
        }
        if old_key_id == new_key_id {
            return Ok(0);
        }
        if !self.crypto.list_keys()?.iter().any(|k| k.id == old_key_id) {
            return Err(CryptoError::UnknownKeyId(old_key_id.to_string()).into());
        }

        let rows = sqlx::query(
            "SELECT id, key, value FROM variables WHERE encrypted = 1 AND value LIKE ? ESCAPE '\\'",
        )
        .bind(format!("{}%", like_escape(&format!("{ALGORITHM_LABEL}:{old_key_id}:"))))
        .fetch_all(&self.pool)
        .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id")?;
            let key: String = row.try_get("key")?;
            let old_value: String = row.try_get("value")?;
            match self.crypto.decrypt(&old_value) {
                Ok(plain) => {
                    let new_value = self.crypto.encrypt(&plain)?;
                    pending.push((id, old_value, new_value));
                }
                Err(e) => {
                    tracing::warn!(variable_id = %id, key = %key, error = %e, "skipping undecryptable value")
                }
            }
        }

        let mut rewritten = 0;
        for batch in pending.chunks(self.batch_size) {
            let now = Utc::now().to_rfc3339();
            let mut tx = self.pool.begin().await?;
            for (id, old_value, new_value) in batch {
                let result = sqlx::query(
                    "UPDATE variables SET value = ?, updated_at = ? WHERE id = ? AND value = ?",
                )
                .bind(new_value)
                .bind(&now)
                .bind(id)
                .bind(old_value)
                .execute(&mut *tx)
                .await?;
                rewritten += result.rows_affected() as usize;
            }
            tx.commit().await?;
        }

        tracing::info!(old_key_id, new_key_id, rewritten, "variables re-encrypted");
        Ok(rewritten)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn ensure_environment(&self, env_id: &str) -> Result<(), VaultError> {
        parse_id("environment", env_id)?;
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM environments WHERE id = ?")
            .bind(env_id)
            .fetch_optional(&self.pool)
            .await?;
        match found {
            Some(_) => Ok(()),
            None => Err(VaultError::NotFound(format!("environment {env_id}"))),
        }
    }

    fn prepare<'a>(
        &self,
        key: &'a str,
        value: &str,
        encrypt: bool,
        description: Option<&'a str>,
    ) -> Result<PreparedValue<'a>, VaultError> {
        let stored = if encrypt {
            self.crypto.encrypt(value)?
        } else {
            value.to_string()
        };
        Ok(PreparedValue {
            key,
            stored,
            encrypted: encrypt,
            sensitive: encrypt,
            description,
        })
    }

    /// Rows of the environment (optionally `key LIKE like`), decrypted
    /// leniently.
    async fn list_matching(&self, env_id: &str, like: Option<&str>) -> Result<Vec<Listed>, VaultError> {
        let rows = match like {
            Some(like) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM variables WHERE environment_id = ? AND key LIKE ? ESCAPE '\\' ORDER BY key"
                ))
                .bind(env_id)
                .bind(like)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM variables WHERE environment_id = ? ORDER BY key"
                ))
                .bind(env_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter()
            .map(|row| {
                let stored = StoredVariable::from_row(row)?;
                if !stored.encrypted {
                    let value = stored.value.clone();
                    return Ok(Listed {
                        variable: stored.into_variable(value)?,
                        readable: true,
                    });
                }
                match self.crypto.decrypt(&stored.value) {
                    Ok(value) => Ok(Listed {
                        variable: stored.into_variable(value)?,
                        readable: true,
                    }),
                    Err(e) => {
                        tracing::warn!(
                            variable_id = %stored.id,
                            key = %stored.key,
                            error = %e,
                            "failed to decrypt variable; returning placeholder"
                        );
                        Ok(Listed {
                            variable: stored.into_variable(self.placeholder.clone())?,
                            readable: false,
                        })
                    }
                }
            })
            .collect()
    }
}

fn normalize_key(key: &str) -> Result<&str, VaultError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(VaultError::InvalidInput("variable key must not be empty".to_string()));
    }
    Ok(key)
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn like_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

async fn upsert(
    conn: &mut SqliteConnection,
    env_id: &str,
    item: &PreparedValue<'_>,
) -> Result<SqliteRow, VaultError> {
    let now = Utc::now().to_rfc3339();
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO variables (id, environment_id, key, value, encrypted, sensitive, description, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(environment_id, key) DO UPDATE SET
            value = excluded.value,
            encrypted = excluded.encrypted,
            sensitive = excluded.sensitive,
            description = COALESCE(excluded.description, variables.description),
            updated_at = excluded.updated_at
        RETURNING {COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(env_id)
    .bind(item.key)
    .bind(&item.stored)
    .bind(item.encrypted)
    .bind(item.sensitive)
    .bind(item.description)
    .bind(&now)
    .bind(&now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_escape_protects_wildcards() {
        assert_eq!(like_escape("DB_"), "DB\\_");
        assert_eq!(like_escape("50%"), "50\\%");
        assert_eq!(like_escape("a\\b"), "a\\\\b");
        assert_eq!(like_escape("plain"), "plain");
    }

    #[test]
    fn keys_are_trimmed_and_required() {
        assert_eq!(normalize_key("  API_KEY ").unwrap(), "API_KEY");
        assert!(matches!(normalize_key(" \t"), Err(VaultError::InvalidInput(_))));
    }
}
