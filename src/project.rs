//! Projects and their environments.
//!
//! Deleting a project removes its environments, their variables and all
//! permission rows through `ON DELETE CASCADE`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::db::{parse_id, parse_timestamp};
use crate::error::VaultError;
use crate::permission::{upsert_role, Role};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn parse_project_row(row: &SqliteRow) -> Result<Project, VaultError> {
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Project {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        owner_id: row.try_get("owner_id")?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn parse_environment_row(row: &SqliteRow) -> Result<Environment, VaultError> {
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Environment {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn required_name<'a>(kind: &str, name: &'a str) -> Result<&'a str, VaultError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(VaultError::InvalidInput(format!("{kind} name must not be empty")));
    }
    Ok(name)
}

#[derive(Debug, Clone)]
pub struct ProjectStore {
    pool: SqlitePool,
}

impl ProjectStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a project owned by `owner_id`. The owner's permission row is
    /// written in the same transaction.
    #[tracing::instrument(skip(self, description))]
    pub async fn create_project(
        &self,
        owner_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Project, VaultError> {
        parse_id("user", owner_id)?;
        let name = required_name("project", name)?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let owner_exists = sqlx::query_scalar::<_, i64>("SELECT 1 FROM users WHERE id = ?")
            .bind(owner_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !owner_exists {
            return Err(VaultError::NotFound(format!("user {owner_id}")));
        }

        sqlx::query(
            r#"
            INSERT INTO projects (id, name, description, owner_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(description)
        .bind(owner_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        upsert_role(&mut tx, owner_id, &id, Role::Owner).await?;
        tx.commit().await?;

        tracing::debug!(project_id = %id, owner_id, "project created");
        Ok(Project {
            id,
            name: name.to_string(),
            description: description.map(str::to_string),
            owner_id: owner_id.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>, VaultError> {
        parse_id("project", project_id)?;
        let row = sqlx::query(
            "SELECT id, name, description, owner_id, created_at, updated_at FROM projects WHERE id = ?",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_project_row).transpose()
    }

    /// Projects the user holds any role on, by name.
    #[tracing::instrument(skip(self))]
    pub async fn list_projects_for_user(&self, user_id: &str) -> Result<Vec<Project>, VaultError> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.name, p.description, p.owner_id, p.created_at, p.updated_at
            FROM projects p
            JOIN project_permissions pp ON pp.project_id = p.id
            WHERE pp.user_id = ?
            ORDER BY p.name, p.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_project_row).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_project(&self, project_id: &str) -> Result<bool, VaultError> {
        parse_id("project", project_id)?;
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            tracing::debug!(project_id, "project deleted");
        }
        Ok(deleted)
    }

    /// Names are unique per project; a duplicate is `Conflict`.
    #[tracing::instrument(skip(self))]
    pub async fn create_environment(&self, project_id: &str, name: &str) -> Result<Environment, VaultError> {
        let name = required_name("environment", name)?;
        if self.get_project(project_id).await?.is_none() {
            return Err(VaultError::NotFound(format!("project {project_id}")));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO environments (id, project_id, name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(project_id)
        .bind(name)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::debug!(environment_id = %id, project_id, name, "environment created");
        Ok(Environment {
            id,
            project_id: project_id.to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_environment(&self, env_id: &str) -> Result<Option<Environment>, VaultError> {
        parse_id("environment", env_id)?;
        let row = sqlx::query(
            "SELECT id, project_id, name, created_at, updated_at FROM environments WHERE id = ?",
        )
        .bind(env_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_environment_row).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_environments(&self, project_id: &str) -> Result<Vec<Environment>, VaultError> {
        if self.get_project(project_id).await?.is_none() {
            return Err(VaultError::NotFound(format!("project {project_id}")));
        }
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, name, created_at, updated_at
            FROM environments
            WHERE project_id = ?
            ORDER BY name
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_environment_row).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_environment(&self, env_id: &str) -> Result<bool, VaultError> {
        parse_id("environment", env_id)?;
        let result = sqlx::query("DELETE FROM environments WHERE id = ?")
            .bind(env_id)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            tracing::debug!(env_id, "environment deleted");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{insert_test_user, test_pool};

    #[tokio::test]
    async fn create_project_writes_owner_permission() {
        let pool = test_pool().await;
        let owner = insert_test_user(&pool, "owner@example.com").await;
        let store = ProjectStore::new(pool.clone());

        let project = store.create_project(&owner, " Billing ", None).await.unwrap();
        assert_eq!(project.name, "Billing");

        let role: String = sqlx::query_scalar(
            "SELECT role FROM project_permissions WHERE user_id = ? AND project_id = ?",
        )
        .bind(&owner)
        .bind(&project.id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(role, "owner");

        let listed = store.list_projects_for_user(&owner).await.unwrap();
        assert_eq!(listed, vec![project]);
    }

    #[tokio::test]
    async fn unknown_owner_leaves_nothing_behind() {
        let pool = test_pool().await;
        let store = ProjectStore::new(pool.clone());
        let ghost = Uuid::new_v4().to_string();

        assert!(matches!(
            store.create_project(&ghost, "p", None).await,
            Err(VaultError::NotFound(_))
        ));
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn environment_names_unique_per_project() {
        let pool = test_pool().await;
        let owner = insert_test_user(&pool, "o@example.com").await;
        let store = ProjectStore::new(pool);
        let a = store.create_project(&owner, "a", None).await.unwrap();
        let b = store.create_project(&owner, "b", None).await.unwrap();

        store.create_environment(&a.id, "prod").await.unwrap();
        store.create_environment(&b.id, "prod").await.unwrap();
        assert!(matches!(
            store.create_environment(&a.id, "prod").await,
            Err(VaultError::Conflict(_))
        ));
        assert!(matches!(
            store.create_environment(&a.id, "  ").await,
            Err(VaultError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn delete_project_cascades_to_environments() {
        let pool = test_pool().await;
        let owner = insert_test_user(&pool, "o@example.com").await;
        let store = ProjectStore::new(pool);
        let project = store.create_project(&owner, "p", Some("desc")).await.unwrap();
        let env = store.create_environment(&project.id, "dev").await.unwrap();

        assert!(store.delete_project(&project.id).await.unwrap());
        assert_eq!(store.get_environment(&env.id).await.unwrap(), None);
        assert!(!store.delete_project(&project.id).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_ids_are_invalid_input() {
        let store = ProjectStore::new(test_pool().await);
        assert!(matches!(
            store.get_project("not-a-uuid").await,
            Err(VaultError::InvalidInput(_))
        ));
        assert!(matches!(
            store.list_environments(&Uuid::new_v4().to_string()).await,
            Err(VaultError::NotFound(_))
        ));
    }
}
