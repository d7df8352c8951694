//! Role-based access to projects.
//!
//! Roles are totally ordered, `Owner > Admin > Editor > Viewer`, and a user
//! holds at most one role per project. The owner's row always mirrors
//! `projects.owner_id` and only changes through [`PermissionEngine::transfer_ownership`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::db::{parse_id, parse_timestamp};
use crate::error::VaultError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Admin,
    Owner,
}

impl Role {
    pub fn rank(self) -> u8 {
        match self {
            Self::Viewer => 1,
            Self::Editor => 2,
            Self::Admin => 3,
            Self::Owner => 4,
        }
    }

    /// `true` when this role is at least as strong as `required`.
    pub fn satisfies(self, required: Role) -> bool {
        self.rank() >= required.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Editor => "editor",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }
}

impl PartialOrd for Role {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Role {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Self::Viewer),
            "editor" => Ok(Self::Editor),
            "admin" => Ok(Self::Admin),
            "owner" => Ok(Self::Owner),
            other => Err(VaultError::InvalidInput(format!("invalid role: {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPermission {
    pub id: String,
    pub user_id: String,
    pub project_id: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

fn parse_permission_row(row: &SqliteRow) -> Result<ProjectPermission, VaultError> {
    let role: String = row.try_get("role")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(ProjectPermission {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        project_id: row.try_get("project_id")?,
        role: role
            .parse()
            .map_err(|_| VaultError::Internal(format!("invalid stored role: {role}")))?,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}

/// Insert or update the single `(user, project)` row inside `conn`.
pub(crate) async fn upsert_role(
    conn: &mut SqliteConnection,
    user_id: &str,
    project_id: &str,
    role: Role,
) -> Result<(), VaultError> {
    sqlx::query(
        r#"
        INSERT INTO project_permissions (id, user_id, project_id, role, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(user_id, project_id) DO UPDATE SET role = excluded.role
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(project_id)
    .bind(role.as_str())
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PermissionEngine {
    pool: SqlitePool,
}

impl PermissionEngine {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// `false` when the user has no role on the project.
    #[tracing::instrument(skip(self))]
    pub async fn check_permission(
        &self,
        user_id: &str,
        project_id: &str,
        required: Role,
    ) -> Result<bool, VaultError> {
        Ok(self
            .get_role(user_id, project_id)
            .await?
            .is_some_and(|role| role.satisfies(required)))
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_role(&self, user_id: &str, project_id: &str) -> Result<Option<Role>, VaultError> {
        let role = sqlx::query_scalar::<_, String>(
            "SELECT role FROM project_permissions WHERE user_id = ? AND project_id = ?",
        )
        .bind(user_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        role.map(|r| {
            r.parse()
                .map_err(|_| VaultError::Internal(format!("invalid stored role: {r}")))
        })
        .transpose()
    }

    /// Create or update the user's role. `Owner` cannot be granted and the
    /// current owner's role cannot be changed here; both go through
    /// [`transfer_ownership`](Self::transfer_ownership).
    #[tracing::instrument(skip(self))]
    pub async fn grant_permission(
        &self,
        user_id: &str,
        project_id: &str,
        role: Role,
    ) -> Result<(), VaultError> {
        parse_id("user", user_id)?;
        if role == Role::Owner {
            return Err(VaultError::InvalidInput(
                "ownership is assigned with transfer_ownership".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let owner = project_owner(&mut tx, project_id).await?;
        if owner == user_id {
            return Err(VaultError::InvalidInput(
                "the project owner's role can only change through a transfer".to_string(),
            ));
        }
        ensure_user(&mut tx, user_id).await?;
        upsert_role(&mut tx, user_id, project_id, role).await?;
        tx.commit().await?;

        tracing::debug!(user_id, project_id, role = %role, "permission granted");
        Ok(())
    }

    /// `false` when there was nothing to revoke.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_permission(&self, user_id: &str, project_id: &str) -> Result<bool, VaultError> {
        if self.get_role(user_id, project_id).await? == Some(Role::Owner) {
            return Err(VaultError::CannotRevokeOwner);
        }

        let result = sqlx::query(
            "DELETE FROM project_permissions WHERE user_id = ? AND project_id = ? AND role != 'owner'",
        )
        .bind(user_id)
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        let revoked = result.rows_affected() > 0;
        if revoked {
            tracing::debug!(user_id, project_id, "permission revoked");
        }
        Ok(revoked)
    }

    /// Make `new_owner_id` the owner. The previous owner keeps `Admin`.
    /// All three writes commit together or not at all.
    #[tracing::instrument(skip(self))]
    pub async fn transfer_ownership(&self, project_id: &str, new_owner_id: &str) -> Result<(), VaultError> {
        parse_id("user", new_owner_id)?;
        let mut tx = self.pool.begin().await?;

        let previous = project_owner(&mut tx, project_id).await?;
        if previous == new_owner_id {
            return Ok(());
        }

        ensure_user(&mut tx, new_owner_id).await?;
        sqlx::query("UPDATE projects SET owner_id = ?, updated_at = ? WHERE id = ?")
            .bind(new_owner_id)
            .bind(Utc::now().to_rfc3339())
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        upsert_role(&mut tx, new_owner_id, project_id, Role::Owner).await?;
        upsert_role(&mut tx, &previous, project_id, Role::Admin).await?;

        tx.commit().await?;
        tracing::info!(project_id, previous_owner = %previous, new_owner = new_owner_id, "ownership transferred");
        Ok(())
    }

    /// Every permission on the project, strongest role first.
    #[tracing::instrument(skip(self))]
    pub async fn list_permissions(&self, project_id: &str) -> Result<Vec<ProjectPermission>, VaultError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, project_id, role, created_at
            FROM project_permissions
            WHERE project_id = ?
            ORDER BY created_at, user_id
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let mut permissions = rows
            .iter()
            .map(parse_permission_row)
            .collect::<Result<Vec<_>, _>>()?;
        permissions.sort_by(|a, b| b.role.cmp(&a.role));
        Ok(permissions)
    }
}

async fn project_owner(conn: &mut SqliteConnection, project_id: &str) -> Result<String, VaultError> {
    parse_id("project", project_id)?;
    sqlx::query_scalar::<_, String>("SELECT owner_id FROM projects WHERE id = ?")
        .bind(project_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| VaultError::NotFound(format!("project {project_id}")))
}

async fn ensure_user(conn: &mut SqliteConnection, user_id: &str) -> Result<(), VaultError> {
    sqlx::query_scalar::<_, i64>("SELECT 1 FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|_| ())
        .ok_or_else(|| VaultError::NotFound(format!("user {user_id}")))
}
