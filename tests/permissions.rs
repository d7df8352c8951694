use sqlx::sqlite::SqlitePool;
use vaultkeep::db::testing::{insert_test_user, test_pool};
use vaultkeep::{PermissionEngine, ProjectStore, Role, VaultError};

struct Fixture {
    pool: SqlitePool,
    engine: PermissionEngine,
    projects: ProjectStore,
    owner: String,
    project: String,
}

async fn fixture() -> Fixture {
    let pool = test_pool().await;
    let owner = insert_test_user(&pool, "owner@example.com").await;
    let projects = ProjectStore::new(pool.clone());
    let project = projects.create_project(&owner, "payments", None).await.unwrap();
    Fixture {
        engine: PermissionEngine::new(pool.clone()),
        pool,
        projects,
        owner,
        project: project.id,
    }
}

async fn stored_owner(pool: &SqlitePool, project: &str) -> String {
    sqlx::query_scalar("SELECT owner_id FROM projects WHERE id = ?")
        .bind(project)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn creator_is_owner() {
    let f = fixture().await;
    assert_eq!(
        f.engine.get_role(&f.owner, &f.project).await.unwrap(),
        Some(Role::Owner)
    );
    for role in [Role::Viewer, Role::Editor, Role::Admin, Role::Owner] {
        assert!(f.engine.check_permission(&f.owner, &f.project, role).await.unwrap());
    }
}

#[tokio::test]
async fn role_checks_are_monotonic() {
    let f = fixture().await;
    let user = insert_test_user(&f.pool, "editor@example.com").await;
    f.engine
        .grant_permission(&user, &f.project, Role::Editor)
        .await
        .unwrap();

    assert!(f.engine.check_permission(&user, &f.project, Role::Viewer).await.unwrap());
    assert!(f.engine.check_permission(&user, &f.project, Role::Editor).await.unwrap());
    assert!(!f.engine.check_permission(&user, &f.project, Role::Admin).await.unwrap());
    assert!(!f.engine.check_permission(&user, &f.project, Role::Owner).await.unwrap());
}

#[tokio::test]
async fn no_row_means_no_access() {
    let f = fixture().await;
    let stranger = insert_test_user(&f.pool, "stranger@example.com").await;
    assert!(!f.engine.check_permission(&stranger, &f.project, Role::Viewer).await.unwrap());
    assert_eq!(f.engine.get_role(&stranger, &f.project).await.unwrap(), None);
}

#[tokio::test]
async fn upgrade_from_viewer_to_admin() {
    let f = fixture().await;
    let user = insert_test_user(&f.pool, "u@example.com").await;

    f.engine.grant_permission(&user, &f.project, Role::Viewer).await.unwrap();
    assert!(!f.engine.check_permission(&user, &f.project, Role::Editor).await.unwrap());

    f.engine.grant_permission(&user, &f.project, Role::Admin).await.unwrap();
    assert!(f.engine.check_permission(&user, &f.project, Role::Editor).await.unwrap());

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM project_permissions WHERE user_id = ?")
        .bind(&user)
        .fetch_one(&f.pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn owner_cannot_be_revoked_or_regranted() {
    let f = fixture().await;
    assert!(matches!(
        f.engine.revoke_permission(&f.owner, &f.project).await,
        Err(VaultError::CannotRevokeOwner)
    ));
    assert!(matches!(
        f.engine.grant_permission(&f.owner, &f.project, Role::Viewer).await,
        Err(VaultError::InvalidInput(_))
    ));

    let user = insert_test_user(&f.pool, "u@example.com").await;
    assert!(matches!(
        f.engine.grant_permission(&user, &f.project, Role::Owner).await,
        Err(VaultError::InvalidInput(_))
    ));
    assert_eq!(
        f.engine.get_role(&f.owner, &f.project).await.unwrap(),
        Some(Role::Owner)
    );
}

#[tokio::test]
async fn revoke_semantics() {
    let f = fixture().await;
    let user = insert_test_user(&f.pool, "u@example.com").await;

    assert!(!f.engine.revoke_permission(&user, &f.project).await.unwrap());
    f.engine.grant_permission(&user, &f.project, Role::Editor).await.unwrap();
    assert!(f.engine.revoke_permission(&user, &f.project).await.unwrap());
    assert!(!f.engine.check_permission(&user, &f.project, Role::Viewer).await.unwrap());
}

#[tokio::test]
async fn grant_requires_existing_project_and_user() {
    let f = fixture().await;
    let user = insert_test_user(&f.pool, "u@example.com").await;
    let missing = uuid::Uuid::new_v4().to_string();

    assert!(matches!(
        f.engine.grant_permission(&user, &missing, Role::Viewer).await,
        Err(VaultError::NotFound(_))
    ));
    assert!(matches!(
        f.engine.grant_permission(&missing, &f.project, Role::Viewer).await,
        Err(VaultError::NotFound(_))
    ));
    assert!(matches!(
        f.engine.grant_permission("bogus", &f.project, Role::Viewer).await,
        Err(VaultError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn transfer_moves_ownership_and_demotes_previous_owner() {
    let f = fixture().await;
    let heir = insert_test_user(&f.pool, "heir@example.com").await;
    f.engine.grant_permission(&heir, &f.project, Role::Viewer).await.unwrap();

    f.engine.transfer_ownership(&f.project, &heir).await.unwrap();

    assert_eq!(stored_owner(&f.pool, &f.project).await, heir);
    assert_eq!(f.engine.get_role(&heir, &f.project).await.unwrap(), Some(Role::Owner));
    assert_eq!(f.engine.get_role(&f.owner, &f.project).await.unwrap(), Some(Role::Admin));

    assert!(f.engine.revoke_permission(&f.owner, &f.project).await.unwrap());
    assert!(matches!(
        f.engine.revoke_permission(&heir, &f.project).await,
        Err(VaultError::CannotRevokeOwner)
    ));
}

#[tokio::test]
async fn transfer_to_user_without_prior_role() {
    let f = fixture().await;
    let heir = insert_test_user(&f.pool, "heir@example.com").await;

    f.engine.transfer_ownership(&f.project, &heir).await.unwrap();
    assert_eq!(f.engine.get_role(&heir, &f.project).await.unwrap(), Some(Role::Owner));

    let permissions = f.engine.list_permissions(&f.project).await.unwrap();
    let roles: Vec<Role> = permissions.iter().map(|p| p.role).collect();
    assert_eq!(roles, vec![Role::Owner, Role::Admin]);
    assert_eq!(permissions[0].user_id, heir);
}

#[tokio::test]
async fn failed_transfer_changes_nothing() {
    let f = fixture().await;
    let ghost = uuid::Uuid::new_v4().to_string();

    assert!(matches!(
        f.engine.transfer_ownership(&f.project, &ghost).await,
        Err(VaultError::NotFound(_))
    ));
    assert_eq!(stored_owner(&f.pool, &f.project).await, f.owner);
    assert_eq!(
        f.engine.get_role(&f.owner, &f.project).await.unwrap(),
        Some(Role::Owner)
    );
    assert_eq!(f.engine.list_permissions(&f.project).await.unwrap().len(), 1);
}

#[tokio::test]
async fn deleting_project_drops_permissions() {
    let f = fixture().await;
    let user = insert_test_user(&f.pool, "u@example.com").await;
    f.engine.grant_permission(&user, &f.project, Role::Editor).await.unwrap();

    assert!(f.projects.delete_project(&f.project).await.unwrap());
    assert_eq!(f.engine.get_role(&user, &f.project).await.unwrap(), None);
    assert!(f.projects.list_projects_for_user(&user).await.unwrap().is_empty());
}
