use sqlx::sqlite::SqlitePool;
use vaultkeep::config::{CryptoConfig, StoreConfig};
use vaultkeep::db::testing::{insert_test_user, test_pool};
use vaultkeep::keystore::KEYRING_CONFIG_KEY;
use vaultkeep::{
    ApiKeyStore, CryptoEngine, CryptoError, ProjectStore, SetVariableOptions, UserStore,
    VariableStore, VaultError,
};

fn config(password: Option<&str>) -> CryptoConfig {
    CryptoConfig {
        hash_iterations: 1_000,
        keyring_password: password.map(str::to_string),
        ..CryptoConfig::default()
    }
}

/// Every TEXT cell of `table`, concatenated, as an attacker with a copy of
/// the database file would see it.
async fn dump(pool: &SqlitePool, table: &str, columns: &str) -> String {
    let rows: Vec<String> = sqlx::query_scalar(&format!("SELECT {columns} FROM {table}"))
        .fetch_all(pool)
        .await
        .unwrap();
    rows.join("\n")
}

#[tokio::test]
async fn database_dump_reveals_no_sensitive_values() {
    // Threat: the database file is stolen. Sensitive values, passwords and
    // API keys must not appear in it.
    let pool = test_pool().await;
    let crypto = CryptoEngine::with_pool(pool.clone(), &config(Some("keyring-pw")));
    crypto.initialize().await.unwrap();

    let users = UserStore::new(pool.clone(), crypto.clone());
    let user = users
        .create_user("ops@example.com", "Ops", "login-password-123")
        .await
        .unwrap();
    let projects = ProjectStore::new(pool.clone());
    let project = projects.create_project(&user.id, "infra", None).await.unwrap();
    let env = projects.create_environment(&project.id, "prod").await.unwrap();

    let variables = VariableStore::new(pool.clone(), crypto.clone(), &StoreConfig::default());
    variables
        .set_variable(&env.id, "STRIPE_SECRET", "sk_live_abcdef", &SetVariableOptions::default())
        .await
        .unwrap();
    let api_key = ApiKeyStore::new(pool.clone(), crypto)
        .create_api_key(&user.id, "deploy")
        .await
        .unwrap();

    let values = dump(&pool, "variables", "value").await;
    let hashes = dump(&pool, "users", "password_hash").await;
    let key_hashes = dump(&pool, "api_keys", "key_hash").await;

    assert!(!values.contains("sk_live_abcdef"));
    assert!(!hashes.contains("login-password-123"));
    assert!(!key_hashes.contains(&api_key.key));
    assert!(!key_hashes.contains(api_key.key.trim_start_matches("ak_")));
}

#[tokio::test]
async fn stolen_wrapped_keyring_needs_the_password() {
    // Threat: the system_config row holding the keyring is copied. Without
    // the keyring password it cannot be loaded.
    let pool = test_pool().await;
    let owner = CryptoEngine::with_pool(pool.clone(), &config(Some("right")));
    owner.initialize().await.unwrap();

    let blob: String = sqlx::query_scalar("SELECT value FROM system_config WHERE key = ?")
        .bind(KEYRING_CONFIG_KEY)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(blob.starts_with("wrapped:"));

    let attacker = CryptoEngine::with_pool(pool, &config(Some("guess")));
    assert!(matches!(
        attacker.initialize().await,
        Err(VaultError::Crypto(CryptoError::WrongPassword))
    ));
    let no_password = CryptoEngine::ephemeral(&config(None));
    no_password.initialize().await.unwrap();
    assert!(no_password
        .import_key(blob.trim_start_matches("wrapped:"), "")
        .await
        .is_err());
}

#[tokio::test]
async fn exported_key_opens_only_with_its_password() {
    // Threat: a backup blob leaks. Import with any other password fails and
    // leaves the importing engine's keys untouched.
    let source = CryptoEngine::ephemeral(&config(None));
    source.initialize().await.unwrap();
    let blob = source.export_key("backup-password").unwrap();

    let target = CryptoEngine::ephemeral(&config(None));
    let before = target.initialize().await.unwrap();
    assert!(matches!(
        target.import_key(&blob, "backup-passwore").await,
        Err(VaultError::Crypto(CryptoError::WrongPassword))
    ));
    assert_eq!(target.active_key().unwrap(), before);
    assert_eq!(target.list_keys().unwrap().len(), 1);
}

#[tokio::test]
async fn envelope_from_another_vault_is_rejected() {
    // Threat: an attacker with write access plants a ciphertext made under a
    // key they control. Fetching it fails instead of returning their value.
    let pool = test_pool().await;
    let owner = insert_test_user(&pool, "o@example.com").await;
    let projects = ProjectStore::new(pool.clone());
    let project = projects.create_project(&owner, "p", None).await.unwrap();
    let env = projects.create_environment(&project.id, "dev").await.unwrap();

    let crypto = CryptoEngine::ephemeral(&config(None));
    crypto.initialize().await.unwrap();
    let variables = VariableStore::new(pool.clone(), crypto, &StoreConfig::default());
    variables
        .set_variable(&env.id, "API_TOKEN", "real", &SetVariableOptions::default())
        .await
        .unwrap();

    let attacker = CryptoEngine::ephemeral(&config(None));
    attacker.initialize().await.unwrap();
    let planted = attacker.encrypt("planted").unwrap();
    sqlx::query("UPDATE variables SET value = ? WHERE key = 'API_TOKEN'")
        .bind(planted)
        .execute(&pool)
        .await
        .unwrap();

    assert!(variables.get_variable(&env.id, "API_TOKEN").await.is_err());
}
