//! The crypto engine: every cryptographic operation the stores need, in
//! one injectable handle.
//!
//! Key-dependent operations (`encrypt`, `decrypt`, `rotate_key`,
//! `export_key`, `import_key`) fail with `CryptoError::Uninitialized` until
//! [`CryptoEngine::initialize`] has run. Hashing, token generation and the
//! heuristics do not touch the master key and work at any time.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use sqlx::sqlite::SqlitePool;

use crate::classify::{self, PasswordStrength, SensitivityClassifier};
use crate::config::CryptoConfig;
use crate::crypto::{self, KEY_LEN};
use crate::envelope::{self, Envelope};
use crate::error::{CryptoError, VaultError};
use crate::hashing;
use crate::keys::KeyInfo;
use crate::keystore::KeyStore;
use crate::system_config::{SystemConfigRepository, SystemConfigStore};

pub const DEFAULT_TOKEN_LENGTH: usize = 32;
pub const DEFAULT_API_KEY_PREFIX: &str = "ak";

#[derive(Debug, Clone)]
pub struct CryptoEngine {
    keys: Arc<KeyStore>,
    classifier: SensitivityClassifier,
    hash_iterations: u32,
}

impl CryptoEngine {
    pub fn new(keys: Arc<KeyStore>, config: &CryptoConfig) -> Self {
        Self {
            keys,
            classifier: SensitivityClassifier::new(&config.sensitive_patterns),
            hash_iterations: config.hash_iterations,
        }
    }

    /// Engine whose keyring is persisted in `pool`'s `system_config` table.
    pub fn with_pool(pool: SqlitePool, config: &CryptoConfig) -> Self {
        let repo: Arc<dyn SystemConfigStore> = Arc::new(SystemConfigRepository::new(pool));
        Self::new(Arc::new(KeyStore::new(Some(repo), config)), config)
    }

    /// Engine with an in-memory keyring only.
    pub fn ephemeral(config: &CryptoConfig) -> Self {
        Self::new(Arc::new(KeyStore::ephemeral(config)), config)
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    // -----------------------------------------------------------------------
    // Key lifecycle
    // -----------------------------------------------------------------------

    pub async fn initialize(&self) -> Result<KeyInfo, VaultError> {
        self.keys.init().await
    }

    pub async fn rotate_key(&self) -> Result<KeyInfo, VaultError> {
        self.keys.rotate().await
    }

    pub fn export_key(&self, password: &str) -> Result<String, CryptoError> {
        self.keys.export(password)
    }

    /// Returns `true` once the imported key is active and persisted.
    pub async fn import_key(&self, blob: &str, password: &str) -> Result<bool, VaultError> {
        self.keys.import(blob, password).await?;
        Ok(true)
    }

    pub async fn shutdown(&self) {
        self.keys.shutdown().await
    }

    pub fn active_key(&self) -> Result<KeyInfo, CryptoError> {
        self.keys.active_key()
    }

    pub fn list_keys(&self) -> Result<Vec<KeyInfo>, CryptoError> {
        self.keys.list_keys()
    }

    // -----------------------------------------------------------------------
    // Envelopes
    // -----------------------------------------------------------------------

    /// Encrypt under the active key.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let ring = self.keys.current()?;
        Ok(Envelope::seal(ring.active(), plaintext.as_bytes())?.to_string())
    }

    /// Decrypt with whichever keyring key the envelope names.
    pub fn decrypt(&self, envelope: &str) -> Result<String, CryptoError> {
        let ring = self.keys.current()?;
        let parsed: Envelope = envelope.parse()?;
        let key = ring
            .get(parsed.key_id())
            .ok_or_else(|| CryptoError::UnknownKeyId(parsed.key_id().to_string()))?;
        let bytes = parsed.open(key)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::InvalidCiphertext)
    }

    /// Key id embedded in `envelope`, if it parses.
    pub fn envelope_key_id(&self, envelope: &str) -> Option<String> {
        envelope
            .parse::<Envelope>()
            .ok()
            .map(|e| e.key_id().to_string())
    }

    pub fn is_envelope(&self, value: &str) -> bool {
        envelope::is_envelope(value)
    }

    // -----------------------------------------------------------------------
    // Hashing
    // -----------------------------------------------------------------------

    pub fn hash(&self, secret: &str) -> Result<String, CryptoError> {
        hashing::hash_password(secret, self.hash_iterations)
    }

    pub fn verify(&self, secret: &str, hash: &str) -> bool {
        hashing::verify_password(secret, hash)
    }

    pub fn secure_hash(&self, token: &str) -> Result<String, CryptoError> {
        hashing::secure_hash(token)
    }

    pub fn verify_secure_hash(&self, token: &str, hash: &str) -> bool {
        hashing::verify_secure_hash(token, hash)
    }

    pub fn generate_deterministic_hash(&self, value: &str, salt: Option<&str>) -> String {
        hashing::deterministic_hash(value, salt)
    }

    // -----------------------------------------------------------------------
    // Random material
    // -----------------------------------------------------------------------

    /// Fresh 256-bit key, base64 encoded. Unrelated to the master key.
    pub fn generate_key(&self) -> Result<String, CryptoError> {
        let key = zeroize::Zeroizing::new(crypto::generate_random_key()?);
        debug_assert_eq!(key.len(), KEY_LEN);
        Ok(B64.encode(key.as_slice()))
    }

    /// `length` random bytes, hex encoded (`2 * length` characters).
    pub fn generate_token(&self, length: usize) -> Result<String, CryptoError> {
        Ok(hex::encode(crypto::random_bytes(length)?))
    }

    /// `<prefix>_<64 hex chars>`.
    pub fn generate_api_key(&self, prefix: &str) -> Result<String, CryptoError> {
        Ok(format!("{prefix}_{}", self.generate_token(DEFAULT_TOKEN_LENGTH)?))
    }

    // -----------------------------------------------------------------------
    // Heuristics
    // -----------------------------------------------------------------------

    pub fn is_sensitive_value(&self, text: &str, additional: &[&str]) -> bool {
        self.classifier.is_sensitive(text, additional)
    }

    pub fn validate_password_strength(&self, password: &str) -> PasswordStrength {
        classify::validate_password_strength(password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CryptoEngine {
        CryptoEngine::ephemeral(&CryptoConfig {
            hash_iterations: 1_000,
            ..CryptoConfig::default()
        })
    }

    #[tokio::test]
    async fn encrypt_requires_initialize() {
        let engine = engine();
        assert_eq!(engine.encrypt("x").unwrap_err(), CryptoError::Uninitialized);
        engine.initialize().await.unwrap();
        let env = engine.encrypt("x").unwrap();
        assert_eq!(engine.decrypt(&env).unwrap(), "x");
    }

    #[tokio::test]
    async fn rotation_keeps_old_envelopes_readable() {
        let engine = engine();
        let first = engine.initialize().await.unwrap();
        let old = engine.encrypt("before").unwrap();
        let second = engine.rotate_key().await.unwrap();
        let new = engine.encrypt("after").unwrap();

        assert_eq!(engine.envelope_key_id(&old).as_deref(), Some(first.id.as_str()));
        assert_eq!(engine.envelope_key_id(&new).as_deref(), Some(second.id.as_str()));
        assert_eq!(engine.decrypt(&old).unwrap(), "before");
        assert_eq!(engine.decrypt(&new).unwrap(), "after");
    }

    #[tokio::test]
    async fn foreign_envelope_names_unknown_key() {
        let a = engine();
        let b = engine();
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();
        let env = a.encrypt("x").unwrap();
        assert!(matches!(b.decrypt(&env), Err(CryptoError::UnknownKeyId(_))));
    }

    #[tokio::test]
    async fn export_import_moves_keys_between_engines() {
        let a = engine();
        let b = engine();
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();
        let env = a.encrypt("portable").unwrap();
        let blob = a.export_key("backup-pw").unwrap();

        assert!(matches!(
            b.import_key(&blob, "nope").await,
            Err(VaultError::Crypto(CryptoError::WrongPassword))
        ));
        assert!(b.import_key(&blob, "backup-pw").await.unwrap());
        assert_eq!(b.decrypt(&env).unwrap(), "portable");
        assert_eq!(b.active_key().unwrap(), a.active_key().unwrap());
        assert_eq!(b.list_keys().unwrap().len(), 2);
    }

    #[test]
    fn tokens_and_keys() {
        let engine = engine();
        assert_eq!(engine.generate_token(16).unwrap().len(), 32);
        let api_key = engine.generate_api_key(DEFAULT_API_KEY_PREFIX).unwrap();
        assert!(api_key.starts_with("ak_"));
        assert_eq!(api_key.len(), 3 + 64);
        let key = B64.decode(engine.generate_key().unwrap()).unwrap();
        assert_eq!(key.len(), KEY_LEN);
        assert_ne!(engine.generate_key().unwrap(), engine.generate_key().unwrap());
    }

    #[test]
    fn hashing_needs_no_master_key() {
        let engine = engine();
        let hash = engine.hash("pw").unwrap();
        assert!(engine.verify("pw", &hash));
        assert!(!engine.verify("pw2", &hash));
    }
}
