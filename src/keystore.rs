//! Master key lifecycle: `init`, `rotate`, `import`, `shutdown`.
//!
//! The active keyring is held behind a read-mostly lock and replaced as a
//! whole (`Arc` swap), so concurrent encrypt/decrypt calls see either the
//! old keyring or the new one, never a mix. Lifecycle operations take a
//! separate async mutex and therefore never interleave.
//!
//! When persistence is enabled, the keyring is written to `system_config`
//! under [`KEYRING_CONFIG_KEY`] before it becomes active.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;

use crate::config::{CryptoConfig, MIN_HASH_ITERATIONS};
use crate::crypto::spawn_kdf;
use crate::error::{CryptoError, VaultError};
use crate::keys::{KeyInfo, Keyring, MasterKey};
use crate::system_config::SystemConfigStore;

/// `system_config` key under which the keyring blob is stored.
pub const KEYRING_CONFIG_KEY: &str = "crypto.keyring";

/// Prefix marking an unwrapped (plain) persisted keyring.
const PLAIN_PREFIX: &str = "plain:";
/// Prefix marking a password-wrapped persisted keyring.
const WRAPPED_PREFIX: &str = "wrapped:";

pub struct KeyStore {
    ring: RwLock<Option<Arc<Keyring>>>,
    lifecycle: Mutex<()>,
    persistence: Option<Arc<dyn SystemConfigStore>>,
    password: Option<String>,
    iterations: u32,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("initialized", &self.is_initialized())
            .field("persistent", &self.persistence.is_some())
            .finish_non_exhaustive()
    }
}

impl KeyStore {
    /// `persistence` is ignored when `config.persist_keys` is false.
    pub fn new(persistence: Option<Arc<dyn SystemConfigStore>>, config: &CryptoConfig) -> Self {
        Self {
            ring: RwLock::new(None),
            lifecycle: Mutex::new(()),
            persistence: persistence.filter(|_| config.persist_keys),
            password: config.keyring_password.clone(),
            iterations: config.hash_iterations,
        }
    }

    /// A store that never persists; keys live only in memory.
    pub fn ephemeral(config: &CryptoConfig) -> Self {
        Self::new(None, config)
    }

    pub fn is_initialized(&self) -> bool {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Snapshot of the current keyring.
    pub fn current(&self) -> Result<Arc<Keyring>, CryptoError> {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CryptoError::Uninitialized)
    }

    fn swap(&self, ring: Option<Arc<Keyring>>) {
        *self.ring.write().unwrap_or_else(PoisonError::into_inner) = ring;
    }

    /// Load the persisted keyring, or generate and persist a new one.
    /// Calling `init` on an initialized store is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn init(&self) -> Result<KeyInfo, VaultError> {
        let _guard = self.lifecycle.lock().await;
        if let Ok(ring) = self.current() {
            return Ok(ring.active().info());
        }

        let loaded = match &self.persistence {
            Some(store) => match store.get(KEYRING_CONFIG_KEY).await? {
                Some(blob) => Some(self.decode(blob).await?),
                None => None,
            },
            None => None,
        };

        let ring = match loaded {
            Some(ring) => {
                tracing::info!(key_id = %ring.active().id(), "loaded persisted keyring");
                Arc::new(ring)
            }
            None => {
                let ring = Arc::new(Keyring::new(MasterKey::generate()?));
                self.persist(&ring).await?;
                tracing::info!(key_id = %ring.active().id(), "generated new master key");
                ring
            }
        };

        let info = ring.active().info();
        self.swap(Some(ring));
        Ok(info)
    }

    /// Make a freshly generated key active. Retired keys stay available
    /// for decryption.
    #[tracing::instrument(skip(self))]
    pub async fn rotate(&self) -> Result<KeyInfo, VaultError> {
        let _guard = self.lifecycle.lock().await;
        let current = self.current()?;
        let previous = current.active().id().to_string();

        let ring = Arc::new(current.rotated(MasterKey::generate()?));
        self.persist(&ring).await?;

        let info = ring.active().info();
        self.swap(Some(ring));
        tracing::info!(previous_key_id = %previous, key_id = %info.id, "master key rotated");
        Ok(info)
    }

    /// Password-wrap the whole keyring for backup.
    pub fn export(&self, password: &str) -> Result<String, CryptoError> {
        self.current()?.wrap(password, self.iterations)
    }

    /// Unwrap `blob` and merge its keys in, making its active key active.
    #[tracing::instrument(skip(self, blob, password))]
    pub async fn import(&self, blob: &str, password: &str) -> Result<KeyInfo, VaultError> {
        let _guard = self.lifecycle.lock().await;
        let current = self.current()?;
        let (blob, password) = (blob.to_string(), password.to_string());
        let floor = self.min_wrap_iterations();
        let imported = spawn_kdf(move || Keyring::unwrap(&blob, &password, floor)).await?;

        let ring = Arc::new(current.merged(&imported));
        self.persist(&ring).await?;

        let info = ring.active().info();
        self.swap(Some(ring));
        tracing::info!(key_id = %info.id, "keyring imported");
        Ok(info)
    }

    /// Drop all key material. Later operations fail with `Uninitialized`
    /// until `init` runs again.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        self.swap(None);
        tracing::debug!("key store shut down");
    }

    pub fn active_key(&self) -> Result<KeyInfo, CryptoError> {
        Ok(self.current()?.active().info())
    }

    pub fn list_keys(&self) -> Result<Vec<KeyInfo>, CryptoError> {
        Ok(self.current()?.infos())
    }

    /// Lowest iteration count accepted from a wrapped blob: the configured
    /// count, capped at the configuration minimum.
    fn min_wrap_iterations(&self) -> u32 {
        self.iterations.min(MIN_HASH_ITERATIONS)
    }

    async fn persist(&self, ring: &Arc<Keyring>) -> Result<(), VaultError> {
        let Some(store) = &self.persistence else {
            return Ok(());
        };
        let blob = match &self.password {
            Some(password) => {
                let (ring, password, iterations) =
                    (Arc::clone(ring), password.clone(), self.iterations);
                let wrapped = spawn_kdf(move || ring.wrap(&password, iterations)).await?;
                format!("{WRAPPED_PREFIX}{wrapped}")
            }
            None => {
                tracing::warn!("persisting keyring without a keyring password");
                format!("{PLAIN_PREFIX}{}", ring.to_plain_blob()?)
            }
        };
        store.set(KEYRING_CONFIG_KEY, &blob).await
    }

    async fn decode(&self, blob: String) -> Result<Keyring, VaultError> {
        if let Some(wrapped) = blob.strip_prefix(WRAPPED_PREFIX) {
            let password = self.password.clone().ok_or(CryptoError::WrongPassword)?;
            let (wrapped, floor) = (wrapped.to_string(), self.min_wrap_iterations());
            spawn_kdf(move || Keyring::unwrap(&wrapped, &password, floor)).await
        } else if let Some(plain) = blob.strip_prefix(PLAIN_PREFIX) {
            Ok(Keyring::from_plain_blob(plain)?)
        } else {
            Err(CryptoError::InvalidKeyBlob.into())
        }
    }
}
