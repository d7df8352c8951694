//! Layered configuration.
//!
//! Precedence (highest to lowest):
//! 1. Environment variables (`VAULTKEEP_*`)
//! 2. TOML file named by `VAULTKEEP_CONFIG`
//! 3. Built-in defaults
//!
//! Each section has a fully resolved form and a partial `*Layer` form used
//! for merging.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::VaultError;

/// Lower bound for PBKDF2 iterations accepted from configuration.
pub const MIN_HASH_ITERATIONS: u32 = 100_000;

/// Upper bound for PBKDF2 iterations, configured or read from a stored blob.
pub const MAX_HASH_ITERATIONS: u32 = 10_000_000;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:./vaultkeep.db";
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_DECRYPTION_PLACEHOLDER: &str = "[DECRYPTION_FAILED]";

const ENV_PREFIX: &str = "VAULTKEEP_";

/// Fully resolved configuration.
#[derive(Debug, Clone, Default)]
pub struct VaultConfig {
    pub database: DatabaseConfig,
    pub crypto: CryptoConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 8,
        }
    }
}

#[derive(Clone)]
pub struct CryptoConfig {
    /// PBKDF2 iterations for password hashing and key wrapping.
    pub hash_iterations: u32,
    /// Extra classifier patterns, matched case-insensitively.
    pub sensitive_patterns: Vec<String>,
    /// When set, the persisted keyring is wrapped under this password.
    pub keyring_password: Option<String>,
    /// Persist the keyring to `system_config`.
    pub persist_keys: bool,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            hash_iterations: MIN_HASH_ITERATIONS,
            sensitive_patterns: Vec::new(),
            keyring_password: None,
            persist_keys: true,
        }
    }
}

impl std::fmt::Debug for CryptoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoConfig")
            .field("hash_iterations", &self.hash_iterations)
            .field("sensitive_patterns", &self.sensitive_patterns)
            .field(
                "keyring_password",
                &self.keyring_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("persist_keys", &self.persist_keys)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Rows per transaction for bulk writes.
    pub batch_size: usize,
    /// Value shown in listings for entries that fail to decrypt.
    pub decryption_placeholder: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            decryption_placeholder: DEFAULT_DECRYPTION_PLACEHOLDER.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

/// Partial configuration, as read from one source.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VaultConfigLayer {
    pub database: DatabaseConfigLayer,
    pub crypto: CryptoConfigLayer,
    pub store: StoreConfigLayer,
    pub logging: LoggingConfigLayer,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfigLayer {
    pub url: Option<String>,
    pub max_connections: Option<u32>,
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct CryptoConfigLayer {
    pub hash_iterations: Option<u32>,
    pub sensitive_patterns: Option<Vec<String>>,
    pub keyring_password: Option<String>,
    pub persist_keys: Option<bool>,
}

impl std::fmt::Debug for CryptoConfigLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoConfigLayer")
            .field("hash_iterations", &self.hash_iterations)
            .field("sensitive_patterns", &self.sensitive_patterns)
            .field(
                "keyring_password",
                &self.keyring_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("persist_keys", &self.persist_keys)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfigLayer {
    pub batch_size: Option<usize>,
    pub decryption_placeholder: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfigLayer {
    pub level: Option<String>,
    pub json: Option<bool>,
}

macro_rules! take_some {
    ($dst:expr, $src:expr) => {
        if $src.is_some() {
            $dst = $src;
        }
    };
}

impl VaultConfigLayer {
    /// Overlay `other` on top of `self`; fields set in `other` win.
    pub fn merge(&mut self, other: VaultConfigLayer) {
        take_some!(self.database.url, other.database.url);
        take_some!(self.database.max_connections, other.database.max_connections);
        take_some!(self.crypto.hash_iterations, other.crypto.hash_iterations);
        take_some!(self.crypto.sensitive_patterns, other.crypto.sensitive_patterns);
        take_some!(self.crypto.keyring_password, other.crypto.keyring_password);
        take_some!(self.crypto.persist_keys, other.crypto.persist_keys);
        take_some!(self.store.batch_size, other.store.batch_size);
        take_some!(self.store.decryption_placeholder, other.store.decryption_placeholder);
        take_some!(self.logging.level, other.logging.level);
        take_some!(self.logging.json, other.logging.json);
    }

    /// Resolve defaults and validate.
    pub fn finalize(self) -> Result<VaultConfig, VaultError> {
        let defaults = VaultConfig::default();

        let hash_iterations = self
            .crypto
            .hash_iterations
            .unwrap_or(defaults.crypto.hash_iterations);
        if !(MIN_HASH_ITERATIONS..=MAX_HASH_ITERATIONS).contains(&hash_iterations) {
            return Err(VaultError::Config(format!(
                "crypto.hash_iterations must be between {MIN_HASH_ITERATIONS} and {MAX_HASH_ITERATIONS}"
            )));
        }

        let batch_size = self.store.batch_size.unwrap_or(defaults.store.batch_size);
        if batch_size == 0 {
            return Err(VaultError::Config(
                "store.batch_size must be positive".to_string(),
            ));
        }

        let max_connections = self
            .database
            .max_connections
            .unwrap_or(defaults.database.max_connections);
        if max_connections == 0 {
            return Err(VaultError::Config(
                "database.max_connections must be positive".to_string(),
            ));
        }

        Ok(VaultConfig {
            database: DatabaseConfig {
                url: self.database.url.unwrap_or(defaults.database.url),
                max_connections,
            },
            crypto: CryptoConfig {
                hash_iterations,
                sensitive_patterns: self.crypto.sensitive_patterns.unwrap_or_default(),
                keyring_password: self.crypto.keyring_password.filter(|p| !p.is_empty()),
                persist_keys: self
                    .crypto
                    .persist_keys
                    .unwrap_or(defaults.crypto.persist_keys),
            },
            store: StoreConfig {
                batch_size,
                decryption_placeholder: self
                    .store
                    .decryption_placeholder
                    .unwrap_or(defaults.store.decryption_placeholder),
            },
            logging: LoggingConfig {
                level: self.logging.level.unwrap_or(defaults.logging.level),
                json: self.logging.json.unwrap_or(defaults.logging.json),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Parse a TOML file into a layer.
pub fn load_toml(path: &Path) -> Result<VaultConfigLayer, VaultError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| VaultError::Config(format!("reading {}: {e}", path.display())))?;
    toml::from_str(&text)
        .map_err(|e| VaultError::Config(format!("parsing {}: {e}", path.display())))
}

/// Build a layer from `VAULTKEEP_*` variables, read through `lookup`.
pub fn env_layer<F>(lookup: F) -> Result<VaultConfigLayer, VaultError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    let mut layer = VaultConfigLayer::default();
    layer.database.url = var("DATABASE_URL");
    layer.database.max_connections = parse_var("DATABASE_MAX_CONNECTIONS", var("DATABASE_MAX_CONNECTIONS"))?;
    layer.crypto.hash_iterations = parse_var("HASH_ITERATIONS", var("HASH_ITERATIONS"))?;
    layer.crypto.sensitive_patterns = var("SENSITIVE_PATTERNS").map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    });
    layer.crypto.keyring_password = var("KEYRING_PASSWORD");
    layer.crypto.persist_keys = parse_var("PERSIST_KEYS", var("PERSIST_KEYS"))?;
    layer.store.batch_size = parse_var("BATCH_SIZE", var("BATCH_SIZE"))?;
    layer.store.decryption_placeholder = var("DECRYPTION_PLACEHOLDER");
    layer.logging.level = var("LOG_LEVEL");
    layer.logging.json = parse_var("LOG_JSON", var("LOG_JSON"))?;
    Ok(layer)
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Result<Option<T>, VaultError> {
    raw.map(|value| {
        value
            .trim()
            .parse::<T>()
            .map_err(|_| VaultError::Config(format!("{ENV_PREFIX}{name}: cannot parse {value:?}")))
    })
    .transpose()
}

/// Resolve configuration from `file` (if any) and `lookup`.
pub fn load_config_from<F>(file: Option<&Path>, lookup: F) -> Result<VaultConfig, VaultError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut merged = VaultConfigLayer::default();
    if let Some(path) = file {
        debug!(path = %path.display(), "loading configuration file");
        merged.merge(load_toml(path)?);
    }
    debug!("loading environment configuration");
    merged.merge(env_layer(lookup)?);
    merged.finalize()
}

/// Resolve configuration from the process environment.
pub fn load_config() -> Result<VaultConfig, VaultError> {
    let file = std::env::var_os(format!("{ENV_PREFIX}CONFIG")).map(std::path::PathBuf::from);
    load_config_from(file.as_deref(), |name| std::env::var(name).ok())
}
