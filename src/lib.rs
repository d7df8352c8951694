//! # vaultkeep
//!
//! Secret-storage and access-control engine for a self-hosted configuration
//! store. Users organise projects into environments; each environment holds
//! key-value variables, and the values of sensitive ones are encrypted at
//! rest.
//!
//! Three components carry the security properties:
//!
//! - [`CryptoEngine`]: AES-256-GCM envelopes under a master key held by a
//!   [`KeyStore`], password and token hashing, key rotation, export and
//!   import, sensitivity and password-strength heuristics.
//! - [`VariableStore`]: variable CRUD with encryption policy, batched
//!   writes, JSON/dotenv/YAML import and export, cross-environment copy.
//! - [`PermissionEngine`]: the `owner > admin > editor > viewer` role
//!   hierarchy per project.
//!
//! Authorization is the caller's job: check the role with
//! [`PermissionEngine::check_permission`] before calling into a store.
//!
//! ## Wiring
//!
//! ```no_run
//! # async fn run() -> Result<(), vaultkeep::VaultError> {
//! use vaultkeep::{config, db, CryptoEngine, VariableStore};
//!
//! let config = config::load_config()?;
//! let pool = db::create_pool(&config.database).await?;
//! let crypto = CryptoEngine::with_pool(pool.clone(), &config.crypto);
//! crypto.initialize().await?;
//! let variables = VariableStore::new(pool, crypto, &config.store);
//! # let _ = variables;
//! # Ok(())
//! # }
//! ```

pub(crate) mod crypto;
pub mod error;
pub mod keys;

pub mod api_key;
pub mod classify;
pub mod codec;
pub mod config;
pub mod db;
pub mod engine;
pub mod envelope;
pub mod hashing;
pub mod keystore;
pub mod logging;
pub mod permission;
pub mod project;
pub mod system_config;
pub mod user;
pub mod variable;

pub use api_key::{ApiKey, ApiKeyStore, CreatedApiKey};
pub use classify::PasswordStrength;
pub use codec::Format;
pub use config::VaultConfig;
pub use engine::CryptoEngine;
pub use error::{CryptoError, VaultError};
pub use keys::KeyInfo;
pub use keystore::KeyStore;
pub use permission::{PermissionEngine, ProjectPermission, Role};
pub use project::{Environment, Project, ProjectStore};
pub use user::{User, UserStore};
pub use variable::{ImportResult, SetVariableOptions, Variable, VariableStore};
