//! `tracing` subscriber setup for binaries embedding the engine.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::VaultError;

/// `RUST_LOG` wins over `config.level` when set.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, VaultError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| VaultError::Config(format!("invalid log level {:?}: {e}", config.level))),
    }
}

/// Install the global fmt subscriber, plain or JSON. Fails if a global
/// subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<(), VaultError> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| VaultError::Config(format!("failed to install subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_level() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "vaultkeep=loud".to_string(),
            json: false,
        };
        assert!(matches!(env_filter(&config), Err(VaultError::Config(_))));
    }

    #[test]
    fn accepts_directives() {
        let config = LoggingConfig {
            level: "vaultkeep=debug,sqlx=warn".to_string(),
            json: true,
        };
        assert!(env_filter(&config).is_ok());
    }
}
