//! Error types for vaultkeep.
//!
//! Two layers of failure exist. `CryptoError` covers the key lifecycle and
//! the cryptographic primitives; messages signal *what* failed without
//! revealing anything about key material. `VaultError` is what store-level
//! callers see: input validation, missing rows, constraint conflicts, and
//! wrapped crypto or database failures.

/// Failures of the encryption subsystem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// An operation was invoked before `initialize`, or after `shutdown`.
    #[error("crypto engine not initialized")]
    Uninitialized,

    /// A cryptographic key was invalid (wrong length, malformed, etc.).
    #[error("invalid key")]
    InvalidKey,

    /// Encryption failed. The underlying `ring` operation returned an error.
    #[error("encryption failed")]
    EncryptionFailure,

    /// The envelope was malformed, or authentication failed (tampering or
    /// wrong key).
    #[error("invalid ciphertext")]
    InvalidCiphertext,

    /// PBKDF2 parameters were rejected.
    #[error("key derivation failed")]
    KeyDerivationFailure,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// An exported key blob failed authentication under the given password.
    #[error("wrong password")]
    WrongPassword,

    /// An exported or persisted key blob could not be parsed.
    #[error("invalid key blob")]
    InvalidKeyBlob,

    /// An envelope references a key id absent from the keyring.
    #[error("unknown key id: {0}")]
    UnknownKeyId(String),
}

/// The error type for store, permission and key-lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Malformed id, empty key, invalid role, invalid format string.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Environment, project, user or permission absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-constraint violation reported by the database.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The project owner's permission can only be moved by a transfer.
    #[error("cannot revoke the project owner's permission")]
    CannotRevokeOwner,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// A stored row could not be decoded (bad UUID, timestamp or role).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for VaultError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_string())
            }
            _ => Self::Database(err),
        }
    }
}

pub type Result<T, E = VaultError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_messages_do_not_leak_detail() {
        assert_eq!(CryptoError::InvalidCiphertext.to_string(), "invalid ciphertext");
        assert_eq!(CryptoError::WrongPassword.to_string(), "wrong password");
    }

    #[test]
    fn crypto_error_converts_transparently() {
        let err: VaultError = CryptoError::Uninitialized.into();
        assert!(matches!(err, VaultError::Crypto(CryptoError::Uninitialized)));
        assert_eq!(err.to_string(), "crypto engine not initialized");
    }

    #[test]
    fn row_not_found_stays_database_error() {
        let err: VaultError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, VaultError::Database(_)));
    }
}
