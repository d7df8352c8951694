//! One-way hashing: passwords, opaque tokens, fingerprints.
//!
//! ```text
//! password hash   = pbkdf2_sha256$<iterations>$<salt b64>$<dk b64>
//! token hash      = hmac_sha256$<salt b64>$<tag b64>
//! fingerprint     = hex( HMAC-SHA256(salt, value) )   or hex( SHA-256(value) )
//! ```

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use crate::crypto::{self, SALT_LEN};
use crate::error::CryptoError;

const PASSWORD_SCHEME: &str = "pbkdf2_sha256";
const TOKEN_SCHEME: &str = "hmac_sha256";
const DERIVED_LEN: usize = 32;

/// Salted, iterated password hash.
pub fn hash_password(secret: &str, iterations: u32) -> Result<String, CryptoError> {
    let salt = crypto::random_bytes(SALT_LEN)?;
    let mut derived = [0u8; DERIVED_LEN];
    crypto::pbkdf2_derive(iterations, &salt, secret.as_bytes(), &mut derived)?;
    Ok(format!(
        "{PASSWORD_SCHEME}${iterations}${}${}",
        B64.encode(&salt),
        B64.encode(derived)
    ))
}

/// Check `secret` against a [`hash_password`] output. Malformed hashes
/// never verify.
pub fn verify_password(secret: &str, encoded: &str) -> bool {
    let parts: Vec<&str> = encoded.split('$').collect();
    let [scheme, iterations, salt, derived] = parts.as_slice() else {
        return false;
    };
    if *scheme != PASSWORD_SCHEME {
        return false;
    }
    let (Ok(iterations), Ok(salt), Ok(derived)) = (
        iterations.parse::<u32>(),
        B64.decode(salt.as_bytes()),
        B64.decode(derived.as_bytes()),
    ) else {
        return false;
    };
    crypto::pbkdf2_verify(iterations, &salt, secret.as_bytes(), &derived)
}

/// Fast salted one-way hash for high-entropy tokens such as API keys.
pub fn secure_hash(token: &str) -> Result<String, CryptoError> {
    let salt = crypto::random_bytes(SALT_LEN)?;
    let tag = crypto::hmac_sha256(&salt, token.as_bytes());
    Ok(format!(
        "{TOKEN_SCHEME}${}${}",
        B64.encode(&salt),
        B64.encode(tag)
    ))
}

pub fn verify_secure_hash(token: &str, encoded: &str) -> bool {
    let parts: Vec<&str> = encoded.split('$').collect();
    let [scheme, salt, tag] = parts.as_slice() else {
        return false;
    };
    if *scheme != TOKEN_SCHEME {
        return false;
    }
    match (B64.decode(salt.as_bytes()), B64.decode(tag.as_bytes())) {
        (Ok(salt), Ok(tag)) => crypto::hmac_sha256_verify(&salt, token.as_bytes(), &tag),
        _ => false,
    }
}

/// Deterministic 256-bit fingerprint, hex encoded (64 chars). No work
/// factor: not for passwords.
pub fn deterministic_hash(value: &str, salt: Option<&str>) -> String {
    match salt {
        Some(salt) => hex::encode(crypto::hmac_sha256(salt.as_bytes(), value.as_bytes())),
        None => hex::encode(crypto::sha256(&[value.as_bytes()])),
    }
}
