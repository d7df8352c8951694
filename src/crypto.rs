//! Low-level cryptographic operations.
//!
//! This module and `keys` are the only places in the crate that import
//! `ring` directly. Everything else performs encryption, hashing and random
//! generation exclusively through the functions exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Key size**: 256 bits (32 bytes)
//! - **Password KDF**: PBKDF2-HMAC-SHA256
//! - **Digest / MAC**: SHA-256 / HMAC-SHA256

use std::num::NonZeroU32;

use ring::aead::{self, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, hmac, pbkdf2};

use crate::config::MAX_HASH_ITERATIONS;
use crate::error::{CryptoError, VaultError};

/// The AEAD algorithm used throughout vaultkeep.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Size of a master or derived key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Minimum salt length for password and token hashing.
pub const SALT_LEN: usize = 16;

/// A nonce generated for a single encryption operation.
/// Consumed by the seal call, so a nonce cannot be used twice.
struct OwnedNonce(Nonce);

/// Fill `buf` from the system CSPRNG.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| CryptoError::RandomnessFailure)
}

/// Return `len` fresh random bytes.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
    let mut buf = vec![0u8; len];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate a cryptographically secure random nonce.
///
/// A fresh nonce is generated for every encryption call. There is no nonce
/// caching or counter-based generation.
fn generate_nonce() -> Result<OwnedNonce, CryptoError> {
    let mut buf = [0u8; NONCE_LEN];
    fill_random(&mut buf)?;
    Ok(OwnedNonce(Nonce::assume_unique_for_key(buf)))
}

fn sealing_key(key_bytes: &[u8; KEY_LEN]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| CryptoError::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt a plaintext payload using AES-256-GCM.
///
/// `aad` is authenticated but not encrypted; decryption must present the
/// same bytes.
///
/// # Layout of returned bytes
/// ```text
/// [ nonce (12 bytes) ][ ciphertext ][ GCM tag (16 bytes) ]
/// ```
pub fn encrypt(
    key_bytes: &[u8; KEY_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = sealing_key(key_bytes)?;
    let nonce = generate_nonce()?;

    let nonce_bytes: [u8; NONCE_LEN] = *nonce.0.as_ref();

    let mut output = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(plaintext);

    // Encrypts `output[NONCE_LEN..]` in place; the tag goes on the end.
    let tag = key
        .seal_in_place_separate_tag(nonce.0, aead::Aad::from(aad), &mut output[NONCE_LEN..])
        .map_err(|_| CryptoError::EncryptionFailure)?;
    output.extend_from_slice(tag.as_ref());

    Ok(output)
}

/// Decrypt a payload produced by [`encrypt`].
///
/// If the key is wrong, the AAD differs, or the bytes have been tampered
/// with, the GCM authentication check fails and no partial plaintext is
/// returned.
pub fn decrypt(
    key_bytes: &[u8; KEY_LEN],
    sealed: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidCiphertext);
    }

    let nonce_bytes: [u8; NONCE_LEN] = sealed[..NONCE_LEN]
        .try_into()
        .map_err(|_| CryptoError::InvalidCiphertext)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let key = sealing_key(key_bytes)?;
    let mut payload = sealed[NONCE_LEN..].to_vec();

    let plaintext = key
        .open_in_place(nonce, aead::Aad::from(aad), &mut payload)
        .map_err(|_| CryptoError::InvalidCiphertext)?;

    Ok(plaintext.to_vec())
}

/// Generate a cryptographically secure random key.
pub fn generate_random_key() -> Result<[u8; KEY_LEN], CryptoError> {
    let mut key = [0u8; KEY_LEN];
    fill_random(&mut key)?;
    Ok(key)
}

fn non_zero(iterations: u32) -> Result<NonZeroU32, CryptoError> {
    if iterations > MAX_HASH_ITERATIONS {
        return Err(CryptoError::KeyDerivationFailure);
    }
    NonZeroU32::new(iterations).ok_or(CryptoError::KeyDerivationFailure)
}

/// Derive `out.len()` bytes from `secret` with PBKDF2-HMAC-SHA256.
pub fn pbkdf2_derive(
    iterations: u32,
    salt: &[u8],
    secret: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        non_zero(iterations)?,
        salt,
        secret,
        out,
    );
    Ok(())
}

/// Constant-time check of `secret` against a previously derived value.
pub fn pbkdf2_verify(iterations: u32, salt: &[u8], secret: &[u8], expected: &[u8]) -> bool {
    match non_zero(iterations) {
        Ok(n) => pbkdf2::verify(pbkdf2::PBKDF2_HMAC_SHA256, n, salt, secret, expected).is_ok(),
        Err(_) => false,
    }
}

/// Run key derivation on the blocking pool instead of an async worker.
pub(crate) async fn spawn_kdf<T, F>(work: F) -> Result<T, VaultError>
where
    F: FnOnce() -> Result<T, CryptoError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| VaultError::Internal(format!("key derivation task failed: {e}")))?
        .map_err(VaultError::from)
}

/// SHA-256 over the concatenation of `parts`.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut ctx = digest::Context::new(&digest::SHA256);
    for part in parts {
        ctx.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(ctx.finish().as_ref());
    out
}

/// HMAC-SHA256 of `message` keyed by `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, message).as_ref().to_vec()
}

/// Constant-time HMAC-SHA256 verification.
pub fn hmac_sha256_verify(key: &[u8], message: &[u8], tag: &[u8]) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::verify(&key, message, tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_aad() {
        let key = generate_random_key().unwrap();
        let sealed = encrypt(&key, b"hello", b"key-1").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 5 + TAG_LEN);
        assert_eq!(decrypt(&key, &sealed, b"key-1").unwrap(), b"hello");
    }

    #[test]
    fn aad_mismatch_fails() {
        let key = generate_random_key().unwrap();
        let sealed = encrypt(&key, b"hello", b"key-1").unwrap();
        assert_eq!(
            decrypt(&key, &sealed, b"key-2"),
            Err(CryptoError::InvalidCiphertext)
        );
    }

    #[test]
    fn truncated_input_is_rejected() {
        let key = generate_random_key().unwrap();
        assert!(decrypt(&key, &[0u8; NONCE_LEN], b"").is_err());
    }

    #[test]
    fn fresh_nonce_per_call() {
        let key = generate_random_key().unwrap();
        let a = encrypt(&key, b"same", b"").unwrap();
        let b = encrypt(&key, b"same", b"").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn pbkdf2_derive_then_verify() {
        let mut out = [0u8; 32];
        pbkdf2_derive(1_000, b"0123456789abcdef", b"pw", &mut out).unwrap();
        assert!(pbkdf2_verify(1_000, b"0123456789abcdef", b"pw", &out));
        assert!(!pbkdf2_verify(1_000, b"0123456789abcdef", b"px", &out));
        assert!(pbkdf2_derive(0, b"salt", b"pw", &mut out).is_err());
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            hex::encode(sha256(&[b"ab", b"c"])),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hmac_verify_detects_mismatch() {
        let tag = hmac_sha256(b"k", b"m");
        assert!(hmac_sha256_verify(b"k", b"m", &tag));
        assert!(!hmac_sha256_verify(b"k", b"n", &tag));
    }
}
