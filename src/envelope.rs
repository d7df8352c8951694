//! The string envelope stored in place of a sensitive value.
//!
//! ```text
//! aes-256-gcm:<key_id>:<nonce b64>:<tag b64>:<ciphertext b64>
//! ```
//!
//! The key id is bound into the GCM tag as associated data, so an envelope
//! cannot be relabelled to claim a different key.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use crate::crypto::{self, NONCE_LEN, TAG_LEN};
use crate::error::CryptoError;
use crate::keys::MasterKey;

/// Algorithm label written as the first envelope field.
pub const ALGORITHM_LABEL: &str = "aes-256-gcm";

const SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    key_id: String,
    nonce: [u8; NONCE_LEN],
    tag: [u8; TAG_LEN],
    ciphertext: Vec<u8>,
}

impl Envelope {
    /// Encrypt `plaintext` under `key`.
    pub fn seal(key: &MasterKey, plaintext: &[u8]) -> Result<Self, CryptoError> {
        let sealed = crypto::encrypt(key.as_bytes(), plaintext, key.id().as_bytes())?;
        Self::from_sealed(key.id().to_string(), &sealed)
    }

    /// Decrypt with `key`. The caller picks the key by [`Envelope::key_id`].
    pub fn open(&self, key: &MasterKey) -> Result<Vec<u8>, CryptoError> {
        let mut sealed = Vec::with_capacity(NONCE_LEN + self.ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&self.nonce);
        sealed.extend_from_slice(&self.ciphertext);
        sealed.extend_from_slice(&self.tag);
        crypto::decrypt(key.as_bytes(), &sealed, self.key_id.as_bytes())
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Split `nonce || ciphertext || tag` into envelope fields.
    fn from_sealed(key_id: String, sealed: &[u8]) -> Result<Self, CryptoError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::EncryptionFailure);
        }
        let tag_start = sealed.len() - TAG_LEN;
        let nonce = sealed[..NONCE_LEN]
            .try_into()
            .map_err(|_| CryptoError::EncryptionFailure)?;
        let tag = sealed[tag_start..]
            .try_into()
            .map_err(|_| CryptoError::EncryptionFailure)?;
        Ok(Self {
            key_id,
            nonce,
            tag,
            ciphertext: sealed[NONCE_LEN..tag_start].to_vec(),
        })
    }
}

/// Cheap structural check: does `value` parse as an envelope?
pub fn is_envelope(value: &str) -> bool {
    value.starts_with(ALGORITHM_LABEL) && value.parse::<Envelope>().is_ok()
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{ALGORITHM_LABEL}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.key_id,
            B64.encode(self.nonce),
            B64.encode(self.tag),
            B64.encode(&self.ciphertext),
        )
    }
}

impl FromStr for Envelope {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(5, SEPARATOR);
        let (Some(label), Some(key_id), Some(nonce), Some(tag), Some(ciphertext)) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(CryptoError::InvalidCiphertext);
        };

        if label != ALGORITHM_LABEL || key_id.is_empty() {
            return Err(CryptoError::InvalidCiphertext);
        }

        let decode = |field: &str| {
            B64.decode(field.as_bytes())
                .map_err(|_| CryptoError::InvalidCiphertext)
        };
        let nonce: [u8; NONCE_LEN] = decode(nonce)?
            .try_into()
            .map_err(|_| CryptoError::InvalidCiphertext)?;
        let tag: [u8; TAG_LEN] = decode(tag)?
            .try_into()
            .map_err(|_| CryptoError::InvalidCiphertext)?;

        Ok(Self {
            key_id: key_id.to_string(),
            nonce,
            tag,
            ciphertext: decode(ciphertext)?,
        })
    }
}
