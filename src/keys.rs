//! Master keys, the keyring, and password wrapping of key material.
//!
//! Raw key bytes live only inside `MasterKey`, which is not `Clone` and is
//! zeroised on drop. A `Keyring` holds the single active key plus every
//! retired key still needed to open older envelopes; it is immutable once
//! built, so swapping keyrings is a single pointer replacement.
//!
//! ## Serialized forms
//!
//! ```text
//! keyring document  = JSON { active, keys: [{ id, created_at, material(b64) }] }
//! wrapped blob      = base64( JSON { version, kdf, iterations, salt, data } )
//! data              = AES-256-GCM( PBKDF2(password, salt), keyring document )
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::MAX_HASH_ITERATIONS;
use crate::crypto::{self, KEY_LEN, SALT_LEN};
use crate::error::CryptoError;

/// Associated data bound into every wrapped keyring blob.
const WRAP_AAD: &[u8] = b"vaultkeep:keyring:v1";

const WRAP_VERSION: u32 = 1;
const WRAP_KDF: &str = "pbkdf2-sha256";

// ---------------------------------------------------------------------------
// Master key
// ---------------------------------------------------------------------------

/// A symmetric master key with its identifier and creation time.
///
/// - Not `Clone`. Shared through `Arc` inside a `Keyring`.
/// - Zeroised on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    #[zeroize(skip)]
    id: String,
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    /// Generate a fresh key with a new id.
    pub fn generate() -> Result<Self, CryptoError> {
        let bytes = crypto::generate_random_key()?;
        Ok(Self::from_parts(uuid::Uuid::new_v4().to_string(), Utc::now(), bytes))
    }

    pub fn from_parts(id: String, created_at: DateTime<Utc>, bytes: [u8; KEY_LEN]) -> Self {
        Self {
            id,
            created_at,
            bytes,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            id: self.id.clone(),
            created_at: self.created_at,
        }
    }

    /// `pub(crate)`: raw bytes never leave the crate.
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Public description of a key: never carries key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Keyring
// ---------------------------------------------------------------------------

/// The active key plus retired keys, addressed by id.
#[derive(Debug, Clone)]
pub struct Keyring {
    active: Arc<MasterKey>,
    keys: HashMap<String, Arc<MasterKey>>,
}

impl Keyring {
    pub fn new(active: MasterKey) -> Self {
        let active = Arc::new(active);
        let mut keys = HashMap::new();
        keys.insert(active.id().to_string(), Arc::clone(&active));
        Self { active, keys }
    }

    pub fn active(&self) -> &MasterKey {
        &self.active
    }

    pub fn get(&self, id: &str) -> Option<&MasterKey> {
        self.keys.get(id).map(|k| k.as_ref())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.keys.contains_key(id)
    }

    /// A new keyring where `key` is active and every current key is retained.
    pub fn rotated(&self, key: MasterKey) -> Self {
        let active = Arc::new(key);
        let mut keys = self.keys.clone();
        keys.insert(active.id().to_string(), Arc::clone(&active));
        Self { active, keys }
    }

    /// A new keyring holding the union of both key sets, with `other`'s
    /// active key made active.
    pub fn merged(&self, other: &Keyring) -> Self {
        let mut keys = self.keys.clone();
        for (id, key) in &other.keys {
            keys.insert(id.clone(), Arc::clone(key));
        }
        Self {
            active: Arc::clone(&other.active),
            keys,
        }
    }

    /// Key descriptions, oldest first.
    pub fn infos(&self) -> Vec<KeyInfo> {
        let mut infos: Vec<KeyInfo> = self.keys.values().map(|k| k.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        infos
    }

    /// Serialize to the keyring document. The returned buffer is zeroised
    /// on drop.
    pub(crate) fn to_document(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let doc = KeyringDocument {
            active: self.active.id().to_string(),
            keys: self
                .keys
                .values()
                .map(|k| StoredKey {
                    id: k.id.clone(),
                    created_at: k.created_at,
                    material: B64.encode(k.as_bytes()),
                })
                .collect(),
        };
        serde_json::to_vec(&doc)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::InvalidKeyBlob)
    }

    pub(crate) fn from_document(bytes: &[u8]) -> Result<Self, CryptoError> {
        let doc: KeyringDocument =
            serde_json::from_slice(bytes).map_err(|_| CryptoError::InvalidKeyBlob)?;

        let mut keys = HashMap::with_capacity(doc.keys.len());
        for stored in &doc.keys {
            let raw = Zeroizing::new(
                B64.decode(stored.material.as_bytes())
                    .map_err(|_| CryptoError::InvalidKeyBlob)?,
            );
            let bytes: [u8; KEY_LEN] = raw
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKey)?;
            let key = MasterKey::from_parts(stored.id.clone(), stored.created_at, bytes);
            keys.insert(stored.id.clone(), Arc::new(key));
        }

        let active = keys
            .get(&doc.active)
            .cloned()
            .ok_or(CryptoError::InvalidKeyBlob)?;
        Ok(Self { active, keys })
    }

    /// Plain (unwrapped) persisted form: base64 of the keyring document.
    pub(crate) fn to_plain_blob(&self) -> Result<String, CryptoError> {
        Ok(B64.encode(self.to_document()?.as_slice()))
    }

    pub(crate) fn from_plain_blob(blob: &str) -> Result<Self, CryptoError> {
        let doc = Zeroizing::new(
            B64.decode(blob.trim())
                .map_err(|_| CryptoError::InvalidKeyBlob)?,
        );
        Self::from_document(&doc)
    }

    /// Wrap the whole keyring under a password-derived key.
    pub(crate) fn wrap(&self, password: &str, iterations: u32) -> Result<String, CryptoError> {
        let salt = crypto::random_bytes(SALT_LEN)?;
        let kek = derive_wrapping_key(password, &salt, iterations)?;
        let data = crypto::encrypt(&kek, &self.to_document()?, WRAP_AAD)?;

        let blob = WrappedBlob {
            version: WRAP_VERSION,
            kdf: WRAP_KDF.to_string(),
            iterations,
            salt: B64.encode(&salt),
            data: B64.encode(&data),
        };
        let json = serde_json::to_vec(&blob).map_err(|_| CryptoError::InvalidKeyBlob)?;
        Ok(B64.encode(json))
    }

    /// Reverse of [`Keyring::wrap`]. Authentication failure is reported as
    /// `WrongPassword`; anything structurally wrong as `InvalidKeyBlob`.
    ///
    /// The blob's iteration count must lie between `min_iterations` and
    /// [`MAX_HASH_ITERATIONS`]; it is checked before any derivation runs.
    pub(crate) fn unwrap(
        blob: &str,
        password: &str,
        min_iterations: u32,
    ) -> Result<Self, CryptoError> {
        let json = B64
            .decode(blob.trim())
            .map_err(|_| CryptoError::InvalidKeyBlob)?;
        let wrapped: WrappedBlob =
            serde_json::from_slice(&json).map_err(|_| CryptoError::InvalidKeyBlob)?;
        if wrapped.version != WRAP_VERSION || wrapped.kdf != WRAP_KDF {
            return Err(CryptoError::InvalidKeyBlob);
        }
        if !(min_iterations..=MAX_HASH_ITERATIONS).contains(&wrapped.iterations) {
            return Err(CryptoError::InvalidKeyBlob);
        }

        let salt = B64
            .decode(wrapped.salt.as_bytes())
            .map_err(|_| CryptoError::InvalidKeyBlob)?;
        let data = B64
            .decode(wrapped.data.as_bytes())
            .map_err(|_| CryptoError::InvalidKeyBlob)?;

        let kek = derive_wrapping_key(password, &salt, wrapped.iterations)?;
        let doc = Zeroizing::new(
            crypto::decrypt(&kek, &data, WRAP_AAD).map_err(|_| CryptoError::WrongPassword)?,
        );
        Self::from_document(&doc)
    }
}

fn derive_wrapping_key(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let mut kek = Zeroizing::new([0u8; KEY_LEN]);
    crypto::pbkdf2_derive(iterations, salt, password.as_bytes(), kek.as_mut())?;
    Ok(kek)
}

#[derive(Serialize, Deserialize)]
struct KeyringDocument {
    active: String,
    keys: Vec<StoredKey>,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredKey {
    id: String,
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
    material: String,
}

#[derive(Serialize, Deserialize)]
struct WrappedBlob {
    version: u32,
    kdf: String,
    iterations: u32,
    salt: String,
    data: String,
}
