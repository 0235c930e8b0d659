//! Secret-box codec for persisted records.
//!
//! Uses crates from the RustCrypto ecosystem:
//! - chacha20poly1305: XChaCha20-Poly1305 authenticated encryption
//! - hkdf + sha2: HKDF-SHA256 subkey derivation
//! - rand: OS randomness for nonces
//!
//! # Security Properties
//!
//! - **Zeroize on drop**: `SecretKey` implements `ZeroizeOnDrop`, and
//!   intermediate plaintext buffers are wrapped in `Zeroizing`
//! - **Random nonces**: every seal draws a fresh 24-byte nonce, which is
//!   safe for XChaCha20 at any realistic record count
//! - **Domain separation**: each keyspace (blocks, inbox, outbox, trackers)
//!   seals with its own HKDF subkey, so a record can never be opened under
//!   another concern
//! - **All-or-nothing**: a record that fails authentication, or whose
//!   envelope version is newer than `CRYPTO_VERSION`, is reported as
//!   corrupt and never partially decoded

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ============================================================
// CONSTANTS
// ============================================================

/// Current envelope format. Must never decrease across releases.
pub const CRYPTO_VERSION: u32 = 1;

/// Secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// XChaCha20 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// HKDF salt for subkey derivation
const SUBKEY_SALT: &[u8] = b"chat-storage-subkey-v1";

// ============================================================
// ERRORS
// ============================================================

/// Error types for crypto operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Invalid authentication tag")]
    InvalidTag,
    #[error("Envelope version {0} is newer than supported")]
    VersionTooNew(u32),
    #[error("Encoding failed: {0}")]
    Encode(String),
    #[error("Decoding failed: {0}")]
    Decode(String),
}

/// Failure reported by a `KeyProvider`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("secret key unavailable: {0}")]
    Unavailable(String),
}

// ============================================================
// KEYS
// ============================================================

/// 32-byte symmetric key
/// Automatically zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; SECRET_KEY_SIZE]);

impl SecretKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Fresh random key (tests and first-run provisioning)
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; SECRET_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Get the key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.0
    }

    /// Derive the subkey used to seal one keyspace
    pub fn derive_subkey(&self, purpose: KeyPurpose) -> Result<SecretKey, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(SUBKEY_SALT), &self.0);
        let mut out = [0u8; SECRET_KEY_SIZE];
        hkdf.expand(purpose.label(), &mut out)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(SecretKey(out))
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Keyspaces that get their own subkey
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyPurpose {
    Blocks,
    Inbox,
    Outbox,
    Trackers,
}

impl KeyPurpose {
    fn label(self) -> &'static [u8] {
        match self {
            Self::Blocks => b"blocks",
            Self::Inbox => b"inbox",
            Self::Outbox => b"outbox",
            Self::Trackers => b"trackers",
        }
    }
}

/// Source of the device secret key.
///
/// Key derivation and unlocking happen outside this crate; the storage layer
/// only asks for the key at the start of each operation.
pub trait KeyProvider: Send + Sync {
    fn secret_key(&self) -> Result<SecretKey, KeyError>;
}

/// Provider holding a fixed key in memory
#[derive(Clone, Debug)]
pub struct StaticKeyProvider {
    key: SecretKey,
}

impl StaticKeyProvider {
    #[must_use]
    pub fn new(key: SecretKey) -> Self {
        Self { key }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn secret_key(&self) -> Result<SecretKey, KeyError> {
        Ok(self.key.clone())
    }
}

// ============================================================
// ENVELOPE
// ============================================================

/// Sealed record as stored on disk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        decode(bytes)
    }
}

/// Format-versioned payload inside an envelope
#[derive(Serialize, Deserialize)]
struct VersionedRecord {
    version: u32,
    payload: Vec<u8>,
}

/// Encrypt plaintext under a fresh random nonce
pub fn seal(key: &SecretKey, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(Envelope {
        version: CRYPTO_VERSION,
        nonce,
        ciphertext,
    })
}

/// Decrypt an envelope
///
/// Rejects envelopes written by a newer crypto version
pub fn open(key: &SecretKey, envelope: &Envelope) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if envelope.version > CRYPTO_VERSION {
        return Err(CryptoError::VersionTooNew(envelope.version));
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(XNonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::InvalidTag)
}

/// Serialize, version-tag and seal a record
pub fn seal_record<T: Serialize>(key: &SecretKey, version: u32, value: &T) -> Result<Vec<u8>, CryptoError> {
    let record = VersionedRecord {
        version,
        payload: encode(value)?,
    };
    let plaintext = Zeroizing::new(encode(&record)?);
    seal(key, &plaintext)?.to_bytes()
}

/// Open a sealed record
///
/// Returns `Ok(None)` when the record's format version differs from
/// `version`: the caller treats it as absent and starts from empty state.
pub fn open_record<T: DeserializeOwned>(
    key: &SecretKey,
    version: u32,
    bytes: &[u8],
) -> Result<Option<T>, CryptoError> {
    let envelope = Envelope::from_bytes(bytes)?;
    let plaintext = open(key, &envelope)?;
    let record: VersionedRecord = decode(&plaintext)?;
    if record.version != version {
        return Ok(None);
    }
    let payload = Zeroizing::new(record.payload);
    decode(&payload).map(Some)
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CryptoError::Encode(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CryptoError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| CryptoError::Decode(e.to_string()))
}
