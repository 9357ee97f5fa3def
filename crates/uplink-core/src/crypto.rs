//! Cryptographic primitives for the credential vault
//!
//! Provides:
//! - Master key generation and Argon2id passphrase derivation
//! - Per-record key derivation (BLAKE3 keyed hash of the record identity)
//! - XChaCha20-Poly1305 sealing with a detached tag, bound to the record
//!   identity through associated data

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::VaultError;
use crate::types::Protocol;
use crate::{ENCRYPTION_VERSION, LEGACY_PLAINTEXT_VERSION};

/// Symmetric key length in bytes
pub const KEY_LEN: usize = 32;

/// XChaCha20 nonce length in bytes
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length in bytes
pub const TAG_LEN: usize = 16;

/// Passphrase salt length in bytes
pub const SALT_LEN: usize = 16;

/// Domain separation for per-record keys
const RECORD_KEY_CONTEXT: &[u8] = b"uplink vault record key v1";

/// Fill a buffer from the OS entropy source
pub fn random_bytes(buf: &mut [u8]) -> Result<(), VaultError> {
    getrandom::fill(buf).map_err(|e| VaultError::Kdf(format!("entropy unavailable: {}", e)))
}

/// 256-bit key protecting every record in a vault. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Generate a fresh random key
    pub fn generate() -> Result<Self, VaultError> {
        let mut bytes = [0u8; KEY_LEN];
        random_bytes(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse the hex form stored in an OS keystore
    pub fn from_hex(encoded: &str) -> Result<Self, VaultError> {
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(encoded.trim(), &mut bytes)
            .map_err(|_| VaultError::Keystore("stored master key is malformed".into()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0))
    }

    /// Derive a key from a passphrase with Argon2id
    pub fn from_passphrase(passphrase: &SecretString, kdf: &KdfParams) -> Result<Self, VaultError> {
        if passphrase.expose_secret().is_empty() {
            return Err(VaultError::Kdf("empty passphrase".into()));
        }
        let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(KEY_LEN))
            .map_err(|e| VaultError::Kdf(e.to_string()))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut bytes = [0u8; KEY_LEN];
        argon
            .hash_password_into(passphrase.expose_secret().as_bytes(), &kdf.salt, &mut bytes)
            .map_err(|e| VaultError::Kdf(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Key used for a single record
    fn record_key(&self, account_id: &str, protocol: Protocol) -> Zeroizing<[u8; KEY_LEN]> {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(RECORD_KEY_CONTEXT);
        hasher.update(&record_aad(account_id, protocol));
        Zeroizing::new(*hasher.finalize().as_bytes())
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Argon2id parameters persisted in the store header
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    #[serde(with = "hex")]
    pub salt: Vec<u8>,
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// Fresh parameters with a random salt
    pub fn generate(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self, VaultError> {
        let mut salt = vec![0u8; SALT_LEN];
        random_bytes(&mut salt)?;
        Ok(Self {
            salt,
            memory_kib,
            iterations,
            parallelism,
        })
    }
}

/// Stored form of a secret: `{nonce, ciphertext, tag, encryption_version}`.
///
/// Version 0 is the legacy plaintext format: `ciphertext` holds the raw
/// secret and `nonce`/`tag` are empty.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub encryption_version: u8,
    #[serde(with = "hex", default)]
    pub nonce: Vec<u8>,
    #[serde(with = "hex")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex", default)]
    pub tag: Vec<u8>,
}

impl SealedSecret {
    /// Wrap a legacy plaintext secret
    pub fn legacy(plaintext: &str) -> Self {
        Self {
            encryption_version: LEGACY_PLAINTEXT_VERSION,
            nonce: Vec::new(),
            ciphertext: plaintext.as_bytes().to_vec(),
            tag: Vec::new(),
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.encryption_version == LEGACY_PLAINTEXT_VERSION
    }
}

impl std::fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedSecret")
            .field("encryption_version", &self.encryption_version)
            .field("len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

/// Associated data binding a blob to its record
fn record_aad(account_id: &str, protocol: Protocol) -> Vec<u8> {
    let mut aad = Vec::with_capacity(account_id.len() + 16);
    aad.extend_from_slice(account_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(protocol.as_str().as_bytes());
    aad.push(0);
    aad.push(ENCRYPTION_VERSION);
    aad
}

/// Encrypt a secret for one record
pub fn seal(
    key: &MasterKey,
    account_id: &str,
    protocol: Protocol,
    secret: &SecretString,
) -> Result<SealedSecret, VaultError> {
    let record_key = key.record_key(account_id, protocol);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&record_key[..]));

    let mut nonce = [0u8; NONCE_LEN];
    random_bytes(&mut nonce)?;

    let mut buffer = secret.expose_secret().as_bytes().to_vec();
    let tag = cipher
        .encrypt_in_place_detached(
            XNonce::from_slice(&nonce),
            &record_aad(account_id, protocol),
            &mut buffer,
        )
        .map_err(|_| VaultError::Write("encryption failed".into()))?;

    Ok(SealedSecret {
        encryption_version: ENCRYPTION_VERSION,
        nonce: nonce.to_vec(),
        ciphertext: buffer,
        tag: tag.to_vec(),
    })
}

/// Decrypt a record's secret, verifying integrity.
///
/// Legacy plaintext blobs are returned as-is; callers are expected to
/// migrate them.
pub fn open(
    key: &MasterKey,
    account_id: &str,
    protocol: Protocol,
    sealed: &SealedSecret,
) -> Result<SecretString, VaultError> {
    let integrity = || VaultError::Decrypt {
        account_id: account_id.to_string(),
        protocol,
    };

    let plaintext = match sealed.encryption_version {
        LEGACY_PLAINTEXT_VERSION => Zeroizing::new(sealed.ciphertext.clone()),
        ENCRYPTION_VERSION => {
            if sealed.nonce.len() != NONCE_LEN || sealed.tag.len() != TAG_LEN {
                return Err(integrity());
            }
            let record_key = key.record_key(account_id, protocol);
            let cipher = XChaCha20Poly1305::new(Key::from_slice(&record_key[..]));

            let mut buffer = Zeroizing::new(sealed.ciphertext.clone());
            cipher
                .decrypt_in_place_detached(
                    XNonce::from_slice(&sealed.nonce),
                    &record_aad(account_id, protocol),
                    buffer.as_mut_slice(),
                    Tag::from_slice(&sealed.tag),
                )
                .map_err(|_| integrity())?;
            buffer
        }
        other => {
            return Err(VaultError::Corrupt(format!(
                "unsupported encryption version {}",
                other
            )))
        }
    };

    let text = std::str::from_utf8(&plaintext).map_err(|_| integrity())?;
    Ok(SecretString::new(text.to_string()))
}
