//! Master key sources for the vault
//!
//! The master key lives in the OS keystore when one is available. Otherwise
//! it is derived from a passphrase with Argon2id, using a salt kept in the
//! vault store header (see [`crate::vault`]).

use parking_lot::Mutex;
use secrecy::SecretString;
use tracing::debug;

use crate::config::{KeySourceKind, VaultConfig};
use crate::crypto::MasterKey;
use crate::error::VaultError;

/// Keychain service name used for the master key entry
pub const KEYSTORE_SERVICE: &str = "uplink";

/// Keychain account name used for the master key entry
pub const KEYSTORE_ACCOUNT: &str = "vault-master-key";

/// Secure storage for the vault master key
pub trait Keystore: Send + Sync {
    /// Fetch the stored key; `Ok(None)` when no key was stored yet
    fn load(&self) -> Result<Option<MasterKey>, VaultError>;

    /// Persist the key, replacing any previous one
    fn store(&self, key: &MasterKey) -> Result<(), VaultError>;

    /// Short name for log messages
    fn name(&self) -> &'static str;
}

/// Process-local keystore, for embedding and tests
#[derive(Default)]
pub struct MemoryKeystore {
    key: Mutex<Option<MasterKey>>,
    unavailable: bool,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A keystore that fails every call, like a headless session without
    /// a secret service
    pub fn unavailable() -> Self {
        Self {
            key: Mutex::new(None),
            unavailable: true,
        }
    }
}

impl Keystore for MemoryKeystore {
    fn load(&self) -> Result<Option<MasterKey>, VaultError> {
        if self.unavailable {
            return Err(VaultError::Keystore("memory keystore disabled".into()));
        }
        Ok(self.key.lock().clone())
    }

    fn store(&self, key: &MasterKey) -> Result<(), VaultError> {
        if self.unavailable {
            return Err(VaultError::Keystore("memory keystore disabled".into()));
        }
        *self.key.lock() = Some(key.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Platform keychain (macOS Keychain, Windows Credential Manager, Secret Service)
#[cfg(feature = "os-keystore")]
pub struct OsKeystore {
    service: String,
    account: String,
}

#[cfg(feature = "os-keystore")]
impl OsKeystore {
    pub fn new() -> Self {
        Self::with_names(KEYSTORE_SERVICE, KEYSTORE_ACCOUNT)
    }

    pub fn with_names(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, VaultError> {
        keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| VaultError::Keystore(e.to_string()))
    }
}

#[cfg(feature = "os-keystore")]
impl Default for OsKeystore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "os-keystore")]
impl Keystore for OsKeystore {
    fn load(&self) -> Result<Option<MasterKey>, VaultError> {
        match self.entry()?.get_password() {
            Ok(encoded) => MasterKey::from_hex(&encoded).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(VaultError::Keystore(e.to_string())),
        }
    }

    fn store(&self, key: &MasterKey) -> Result<(), VaultError> {
        self.entry()?
            .set_password(&key.to_hex())
            .map_err(|e| VaultError::Keystore(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "os"
    }
}

/// How a vault obtains its master key
pub enum KeySource {
    /// An explicit key
    Key(MasterKey),
    /// Argon2id over a passphrase
    Passphrase(SecretString),
    /// A keystore; a new random key is generated and stored on first use
    Keystore(Box<dyn Keystore>),
    /// Keystore first, passphrase if the keystore is unavailable
    Auto {
        keystore: Box<dyn Keystore>,
        passphrase: Option<SecretString>,
    },
}

impl KeySource {
    /// Build the key source a configuration asks for
    pub fn from_config(config: &VaultConfig) -> Result<Self, VaultError> {
        let passphrase = std::env::var(&config.passphrase_env)
            .ok()
            .filter(|p| !p.is_empty())
            .map(SecretString::new);

        match config.key_source {
            KeySourceKind::Passphrase => passphrase.map(KeySource::Passphrase).ok_or_else(|| {
                VaultError::Kdf(format!("passphrase not set in ${}", config.passphrase_env))
            }),
            KeySourceKind::Keystore => Ok(KeySource::Keystore(default_keystore()?)),
            KeySourceKind::Auto => match default_keystore() {
                Ok(keystore) => Ok(KeySource::Auto {
                    keystore,
                    passphrase,
                }),
                Err(e) => {
                    debug!("No OS keystore ({}), falling back to passphrase", e);
                    passphrase.map(KeySource::Passphrase).ok_or(e)
                }
            },
        }
    }
}

#[cfg(feature = "os-keystore")]
fn default_keystore() -> Result<Box<dyn Keystore>, VaultError> {
    Ok(Box::new(OsKeystore::new()))
}

#[cfg(not(feature = "os-keystore"))]
fn default_keystore() -> Result<Box<dyn Keystore>, VaultError> {
    Err(VaultError::Keystore("built without OS keystore support".into()))
}

/// Load the keystore's key, generating and storing one on first use
pub(crate) fn load_or_create(keystore: &dyn Keystore) -> Result<MasterKey, VaultError> {
    if let Some(key) = keystore.load()? {
        debug!("Loaded vault master key from {} keystore", keystore.name());
        return Ok(key);
    }
    let key = MasterKey::generate()?;
    keystore.store(&key)?;
    debug!("Created vault master key in {} keystore", keystore.name());
    Ok(key)
}
