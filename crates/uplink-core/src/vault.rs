//! Credential Vault
//!
//! Encrypted-at-rest storage for the secrets the transfer engine needs.
//!
//! # Store layout
//!
//! A single JSON document, rewritten atomically (temp file + rename) on
//! every mutation:
//!
//! ```text
//! {
//!   "format": 1,
//!   "kdf": { "salt": .., "memory_kib": .., .. },      // passphrase mode only
//!   "key_check": "..",                                 // detects a wrong master key
//!   "legacy_scan_complete": true,
//!   "pending_migration": ["ftp:alice"],
//!   "records": { "sftp:bob": { account_id, protocol, secret, created_at, .. } }
//! }
//! ```
//!
//! # Legacy migration
//!
//! Records with `encryption_version` 0 hold the secret in plaintext. Files
//! written before the migration index existed are scanned once on open;
//! afterwards only `pending_migration` is consulted. A legacy record is
//! re-encrypted on its first [`Vault::resolve`] and the rewrite is
//! all-or-nothing: if the store cannot be written, the record stays in its
//! original, readable form and migration is attempted again later.
//!
//! # Concurrency
//!
//! - Readers take a short `RwLock` read section and never touch the disk.
//! - Mutations are serialized by a writer mutex, clone the document, persist
//!   the clone, then swap it in.
//! - Decrypted secrets are cached in memory behind a short-held mutex,
//!   tagged with the sealed blob they came from. An entry is only served
//!   while the stored record still holds that blob, so a resolve racing a
//!   rotate or delete can never bring the old secret back.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Config, VaultConfig};
use crate::crypto::{self, KdfParams, MasterKey, SealedSecret};
use crate::error::VaultError;
use crate::keystore::{self, KeySource};
use crate::types::Protocol;
use crate::VAULT_FORMAT_VERSION;

/// One stored credential. The secret is only ever held sealed here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub account_id: String,
    pub protocol: Protocol,
    pub secret: SealedSecret,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<DateTime<Utc>>,
    /// Set when a legacy plaintext record was re-encrypted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    pub fn encryption_version(&self) -> u8 {
        self.secret.encryption_version
    }

    pub fn is_legacy(&self) -> bool {
        self.secret.is_legacy()
    }
}

/// Key of a record within the store
fn record_id(account_id: &str, protocol: Protocol) -> String {
    format!("{}:{}", protocol, account_id)
}

/// On-disk document
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    /// 0 for files written before versioning
    #[serde(default)]
    format: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kdf: Option<KdfParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_check: Option<String>,
    #[serde(default)]
    legacy_scan_complete: bool,
    #[serde(default)]
    pending_migration: BTreeSet<String>,
    #[serde(default)]
    records: BTreeMap<String, CredentialRecord>,
}

/// Vault counters
#[derive(Debug, Default)]
struct VaultStats {
    store_writes: AtomicU64,
    migrations: AtomicU64,
    cache_hits: AtomicU64,
}

/// Snapshot of vault statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultStatsSnapshot {
    pub records: usize,
    pub pending_migrations: usize,
    pub store_writes: u64,
    pub migrations: u64,
    pub cache_hits: u64,
}

/// A decrypted secret and the record contents it was opened from
struct CachedSecret {
    sealed: SealedSecret,
    secret: SecretString,
}

/// Encrypted credential store shared by every worker
pub struct Vault {
    path: PathBuf,
    key: MasterKey,
    state: RwLock<StoreFile>,
    writer: Mutex<()>,
    cache: Mutex<HashMap<String, CachedSecret>>,
    stats: VaultStats,
}

impl Vault {
    /// Open the vault a configuration describes
    pub fn open_with_config(config: &Config) -> Result<Self, VaultError> {
        let source = KeySource::from_config(&config.vault)?;
        Self::open(config.vault_path(), source, &config.vault)
    }

    /// Open (or create) the store at `path`
    pub fn open(
        path: impl Into<PathBuf>,
        source: KeySource,
        config: &VaultConfig,
    ) -> Result<Self, VaultError> {
        let path = path.into();
        let existed = path.exists();
        let mut file = if existed {
            read_store(&path)?
        } else {
            StoreFile::default()
        };
        let mut dirty = !existed;

        let key = match source {
            KeySource::Key(key) => key,
            KeySource::Passphrase(passphrase) => {
                dirty |= file.kdf.is_none();
                passphrase_key(&mut file, &passphrase, config)?
            }
            KeySource::Keystore(keystore) => keystore::load_or_create(keystore.as_ref())?,
            KeySource::Auto {
                keystore,
                passphrase,
            } => match keystore::load_or_create(keystore.as_ref()) {
                Ok(key) => key,
                Err(e) => match passphrase {
                    Some(passphrase) => {
                        warn!("Keystore unavailable ({}), using passphrase-derived key", e);
                        dirty |= file.kdf.is_none();
                        passphrase_key(&mut file, &passphrase, config)?
                    }
                    None => return Err(e),
                },
            },
        };

        let check = key_check(&key);
        match &file.key_check {
            Some(stored) if *stored != check => return Err(VaultError::WrongKey),
            Some(_) => {}
            None => {
                file.key_check = Some(check);
                dirty = true;
            }
        }

        if !file.legacy_scan_complete {
            file.pending_migration = file
                .records
                .iter()
                .filter(|(_, record)| record.is_legacy())
                .map(|(id, _)| id.clone())
                .collect();
            file.legacy_scan_complete = true;
            file.format = VAULT_FORMAT_VERSION;
            dirty = true;
            if !file.pending_migration.is_empty() {
                info!(
                    "Found {} legacy credential(s) awaiting migration",
                    file.pending_migration.len()
                );
            }
        }

        let vault = Self {
            path,
            key,
            state: RwLock::new(StoreFile::default()),
            writer: Mutex::new(()),
            cache: Mutex::new(HashMap::new()),
            stats: VaultStats::default(),
        };
        if dirty {
            vault.persist(&file)?;
        }
        *vault.state.write() = file;

        debug!("Opened vault at {:?}", vault.path);
        Ok(vault)
    }

    /// Encrypt and store a secret, replacing any existing one
    pub fn store(
        &self,
        account_id: &str,
        protocol: Protocol,
        secret: SecretString,
    ) -> Result<CredentialRecord, VaultError> {
        let id = record_id(account_id, protocol);
        let sealed = crypto::seal(&self.key, account_id, protocol, &secret)?;

        let record = self.mutate(|file| {
            let now = Utc::now();
            let record = match file.records.get(&id) {
                Some(existing) => CredentialRecord {
                    secret: sealed,
                    rotated_at: Some(now),
                    ..existing.clone()
                },
                None => CredentialRecord {
                    account_id: account_id.to_string(),
                    protocol,
                    secret: sealed,
                    created_at: now,
                    rotated_at: None,
                    migrated_at: None,
                },
            };
            file.pending_migration.remove(&id);
            file.records.insert(id.clone(), record.clone());
            Ok(record)
        })?;

        self.remember(&id, &record.secret, secret);
        info!("Stored credential {}", id);
        Ok(record)
    }

    /// Decrypt a stored secret, migrating a legacy record on first access
    pub fn resolve(&self, account_id: &str, protocol: Protocol) -> Result<SecretString, VaultError> {
        let id = record_id(account_id, protocol);
        if let Some(secret) = self.cached(&id) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(secret);
        }

        let record = self
            .state
            .read()
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| VaultError::NotFound {
                account_id: account_id.to_string(),
                protocol,
            })?;

        let secret = crypto::open(&self.key, account_id, protocol, &record.secret)?;

        if record.is_legacy() {
            if let Err(e) = self.migrate_record(&id, account_id, protocol, &secret) {
                // The legacy record is untouched and still readable
                warn!("Deferred migration of credential {}: {}", id, e);
            }
            // Re-sealed by the migration; the next resolve caches the new blob
            return Ok(secret);
        }

        self.remember(&id, &record.secret, secret.clone());
        Ok(secret)
    }

    /// Cached secret, if the record has not changed since it was decrypted
    fn cached(&self, id: &str) -> Option<SecretString> {
        let state = self.state.read();
        let cache = self.cache.lock();
        let entry = cache.get(id)?;
        let record = state.records.get(id)?;
        (entry.sealed == record.secret).then(|| entry.secret.clone())
    }

    /// Cache a decrypted secret unless its record was replaced or removed
    /// in the meantime. Lock order is state, then cache.
    fn remember(&self, id: &str, sealed: &SealedSecret, secret: SecretString) {
        let state = self.state.read();
        let current = state.records.get(id).map(|record| &record.secret);
        let mut cache = self.cache.lock();
        if current == Some(sealed) {
            cache.insert(
                id.to_string(),
                CachedSecret {
                    sealed: sealed.clone(),
                    secret,
                },
            );
        } else {
            cache.remove(id);
        }
    }

    /// Replace an existing secret; the old value is gone afterwards
    pub fn rotate(
        &self,
        account_id: &str,
        protocol: Protocol,
        new_secret: SecretString,
    ) -> Result<CredentialRecord, VaultError> {
        let id = record_id(account_id, protocol);
        if !self.state.read().records.contains_key(&id) {
            return Err(VaultError::NotFound {
                account_id: account_id.to_string(),
                protocol,
            });
        }
        self.cache.lock().remove(&id);
        self.store(account_id, protocol, new_secret)
    }

    /// Remove a credential. Returns whether it existed.
    pub fn delete(&self, account_id: &str, protocol: Protocol) -> Result<bool, VaultError> {
        let id = record_id(account_id, protocol);
        self.cache.lock().remove(&id);
        if !self.state.read().records.contains_key(&id) {
            return Ok(false);
        }
        let removed = self.mutate(|file| {
            file.pending_migration.remove(&id);
            Ok(file.records.remove(&id).is_some())
        })?;
        if removed {
            info!("Deleted credential {}", id);
        }
        Ok(removed)
    }

    /// Record metadata, secret still sealed
    pub fn record(&self, account_id: &str, protocol: Protocol) -> Option<CredentialRecord> {
        self.state
            .read()
            .records
            .get(&record_id(account_id, protocol))
            .cloned()
    }

    /// Stored (account_id, protocol) pairs
    pub fn accounts(&self) -> Vec<(String, Protocol)> {
        self.state
            .read()
            .records
            .values()
            .map(|r| (r.account_id.clone(), r.protocol))
            .collect()
    }

    /// Legacy records not yet migrated
    pub fn pending_migrations(&self) -> usize {
        self.state.read().pending_migration.len()
    }

    /// Migrate every pending legacy record now instead of on first use.
    ///
    /// Each record is migrated on its own; a write failure stops the run
    /// and leaves the remaining records untouched.
    pub fn migrate_all(&self) -> Result<usize, VaultError> {
        let pending: Vec<String> = self.state.read().pending_migration.iter().cloned().collect();
        let mut migrated = 0;

        for id in pending {
            let Some(record) = self.state.read().records.get(&id).cloned() else {
                continue;
            };
            if !record.is_legacy() {
                continue;
            }
            let secret = crypto::open(&self.key, &record.account_id, record.protocol, &record.secret)?;
            if self.migrate_record(&id, &record.account_id, record.protocol, &secret)? {
                migrated += 1;
            }
        }
        Ok(migrated)
    }

    /// Store file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> VaultStatsSnapshot {
        let state = self.state.read();
        VaultStatsSnapshot {
            records: state.records.len(),
            pending_migrations: state.pending_migration.len(),
            store_writes: self.stats.store_writes.load(Ordering::Relaxed),
            migrations: self.stats.migrations.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Forget decrypted secrets held in memory
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Re-encrypt one legacy record. Returns false if another caller
    /// migrated or deleted it first.
    fn migrate_record(
        &self,
        id: &str,
        account_id: &str,
        protocol: Protocol,
        secret: &SecretString,
    ) -> Result<bool, VaultError> {
        let _writer = self.writer.lock();

        let mut next = self.state.read().clone();
        let Some(record) = next.records.get_mut(id) else {
            return Ok(false);
        };
        if !record.is_legacy() {
            return Ok(false);
        }

        record.secret = crypto::seal(&self.key, account_id, protocol, secret)?;
        record.migrated_at = Some(Utc::now());
        next.pending_migration.remove(id);

        self.persist(&next)?;
        *self.state.write() = next;

        self.stats.migrations.fetch_add(1, Ordering::Relaxed);
        info!("Migrated legacy credential {} to encrypted storage", id);
        Ok(true)
    }

    /// Apply a change under the writer lock; memory is only updated once
    /// the new document is on disk
    fn mutate<R>(
        &self,
        change: impl FnOnce(&mut StoreFile) -> Result<R, VaultError>,
    ) -> Result<R, VaultError> {
        let _writer = self.writer.lock();
        let mut next = self.state.read().clone();
        let out = change(&mut next)?;
        self.persist(&next)?;
        *self.state.write() = next;
        Ok(out)
    }

    /// Atomically replace the store file
    fn persist(&self, file: &StoreFile) -> Result<(), VaultError> {
        let write_err = |e: std::io::Error| VaultError::Write(e.to_string());
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(write_err)?;

        let json = serde_json::to_vec_pretty(file).map_err(|e| VaultError::Write(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(&json).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path)
            .map_err(|e| VaultError::Write(e.error.to_string()))?;

        self.stats.store_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("path", &self.path)
            .field("records", &self.state.read().records.len())
            .finish_non_exhaustive()
    }
}

fn read_store(path: &Path) -> Result<StoreFile, VaultError> {
    let content = std::fs::read(path).map_err(|e| VaultError::Read(e.to_string()))?;
    serde_json::from_slice(&content).map_err(|e| VaultError::Corrupt(e.to_string()))
}

/// Derive the passphrase key, creating KDF parameters for a new store
fn passphrase_key(
    file: &mut StoreFile,
    passphrase: &SecretString,
    config: &VaultConfig,
) -> Result<MasterKey, VaultError> {
    if file.kdf.is_none() {
        file.kdf = Some(KdfParams::generate(
            config.argon2_memory_kib,
            config.argon2_iterations,
            config.argon2_parallelism,
        )?);
    }
    match &file.kdf {
        Some(kdf) => MasterKey::from_passphrase(passphrase, kdf),
        None => Err(VaultError::Kdf("missing KDF parameters".into())),
    }
}

/// Short fingerprint of the master key, safe to store
fn key_check(key: &MasterKey) -> String {
    let hash = blake3::hash(format!("uplink vault key check {}", key.to_hex().as_str()).as_bytes());
    hash.to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeystore;
    use crate::{ENCRYPTION_VERSION, LEGACY_PLAINTEXT_VERSION};
    use secrecy::ExposeSecret;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn secret(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    fn fast_kdf() -> VaultConfig {
        VaultConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            ..VaultConfig::default()
        }
    }

    fn open_with(path: &Path, key: &MasterKey) -> Vault {
        Vault::open(path, KeySource::Key(key.clone()), &fast_kdf()).unwrap()
    }

    /// A store file as written by releases that kept secrets in plaintext
    fn write_legacy_store(path: &Path, entries: &[(&str, &str, &str)]) {
        let mut records = serde_json::Map::new();
        for (protocol, account, password) in entries {
            records.insert(
                format!("{}:{}", protocol, account),
                serde_json::json!({
                    "account_id": account,
                    "protocol": protocol,
                    "secret": {
                        "encryption_version": 0,
                        "ciphertext": hex::encode(password.as_bytes()),
                    },
                    "created_at": "2022-03-01T12:00:00Z",
                }),
            );
        }
        let doc = serde_json::json!({ "records": records });
        std::fs::write(path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
    }

    #[test]
    fn test_store_and_resolve() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let key = MasterKey::generate().unwrap();

        let vault = open_with(&path, &key);
        let record = vault.store("alice", Protocol::Sftp, secret("s3cret")).unwrap();
        assert_eq!(record.encryption_version(), ENCRYPTION_VERSION);

        // Fresh instance, nothing cached
        let reopened = open_with(&path, &key);
        let resolved = reopened.resolve("alice", Protocol::Sftp).unwrap();
        assert_eq!(resolved.expose_secret(), "s3cret");

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains("s3cret"));
        assert!(!on_disk.contains(&hex::encode("s3cret")));
    }

    #[test]
    fn test_resolve_missing() {
        let dir = tempdir().unwrap();
        let vault = open_with(&dir.path().join("vault.json"), &MasterKey::generate().unwrap());
        let err = vault.resolve("nobody", Protocol::Ftp).unwrap_err();
        assert!(matches!(err, VaultError::NotFound { .. }));
    }

    #[test]
    fn test_legacy_record_migrates_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.json");
        write_legacy_store(&path, &[("ftp", "bob", "legacy-pw"), ("sftp", "carol", "other-pw")]);
        let key = MasterKey::generate().unwrap();

        let vault = open_with(&path, &key);
        assert_eq!(vault.pending_migrations(), 2);
        assert_eq!(
            vault.record("bob", Protocol::Ftp).unwrap().encryption_version(),
            LEGACY_PLAINTEXT_VERSION
        );

        let resolved = vault.resolve("bob", Protocol::Ftp).unwrap();
        assert_eq!(resolved.expose_secret(), "legacy-pw");

        let record = vault.record("bob", Protocol::Ftp).unwrap();
        assert!(record.encryption_version() >= 1);
        assert!(record.migrated_at.is_some());
        assert_eq!(vault.pending_migrations(), 1);

        // Second resolve performs no rewrite, even without the cache
        let writes = vault.stats().store_writes;
        vault.clear_cache();
        assert_eq!(vault.resolve("bob", Protocol::Ftp).unwrap().expose_secret(), "legacy-pw");
        assert_eq!(vault.stats().store_writes, writes);
        assert_eq!(vault.stats().migrations, 1);

        // Migrated form survives a reopen and decrypts to the original
        let reopened = open_with(&path, &key);
        assert_eq!(reopened.resolve("bob", Protocol::Ftp).unwrap().expose_secret(), "legacy-pw");
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains(&hex::encode("legacy-pw")));
        // carol's record is untouched until she is resolved
        assert!(on_disk.contains(&hex::encode("other-pw")));
    }

    #[test]
    fn test_legacy_scan_runs_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.json");
        write_legacy_store(&path, &[("ftp", "bob", "pw")]);
        let key = MasterKey::generate().unwrap();

        let first = open_with(&path, &key);
        assert!(first.stats().store_writes >= 1); // scan marker persisted
        first.resolve("bob", Protocol::Ftp).unwrap();
        drop(first);

        let second = open_with(&path, &key);
        assert_eq!(second.pending_migrations(), 0);
        assert_eq!(second.stats().store_writes, 0);
    }

    #[test]
    fn test_migrate_all() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.json");
        write_legacy_store(&path, &[("ftp", "a", "pw-a"), ("s3", "b", "pw-b")]);
        let key = MasterKey::generate().unwrap();

        let vault = open_with(&path, &key);
        assert_eq!(vault.migrate_all().unwrap(), 2);
        assert_eq!(vault.pending_migrations(), 0);
        assert_eq!(vault.migrate_all().unwrap(), 0);
        assert_eq!(vault.resolve("b", Protocol::S3).unwrap().expose_secret(), "pw-b");
    }

    #[test]
    fn test_failed_migration_leaves_record_readable() {
        let dir = tempdir().unwrap();
        let store_dir = dir.path().join("store");
        std::fs::create_dir(&store_dir).unwrap();
        let path = store_dir.join("vault.json");
        write_legacy_store(&path, &[("ftp", "bob", "legacy-pw")]);
        let key = MasterKey::generate().unwrap();
        let vault = open_with(&path, &key);

        // Make the store directory unwritable by replacing it with a file
        let saved = std::fs::read(&path).unwrap();
        std::fs::remove_dir_all(&store_dir).unwrap();
        std::fs::write(&store_dir, b"not a directory").unwrap();

        let resolved = vault.resolve("bob", Protocol::Ftp).unwrap();
        assert_eq!(resolved.expose_secret(), "legacy-pw");
        assert!(vault.record("bob", Protocol::Ftp).unwrap().is_legacy());
        assert_eq!(vault.pending_migrations(), 1);

        // Once the disk is back, the next resolve migrates
        std::fs::remove_file(&store_dir).unwrap();
        std::fs::create_dir(&store_dir).unwrap();
        std::fs::write(&path, saved).unwrap();
        vault.resolve("bob", Protocol::Ftp).unwrap();
        assert!(!vault.record("bob", Protocol::Ftp).unwrap().is_legacy());
    }

    #[test]
    fn test_tampered_blob_fails_decrypt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let key = MasterKey::generate().unwrap();
        open_with(&path, &key)
            .store("alice", Protocol::WebDav, secret("dav-password"))
            .unwrap();

        let mut doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let ciphertext = doc["records"]["webdav:alice"]["secret"]["ciphertext"]
            .as_str()
            .unwrap()
            .to_string();
        let mut bytes = hex::decode(ciphertext).unwrap();
        bytes[0] ^= 0xff;
        doc["records"]["webdav:alice"]["secret"]["ciphertext"] =
            serde_json::Value::String(hex::encode(bytes));
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let vault = open_with(&path, &key);
        let err = vault.resolve("alice", Protocol::WebDav).unwrap_err();
        assert!(matches!(err, VaultError::Decrypt { .. }));
    }

    #[test]
    fn test_rotate_replaces_secret() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let key = MasterKey::generate().unwrap();
        let vault = open_with(&path, &key);

        let original = vault.store("alice", Protocol::S3, secret("old-key")).unwrap();
        let rotated = vault.rotate("alice", Protocol::S3, secret("new-key")).unwrap();
        assert_eq!(rotated.created_at, original.created_at);
        assert!(rotated.rotated_at.is_some());
        assert_ne!(rotated.secret.nonce, original.secret.nonce);

        assert_eq!(vault.resolve("alice", Protocol::S3).unwrap().expose_secret(), "new-key");
        let reopened = open_with(&path, &key);
        assert_eq!(reopened.resolve("alice", Protocol::S3).unwrap().expose_secret(), "new-key");

        assert!(matches!(
            vault.rotate("nobody", Protocol::S3, secret("x")),
            Err(VaultError::NotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_racing_rotate_never_restores_old_secret() {
        let dir = tempdir().unwrap();
        let vault = open_with(&dir.path().join("vault.json"), &MasterKey::generate().unwrap());
        let id = record_id("alice", Protocol::S3);
        let stale = vault.store("alice", Protocol::S3, secret("old-key")).unwrap().secret;

        // A resolve decrypted the old record, then lost the race to a rotate
        vault.rotate("alice", Protocol::S3, secret("new-key")).unwrap();
        vault.remember(&id, &stale, secret("old-key"));
        assert_eq!(vault.resolve("alice", Protocol::S3).unwrap().expose_secret(), "new-key");

        // An entry that slipped into the cache for the old blob is ignored
        vault.cache.lock().insert(
            id.clone(),
            CachedSecret {
                sealed: stale.clone(),
                secret: secret("old-key"),
            },
        );
        assert_eq!(vault.resolve("alice", Protocol::S3).unwrap().expose_secret(), "new-key");

        // Same after a delete: the secret stays gone
        vault.delete("alice", Protocol::S3).unwrap();
        vault.remember(&id, &stale, secret("old-key"));
        assert!(matches!(
            vault.resolve("alice", Protocol::S3),
            Err(VaultError::NotFound { .. })
        ));
    }

    #[test]
    fn test_concurrent_resolve_and_rotate_settle_on_latest() {
        let dir = tempdir().unwrap();
        let vault = Arc::new(open_with(
            &dir.path().join("vault.json"),
            &MasterKey::generate().unwrap(),
        ));
        vault.store("alice", Protocol::Ftp, secret("v0")).unwrap();

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let vault = Arc::clone(&vault);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        vault.resolve("alice", Protocol::Ftp).unwrap();
                    }
                })
            })
            .collect();

        for n in 1..=20 {
            vault
                .rotate("alice", Protocol::Ftp, secret(&format!("v{}", n)))
                .unwrap();
        }
        done.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(vault.resolve("alice", Protocol::Ftp).unwrap().expose_secret(), "v20");
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let vault = open_with(&dir.path().join("vault.json"), &MasterKey::generate().unwrap());
        vault.store("alice", Protocol::Ftp, secret("pw")).unwrap();
        vault.store("alice", Protocol::Sftp, secret("pw2")).unwrap();
        assert_eq!(vault.accounts().len(), 2);

        assert!(vault.delete("alice", Protocol::Ftp).unwrap());
        assert!(!vault.delete("alice", Protocol::Ftp).unwrap());
        assert!(vault.resolve("alice", Protocol::Ftp).is_err());
        assert_eq!(vault.accounts(), vec![("alice".to_string(), Protocol::Sftp)]);
    }

    #[test]
    fn test_wrong_key_rejected_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.json");
        open_with(&path, &MasterKey::generate().unwrap());

        let err = Vault::open(
            &path,
            KeySource::Key(MasterKey::generate().unwrap()),
            &fast_kdf(),
        )
        .unwrap_err();
        assert_eq!(err, VaultError::WrongKey);
    }

    #[test]
    fn test_passphrase_vault_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let config = fast_kdf();

        let vault =
            Vault::open(&path, KeySource::Passphrase(secret("correct horse")), &config).unwrap();
        vault.store("alice", Protocol::Ftps, secret("ftp-pw")).unwrap();
        drop(vault);

        let reopened =
            Vault::open(&path, KeySource::Passphrase(secret("correct horse")), &config).unwrap();
        assert_eq!(reopened.resolve("alice", Protocol::Ftps).unwrap().expose_secret(), "ftp-pw");

        let wrong = Vault::open(&path, KeySource::Passphrase(secret("battery staple")), &config);
        assert!(matches!(wrong, Err(VaultError::WrongKey)));
    }

    #[test]
    fn test_auto_falls_back_to_passphrase() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let source = KeySource::Auto {
            keystore: Box::new(MemoryKeystore::unavailable()),
            passphrase: Some(secret("fallback")),
        };
        let vault = Vault::open(&path, source, &fast_kdf()).unwrap();
        vault.store("alice", Protocol::Http, secret("token")).unwrap();

        let no_passphrase = KeySource::Auto {
            keystore: Box::new(MemoryKeystore::unavailable()),
            passphrase: None,
        };
        assert!(matches!(
            Vault::open(&path, no_passphrase, &fast_kdf()),
            Err(VaultError::Keystore(_))
        ));
    }

    #[test]
    fn test_keystore_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let keystore = std::sync::Arc::new(MemoryKeystore::new());

        struct Shared(std::sync::Arc<MemoryKeystore>);
        impl keystore::Keystore for Shared {
            fn load(&self) -> Result<Option<MasterKey>, VaultError> {
                self.0.load()
            }
            fn store(&self, key: &MasterKey) -> Result<(), VaultError> {
                self.0.store(key)
            }
            fn name(&self) -> &'static str {
                "shared"
            }
        }

        let vault = Vault::open(
            &path,
            KeySource::Keystore(Box::new(Shared(keystore.clone()))),
            &fast_kdf(),
        )
        .unwrap();
        vault.store("alice", Protocol::Dropbox, secret("refresh")).unwrap();
        drop(vault);

        let reopened = Vault::open(
            &path,
            KeySource::Keystore(Box::new(Shared(keystore))),
            &fast_kdf(),
        )
        .unwrap();
        assert_eq!(
            reopened.resolve("alice", Protocol::Dropbox).unwrap().expose_secret(),
            "refresh"
        );
    }

    #[test]
    fn test_corrupt_store_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let err = Vault::open(&path, KeySource::Key(MasterKey::generate().unwrap()), &fast_kdf())
            .unwrap_err();
        assert!(matches!(err, VaultError::Corrupt(_)));
    }

    /// Everything logged while `f` runs on this thread
    fn capture_logs(f: impl FnOnce()) -> String {
        struct Sink(Arc<parking_lot::Mutex<Vec<u8>>>);
        impl std::io::Write for Sink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buf = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || Sink(writer.clone()))
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let logs = buf.lock().clone();
        String::from_utf8_lossy(&logs).into_owned()
    }

    #[test]
    fn test_secrets_never_logged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.json");
        write_legacy_store(&path, &[("ftp", "bob", "plaintext-hunter2")]);
        let key = MasterKey::generate().unwrap();

        let logs = capture_logs(|| {
            let vault = open_with(&path, &key);
            vault.resolve("bob", Protocol::Ftp).unwrap();
            vault.store("eve", Protocol::Sftp, secret("fresh-hunter2")).unwrap();
            vault.rotate("eve", Protocol::Sftp, secret("rotated-hunter2")).unwrap();
        });

        assert!(logs.contains("Migrated legacy credential ftp:bob"));
        assert!(!logs.contains("hunter2"));
    }
}
