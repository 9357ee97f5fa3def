//! Uplink Core - Shared types, configuration, and the credential vault
//!
//! This crate contains the transfer data model used across all Uplink components
//! and the encrypted-at-rest credential store. It has no dependencies on
//! networking code.

pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod keystore;
pub mod types;
pub mod vault;

pub use config::{
    Config, EventConfig, KeySourceKind, NetworkConfig, SchedulerConfig, TransferConfig,
    VaultConfig,
};
pub use error::*;
pub use events::*;
pub use types::*;
pub use vault::{CredentialRecord, Vault};

/// Default read size for streaming local files (64 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Current vault record encryption version (XChaCha20-Poly1305)
pub const ENCRYPTION_VERSION: u8 = 1;

/// Encryption version marking a legacy plaintext record
pub const LEGACY_PLAINTEXT_VERSION: u8 = 0;

/// Vault store file format version
pub const VAULT_FORMAT_VERSION: u32 = 1;

/// Default S3 region when none is configured
pub const DEFAULT_S3_REGION: &str = "us-east-1";
