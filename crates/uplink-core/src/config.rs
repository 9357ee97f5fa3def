//! Configuration system for Uplink
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/uplink/config.toml
//! - Linux: ~/.config/uplink/config.toml
//! - Windows: %APPDATA%/uplink/config.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker pool and retry settings
    pub scheduler: SchedulerConfig,
    /// Per-upload streaming settings
    pub transfer: TransferConfig,
    /// Network settings
    pub network: NetworkConfig,
    /// Event bus settings
    pub events: EventConfig,
    /// Credential vault settings
    pub vault: VaultConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrent execution slots
    pub max_concurrent_jobs: usize,
    /// Sessions open at once per (protocol, endpoint, account)
    pub max_sessions_per_endpoint: usize,
    /// Total attempts per job, including the first
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    pub backoff_initial_ms: u64,
    /// Multiplier applied per subsequent retry
    pub backoff_factor: f64,
    /// Upper bound on the retry delay in milliseconds
    pub backoff_max_ms: u64,
    /// How long a cancelled upload may take to wind down in milliseconds
    pub cancel_grace_ms: u64,
    /// Idle sessions older than this are closed
    pub idle_session_ttl_secs: u64,
    /// Idle sessions kept per key
    pub max_idle_sessions_per_endpoint: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            max_sessions_per_endpoint: 3,
            max_attempts: 3,
            backoff_initial_ms: 2000,
            backoff_factor: 2.0,
            backoff_max_ms: 60_000,
            cancel_grace_ms: 5000,
            idle_session_ttl_secs: 300, // 5 minutes
            max_idle_sessions_per_endpoint: 2,
        }
    }
}

impl SchedulerConfig {
    /// Delay before retry number `retry` (0 for the first retry)
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(retry.min(32) as i32);
        let ms = (self.backoff_initial_ms as f64 * factor).min(self.backoff_max_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn idle_session_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_session_ttl_secs)
    }
}

/// Streaming configuration shared by all protocol clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes read from disk per write
    pub chunk_size: usize,
    /// Emit progress after this many bytes...
    pub progress_interval_bytes: u64,
    /// ...or after this many milliseconds, whichever comes first
    pub progress_interval_ms: u64,
    /// Bandwidth cap in KB/s (0 = unlimited)
    pub bandwidth_limit_kbps: u64,
    /// Object storage switches to multipart upload above this size
    pub multipart_threshold: u64,
    /// Object storage and cloud drive part size
    pub multipart_part_size: u64,
    /// Compare the remote size after upload when the protocol reports it
    pub verify_remote_size: bool,
    /// Continue partial uploads where the protocol supports it
    pub resume_partial: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            progress_interval_bytes: 256 * 1024,
            progress_interval_ms: 250,
            bandwidth_limit_kbps: 0,
            multipart_threshold: 8 * 1024 * 1024,
            multipart_part_size: 8 * 1024 * 1024,
            verify_remote_size: true,
            resume_partial: true,
        }
    }
}

impl TransferConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Buffered events before progress starts being coalesced
    pub buffer_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
        }
    }
}

/// Where the vault master key comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySourceKind {
    /// OS keystore when available, passphrase otherwise
    #[default]
    Auto,
    /// OS keystore only
    Keystore,
    /// Passphrase only
    Passphrase,
}

/// Credential vault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Store file (uses the system data dir if None)
    pub path: Option<PathBuf>,
    pub key_source: KeySourceKind,
    /// Environment variable holding the vault passphrase
    pub passphrase_env: String,
    /// Argon2id memory cost in KiB
    pub argon2_memory_kib: u32,
    /// Argon2id iterations
    pub argon2_iterations: u32,
    /// Argon2id lanes
    pub argon2_parallelism: u32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: None,
            key_source: KeySourceKind::Auto,
            passphrase_env: "UPLINK_VAULT_PASSPHRASE".to_string(),
            argon2_memory_kib: 19 * 1024,
            argon2_iterations: 2,
            argon2_parallelism: 1,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<(), ConfigError> {
        match Self::default_path() {
            Some(path) => self.save_to(&path),
            None => Err(ConfigError::NoConfigDir),
        }
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrent_jobs must be at least 1".into(),
            ));
        }
        if self.scheduler.max_sessions_per_endpoint == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_sessions_per_endpoint must be at least 1".into(),
            ));
        }
        if self.scheduler.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_attempts must be at least 1".into(),
            ));
        }
        if self.transfer.chunk_size == 0 {
            return Err(ConfigError::Invalid("transfer.chunk_size must be non-zero".into()));
        }
        // S3 rejects non-final parts under 5 MiB
        if self.transfer.multipart_part_size < 5 * 1024 * 1024 {
            return Err(ConfigError::Invalid(
                "transfer.multipart_part_size must be at least 5 MiB".into(),
            ));
        }
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "uplink", "uplink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the default data directory (vault store lives here)
    pub fn default_data_dir() -> Option<PathBuf> {
        ProjectDirs::from("com", "uplink", "uplink").map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Get the effective vault path (config override or system default)
    pub fn vault_path(&self) -> PathBuf {
        self.vault
            .path
            .clone()
            .or_else(|| Self::default_data_dir().map(|dir| dir.join("vault.json")))
            .unwrap_or_else(|| PathBuf::from("uplink-vault.json"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
    /// A value is out of range
    Invalid(String),
    /// No config directory available
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {}", e),
            ConfigError::NoConfigDir => write!(f, "No configuration directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}
