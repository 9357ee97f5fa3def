//! Core type definitions for Uplink
//!
//! These types describe what the shell asks for (a [`JobRequest`]), how to
//! reach the destination ([`ConnectionParams`]), and the per-file job record
//! the scheduler owns ([`TransferJob`]).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Transfer protocols supported by the engine
#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ftp,
    Ftps,
    Sftp,
    Http,
    Https,
    WebDav,
    S3,
    Dropbox,
}

impl Protocol {
    /// Every supported protocol, in display order
    pub const ALL: [Protocol; 8] = [
        Protocol::Ftp,
        Protocol::Ftps,
        Protocol::Sftp,
        Protocol::Http,
        Protocol::Https,
        Protocol::WebDav,
        Protocol::S3,
        Protocol::Dropbox,
    ];

    /// Stable lowercase name, used in vault keys and config files
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ftp => "ftp",
            Protocol::Ftps => "ftps",
            Protocol::Sftp => "sftp",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::WebDav => "webdav",
            Protocol::S3 => "s3",
            Protocol::Dropbox => "dropbox",
        }
    }

    /// Well-known port used when the connection parameters leave it unset
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Ftp | Protocol::Ftps => 21,
            Protocol::Sftp => 22,
            Protocol::Http => 80,
            Protocol::Https | Protocol::WebDav | Protocol::S3 | Protocol::Dropbox => 443,
        }
    }

    /// Whether an interrupted upload can continue from where it stopped
    pub fn supports_resume(&self) -> bool {
        matches!(
            self,
            Protocol::Ftp | Protocol::Ftps | Protocol::Sftp | Protocol::S3 | Protocol::Dropbox
        )
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown protocol: {}", s))
    }
}

/// HTTP method used for plain HTTP/HTTPS uploads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// Multipart form upload to the endpoint URL
    #[default]
    Post,
    /// Raw body to `endpoint/remote_path`
    Put,
}

/// How the secret is presented to an HTTP/HTTPS endpoint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpAuth {
    #[default]
    None,
    Basic,
    Bearer,
}

/// HTTP/HTTPS specific options
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpOptions {
    pub method: HttpMethod,
    pub auth: HttpAuth,
    /// Extra request headers sent with every upload
    pub headers: BTreeMap<String, String>,
}

/// Everything needed to reach a destination, except the secret.
///
/// Secrets live in the vault and are resolved per attempt, so this struct
/// is safe to log and to serialize into batch descriptions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// Host name (FTP/SFTP), base URL (HTTP/WebDAV), or optional custom
    /// API endpoint (S3/Dropbox)
    pub endpoint: String,
    /// Port override (protocol default when unset)
    pub port: Option<u16>,
    /// Login name, S3 access key id, or Dropbox app key
    pub username: Option<String>,
    /// SFTP private key; the vault secret is then its passphrase
    pub private_key_path: Option<PathBuf>,
    /// HTTP/HTTPS options
    pub http: HttpOptions,
    /// Object storage bucket
    pub bucket: Option<String>,
    /// Object storage region
    pub region: Option<String>,
    /// Per-job bandwidth cap in KB/s, overriding the configured default
    pub bandwidth_limit_kbps: Option<u64>,
}

impl ConnectionParams {
    /// Create parameters for a host or URL endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Set the login name
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Effective port for a protocol
    pub fn port_for(&self, protocol: Protocol) -> u16 {
        self.port.unwrap_or_else(|| protocol.default_port())
    }

    /// Normalized endpoint identity used to key pooled sessions
    pub fn endpoint_key(&self, protocol: Protocol) -> String {
        let endpoint = self.endpoint.trim().trim_end_matches('/').to_ascii_lowercase();
        match protocol {
            Protocol::S3 => format!(
                "{}|{}|{}",
                endpoint,
                self.bucket.as_deref().unwrap_or_default(),
                self.region.as_deref().unwrap_or(crate::DEFAULT_S3_REGION)
            ),
            _ => format!("{}:{}", endpoint, self.port_for(protocol)),
        }
    }

    /// Digest of the settings that shape an authenticated session.
    ///
    /// Two jobs may share a pooled session only when this matches: same
    /// login, same key file, same HTTP method, auth scheme and headers.
    pub fn session_fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        let mut field = |value: &[u8]| {
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value);
        };
        field(self.username.as_deref().unwrap_or_default().as_bytes());
        field(
            self.private_key_path
                .as_deref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
                .as_bytes(),
        );
        field(format!("{:?}/{:?}", self.http.method, self.http.auth).as_bytes());
        for (name, value) in &self.http.headers {
            field(name.to_ascii_lowercase().as_bytes());
            field(value.as_bytes());
        }
        let digest = hasher.finalize();
        digest.to_hex().as_str()[..16].to_string()
    }
}

/// Job identifier, unique within a scheduler
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Debug, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Batch identifier, unique within a scheduler
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Debug, Serialize, Deserialize)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// Job lifecycle state
///
/// ```text
/// Queued -> Connecting -> Uploading -> (Verifying) -> Succeeded | Failed | Cancelled
///    ^                                                              |
///    +------------------------- retry -----------------------------+
/// ```
#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Connecting,
    Uploading,
    Verifying,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Position along the forward path; terminal states share the last rank
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Connecting => 1,
            JobStatus::Uploading => 2,
            JobStatus::Verifying => 3,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled => 4,
        }
    }

    /// Succeeded, Failed, or Cancelled
    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Transitions only move forward, with a single exception: a Failed job
    /// may go back to Queued for a retry.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Failed, JobStatus::Queued) => true,
            (JobStatus::Succeeded | JobStatus::Cancelled, _) => false,
            (JobStatus::Failed, _) => false,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Connecting => "connecting",
            JobStatus::Uploading => "uploading",
            JobStatus::Verifying => "verifying",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One file transfer as submitted by the shell
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub protocol: Protocol,
    pub connection_params: ConnectionParams,
    /// Vault account holding the secret for this destination
    pub account_id: String,
}

impl JobRequest {
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        protocol: Protocol,
        connection_params: ConnectionParams,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            protocol,
            connection_params,
            account_id: account_id.into(),
        }
    }
}

/// A scheduled transfer with its mutable progress and status
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferJob {
    pub id: JobId,
    pub batch_id: BatchId,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub protocol: Protocol,
    pub connection_params: ConnectionParams,
    pub account_id: String,
    pub status: JobStatus,
    pub bytes_total: u64,
    pub bytes_sent: u64,
    /// Number of attempts that failed transiently and were re-queued
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl TransferJob {
    /// Create a queued job from a request
    pub fn new(id: JobId, batch_id: BatchId, request: JobRequest, bytes_total: u64) -> Self {
        Self {
            id,
            batch_id,
            local_path: request.local_path,
            remote_path: request.remote_path,
            protocol: request.protocol,
            connection_params: request.connection_params,
            account_id: request.account_id,
            status: JobStatus::Queued,
            bytes_total,
            bytes_sent: 0,
            attempt_count: 0,
            last_error: None,
        }
    }

    /// Rebuild the request this job was created from
    pub fn request(&self) -> JobRequest {
        JobRequest {
            local_path: self.local_path.clone(),
            remote_path: self.remote_path.clone(),
            protocol: self.protocol,
            connection_params: self.connection_params.clone(),
            account_id: self.account_id.clone(),
        }
    }

    /// Whether the job reached Succeeded, Failed, or Cancelled
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status transition, rejecting anything non-monotonic
    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Put a transiently failed job back in the queue for another attempt
    pub fn requeue(&mut self) -> Result<(), JobError> {
        if self.status != JobStatus::Failed {
            return Err(JobError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: JobStatus::Queued,
            });
        }
        self.status = JobStatus::Queued;
        self.attempt_count += 1;
        Ok(())
    }

    /// Record progress; never moves backwards and never exceeds the total
    pub fn record_progress(&mut self, bytes_sent: u64) {
        self.bytes_sent = self.bytes_sent.max(bytes_sent).min(self.bytes_total);
    }

    /// Update the total after re-reading the source file
    pub fn set_total(&mut self, bytes_total: u64) {
        self.bytes_total = bytes_total;
        self.bytes_sent = self.bytes_sent.min(bytes_total);
    }

    /// Fraction complete in `0.0..=1.0`
    pub fn progress(&self) -> f64 {
        if self.bytes_total == 0 {
            if self.status == JobStatus::Succeeded {
                1.0
            } else {
                0.0
            }
        } else {
            self.bytes_sent as f64 / self.bytes_total as f64
        }
    }
}
