//! Error types for the transfer engine and vault

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{JobId, JobStatus, Protocol};

/// Failure to establish or authenticate a session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ConnectError {
    /// Bad credentials and malformed endpoints will not fix themselves
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectError::Timeout(_) | ConnectError::Network(_) | ConnectError::Protocol(_)
        )
    }
}

/// Failure while streaming a file to the remote side
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Network blip, rate limit, server busy
    #[error("transient upload failure: {0}")]
    Transient(String),

    /// Auth rejected, quota exceeded, path invalid
    #[error("permanent upload failure: {0}")]
    Permanent(String),

    #[error("upload cancelled")]
    Cancelled,

    /// The local source could not be read
    #[error("local file error: {0}")]
    LocalIo(String),
}

impl UploadError {
    pub fn transient(msg: impl Into<String>) -> Self {
        UploadError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        UploadError::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Transient(_))
    }
}

impl From<std::io::Error> for UploadError {
    /// I/O on the remote stream; local reads map to `LocalIo` explicitly
    fn from(e: std::io::Error) -> Self {
        UploadError::Transient(e.to_string())
    }
}

/// Credential vault errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("no credential stored for {account_id}@{protocol}")]
    NotFound { account_id: String, protocol: Protocol },

    /// Integrity check failed: tampered blob or wrong master key
    #[error("credential for {account_id}@{protocol} failed integrity check")]
    Decrypt { account_id: String, protocol: Protocol },

    #[error("vault write failed: {0}")]
    Write(String),

    #[error("vault read failed: {0}")]
    Read(String),

    #[error("vault store is corrupt: {0}")]
    Corrupt(String),

    #[error("keystore unavailable: {0}")]
    Keystore(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("master key does not match this vault")]
    WrongKey,
}

/// Invalid manipulation of a job record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("{job_id}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("{0}: no such job")]
    UnknownJob(JobId),

    #[error("{0} is not paused")]
    NotPaused(JobId),
}

/// Any failure that can end a transfer attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

impl TransferError {
    /// Whether the scheduler may re-queue the job after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Connect(e) => e.is_retryable(),
            TransferError::Upload(e) => e.is_retryable(),
            TransferError::Vault(_) => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Upload(UploadError::Cancelled))
    }

    /// Discriminant reported to the shell
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Connect(ConnectError::AuthRejected(_)) => ErrorKind::Auth,
            TransferError::Connect(_) => ErrorKind::Connect,
            TransferError::Upload(UploadError::Transient(_)) => ErrorKind::UploadTransient,
            TransferError::Upload(UploadError::Permanent(_)) => ErrorKind::UploadPermanent,
            TransferError::Upload(UploadError::Cancelled) => ErrorKind::Cancelled,
            TransferError::Upload(UploadError::LocalIo(_)) => ErrorKind::LocalIo,
            TransferError::Vault(VaultError::NotFound { .. }) => ErrorKind::VaultNotFound,
            TransferError::Vault(VaultError::Decrypt { .. }) => ErrorKind::VaultDecrypt,
            TransferError::Vault(VaultError::Write(_)) => ErrorKind::VaultWrite,
            TransferError::Vault(_) => ErrorKind::Vault,
        }
    }
}

/// Error category carried by [`crate::events::ErrorEvent`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connect,
    Auth,
    UploadTransient,
    UploadPermanent,
    Cancelled,
    LocalIo,
    VaultNotFound,
    VaultDecrypt,
    VaultWrite,
    Vault,
}
