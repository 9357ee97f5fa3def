//! SFTP client over libssh2
//!
//! libssh2 is blocking, so every operation runs on tokio's blocking pool
//! with the session behind a mutex. Cancellation and bandwidth limits are
//! checked between chunks on the blocking thread.

use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use ssh2::{ErrorCode, OpenFlags, OpenType, Session as SshSession, Sftp};
use tracing::{debug, info, warn};

use uplink_core::{ConnectError, ConnectionParams, NetworkConfig, Protocol, TransferConfig, UploadError};

use super::{host_of, parent_dirs, UploadContext, UploadRequest, UploadResult};

// SSH_FX_* status codes that retrying will not fix
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;
const FX_NO_SPACE_ON_FILESYSTEM: i32 = 14;
const FX_QUOTA_EXCEEDED: i32 = 15;

struct SftpInner {
    session: SshSession,
    sftp: Sftp,
}

/// An authenticated SSH session with an open SFTP channel
pub struct SftpConnection {
    inner: Arc<Mutex<SftpInner>>,
    host: String,
}

impl std::fmt::Debug for SftpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpConnection")
            .field("host", &self.host)
            .finish()
    }
}

fn upload_error(e: ssh2::Error) -> UploadError {
    match e.code() {
        ErrorCode::SFTP(
            FX_NO_SUCH_FILE | FX_PERMISSION_DENIED | FX_NO_SPACE_ON_FILESYSTEM | FX_QUOTA_EXCEEDED,
        ) => UploadError::permanent(e.to_string()),
        _ => UploadError::transient(e.to_string()),
    }
}

fn write_error(e: std::io::Error) -> UploadError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => UploadError::permanent(e.to_string()),
        _ => UploadError::transient(e.to_string()),
    }
}

pub(crate) async fn connect(
    params: &ConnectionParams,
    secret: &SecretString,
    network: &NetworkConfig,
) -> Result<(String, SftpConnection), ConnectError> {
    let host = host_of(&params.endpoint).to_string();
    if host.is_empty() {
        return Err(ConnectError::InvalidEndpoint("empty SFTP host".into()));
    }
    let username = params
        .username
        .clone()
        .ok_or_else(|| ConnectError::InvalidEndpoint("SFTP requires a username".into()))?;
    let port = params.port_for(Protocol::Sftp);
    let key_path = params.private_key_path.clone();
    let secret = secret.clone();
    let timeout = network.connect_timeout();
    let io_timeout = network.request_timeout();

    let blocking_host = host.clone();
    let inner = tokio::task::spawn_blocking(move || {
        let addr = (blocking_host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| ConnectError::InvalidEndpoint(format!("{}: {}", blocking_host, e)))?
            .next()
            .ok_or_else(|| ConnectError::InvalidEndpoint(format!("{}: no address", blocking_host)))?;
        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| ConnectError::Network(format!("{}: {}", addr, e)))?;

        let mut session = SshSession::new()
            .map_err(|e| ConnectError::Protocol(format!("SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(io_timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| ConnectError::Network(format!("SSH handshake: {}", e)))?;

        let auth = match &key_path {
            Some(path) => {
                let passphrase = Some(secret.expose_secret().as_str()).filter(|p| !p.is_empty());
                session.userauth_pubkey_file(&username, None, path, passphrase)
            }
            None => session.userauth_password(&username, secret.expose_secret()),
        };
        if let Err(e) = auth {
            return Err(ConnectError::AuthRejected(format!("{}: {}", username, e.message())));
        }
        if !session.authenticated() {
            return Err(ConnectError::AuthRejected(format!("{}: not authenticated", username)));
        }

        let sftp = session
            .sftp()
            .map_err(|e| ConnectError::Protocol(format!("SFTP subsystem: {}", e)))?;
        Ok((username, SftpInner { session, sftp }))
    })
    .await
    .map_err(|e| ConnectError::Network(format!("SFTP connect task failed: {}", e)))?;

    let (username, inner) = inner?;
    info!("SFTP login as {} on {}:{}", username, host, port);
    Ok((
        format!("{}@{}", username, host),
        SftpConnection {
            inner: Arc::new(Mutex::new(inner)),
            host,
        },
    ))
}

pub(crate) async fn upload(
    conn: &mut SftpConnection,
    request: &UploadRequest,
    ctx: &UploadContext,
    transfer: &TransferConfig,
) -> Result<UploadResult, UploadError> {
    ctx.check_cancelled()?;
    let inner = conn.inner.clone();
    let request = request.clone();
    let ctx = ctx.clone();
    let chunk_size = transfer.chunk_size;
    let resume = ctx.resume && transfer.resume_partial;
    let verify = transfer.verify_remote_size;

    tokio::task::spawn_blocking(move || {
        let inner = inner.lock();
        upload_blocking(&inner.sftp, &request, &ctx, chunk_size, resume, verify)
    })
    .await
    .map_err(|e| UploadError::transient(format!("SFTP upload task failed: {}", e)))?
}

fn upload_blocking(
    sftp: &Sftp,
    request: &UploadRequest,
    ctx: &UploadContext,
    chunk_size: usize,
    resume: bool,
    verify: bool,
) -> Result<UploadResult, UploadError> {
    let remote = Path::new(&request.remote_path);
    for dir in parent_dirs(&request.remote_path) {
        // Fails for existing directories
        if let Err(e) = sftp.mkdir(Path::new(&dir), 0o755) {
            debug!("mkdir {}: {}", dir, e);
        }
    }

    let mut offset = 0;
    if resume {
        if let Some(size) = sftp.stat(remote).ok().and_then(|s| s.size) {
            if size <= request.bytes_total {
                offset = size;
            }
        }
    }
    ctx.progress.begin_attempt(offset);
    if offset > 0 && offset == request.bytes_total {
        return Ok(UploadResult {
            bytes_sent: 0,
            resumed_from: offset,
            remote_size: Some(offset),
        });
    }

    let local_error =
        |e: std::io::Error| UploadError::LocalIo(format!("{}: {}", request.local_path.display(), e));
    let mut local = std::fs::File::open(&request.local_path).map_err(local_error)?;
    if offset > 0 {
        local.seek(SeekFrom::Start(offset)).map_err(local_error)?;
        info!("Resuming {} at byte {}", request.remote_path, offset);
    }

    let flags = if offset > 0 {
        OpenFlags::WRITE | OpenFlags::CREATE
    } else {
        OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE
    };
    let mut file = sftp
        .open_mode(remote, flags, 0o644, OpenType::File)
        .map_err(upload_error)?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).map_err(write_error)?;
    }

    let mut throttle = ctx.throttle();
    let mut buf = vec![0u8; chunk_size];
    let mut sent = 0u64;
    loop {
        ctx.check_cancelled()?;
        let n = local.read(&mut buf).map_err(local_error)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).map_err(write_error)?;
        sent += n as u64;
        ctx.progress.advance(n as u64);
        throttle.pace_blocking(n as u64);
    }
    drop(file);
    ctx.progress.flush();

    let remote_size = if verify {
        sftp.stat(remote).ok().and_then(|s| s.size)
    } else {
        None
    };
    Ok(UploadResult {
        bytes_sent: sent,
        resumed_from: offset,
        remote_size,
    })
}

pub(crate) async fn close(conn: SftpConnection) {
    let host = conn.host.clone();
    let result = tokio::task::spawn_blocking(move || {
        let inner = conn.inner.lock();
        inner.session.disconnect(None, "closing", None)
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("SFTP disconnect from {} failed: {}", host, e),
        Err(e) => warn!("SFTP disconnect task failed: {}", e),
    }
}
