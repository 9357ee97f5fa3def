//! Protocol clients
//!
//! Every protocol satisfies the same three-operation contract, so the
//! scheduler never branches on protocol:
//!
//! ```text
//!                  Scheduler
//!                      |
//!        Transport { connect, upload, close }
//!                      |
//!               ProtocolClient
//!     +-------+-------+-------+-------+-------+
//!    FTP    SFTP    HTTP   WebDAV    S3    Dropbox
//!   (FTPS)         (HTTPS)
//! ```
//!
//! Protocol quirks (multipart thresholds, WebDAV's lack of resume, FTP
//! passive mode) stay inside the per-protocol modules.

pub mod dropbox;
pub mod ftp;
pub mod http;
pub mod s3;
pub mod sftp;
mod sigv4;
mod tls;
pub mod webdav;

#[cfg(test)]
pub(crate) mod mock;
#[cfg(test)]
pub(crate) mod test_server;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use secrecy::SecretString;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use uplink_core::{
    Config, ConnectError, ConnectionParams, JobId, NetworkConfig, Protocol, TransferConfig,
    UploadError,
};

use crate::progress::ProgressReporter;
use crate::throttle::Throttle;

/// An authenticated connection owned by one worker at a time
pub struct Session<H> {
    pub protocol: Protocol,
    /// Normalized endpoint this session talks to
    pub endpoint: String,
    /// Who the remote side says we are
    pub identity: String,
    handle: Option<H>,
    pub opened_at: Instant,
    pub last_used: Instant,
    /// Access tokens expire; the pool drops sessions past this point
    pub expires_at: Option<Instant>,
    /// Uploads completed on this session
    pub uploads: u64,
}

impl<H> Session<H> {
    pub fn new(
        protocol: Protocol,
        endpoint: impl Into<String>,
        identity: impl Into<String>,
        handle: H,
    ) -> Self {
        let now = Instant::now();
        Self {
            protocol,
            endpoint: endpoint.into(),
            identity: identity.into(),
            handle: Some(handle),
            opened_at: now,
            last_used: now,
            expires_at: None,
            uploads: 0,
        }
    }

    pub fn with_expiry(mut self, expires_at: Instant) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn handle_mut(&mut self) -> Option<&mut H> {
        self.handle.as_mut()
    }

    /// Take the connection out; later calls return `None`
    pub fn take_handle(&mut self) -> Option<H> {
        self.handle.take()
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Instant::now() >= at)
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

impl<H> std::fmt::Debug for Session<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("protocol", &self.protocol)
            .field("endpoint", &self.endpoint)
            .field("identity", &self.identity)
            .field("open", &self.is_open())
            .field("uploads", &self.uploads)
            .finish()
    }
}

/// What to upload in one attempt
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub job_id: JobId,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub bytes_total: u64,
}

/// Per-attempt plumbing handed to a client
#[derive(Clone)]
pub struct UploadContext {
    pub progress: ProgressReporter,
    /// Polled between chunks
    pub cancel: CancellationToken,
    /// KB/s, 0 for unlimited
    pub bandwidth_limit_kbps: u64,
    /// An earlier attempt of this job left a partial upload behind that may
    /// be continued. When false the remote target is written from scratch.
    pub resume: bool,
}

impl UploadContext {
    pub fn throttle(&self) -> Throttle {
        Throttle::new(self.bandwidth_limit_kbps)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check_cancelled(&self) -> Result<(), UploadError> {
        if self.cancel.is_cancelled() {
            Err(UploadError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Outcome of a successful upload attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadResult {
    /// Bytes written during this attempt
    pub bytes_sent: u64,
    /// Offset the attempt resumed from (0 for a full upload)
    pub resumed_from: u64,
    /// Size the remote side reports after the upload, when available
    pub remote_size: Option<u64>,
}

/// The uniform {connect, upload, close} contract
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Protocol-specific connection state carried by a [`Session`]
    type Handle: Send + 'static;

    /// Establish and authenticate a session. Must fail with a
    /// [`ConnectError`] rather than block indefinitely.
    async fn connect(
        &self,
        protocol: Protocol,
        params: &ConnectionParams,
        secret: &SecretString,
    ) -> Result<Session<Self::Handle>, ConnectError>;

    /// Stream one local file to `request.remote_path`
    async fn upload(
        &self,
        session: &mut Session<Self::Handle>,
        request: &UploadRequest,
        ctx: &UploadContext,
    ) -> Result<UploadResult, UploadError>;

    /// Release the session. Safe to call on an already-closed session.
    async fn close(&self, session: &mut Session<Self::Handle>);

    /// Drop any resume state a job left behind, aborting server-side
    /// uploads where the protocol has them. Called once a job failed or was
    /// cancelled for good.
    async fn discard(&self, _job_id: JobId) {}
}

/// Connection state for each protocol family
pub enum SessionHandle {
    Ftp(ftp::FtpConnection),
    Sftp(sftp::SftpConnection),
    Http(http::HttpConnection),
    WebDav(webdav::WebDavConnection),
    S3(s3::S3Connection),
    Dropbox(dropbox::DropboxConnection),
}

/// Production transport dispatching over the closed set of protocols
pub struct ProtocolClient {
    transfer: TransferConfig,
    network: NetworkConfig,
    s3: s3::S3Client,
    dropbox: dropbox::DropboxClient,
}

impl ProtocolClient {
    pub fn new(config: &Config) -> Self {
        Self {
            transfer: config.transfer.clone(),
            network: config.network.clone(),
            s3: s3::S3Client::new(config.transfer.clone()),
            dropbox: dropbox::DropboxClient::new(config.transfer.clone()),
        }
    }
}

impl ProtocolClient {
    /// How long an upload may go without moving a byte. A throttled
    /// upload may legitimately pause for one chunk or part at the limit.
    fn stall_timeout(&self, ctx: &UploadContext) -> Duration {
        let idle = self.network.request_timeout();
        if ctx.bandwidth_limit_kbps == 0 {
            return idle;
        }
        let unit = (self.transfer.chunk_size as u64).max(self.transfer.multipart_part_size);
        idle + Duration::from_secs_f64(unit as f64 / (ctx.bandwidth_limit_kbps * 1024) as f64)
    }
}

impl Default for ProtocolClient {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

#[async_trait]
impl Transport for ProtocolClient {
    type Handle = SessionHandle;

    async fn connect(
        &self,
        protocol: Protocol,
        params: &ConnectionParams,
        secret: &SecretString,
    ) -> Result<Session<SessionHandle>, ConnectError> {
        let timeout = self.network.connect_timeout();
        let endpoint = params.endpoint_key(protocol);
        debug!("Connecting to {} via {}", endpoint, protocol);

        let connect = async {
            let session = match protocol {
                Protocol::Ftp | Protocol::Ftps => {
                    let (identity, conn) = ftp::connect(protocol, params, secret, timeout).await?;
                    Session::new(protocol, endpoint, identity, SessionHandle::Ftp(conn))
                }
                Protocol::Sftp => {
                    let (identity, conn) = sftp::connect(params, secret, &self.network).await?;
                    Session::new(protocol, endpoint, identity, SessionHandle::Sftp(conn))
                }
                Protocol::Http | Protocol::Https => {
                    let (identity, conn) =
                        http::connect(protocol, params, secret, &self.network)?;
                    Session::new(protocol, endpoint, identity, SessionHandle::Http(conn))
                }
                Protocol::WebDav => {
                    let (identity, conn) = webdav::connect(params, secret, &self.network).await?;
                    Session::new(protocol, endpoint, identity, SessionHandle::WebDav(conn))
                }
                Protocol::S3 => {
                    let (identity, conn) = self.s3.connect(params, secret, &self.network).await?;
                    Session::new(protocol, endpoint, identity, SessionHandle::S3(conn))
                }
                Protocol::Dropbox => {
                    let (identity, conn, expires_at) =
                        self.dropbox.connect(params, secret, &self.network).await?;
                    let session =
                        Session::new(protocol, endpoint, identity, SessionHandle::Dropbox(conn));
                    match expires_at {
                        Some(at) => session.with_expiry(at),
                        None => session,
                    }
                }
            };
            Ok(session)
        };

        with_timeout(timeout, connect).await
    }

    async fn upload(
        &self,
        session: &mut Session<SessionHandle>,
        request: &UploadRequest,
        ctx: &UploadContext,
    ) -> Result<UploadResult, UploadError> {
        let handle = session
            .handle_mut()
            .ok_or_else(|| UploadError::transient("session already closed"))?;

        let upload = async {
            match handle {
                SessionHandle::Ftp(conn) => ftp::upload(conn, request, ctx, &self.transfer).await,
                SessionHandle::Sftp(conn) => sftp::upload(conn, request, ctx, &self.transfer).await,
                SessionHandle::Http(conn) => {
                    http::upload(conn, request, ctx, self.transfer.chunk_size).await
                }
                SessionHandle::WebDav(conn) => {
                    webdav::upload(conn, request, ctx, &self.transfer).await
                }
                SessionHandle::S3(conn) => self.s3.upload(conn, request, ctx).await,
                SessionHandle::Dropbox(conn) => self.dropbox.upload(conn, request, ctx).await,
            }
        };
        with_stall_timeout(self.stall_timeout(ctx), &ctx.progress, upload).await
    }

    async fn close(&self, session: &mut Session<SessionHandle>) {
        let Some(handle) = session.take_handle() else {
            return;
        };
        debug!("Closing {} session to {}", session.protocol, session.endpoint);
        match handle {
            SessionHandle::Ftp(conn) => ftp::close(conn).await,
            SessionHandle::Sftp(conn) => sftp::close(conn).await,
            // Stateless HTTP clients just drop their connection pool
            SessionHandle::Http(_) | SessionHandle::WebDav(_) => {}
            SessionHandle::S3(_) | SessionHandle::Dropbox(_) => {}
        }
    }

    async fn discard(&self, job_id: JobId) {
        self.s3.discard(job_id).await;
        self.dropbox.discard(job_id);
    }
}

/// Fail an upload whose position has not moved for `idle`. Covers a peer
/// that stops reading mid-body as well as one that never sends its final
/// reply.
async fn with_stall_timeout<T>(
    idle: Duration,
    progress: &ProgressReporter,
    fut: impl Future<Output = Result<T, UploadError>>,
) -> Result<T, UploadError> {
    tokio::pin!(fut);
    let mut last = progress.position();
    loop {
        tokio::select! {
            result = &mut fut => return result,
            _ = tokio::time::sleep(idle) => {
                let now = progress.position();
                if now == last {
                    return Err(UploadError::transient(format!(
                        "no progress for {:?}",
                        idle
                    )));
                }
                last = now;
            }
        }
    }
}

/// Bound a connect future by the configured timeout
async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, ConnectError>>,
) -> Result<T, ConnectError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout(timeout)),
    }
}

/// Open the local source positioned at `offset`
pub(crate) async fn open_source(path: &Path, offset: u64) -> Result<tokio::fs::File, UploadError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| UploadError::LocalIo(format!("{}: {}", path.display(), e)))?;
    if offset > 0 {
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| UploadError::LocalIo(format!("{}: {}", path.display(), e)))?;
    }
    Ok(file)
}

/// Read the next chunk from the local source; 0 at end of file
pub(crate) async fn read_chunk(
    file: &mut tokio::fs::File,
    buf: &mut [u8],
) -> Result<usize, UploadError> {
    file.read(buf)
        .await
        .map_err(|e| UploadError::LocalIo(e.to_string()))
}

/// Fill `buf` as far as the file allows; returns bytes read
pub(crate) async fn read_full(
    file: &mut tokio::fs::File,
    buf: &mut [u8],
) -> Result<usize, UploadError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_chunk(file, &mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Parent directories of a remote path, outermost first.
///
/// `"/a/b/c.txt"` yields `["/a", "/a/b"]`.
pub(crate) fn parent_dirs(remote_path: &str) -> Vec<String> {
    let absolute = remote_path.starts_with('/');
    let parts: Vec<&str> = remote_path.split('/').filter(|p| !p.is_empty()).collect();
    let mut dirs = Vec::new();
    let mut current = String::new();
    for part in parts.iter().take(parts.len().saturating_sub(1)) {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(part);
        dirs.push(current.clone());
    }
    dirs
}

/// Bare host name from an endpoint that may carry a scheme or path
pub(crate) fn host_of(endpoint: &str) -> &str {
    let trimmed = endpoint.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map_or(trimmed, |(_, rest)| rest);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
}

/// Characters escaped inside a URL path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Percent-encode each segment of a remote path, keeping the slashes
pub(crate) fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a base URL and a remote path with exactly one slash
pub(crate) fn join_url(base: &str, remote_path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        encode_path(remote_path.trim_start_matches('/'))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_dirs() {
        assert_eq!(parent_dirs("/a/b/c.txt"), vec!["/a", "/a/b"]);
        assert_eq!(parent_dirs("a/b/c.txt"), vec!["a", "a/b"]);
        assert!(parent_dirs("/c.txt").is_empty());
        assert!(parent_dirs("c.txt").is_empty());
        assert_eq!(parent_dirs("//a//c.txt"), vec!["/a"]);
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("ftp.example.com"), "ftp.example.com");
        assert_eq!(host_of("ftps://ftp.example.com/"), "ftp.example.com");
        assert_eq!(host_of(" sftp://h/home "), "h");
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://h/dav/", "/x/y.txt"), "https://h/dav/x/y.txt");
        assert_eq!(join_url("https://h", "y.txt"), "https://h/y.txt");
        assert_eq!(
            join_url("https://h/", "/q3 #1/r?.txt"),
            "https://h/q3%20%231/r%3F.txt"
        );
    }

    #[test]
    fn test_session_close_is_idempotent() {
        let mut session = Session::new(Protocol::Ftp, "h:21", "alice", 42u32);
        assert!(session.is_open());
        assert_eq!(session.take_handle(), Some(42));
        assert_eq!(session.take_handle(), None);
        assert!(!session.is_open());
    }

    #[test]
    fn test_session_expiry() {
        let session = Session::new(Protocol::Dropbox, "api", "me", ())
            .with_expiry(Instant::now() - Duration::from_secs(1));
        assert!(session.is_expired());
        let fresh = Session::new(Protocol::Dropbox, "api", "me", ());
        assert!(!fresh.is_expired());
    }

    #[tokio::test]
    async fn test_open_source_missing_file_is_local_error() {
        let err = open_source(Path::new("/nonexistent/uplink/file.bin"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::LocalIo(_)));
    }

    #[tokio::test]
    async fn test_open_source_at_offset() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp, b"0123456789").unwrap();
        let mut file = open_source(tmp.path(), 4).await.unwrap();
        let mut buf = [0u8; 16];
        let n = read_full(&mut file, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"456789");
    }

    fn reporter() -> ProgressReporter {
        let (bus, _stream) = crate::event_bus::channel(64);
        ProgressReporter::with_intervals(JobId(1), 1_000_000, bus, 1, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_stalled_upload_times_out() {
        let progress = reporter();
        let started = Instant::now();
        let result: Result<(), UploadError> = with_stall_timeout(
            Duration::from_millis(50),
            &progress,
            std::future::pending(),
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_slow_but_moving_upload_is_not_cut_off() {
        let progress = reporter();
        let moving = async {
            for _ in 0..8 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                progress.advance(1024);
            }
            Ok::<_, UploadError>(8 * 1024)
        };
        // Runs for well over the idle window, in small steps
        let sent = with_stall_timeout(Duration::from_millis(60), &progress, moving)
            .await
            .unwrap();
        assert_eq!(sent, 8 * 1024);
    }
}

