//! FTP and FTPS (explicit TLS) client
//!
//! Control channel: one command per line, replies carry a 3-digit code and
//! may span several lines (`NNN-` until `NNN `). Data always flows over a
//! passive connection (EPSV, falling back to PASV). With FTPS the control
//! channel is upgraded via `AUTH TLS` and data channels are protected with
//! `PROT P`.
//!
//! Reply classes map onto retry semantics: 4xx is transient, 5xx permanent.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use uplink_core::{ConnectError, ConnectionParams, Protocol, TransferConfig, UploadError};

use super::{host_of, open_source, parent_dirs, read_chunk, tls, UploadContext, UploadRequest, UploadResult};

/// Any byte stream usable as a control or data channel
trait FtpStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> FtpStream for T {}

type BoxedStream = Box<dyn FtpStream>;

/// How long to wait for the server after `ABOR` or `QUIT`
const COURTESY_TIMEOUT: Duration = Duration::from_secs(2);

/// Failure while talking to an FTP server
#[derive(Error, Debug)]
enum FtpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server replied {code}: {text}")]
    Reply { code: u16, text: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<FtpError> for ConnectError {
    fn from(e: FtpError) -> Self {
        match &e {
            FtpError::Io(_) => ConnectError::Network(e.to_string()),
            FtpError::Reply { code: 530, .. } => ConnectError::AuthRejected(e.to_string()),
            FtpError::Reply { code, .. } if *code < 500 => ConnectError::Network(e.to_string()),
            FtpError::Reply { .. } | FtpError::Protocol(_) => ConnectError::Protocol(e.to_string()),
        }
    }
}

impl From<FtpError> for UploadError {
    fn from(e: FtpError) -> Self {
        match &e {
            FtpError::Reply { code, .. } if *code >= 500 => UploadError::permanent(e.to_string()),
            _ => UploadError::transient(e.to_string()),
        }
    }
}

/// A complete server reply
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    /// Text of the final line without the code
    fn text(&self) -> &str {
        self.lines
            .last()
            .map(|l| l.get(4..).unwrap_or_default())
            .unwrap_or_default()
    }

    fn class(&self) -> u16 {
        self.code / 100
    }

    fn into_error(self) -> FtpError {
        FtpError::Reply {
            code: self.code,
            text: self.text().to_string(),
        }
    }
}

/// Command/reply codec over the control channel
struct FtpCodec {
    stream: BufReader<BoxedStream>,
}

impl FtpCodec {
    fn new(stream: BoxedStream) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Replace the control stream with a TLS session over it
    async fn upgrade(self, host: &str) -> Result<Self, ConnectError> {
        let inner = self.stream.into_inner();
        let secured = tls::wrap(inner, host).await?;
        Ok(Self::new(Box::new(secured)))
    }

    async fn send_command(&mut self, cmd: &str) -> Result<(), FtpError> {
        let line = format!("{}\r\n", cmd);
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        if cmd.starts_with("PASS ") {
            trace!(">>> PASS ****");
        } else {
            trace!(">>> {}", cmd);
        }
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, FtpError> {
        let mut buf = String::new();
        let n = self.stream.read_line(&mut buf).await?;
        if n == 0 {
            return Err(FtpError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the control connection",
            )));
        }
        Ok(buf.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn read_reply(&mut self) -> Result<Reply, FtpError> {
        let first = self.read_line().await?;
        let code = parse_code(&first)?;
        let mut lines = vec![first];

        if lines[0].as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                let next = self.read_line().await?;
                let done = next.starts_with(&terminator);
                lines.push(next);
                if done {
                    break;
                }
            }
        }

        let reply = Reply { code, lines };
        trace!("<<< {} {}", reply.code, reply.text());
        Ok(reply)
    }

    async fn execute(&mut self, cmd: &str) -> Result<Reply, FtpError> {
        self.send_command(cmd).await?;
        self.read_reply().await
    }

    /// Run `cmd` and require a reply in the given class
    async fn expect(&mut self, cmd: &str, class: u16) -> Result<Reply, FtpError> {
        let reply = self.execute(cmd).await?;
        if reply.class() != class {
            return Err(reply.into_error());
        }
        Ok(reply)
    }

    async fn expect_ok(&mut self, cmd: &str) -> Result<Reply, FtpError> {
        self.expect(cmd, 2).await
    }
}

fn parse_code(line: &str) -> Result<u16, FtpError> {
    line.get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .filter(|c| (100..600).contains(c))
        .ok_or_else(|| FtpError::Protocol(format!("malformed reply: {:?}", line)))
}

/// Port from `229 Entering Extended Passive Mode (|||port|)`
fn parse_epsv(text: &str) -> Option<u16> {
    let start = text.find("|||")? + 3;
    let rest = &text[start..];
    let end = rest.find('|')?;
    rest[..end].parse().ok()
}

/// Port from `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
fn parse_pasv(text: &str) -> Option<u16> {
    let start = text.find('(')? + 1;
    let end = text[start..].find(')')? + start;
    let nums: Vec<u16> = text[start..end]
        .split(',')
        .map(|n| n.trim().parse::<u8>().map(u16::from))
        .collect::<Result<_, _>>()
        .ok()?;
    if nums.len() != 6 {
        return None;
    }
    Some(nums[4] * 256 + nums[5])
}

/// An authenticated control connection
pub struct FtpConnection {
    codec: FtpCodec,
    host: String,
    secure: bool,
    data_timeout: Duration,
}

impl std::fmt::Debug for FtpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConnection")
            .field("host", &self.host)
            .field("secure", &self.secure)
            .finish()
    }
}

pub(crate) async fn connect(
    protocol: Protocol,
    params: &ConnectionParams,
    secret: &SecretString,
    timeout: Duration,
) -> Result<(String, FtpConnection), ConnectError> {
    let host = host_of(&params.endpoint).to_string();
    if host.is_empty() {
        return Err(ConnectError::InvalidEndpoint("empty FTP host".into()));
    }
    let port = params.port_for(protocol);
    let secure = protocol == Protocol::Ftps;

    let tcp = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| ConnectError::Network(format!("{}:{}: {}", host, port, e)))?;
    let mut codec = FtpCodec::new(Box::new(tcp));

    let greeting = codec.read_reply().await?;
    if greeting.class() != 2 {
        return Err(greeting.into_error().into());
    }

    if secure {
        let reply = codec.execute("AUTH TLS").await?;
        if reply.code != 234 {
            return Err(ConnectError::Protocol(format!(
                "server refused AUTH TLS: {} {}",
                reply.code,
                reply.text()
            )));
        }
        codec = codec.upgrade(&host).await?;
    }

    let username = params.username.as_deref().unwrap_or("anonymous");
    let reply = codec.execute(&format!("USER {}", username)).await?;
    match reply.code {
        230 => {}
        331 | 332 => {
            let reply = codec
                .execute(&format!("PASS {}", secret.expose_secret()))
                .await?;
            if reply.class() != 2 {
                return Err(match reply.code {
                    530 => ConnectError::AuthRejected(format!("login as {} refused", username)),
                    _ => reply.into_error().into(),
                });
            }
        }
        530 => {
            return Err(ConnectError::AuthRejected(format!(
                "user {} refused",
                username
            )))
        }
        _ => return Err(reply.into_error().into()),
    }

    if secure {
        codec.expect_ok("PBSZ 0").await?;
        codec.expect_ok("PROT P").await?;
    }

    info!("FTP login as {} on {}:{} (tls: {})", username, host, port, secure);
    Ok((
        format!("{}@{}", username, host),
        FtpConnection {
            codec,
            host,
            secure,
            data_timeout: timeout,
        },
    ))
}

/// Remote size via `SIZE`, `None` when the file does not exist
async fn remote_size(conn: &mut FtpConnection, path: &str) -> Result<Option<u64>, FtpError> {
    let reply = conn.codec.execute(&format!("SIZE {}", path)).await?;
    if reply.code == 213 {
        Ok(reply.text().trim().parse().ok())
    } else {
        Ok(None)
    }
}

/// Open a passive data connection
async fn open_data(conn: &mut FtpConnection) -> Result<TcpStream, FtpError> {
    let reply = conn.codec.execute("EPSV").await?;
    let port = if reply.code == 229 {
        parse_epsv(reply.text())
            .ok_or_else(|| FtpError::Protocol(format!("cannot parse EPSV: {}", reply.text())))?
    } else {
        debug!("EPSV unsupported ({}), falling back to PASV", reply.code);
        let reply = conn.codec.expect_ok("PASV").await?;
        parse_pasv(reply.text())
            .ok_or_else(|| FtpError::Protocol(format!("cannot parse PASV: {}", reply.text())))?
    };

    // Servers behind NAT often advertise a private address; the control
    // host is used for the data connection instead.
    tokio::time::timeout(
        conn.data_timeout,
        TcpStream::connect((conn.host.as_str(), port)),
    )
    .await
    .map_err(|_| FtpError::Protocol("data connection timed out".into()))?
    .map_err(FtpError::Io)
}

/// Abort an in-flight transfer and drain the replies
async fn abort(conn: &mut FtpConnection) {
    let drain = async {
        conn.codec.send_command("ABOR").await?;
        // 426 for the aborted transfer, then 226 for ABOR itself
        let first = conn.codec.read_reply().await?;
        if first.code == 426 {
            conn.codec.read_reply().await?;
        }
        Ok::<_, FtpError>(())
    };
    if let Ok(Err(e)) = tokio::time::timeout(COURTESY_TIMEOUT, drain).await {
        debug!("ABOR failed: {}", e);
    }
}

pub(crate) async fn upload(
    conn: &mut FtpConnection,
    request: &UploadRequest,
    ctx: &UploadContext,
    transfer: &TransferConfig,
) -> Result<UploadResult, UploadError> {
    ctx.check_cancelled()?;
    let path = request.remote_path.as_str();

    conn.codec.expect_ok("TYPE I").await?;
    for dir in parent_dirs(path) {
        // 550 for directories that already exist
        let reply = conn.codec.execute(&format!("MKD {}", dir)).await?;
        trace!("MKD {} -> {}", dir, reply.code);
    }

    let mut offset = 0;
    if ctx.resume && transfer.resume_partial {
        if let Some(existing) = remote_size(conn, path).await? {
            if existing <= request.bytes_total {
                offset = existing;
            }
        }
    }
    ctx.progress.begin_attempt(offset);

    if offset > 0 && offset == request.bytes_total {
        debug!("{} already complete on server", path);
        return Ok(UploadResult {
            bytes_sent: 0,
            resumed_from: offset,
            remote_size: Some(offset),
        });
    }

    let mut file = open_source(&request.local_path, offset).await?;
    let tcp = open_data(conn).await?;
    if offset > 0 {
        conn.codec.expect(&format!("REST {}", offset), 3).await?;
        info!("Resuming {} at byte {}", path, offset);
    }

    let reply = conn.codec.execute(&format!("STOR {}", path)).await?;
    if reply.class() != 1 {
        return Err(reply.into_error().into());
    }

    let mut data: BoxedStream = if conn.secure {
        let host = conn.host.clone();
        Box::new(
            tls::wrap(tcp, &host)
                .await
                .map_err(|e| UploadError::transient(e.to_string()))?,
        )
    } else {
        Box::new(tcp)
    };

    let mut throttle = ctx.throttle();
    let mut buf = vec![0u8; transfer.chunk_size];
    let mut sent = 0u64;
    loop {
        if ctx.cancel.is_cancelled() {
            drop(data);
            abort(conn).await;
            return Err(UploadError::Cancelled);
        }
        let n = read_chunk(&mut file, &mut buf).await?;
        if n == 0 {
            break;
        }
        data.write_all(&buf[..n])
            .await
            .map_err(|e| UploadError::transient(format!("data channel: {}", e)))?;
        sent += n as u64;
        ctx.progress.advance(n as u64);
        throttle.pace(n as u64).await;
    }
    data.shutdown()
        .await
        .map_err(|e| UploadError::transient(format!("data channel: {}", e)))?;
    drop(data);

    let done = conn.codec.read_reply().await?;
    if done.class() != 2 {
        return Err(done.into_error().into());
    }
    ctx.progress.flush();

    let remote_size = if transfer.verify_remote_size {
        remote_size(conn, path).await?
    } else {
        None
    };

    Ok(UploadResult {
        bytes_sent: sent,
        resumed_from: offset,
        remote_size,
    })
}

pub(crate) async fn close(mut conn: FtpConnection) {
    let quit = async {
        conn.codec.execute("QUIT").await?;
        conn.codec.stream.get_mut().shutdown().await?;
        Ok::<_, FtpError>(())
    };
    match tokio::time::timeout(COURTESY_TIMEOUT, quit).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("FTP QUIT to {} failed: {}", conn.host, e),
        Err(_) => debug!("FTP QUIT to {} timed out", conn.host),
    }
}
