//! Dropbox client
//!
//! Connect turns a long-lived refresh token into a short-lived access token
//! (the app key travels in `username`); without an app key the secret is
//! used as the access token as-is. Files up to one part go through
//! `files/upload`; larger files use an upload session:
//!
//! ```text
//!   upload_session/start      first part        -> session_id
//!   upload_session/append_v2  part at offset    (repeated)
//!   upload_session/finish     commit            -> metadata
//! ```
//!
//! Session offsets survive failed attempts, so a retry continues where the
//! last acknowledged part ended. When the server disagrees about the offset
//! it reports the `correct_offset` and the upload continues from there.

use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use uplink_core::{
    ConnectError, ConnectionParams, JobId, NetworkConfig, TransferConfig, UploadError,
};

use super::http::{build_client, file_body, request_error, status_error};
use super::{open_source, read_full, UploadContext, UploadRequest, UploadResult};

const API_URL: &str = "https://api.dropboxapi.com";
const CONTENT_URL: &str = "https://content.dropboxapi.com";

/// Renew this long before the access token actually expires
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Account {
    account_id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct FileMetadata {
    #[serde(default)]
    size: Option<u64>,
}

/// Upload session progress, kept across attempts
#[derive(Debug, Clone)]
struct UploadSession {
    /// Job that last appended to the session
    owner: JobId,
    session_id: String,
    offset: u64,
}

/// An authenticated Dropbox account
pub struct DropboxConnection {
    client: Client,
    token: SecretString,
    account_id: String,
}

impl std::fmt::Debug for DropboxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropboxConnection")
            .field("account_id", &self.account_id)
            .finish()
    }
}

/// Dropbox protocol client; owns the upload-session resume index
pub struct DropboxClient {
    transfer: TransferConfig,
    api_url: String,
    content_url: String,
    sessions: DashMap<String, UploadSession>,
}

impl DropboxClient {
    pub fn new(transfer: TransferConfig) -> Self {
        Self::with_base_urls(transfer, API_URL, CONTENT_URL)
    }

    /// Point the client at different API hosts
    pub fn with_base_urls(transfer: TransferConfig, api_url: &str, content_url: &str) -> Self {
        Self {
            transfer,
            api_url: api_url.trim_end_matches('/').to_string(),
            content_url: content_url.trim_end_matches('/').to_string(),
            sessions: DashMap::new(),
        }
    }

    /// Upload sessions with parts still to send
    pub fn pending_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Forget the sessions last used by `job_id`. Dropbox has no call to
    /// cancel a session; unfinished ones expire on the server.
    pub(crate) fn discard(&self, job_id: JobId) {
        self.sessions.retain(|_, session| session.owner != job_id);
    }

    pub(crate) async fn connect(
        &self,
        params: &ConnectionParams,
        secret: &SecretString,
        network: &NetworkConfig,
    ) -> Result<(String, DropboxConnection, Option<Instant>), ConnectError> {
        let client = build_client(network, &params.http.headers)?;

        let (token, expires_at) = match params.username.as_deref().filter(|k| !k.is_empty()) {
            Some(app_key) => {
                let token = self.refresh(&client, app_key, secret).await?;
                let expires_at = token
                    .expires_in
                    .map(|secs| Instant::now() + Duration::from_secs(secs).saturating_sub(EXPIRY_MARGIN));
                (SecretString::new(token.access_token), expires_at)
            }
            None => (secret.clone(), None),
        };

        let response = client
            .post(format!("{}/2/users/get_current_account", self.api_url))
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| ConnectError::Network(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ConnectError::AuthRejected("Dropbox rejected the access token".into()));
        }
        if !status.is_success() {
            return Err(connect_status(status));
        }
        let account: Account = response
            .json()
            .await
            .map_err(|e| ConnectError::Protocol(format!("bad account reply: {}", e)))?;

        let identity = account.email.clone().unwrap_or_else(|| account.account_id.clone());
        info!("Dropbox session for {}", identity);
        Ok((
            identity,
            DropboxConnection {
                client,
                token,
                account_id: account.account_id,
            },
            expires_at,
        ))
    }

    async fn refresh(
        &self,
        client: &Client,
        app_key: &str,
        refresh_token: &SecretString,
    ) -> Result<TokenResponse, ConnectError> {
        let response = client
            .post(format!("{}/oauth2/token", self.api_url))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose_secret().as_str()),
                ("client_id", app_key),
            ])
            .send()
            .await
            .map_err(|e| ConnectError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            return Err(ConnectError::AuthRejected(format!(
                "refresh token rejected for app {}",
                app_key
            )));
        }
        if !status.is_success() {
            return Err(connect_status(status));
        }
        debug!("Refreshed Dropbox access token");
        response
            .json()
            .await
            .map_err(|e| ConnectError::Protocol(format!("bad token reply: {}", e)))
    }

    pub(crate) async fn upload(
        &self,
        conn: &mut DropboxConnection,
        request: &UploadRequest,
        ctx: &UploadContext,
    ) -> Result<UploadResult, UploadError> {
        ctx.check_cancelled()?;
        let path = format!("/{}", request.remote_path.trim_start_matches('/'));
        let result = if request.bytes_total <= self.transfer.multipart_part_size {
            self.upload_single(conn, &path, request, ctx).await?
        } else {
            self.upload_session(conn, &path, request, ctx).await?
        };
        ctx.progress.flush();
        Ok(result)
    }

    async fn upload_single(
        &self,
        conn: &DropboxConnection,
        path: &str,
        request: &UploadRequest,
        ctx: &UploadContext,
    ) -> Result<UploadResult, UploadError> {
        ctx.progress.begin_attempt(0);
        let body = file_body(request, ctx, self.transfer.chunk_size).await?;
        let response = conn
            .client
            .post(format!("{}/2/files/upload", self.content_url))
            .bearer_auth(conn.token.expose_secret())
            .header("Dropbox-API-Arg", api_arg(&commit_info(path)))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| request_error(e, &ctx.cancel))?;
        let metadata: FileMetadata = parse_reply(response).await?;
        Ok(UploadResult {
            bytes_sent: request.bytes_total,
            resumed_from: 0,
            remote_size: metadata.size,
        })
    }

    async fn upload_session(
        &self,
        conn: &DropboxConnection,
        path: &str,
        request: &UploadRequest,
        ctx: &UploadContext,
    ) -> Result<UploadResult, UploadError> {
        let key = format!(
            "{}|{}|{}|{}",
            conn.account_id,
            path,
            request.local_path.display(),
            request.bytes_total
        );
        let part_size = self.transfer.multipart_part_size.max(1);
        let mut buf = vec![0u8; part_size as usize];
        let mut throttle = ctx.throttle();

        let existing = if ctx.resume && self.transfer.resume_partial {
            self.sessions.get(&key).map(|s| s.value().clone())
        } else {
            None
        };

        let (mut session, mut file, resumed_from, mut sent) = match existing {
            Some(mut session) => {
                info!("Resuming Dropbox upload of {} at byte {}", path, session.offset);
                session.owner = request.job_id;
                if let Some(mut entry) = self.sessions.get_mut(&key) {
                    entry.owner = request.job_id;
                }
                let file = open_source(&request.local_path, session.offset).await?;
                let offset = session.offset;
                (session, file, offset, 0)
            }
            None => {
                let mut file = open_source(&request.local_path, 0).await?;
                ctx.progress.begin_attempt(0);
                let n = read_full(&mut file, &mut buf).await?;
                let response = conn
                    .client
                    .post(format!("{}/2/files/upload_session/start", self.content_url))
                    .bearer_auth(conn.token.expose_secret())
                    .header("Dropbox-API-Arg", api_arg(&json!({ "close": false })))
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(Bytes::copy_from_slice(&buf[..n]))
                    .send()
                    .await
                    .map_err(|e| request_error(e, &ctx.cancel))?;
                let started: SessionStart = parse_reply(response).await?;
                ctx.progress.advance(n as u64);
                throttle.pace(n as u64).await;
                let session = UploadSession {
                    owner: request.job_id,
                    session_id: started.session_id,
                    offset: n as u64,
                };
                self.sessions.insert(key.clone(), session.clone());
                (session, file, 0, n as u64)
            }
        };
        ctx.progress.begin_attempt(session.offset);

        while session.offset < request.bytes_total {
            if ctx.cancel.is_cancelled() {
                self.sessions.remove(&key);
                return Err(UploadError::Cancelled);
            }
            let n = read_full(&mut file, &mut buf).await?;
            if n == 0 {
                return Err(UploadError::LocalIo(format!(
                    "{} shrank during upload",
                    request.local_path.display()
                )));
            }
            let arg = json!({
                "cursor": { "session_id": session.session_id, "offset": session.offset },
                "close": false,
            });
            let response = conn
                .client
                .post(format!("{}/2/files/upload_session/append_v2", self.content_url))
                .bearer_auth(conn.token.expose_secret())
                .header("Dropbox-API-Arg", api_arg(&arg))
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(Bytes::copy_from_slice(&buf[..n]))
                .send()
                .await
                .map_err(|e| request_error(e, &ctx.cancel))?;

            match check_reply(response).await {
                Ok(_) => {
                    session.offset += n as u64;
                    sent += n as u64;
                    ctx.progress.advance(n as u64);
                    throttle.pace(n as u64).await;
                }
                Err(ReplyError::IncorrectOffset(correct)) if correct <= request.bytes_total => {
                    warn!(
                        "Dropbox expects offset {} for {}, not {}",
                        correct, path, session.offset
                    );
                    session.offset = correct;
                    file = open_source(&request.local_path, correct).await?;
                    ctx.progress.begin_attempt(correct);
                }
                Err(e) => {
                    let e = e.into_upload_error();
                    if !e.is_retryable() {
                        self.sessions.remove(&key);
                    }
                    return Err(e);
                }
            }
            if let Some(mut entry) = self.sessions.get_mut(&key) {
                entry.offset = session.offset;
            }
        }

        let arg = json!({
            "cursor": { "session_id": session.session_id, "offset": session.offset },
            "commit": commit_info(path),
        });
        let response = conn
            .client
            .post(format!("{}/2/files/upload_session/finish", self.content_url))
            .bearer_auth(conn.token.expose_secret())
            .header("Dropbox-API-Arg", api_arg(&arg))
            .header(CONTENT_TYPE, "application/octet-stream")
            .send()
            .await
            .map_err(|e| request_error(e, &ctx.cancel))?;
        let metadata: FileMetadata = match parse_reply(response).await {
            Ok(metadata) => metadata,
            Err(e) => {
                if !e.is_retryable() {
                    self.sessions.remove(&key);
                }
                return Err(e);
            }
        };
        self.sessions.remove(&key);
        info!("Finished Dropbox upload of {}", path);

        Ok(UploadResult {
            bytes_sent: sent,
            resumed_from,
            remote_size: metadata.size,
        })
    }
}

fn commit_info(path: &str) -> Value {
    json!({
        "path": path,
        "mode": "overwrite",
        "autorename": false,
        "mute": true,
    })
}

/// JSON for the `Dropbox-API-Arg` header; non-ASCII must be escaped
fn api_arg(value: &Value) -> String {
    let raw = value.to_string();
    let mut escaped = String::with_capacity(raw.len());
    let mut units = [0u16; 2];
    for c in raw.chars() {
        if c.is_ascii() {
            escaped.push(c);
        } else {
            for unit in c.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    escaped
}

fn connect_status(status: StatusCode) -> ConnectError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ConnectError::Network(format!("Dropbox replied {}", status))
    } else {
        ConnectError::Protocol(format!("Dropbox replied {}", status))
    }
}

/// A failed API call
#[derive(Debug)]
enum ReplyError {
    /// The upload session is at a different offset
    IncorrectOffset(u64),
    Upload(UploadError),
}

impl ReplyError {
    fn into_upload_error(self) -> UploadError {
        match self {
            ReplyError::IncorrectOffset(offset) => {
                UploadError::permanent(format!("session offset {} is past the end of the file", offset))
            }
            ReplyError::Upload(e) => e,
        }
    }
}

/// `correct_offset` anywhere in an API error body
fn correct_offset(body: &Value) -> Option<u64> {
    match body {
        Value::Object(map) => map
            .get("correct_offset")
            .and_then(Value::as_u64)
            .or_else(|| map.values().find_map(correct_offset)),
        _ => None,
    }
}

async fn check_reply(response: reqwest::Response) -> Result<String, ReplyError> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_success() {
        return Ok(body);
    }

    let error = match status {
        StatusCode::UNAUTHORIZED if body.contains("expired_access_token") => {
            UploadError::transient("Dropbox access token expired")
        }
        StatusCode::UNAUTHORIZED => UploadError::permanent(format!("Dropbox rejected the token: {}", body)),
        StatusCode::CONFLICT => {
            if let Some(offset) = serde_json::from_str::<Value>(&body).ok().as_ref().and_then(correct_offset) {
                return Err(ReplyError::IncorrectOffset(offset));
            }
            if body.contains("too_many_write_operations") {
                UploadError::transient(format!("Dropbox is busy: {}", body))
            } else {
                UploadError::permanent(format!("Dropbox API error: {}", body))
            }
        }
        s => status_error(s, &body),
    };
    Err(ReplyError::Upload(error))
}

async fn parse_reply<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, UploadError> {
    let body = check_reply(response)
        .await
        .map_err(ReplyError::into_upload_error)?;
    serde_json::from_str(&body)
        .map_err(|e| UploadError::transient(format!("bad Dropbox reply: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;
    use uplink_core::JobId;

    use crate::event_bus::channel;
    use crate::progress::ProgressReporter;
    use crate::protocol::test_server::{RecordedRequest, TestResponse, TestServer};

    fn context(total: u64) -> UploadContext {
        let (bus, _stream) = channel(64);
        UploadContext {
            progress: ProgressReporter::with_intervals(JobId(1), total, bus, 1, Duration::ZERO),
            cancel: CancellationToken::new(),
            bandwidth_limit_kbps: 0,
            resume: false,
        }
    }

    fn source(content: &[u8]) -> (tempfile::NamedTempFile, UploadRequest) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, content).unwrap();
        let request = UploadRequest {
            job_id: JobId(1),
            local_path: file.path().to_path_buf(),
            remote_path: "Camera Uploads/img.raw".into(),
            bytes_total: content.len() as u64,
        };
        (file, request)
    }

    fn arg(req: &RecordedRequest) -> Value {
        serde_json::from_str(req.header("dropbox-api-arg").unwrap()).unwrap()
    }

    fn account() -> TestResponse {
        TestResponse::json(200, json!({ "account_id": "dbid:AAA", "email": "kim@example.com" }))
    }

    #[test]
    fn test_api_arg_escapes_non_ascii() {
        let value = json!({ "path": "/Fotos/Café 😀.jpg" });
        let arg = api_arg(&value);
        assert!(arg.is_ascii());
        assert!(arg.contains("Caf\\u00e9"));
        assert!(arg.contains("\\ud83d\\ude00"));
        let decoded: Value = serde_json::from_str(&arg).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_correct_offset_nested() {
        let append: Value = serde_json::from_str(
            r#"{"error": {".tag": "incorrect_offset", "correct_offset": 8}}"#,
        )
        .unwrap();
        assert_eq!(correct_offset(&append), Some(8));
        let finish: Value = serde_json::from_str(
            r#"{"error": {".tag": "lookup_failed", "lookup_failed": {".tag": "incorrect_offset", "correct_offset": 12}}}"#,
        )
        .unwrap();
        assert_eq!(correct_offset(&finish), Some(12));
        assert_eq!(correct_offset(&json!({"error": "path"})), None);
    }

    #[tokio::test]
    async fn test_connect_exchanges_refresh_token() {
        let server = TestServer::start(|req: &RecordedRequest| match req.path.as_str() {
            "/oauth2/token" => TestResponse::json(
                200,
                json!({ "access_token": "sl.short", "expires_in": 14400, "token_type": "bearer" }),
            ),
            "/2/users/get_current_account" if req.header("authorization") == Some("Bearer sl.short") => {
                account()
            }
            _ => TestResponse::status(401),
        })
        .await;

        let client = DropboxClient::with_base_urls(TransferConfig::default(), &server.url(), &server.url());
        let params = ConnectionParams::new("dropbox").with_username("app-key-1");
        let (identity, conn, expires_at) = client
            .connect(&params, &SecretString::new("refresh-xyz".into()), &NetworkConfig::default())
            .await
            .unwrap();
        assert_eq!(identity, "kim@example.com");
        assert_eq!(conn.account_id, "dbid:AAA");
        assert!(expires_at.unwrap() > Instant::now() + Duration::from_secs(3600));

        let token_request = &server.requests()[0];
        let form = String::from_utf8_lossy(&token_request.body);
        assert!(form.contains("grant_type=refresh_token"));
        assert!(form.contains("refresh_token=refresh-xyz"));
        assert!(form.contains("client_id=app-key-1"));
    }

    #[tokio::test]
    async fn test_revoked_token_is_auth_rejected() {
        let server = TestServer::start(|_| TestResponse::status(401)).await;
        let client = DropboxClient::with_base_urls(TransferConfig::default(), &server.url(), &server.url());
        let err = client
            .connect(
                &ConnectionParams::new("dropbox"),
                &SecretString::new("sl.revoked".into()),
                &NetworkConfig::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::AuthRejected(_)));
    }

    #[tokio::test]
    async fn test_session_follows_correct_offset() {
        let corrected = Arc::new(AtomicBool::new(false));
        let flag = corrected.clone();
        let server = TestServer::start(move |req: &RecordedRequest| match req.path.as_str() {
            "/2/users/get_current_account" => account(),
            "/2/files/upload_session/start" => TestResponse::json(200, json!({ "session_id": "S1" })),
            "/2/files/upload_session/append_v2" => {
                let offset = arg(req)["cursor"]["offset"].as_u64().unwrap();
                if offset == 4 && !flag.swap(true, Ordering::SeqCst) {
                    // The server already has bytes 4..8
                    TestResponse::json(
                        409,
                        json!({ "error": { ".tag": "incorrect_offset", "correct_offset": 8 } }),
                    )
                } else {
                    TestResponse::json(200, Value::Null)
                }
            }
            "/2/files/upload_session/finish" => {
                TestResponse::json(200, json!({ "name": "img.raw", "size": 10 }))
            }
            _ => TestResponse::status(404),
        })
        .await;

        let transfer = TransferConfig {
            multipart_part_size: 4,
            ..TransferConfig::default()
        };
        let client = DropboxClient::with_base_urls(transfer, &server.url(), &server.url());
        let (_, mut conn, _) = client
            .connect(
                &ConnectionParams::new("dropbox"),
                &SecretString::new("sl.token".into()),
                &NetworkConfig::default(),
            )
            .await
            .unwrap();
        let (_file, request) = source(b"0123456789");
        let ctx = context(10);
        let result = client.upload(&mut conn, &request, &ctx).await.unwrap();
        assert_eq!(result.remote_size, Some(10));
        assert_eq!(ctx.progress.bytes_sent(), 10);
        assert_eq!(client.pending_sessions(), 0);

        let requests = server.requests();
        let appends: Vec<(u64, Vec<u8>)> = requests
            .iter()
            .filter(|r| r.path.ends_with("append_v2"))
            .map(|r| (arg(r)["cursor"]["offset"].as_u64().unwrap(), r.body.clone()))
            .collect();
        assert_eq!(
            appends,
            vec![(4, b"4567".to_vec()), (8, b"89".to_vec())]
        );
        let finish = requests.iter().find(|r| r.path.ends_with("finish")).unwrap();
        assert_eq!(arg(finish)["cursor"]["offset"], 10);
        assert_eq!(arg(finish)["commit"]["path"], "/Camera Uploads/img.raw");
    }

    #[tokio::test]
    async fn test_expired_token_is_transient() {
        let server = TestServer::start(|req: &RecordedRequest| match req.path.as_str() {
            "/2/users/get_current_account" => account(),
            _ => TestResponse::json(
                401,
                json!({ "error": { ".tag": "expired_access_token" }, "error_summary": "expired_access_token/" }),
            ),
        })
        .await;
        let client = DropboxClient::with_base_urls(TransferConfig::default(), &server.url(), &server.url());
        let (_, mut conn, _) = client
            .connect(
                &ConnectionParams::new("dropbox"),
                &SecretString::new("sl.token".into()),
                &NetworkConfig::default(),
            )
            .await
            .unwrap();
        let (_file, request) = source(b"small");
        let err = client
            .upload(&mut conn, &request, &context(5))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_discard_forgets_interrupted_session() {
        let server = TestServer::start(|req: &RecordedRequest| match req.path.as_str() {
            "/2/users/get_current_account" => account(),
            "/2/files/upload_session/start" => TestResponse::json(200, json!({ "session_id": "S9" })),
            "/2/files/upload_session/append_v2" => TestResponse::status(503),
            _ => TestResponse::status(404),
        })
        .await;
        let transfer = TransferConfig {
            multipart_part_size: 4,
            ..TransferConfig::default()
        };
        let client = DropboxClient::with_base_urls(transfer, &server.url(), &server.url());
        let (_, mut conn, _) = client
            .connect(
                &ConnectionParams::new("dropbox"),
                &SecretString::new("sl.token".into()),
                &NetworkConfig::default(),
            )
            .await
            .unwrap();
        let (_file, request) = source(b"0123456789");
        let err = client
            .upload(&mut conn, &request, &context(10))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(client.pending_sessions(), 1);

        client.discard(JobId(2));
        assert_eq!(client.pending_sessions(), 1);
        client.discard(JobId(1));
        assert_eq!(client.pending_sessions(), 0);
    }
}
