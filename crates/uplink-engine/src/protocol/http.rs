//! HTTP and HTTPS upload client
//!
//! Uploads are either a multipart `POST` to the endpoint (fields `file` and
//! `path`) or a raw `PUT` of the body to `endpoint/remote_path`. HTTP has no
//! resume; every attempt restarts from byte zero.
//!
//! The request-building helpers here are shared with the WebDAV, S3 and
//! Dropbox clients, which are all HTTP underneath.

use std::io;

use bytes::Bytes;
use futures_util::{stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use uplink_core::{
    ConnectError, ConnectionParams, HttpAuth, HttpMethod, NetworkConfig, Protocol, UploadError,
};

use super::{join_url, open_source, UploadContext, UploadRequest, UploadResult};
use crate::progress::ProgressReporter;
use crate::throttle::Throttle;

const USER_AGENT: &str = concat!("uplink/", env!("CARGO_PKG_VERSION"));

/// Credentials attached to every request
#[derive(Clone)]
pub(crate) enum RequestAuth {
    None,
    Basic { username: String, password: SecretString },
    Bearer(SecretString),
}

impl RequestAuth {
    pub(crate) fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            RequestAuth::None => request,
            RequestAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password.expose_secret()))
            }
            RequestAuth::Bearer(token) => request.bearer_auth(token.expose_secret()),
        }
    }
}

/// A configured client for one HTTP endpoint
pub struct HttpConnection {
    client: Client,
    base_url: String,
    method: HttpMethod,
    auth: RequestAuth,
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("base_url", &self.base_url)
            .field("method", &self.method)
            .finish()
    }
}

/// Build a reqwest client with the engine's timeouts and extra headers
pub(crate) fn build_client(
    network: &NetworkConfig,
    headers: &std::collections::BTreeMap<String, String>,
) -> Result<Client, ConnectError> {
    let mut default_headers = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ConnectError::InvalidEndpoint(format!("invalid header name: {}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ConnectError::InvalidEndpoint(format!("invalid value for header {}", name)))?;
        default_headers.insert(name, value);
    }

    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(network.connect_timeout())
        .default_headers(default_headers)
        .build()
        .map_err(|e| ConnectError::Protocol(format!("HTTP client: {}", e)))
}

/// Endpoint as a URL, adding the protocol's scheme when none is given
pub(crate) fn base_url(endpoint: &str, default_scheme: &str) -> Result<url::Url, ConnectError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(ConnectError::InvalidEndpoint("empty endpoint".into()));
    }
    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("{}://{}", default_scheme, endpoint)
    };
    url::Url::parse(&with_scheme)
        .map_err(|e| ConnectError::InvalidEndpoint(format!("{}: {}", endpoint, e)))
}

/// Map a failed send to an upload error
pub(crate) fn request_error(e: reqwest::Error, cancel: &CancellationToken) -> UploadError {
    if cancel.is_cancelled() {
        return UploadError::Cancelled;
    }
    if e.is_builder() {
        UploadError::permanent(e.to_string())
    } else {
        UploadError::transient(e.to_string())
    }
}

/// Map a non-success status to an upload error
pub(crate) fn status_error(status: StatusCode, body: &str) -> UploadError {
    let message = if body.is_empty() {
        format!("server replied {}", status)
    } else {
        format!("server replied {}: {}", status, truncate(body, 200))
    };
    if is_transient_status(status) {
        UploadError::transient(message)
    } else {
        UploadError::permanent(message)
    }
}

pub(crate) fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Stream a local file as a request body, reporting progress per chunk
/// and failing the body once cancellation is requested
pub(crate) fn progress_body(
    file: tokio::fs::File,
    chunk_size: usize,
    progress: ProgressReporter,
    cancel: CancellationToken,
    throttle: Throttle,
) -> reqwest::Body {
    struct BodyState {
        reader: ReaderStream<tokio::fs::File>,
        progress: ProgressReporter,
        cancel: CancellationToken,
        throttle: Throttle,
        failed: bool,
    }

    let state = BodyState {
        reader: ReaderStream::with_capacity(file, chunk_size),
        progress,
        cancel,
        throttle,
        failed: false,
    };

    let body = stream::unfold(state, |mut state| async move {
        if state.failed {
            return None;
        }
        if state.cancel.is_cancelled() {
            state.failed = true;
            let err = io::Error::new(io::ErrorKind::Interrupted, "upload cancelled");
            return Some((Err(err), state));
        }
        match state.reader.next().await {
            Some(Ok(chunk)) => {
                let len = chunk.len() as u64;
                state.throttle.pace(len).await;
                state.progress.advance(len);
                Some((Ok::<Bytes, io::Error>(chunk), state))
            }
            Some(Err(e)) => {
                state.failed = true;
                Some((Err(e), state))
            }
            None => None,
        }
    });
    reqwest::Body::wrap_stream(body)
}

/// Body for a full upload of `request.local_path`
pub(crate) async fn file_body(
    request: &UploadRequest,
    ctx: &UploadContext,
    chunk_size: usize,
) -> Result<reqwest::Body, UploadError> {
    let file = open_source(&request.local_path, 0).await?;
    Ok(progress_body(
        file,
        chunk_size,
        ctx.progress.clone(),
        ctx.cancel.clone(),
        ctx.throttle(),
    ))
}

pub(crate) fn connect(
    protocol: Protocol,
    params: &ConnectionParams,
    secret: &SecretString,
    network: &NetworkConfig,
) -> Result<(String, HttpConnection), ConnectError> {
    let scheme = if protocol == Protocol::Https { "https" } else { "http" };
    let url = base_url(&params.endpoint, scheme)?;
    if protocol == Protocol::Https && url.scheme() != "https" {
        return Err(ConnectError::InvalidEndpoint(format!(
            "HTTPS endpoint must use https://, got {}",
            url
        )));
    }
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConnectError::InvalidEndpoint(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }

    let auth = match params.http.auth {
        HttpAuth::None => RequestAuth::None,
        HttpAuth::Basic => RequestAuth::Basic {
            username: params.username.clone().unwrap_or_default(),
            password: secret.clone(),
        },
        HttpAuth::Bearer => RequestAuth::Bearer(secret.clone()),
    };
    let client = build_client(network, &params.http.headers)?;
    let identity = params
        .username
        .clone()
        .unwrap_or_else(|| "anonymous".to_string());

    debug!("HTTP endpoint {} ready ({:?})", url, params.http.method);
    Ok((
        identity,
        HttpConnection {
            client,
            base_url: url.to_string(),
            method: params.http.method,
            auth,
        },
    ))
}

pub(crate) async fn upload(
    conn: &mut HttpConnection,
    request: &UploadRequest,
    ctx: &UploadContext,
    chunk_size: usize,
) -> Result<UploadResult, UploadError> {
    ctx.check_cancelled()?;
    ctx.progress.begin_attempt(0);
    let body = file_body(request, ctx, chunk_size).await?;

    let builder = match conn.method {
        HttpMethod::Post => {
            let file_name = request
                .local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            let part = reqwest::multipart::Part::stream_with_length(body, request.bytes_total)
                .file_name(file_name)
                .mime_str("application/octet-stream")
                .map_err(|e| UploadError::permanent(e.to_string()))?;
            let form = reqwest::multipart::Form::new()
                .text("path", request.remote_path.clone())
                .part("file", part);
            conn.client.post(&conn.base_url).multipart(form)
        }
        HttpMethod::Put => conn
            .client
            .put(join_url(&conn.base_url, &request.remote_path))
            .header(CONTENT_LENGTH, request.bytes_total)
            .body(body),
    };

    let response = conn
        .auth
        .apply(builder)
        .send()
        .await
        .map_err(|e| request_error(e, &ctx.cancel))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(status, &body));
    }
    ctx.progress.flush();

    info!("Uploaded {} via HTTP {:?}", request.remote_path, conn.method);
    Ok(UploadResult {
        bytes_sent: request.bytes_total,
        resumed_from: 0,
        remote_size: None,
    })
}
