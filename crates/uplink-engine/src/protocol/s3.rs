//! S3 and S3-compatible object storage
//!
//! Small objects go up in one signed `PUT`. Objects above the multipart
//! threshold use the multipart API:
//!
//! ```text
//!   POST ?uploads            -> UploadId
//!   PUT  ?partNumber=N&...   -> ETag      (repeated)
//!   POST ?uploadId=...       -> complete
//! ```
//!
//! Completed parts are remembered per upload target, so a retried attempt
//! continues at the first missing part. Cancellation and permanent
//! failures abort the multipart upload so the bucket is not left with
//! orphaned parts.
//!
//! Credentials: `username` is the access key id, the vault secret is the
//! secret access key. Requests are path-style.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use reqwest::header::{CONTENT_LENGTH, ETAG};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use uplink_core::{
    ConnectError, ConnectionParams, JobId, NetworkConfig, Protocol, TransferConfig, UploadError,
    DEFAULT_S3_REGION,
};

use super::http::{build_client, file_body, request_error, status_error};
use super::sigv4::{sha256_hex, uri_encode_path, SigV4Signer, UNSIGNED_PAYLOAD};
use super::{open_source, read_full, UploadContext, UploadRequest, UploadResult};

#[derive(Debug, Deserialize)]
struct InitiateMultipartUploadResult {
    #[serde(rename = "UploadId")]
    upload_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct CompletedPart {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload<'a> {
    #[serde(rename = "Part")]
    parts: &'a [CompletedPart],
}

/// Progress of one multipart upload, kept across attempts
#[derive(Debug, Clone)]
struct MultipartState {
    /// Job that last worked on the upload
    owner: JobId,
    key: String,
    upload_id: String,
    part_size: u64,
    parts: Vec<CompletedPart>,
    /// Used to abort the upload once its job gives up
    conn: S3Connection,
}

/// A bucket reachable with a set of credentials
#[derive(Clone)]
pub struct S3Connection {
    client: Client,
    signer: SigV4Signer,
    /// Scheme, host and optional path prefix, no trailing slash
    base_url: String,
    /// Host header value, port included when non-default
    host: String,
    /// Path prefix of `base_url` ("" for the bucket at the root)
    base_path: String,
    bucket: String,
    endpoint_key: String,
}

impl std::fmt::Debug for S3Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Connection")
            .field("base_url", &self.base_url)
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl S3Connection {
    /// Encoded request path for a key, or the bucket when `key` is `None`
    fn path(&self, key: Option<&str>) -> String {
        let mut path = format!("{}/{}", self.base_path, self.bucket);
        if let Some(key) = key {
            path.push('/');
            path.push_str(key.trim_start_matches('/'));
        }
        uri_encode_path(&path)
    }

    /// Build a signed request; the body, if any, is added by the caller
    fn signed(
        &self,
        method: Method,
        key: Option<&str>,
        query: &BTreeMap<String, String>,
        payload_hash: &str,
    ) -> Result<RequestBuilder, String> {
        let path = self.path(key);
        let headers = self
            .signer
            .sign(
                method.as_str(),
                &self.host,
                &path,
                query,
                &BTreeMap::new(),
                payload_hash,
                Utc::now(),
            )
            .map_err(|e| format!("request signing failed: {}", e))?;

        let mut url = format!("{}{}", self.base_url, path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(
                &query
                    .iter()
                    .map(|(k, v)| format!("{}={}", super::sigv4::uri_encode(k), super::sigv4::uri_encode(v)))
                    .collect::<Vec<_>>()
                    .join("&"),
            );
        }

        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        Ok(request)
    }
}

/// S3 protocol client; owns the multipart resume index
pub struct S3Client {
    transfer: TransferConfig,
    uploads: DashMap<String, MultipartState>,
}

impl S3Client {
    pub fn new(transfer: TransferConfig) -> Self {
        Self {
            transfer,
            uploads: DashMap::new(),
        }
    }

    /// Multipart uploads with parts still to send
    pub fn pending_multipart(&self) -> usize {
        self.uploads.len()
    }

    pub(crate) async fn connect(
        &self,
        params: &ConnectionParams,
        secret: &SecretString,
        network: &NetworkConfig,
    ) -> Result<(String, S3Connection), ConnectError> {
        let bucket = params
            .bucket
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ConnectError::InvalidEndpoint("S3 requires a bucket".into()))?;
        let access_key = params
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ConnectError::InvalidEndpoint("S3 requires an access key id".into()))?;
        let region = params
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_S3_REGION.to_string());

        let endpoint = if params.endpoint.trim().is_empty() {
            format!("https://s3.{}.amazonaws.com", region)
        } else {
            params.endpoint.trim().to_string()
        };
        let url = super::http::base_url(&endpoint, "https")?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ConnectError::InvalidEndpoint(format!("{} has no host", endpoint)))
            }
        };
        let base_path = url.path().trim_end_matches('/').to_string();
        let base_url = format!("{}://{}", url.scheme(), host);

        let conn = S3Connection {
            client: build_client(network, &params.http.headers)?,
            signer: SigV4Signer::s3(&access_key, secret.clone(), &region),
            base_url,
            host,
            base_path,
            bucket,
            endpoint_key: params.endpoint_key(Protocol::S3),
        };

        let response = conn
            .signed(Method::HEAD, None, &BTreeMap::new(), &sha256_hex(b""))
            .map_err(ConnectError::Protocol)?
            .send()
            .await
            .map_err(|e| ConnectError::Network(e.to_string()))?;
        match response.status() {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ConnectError::AuthRejected(format!(
                    "access to bucket {} denied for {}",
                    conn.bucket, access_key
                )))
            }
            StatusCode::NOT_FOUND => {
                return Err(ConnectError::InvalidEndpoint(format!(
                    "bucket {} does not exist",
                    conn.bucket
                )))
            }
            StatusCode::MOVED_PERMANENTLY => {
                return Err(ConnectError::InvalidEndpoint(format!(
                    "bucket {} is not in region {}",
                    conn.bucket, region
                )))
            }
            s if s.is_server_error() => {
                return Err(ConnectError::Network(format!("HEAD bucket replied {}", s)))
            }
            s => return Err(ConnectError::Protocol(format!("HEAD bucket replied {}", s))),
        }

        info!("S3 bucket {} ready at {}", conn.bucket, conn.base_url);
        Ok((access_key, conn))
    }

    pub(crate) async fn upload(
        &self,
        conn: &mut S3Connection,
        request: &UploadRequest,
        ctx: &UploadContext,
    ) -> Result<UploadResult, UploadError> {
        ctx.check_cancelled()?;
        let key = request.remote_path.trim_start_matches('/');
        let result = if request.bytes_total > self.transfer.multipart_threshold {
            self.upload_multipart(conn, key, request, ctx).await?
        } else {
            self.upload_single(conn, key, request, ctx).await?
        };
        ctx.progress.flush();

        let remote_size = if self.transfer.verify_remote_size {
            head_object(conn, key).await
        } else {
            None
        };
        Ok(UploadResult {
            remote_size,
            ..result
        })
    }

    async fn upload_single(
        &self,
        conn: &S3Connection,
        key: &str,
        request: &UploadRequest,
        ctx: &UploadContext,
    ) -> Result<UploadResult, UploadError> {
        ctx.progress.begin_attempt(0);
        let body = file_body(request, ctx, self.transfer.chunk_size).await?;
        let response = conn
            .signed(Method::PUT, Some(key), &BTreeMap::new(), UNSIGNED_PAYLOAD)
            .map_err(UploadError::permanent)?
            .header(CONTENT_LENGTH, request.bytes_total)
            .body(body)
            .send()
            .await
            .map_err(|e| request_error(e, &ctx.cancel))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        debug!("PUT s3://{}/{} ({} bytes)", conn.bucket, key, request.bytes_total);
        Ok(UploadResult {
            bytes_sent: request.bytes_total,
            resumed_from: 0,
            remote_size: None,
        })
    }

    async fn upload_multipart(
        &self,
        conn: &S3Connection,
        key: &str,
        request: &UploadRequest,
        ctx: &UploadContext,
    ) -> Result<UploadResult, UploadError> {
        let resume_key = format!(
            "{}|{}|{}|{}",
            conn.endpoint_key,
            key,
            request.local_path.display(),
            request.bytes_total
        );

        let resumable = ctx.resume && self.transfer.resume_partial;
        let existing = self.uploads.get(&resume_key).map(|s| s.clone());
        let mut state = match existing {
            Some(mut state) if resumable => {
                info!(
                    "Resuming multipart upload of {} at part {}",
                    key,
                    state.parts.len() + 1
                );
                state.owner = request.job_id;
                if let Some(mut entry) = self.uploads.get_mut(&resume_key) {
                    entry.owner = request.job_id;
                }
                state
            }
            existing => {
                if existing.is_some() {
                    debug!("Dropping earlier multipart upload of {}", key);
                    self.abandon(&resume_key).await;
                }
                let state = MultipartState {
                    owner: request.job_id,
                    key: key.to_string(),
                    upload_id: initiate(conn, key, ctx).await?,
                    part_size: self.transfer.multipart_part_size.max(1),
                    parts: Vec::new(),
                    conn: conn.clone(),
                };
                self.uploads.insert(resume_key.clone(), state.clone());
                state
            }
        };

        let part_size = state.part_size;
        let part_count = request.bytes_total.div_ceil(part_size) as u32;
        let offset = state.parts.len() as u64 * part_size;
        ctx.progress.begin_attempt(offset);

        let mut file = open_source(&request.local_path, offset).await?;
        let mut throttle = ctx.throttle();
        let mut buf = vec![0u8; part_size as usize];
        let mut sent = 0u64;

        for part_number in (state.parts.len() as u32 + 1)..=part_count {
            if ctx.cancel.is_cancelled() {
                self.abandon(&resume_key).await;
                return Err(UploadError::Cancelled);
            }
            let n = read_full(&mut file, &mut buf).await?;
            let part = Bytes::copy_from_slice(&buf[..n]);

            match upload_part(conn, key, &state.upload_id, part_number, part, ctx).await {
                Ok(etag) => {
                    state.parts.push(CompletedPart { part_number, etag });
                    if let Some(mut entry) = self.uploads.get_mut(&resume_key) {
                        entry.parts = state.parts.clone();
                    }
                }
                Err(UploadError::Cancelled) => {
                    self.abandon(&resume_key).await;
                    return Err(UploadError::Cancelled);
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    self.abandon(&resume_key).await;
                    return Err(e);
                }
            }

            sent += n as u64;
            ctx.progress.advance(n as u64);
            throttle.pace(n as u64).await;
        }

        if let Err(e) = complete(conn, key, &state).await {
            if !e.is_retryable() {
                self.abandon(&resume_key).await;
            }
            return Err(e);
        }
        self.uploads.remove(&resume_key);
        info!(
            "Completed multipart upload s3://{}/{} ({} parts)",
            conn.bucket, key, part_count
        );

        Ok(UploadResult {
            bytes_sent: sent,
            resumed_from: offset,
            remote_size: None,
        })
    }

    /// Abort every multipart upload last worked on by `job_id`
    pub(crate) async fn discard(&self, job_id: JobId) {
        let owned: Vec<String> = self
            .uploads
            .iter()
            .filter(|entry| entry.owner == job_id)
            .map(|entry| entry.key().clone())
            .collect();
        for resume_key in owned {
            self.abandon(&resume_key).await;
        }
    }

    /// Abort the multipart upload and forget its parts
    async fn abandon(&self, resume_key: &str) {
        let Some((_, state)) = self.uploads.remove(resume_key) else {
            return;
        };
        abort(&state.conn, &state.key, &state.upload_id).await;
    }
}

async fn abort(conn: &S3Connection, key: &str, upload_id: &str) {
    let mut query = BTreeMap::new();
    query.insert("uploadId".to_string(), upload_id.to_string());
    let request = match conn.signed(Method::DELETE, Some(key), &query, &sha256_hex(b"")) {
        Ok(request) => request,
        Err(e) => {
            warn!("Cannot abort multipart upload of {}: {}", key, e);
            return;
        }
    };
    match request.send().await {
        Ok(response) if response.status().is_success() => {
            debug!("Aborted multipart upload of {}", key)
        }
        Ok(response) => warn!(
            "Abort of multipart upload {} returned {}",
            key,
            response.status()
        ),
        Err(e) => warn!("Abort of multipart upload {} failed: {}", key, e),
    }
}

async fn initiate(
    conn: &S3Connection,
    key: &str,
    ctx: &UploadContext,
) -> Result<String, UploadError> {
    let mut query = BTreeMap::new();
    query.insert("uploads".to_string(), String::new());
    let response = conn
        .signed(Method::POST, Some(key), &query, &sha256_hex(b""))
        .map_err(UploadError::permanent)?
        .send()
        .await
        .map_err(|e| request_error(e, &ctx.cancel))?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(status_error(status, &body));
    }
    let result: InitiateMultipartUploadResult = quick_xml::de::from_str(&body)
        .map_err(|e| UploadError::transient(format!("bad InitiateMultipartUpload reply: {}", e)))?;
    debug!("Started multipart upload {} for {}", result.upload_id, key);
    Ok(result.upload_id)
}

async fn upload_part(
    conn: &S3Connection,
    key: &str,
    upload_id: &str,
    part_number: u32,
    part: Bytes,
    ctx: &UploadContext,
) -> Result<String, UploadError> {
    let mut query = BTreeMap::new();
    query.insert("partNumber".to_string(), part_number.to_string());
    query.insert("uploadId".to_string(), upload_id.to_string());
    let response = conn
        .signed(Method::PUT, Some(key), &query, &sha256_hex(&part))
        .map_err(UploadError::permanent)?
        .header(CONTENT_LENGTH, part.len())
        .body(part)
        .send()
        .await
        .map_err(|e| request_error(e, &ctx.cancel))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(status, &body));
    }
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| UploadError::transient(format!("part {} reply has no ETag", part_number)))
}

async fn complete(conn: &S3Connection, key: &str, state: &MultipartState) -> Result<(), UploadError> {
    let body = quick_xml::se::to_string(&CompleteMultipartUpload {
        parts: &state.parts,
    })
    .map_err(|e| UploadError::permanent(format!("cannot encode part list: {}", e)))?;

    let mut query = BTreeMap::new();
    query.insert("uploadId".to_string(), state.upload_id.clone());
    let response = conn
        .signed(Method::POST, Some(key), &query, &sha256_hex(body.as_bytes()))
        .map_err(UploadError::permanent)?
        .body(body)
        .send()
        .await
        .map_err(|e| UploadError::transient(e.to_string()))?;

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(status_error(status, &text));
    }
    // S3 may report a failed completion inside a 200 reply
    if text.contains("<Error>") {
        return Err(UploadError::transient(format!(
            "CompleteMultipartUpload failed: {}",
            text
        )));
    }
    Ok(())
}

async fn head_object(conn: &S3Connection, key: &str) -> Option<u64> {
    let response = conn
        .signed(Method::HEAD, Some(key), &BTreeMap::new(), &sha256_hex(b""))
        .ok()?
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    response
        .headers()
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;
    use uplink_core::JobId;

    use crate::event_bus::channel;
    use crate::progress::ProgressReporter;
    use crate::protocol::test_server::{RecordedRequest, TestResponse, TestServer};

    fn params(server: &TestServer) -> ConnectionParams {
        let mut params = ConnectionParams::new(server.url()).with_username("AKIDTEST");
        params.bucket = Some("media".into());
        params.region = Some("eu-west-1".into());
        params
    }

    fn context(total: u64) -> UploadContext {
        context_with(total, false)
    }

    fn context_with(total: u64, resume: bool) -> UploadContext {
        let (bus, _stream) = channel(64);
        UploadContext {
            progress: ProgressReporter::with_intervals(JobId(1), total, bus, 1, Duration::ZERO),
            cancel: CancellationToken::new(),
            bandwidth_limit_kbps: 0,
            resume,
        }
    }

    /// Multipart server that hands out U-1, U-2, ... and fails part 2 once
    async fn flaky_multipart_server() -> TestServer {
        let initiated = Arc::new(AtomicUsize::new(0));
        let part_two_failures = Arc::new(AtomicUsize::new(0));
        TestServer::start(move |req: &RecordedRequest| {
            match (req.method.as_str(), req.path.as_str()) {
                ("HEAD", _) => TestResponse::ok(),
                ("POST", p) if p.ends_with("?uploads=") => {
                    let n = initiated.fetch_add(1, Ordering::SeqCst) + 1;
                    TestResponse::ok().body(format!(
                        "<InitiateMultipartUploadResult><UploadId>U-{}</UploadId>\
                         </InitiateMultipartUploadResult>",
                        n
                    ))
                }
                ("PUT", p) if p.contains("partNumber=2") => {
                    if part_two_failures.fetch_add(1, Ordering::SeqCst) == 0 {
                        TestResponse::status(500)
                    } else {
                        TestResponse::ok().header("etag", "\"e2\"")
                    }
                }
                ("PUT", _) => TestResponse::ok().header("etag", "\"e\""),
                ("POST", p) if p.contains("uploadId=") => TestResponse::ok()
                    .body("<CompleteMultipartUploadResult></CompleteMultipartUploadResult>"),
                ("DELETE", _) => TestResponse::status(204),
                _ => TestResponse::status(400),
            }
        })
        .await
    }

    fn small_parts() -> TransferConfig {
        TransferConfig {
            multipart_threshold: 8,
            multipart_part_size: 4,
            verify_remote_size: false,
            ..TransferConfig::default()
        }
    }

    fn source(content: &[u8], remote: &str) -> (tempfile::NamedTempFile, UploadRequest) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, content).unwrap();
        let request = UploadRequest {
            job_id: JobId(1),
            local_path: file.path().to_path_buf(),
            remote_path: remote.into(),
            bytes_total: content.len() as u64,
        };
        (file, request)
    }

    fn secret() -> SecretString {
        SecretString::new("wJalrXUtnFEMI/K7MDENG".into())
    }

    #[tokio::test]
    async fn test_single_put_is_signed() {
        let server = TestServer::start(|req: &RecordedRequest| match req.method.as_str() {
            "HEAD" if req.path == "/media" => TestResponse::ok(),
            "HEAD" => TestResponse::ok().body(vec![0u8; 11]),
            "PUT" => TestResponse::ok().header("etag", "\"abc\""),
            _ => TestResponse::status(400),
        })
        .await;

        let client = S3Client::new(TransferConfig::default());
        let (identity, mut conn) = client
            .connect(&params(&server), &secret(), &NetworkConfig::default())
            .await
            .unwrap();
        assert_eq!(identity, "AKIDTEST");

        let (_file, request) = source(b"hello world", "/2024/notes v1.txt");
        let result = client
            .upload(&mut conn, &request, &context(11))
            .await
            .unwrap();
        assert_eq!(result.bytes_sent, 11);
        assert_eq!(result.remote_size, Some(11));

        let put = server
            .requests()
            .into_iter()
            .find(|r| r.method == "PUT")
            .unwrap();
        assert_eq!(put.path, "/media/2024/notes%20v1.txt");
        assert_eq!(put.body, b"hello world");
        assert_eq!(put.header("x-amz-content-sha256"), Some(UNSIGNED_PAYLOAD));
        assert!(put
            .header("authorization")
            .unwrap()
            .starts_with("AWS4-HMAC-SHA256 Credential=AKIDTEST/"));
        assert!(put.header("authorization").unwrap().contains("/eu-west-1/s3/aws4_request"));
    }

    #[tokio::test]
    async fn test_denied_bucket_is_auth_rejected() {
        let server = TestServer::start(|_| TestResponse::status(403)).await;
        let client = S3Client::new(TransferConfig::default());
        let err = client
            .connect(&params(&server), &secret(), &NetworkConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::AuthRejected(_)));
    }

    #[tokio::test]
    async fn test_missing_bucket_is_invalid_endpoint() {
        let server = TestServer::start(|_| TestResponse::ok()).await;
        let client = S3Client::new(TransferConfig::default());
        let mut params = params(&server);
        params.bucket = None;
        let err = client
            .connect(&params, &secret(), &NetworkConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::InvalidEndpoint(_)));
    }

    #[tokio::test]
    async fn test_multipart_resumes_at_missing_part() {
        let part_two_failures = Arc::new(AtomicUsize::new(0));
        let failures = part_two_failures.clone();
        let server = TestServer::start(move |req: &RecordedRequest| {
            match (req.method.as_str(), req.path.as_str()) {
                ("HEAD", "/media") => TestResponse::ok(),
                ("POST", p) if p.ends_with("?uploads=") => TestResponse::ok().body(
                    "<InitiateMultipartUploadResult><Bucket>media</Bucket>\
                     <Key>big.bin</Key><UploadId>U-42</UploadId></InitiateMultipartUploadResult>",
                ),
                ("PUT", p) if p.contains("partNumber=2") => {
                    if failures.fetch_add(1, Ordering::SeqCst) == 0 {
                        TestResponse::status(500)
                    } else {
                        TestResponse::ok().header("etag", "\"e2\"")
                    }
                }
                ("PUT", p) if p.contains("partNumber=") => {
                    let n = p.split("partNumber=").nth(1).unwrap().split('&').next().unwrap();
                    TestResponse::ok().header("etag", &format!("\"e{}\"", n))
                }
                ("POST", p) if p.contains("uploadId=U-42") => TestResponse::ok()
                    .body("<CompleteMultipartUploadResult><Key>big.bin</Key></CompleteMultipartUploadResult>"),
                _ => TestResponse::status(400),
            }
        })
        .await;

        let transfer = TransferConfig {
            multipart_threshold: 8,
            multipart_part_size: 4,
            verify_remote_size: false,
            ..TransferConfig::default()
        };
        let client = S3Client::new(transfer);
        let (_, mut conn) = client
            .connect(&params(&server), &secret(), &NetworkConfig::default())
            .await
            .unwrap();
        let (_file, request) = source(b"0123456789", "big.bin");

        let first = client.upload(&mut conn, &request, &context(10)).await;
        assert!(first.unwrap_err().is_retryable());
        assert_eq!(client.pending_multipart(), 1);

        let result = client
            .upload(&mut conn, &request, &context_with(10, true))
            .await
            .unwrap();
        assert_eq!(result.resumed_from, 4);
        assert_eq!(result.bytes_sent, 6);
        assert_eq!(client.pending_multipart(), 0);

        let requests = server.requests();
        let count = |needle: &str| {
            requests
                .iter()
                .filter(|r| r.method == "PUT" && r.path.contains(needle))
                .count()
        };
        assert_eq!(count("partNumber=1&"), 1);
        assert_eq!(count("partNumber=2&"), 2);
        assert_eq!(count("partNumber=3&"), 1);
        assert_eq!(
            requests.iter().filter(|r| r.path.ends_with("?uploads=")).count(),
            1
        );

        let complete = requests
            .iter()
            .find(|r| r.method == "POST" && r.path.contains("uploadId=U-42"))
            .unwrap();
        let body = String::from_utf8_lossy(&complete.body);
        assert_eq!(body.matches("<Part>").count(), 3);
        assert!(body.contains("<PartNumber>3</PartNumber>"));
    }

    #[tokio::test]
    async fn test_permanent_part_failure_aborts() {
        let server = TestServer::start(|req: &RecordedRequest| {
            match (req.method.as_str(), req.path.as_str()) {
                ("HEAD", _) => TestResponse::ok(),
                ("POST", p) if p.ends_with("?uploads=") => TestResponse::ok()
                    .body("<InitiateMultipartUploadResult><UploadId>U-7</UploadId></InitiateMultipartUploadResult>"),
                ("PUT", _) => TestResponse::status(403),
                ("DELETE", _) => TestResponse::status(204),
                _ => TestResponse::status(400),
            }
        })
        .await;
        let transfer = TransferConfig {
            multipart_threshold: 2,
            multipart_part_size: 4,
            ..TransferConfig::default()
        };
        let client = S3Client::new(transfer);
        let (_, mut conn) = client
            .connect(&params(&server), &secret(), &NetworkConfig::default())
            .await
            .unwrap();
        let (_file, request) = source(b"0123456789", "big.bin");
        let err = client
            .upload(&mut conn, &request, &context(10))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(client.pending_multipart(), 0);
        assert!(server
            .requests()
            .iter()
            .any(|r| r.method == "DELETE" && r.path.contains("uploadId=U-7")));
    }

    #[tokio::test]
    async fn test_discard_aborts_left_over_multipart() {
        let server = flaky_multipart_server().await;
        let client = S3Client::new(small_parts());
        let (_, mut conn) = client
            .connect(&params(&server), &secret(), &NetworkConfig::default())
            .await
            .unwrap();
        let (_file, request) = source(b"0123456789", "big.bin");

        let err = client
            .upload(&mut conn, &request, &context(10))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(client.pending_multipart(), 1);

        // Another job's discard leaves it alone
        client.discard(JobId(2)).await;
        assert_eq!(client.pending_multipart(), 1);

        client.discard(JobId(1)).await;
        assert_eq!(client.pending_multipart(), 0);
        assert!(server
            .requests()
            .iter()
            .any(|r| r.method == "DELETE" && r.path.contains("uploadId=U-1")));
    }

    #[tokio::test]
    async fn test_fresh_attempt_replaces_stale_multipart() {
        let server = flaky_multipart_server().await;
        let client = S3Client::new(small_parts());
        let (_, mut conn) = client
            .connect(&params(&server), &secret(), &NetworkConfig::default())
            .await
            .unwrap();
        let (_file, request) = source(b"0123456789", "big.bin");

        assert!(client
            .upload(&mut conn, &request, &context(10))
            .await
            .is_err());

        // Not resuming: the old upload is aborted and a new one started
        let result = client
            .upload(&mut conn, &request, &context(10))
            .await
            .unwrap();
        assert_eq!(result.resumed_from, 0);
        assert_eq!(result.bytes_sent, 10);
        assert_eq!(client.pending_multipart(), 0);

        let requests = server.requests();
        assert!(requests
            .iter()
            .any(|r| r.method == "DELETE" && r.path.contains("uploadId=U-1")));
        assert!(requests
            .iter()
            .any(|r| r.method == "POST" && r.path.contains("uploadId=U-2")));
        assert!(!requests
            .iter()
            .any(|r| r.method == "POST" && r.path.contains("uploadId=U-1")));
    }
}
