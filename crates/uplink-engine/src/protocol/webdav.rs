//! WebDAV client
//!
//! `PROPFIND` (depth 0) on the collection root authenticates the session,
//! `MKCOL` creates missing parent collections and `PUT` streams the body.
//! WebDAV has no partial-upload semantics, so every attempt starts over.

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use secrecy::SecretString;
use tracing::{debug, info, warn};

use uplink_core::{ConnectError, ConnectionParams, NetworkConfig, TransferConfig, UploadError};

use super::http::{base_url, build_client, file_body, request_error, status_error, RequestAuth};
use super::{join_url, parent_dirs, UploadContext, UploadRequest, UploadResult};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?><propfind xmlns="DAV:"><prop><resourcetype/></prop></propfind>"#;

/// An authenticated WebDAV collection
pub struct WebDavConnection {
    client: Client,
    base_url: String,
    auth: RequestAuth,
}

impl std::fmt::Debug for WebDavConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebDavConnection")
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn method(name: &'static str) -> Method {
    Method::from_bytes(name.as_bytes()).unwrap_or(Method::GET)
}

pub(crate) async fn connect(
    params: &ConnectionParams,
    secret: &SecretString,
    network: &NetworkConfig,
) -> Result<(String, WebDavConnection), ConnectError> {
    let url = base_url(&params.endpoint, "https")?;
    let client = build_client(network, &params.http.headers)?;
    let username = params.username.clone().unwrap_or_default();
    let auth = RequestAuth::Basic {
        username: username.clone(),
        password: secret.clone(),
    };

    let response = auth
        .apply(client.request(method("PROPFIND"), url.as_str()))
        .header("Depth", "0")
        .header(CONTENT_TYPE, "application/xml")
        .body(PROPFIND_BODY)
        .send()
        .await
        .map_err(|e| ConnectError::Network(format!("{}: {}", url, e)))?;

    let status = response.status();
    match status {
        s if s.is_success() => {}
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            return Err(ConnectError::AuthRejected(format!(
                "{} rejected credentials for {}",
                url, username
            )))
        }
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => {
            return Err(ConnectError::InvalidEndpoint(format!(
                "{} is not a WebDAV collection ({})",
                url, status
            )))
        }
        s if s.is_server_error() => {
            return Err(ConnectError::Network(format!("{} replied {}", url, s)))
        }
        s => return Err(ConnectError::Protocol(format!("{} replied {}", url, s))),
    }

    info!("WebDAV login as {} on {}", username, url);
    Ok((
        username,
        WebDavConnection {
            client,
            base_url: url.to_string(),
            auth,
        },
    ))
}

/// Create parent collections; existing ones answer 405
async fn make_parents(conn: &WebDavConnection, remote_path: &str) -> Result<(), UploadError> {
    for dir in parent_dirs(remote_path) {
        let url = format!("{}/", join_url(&conn.base_url, &dir));
        let response = conn
            .auth
            .apply(conn.client.request(method("MKCOL"), &url))
            .send()
            .await
            .map_err(|e| UploadError::transient(format!("MKCOL {}: {}", dir, e)))?;
        match response.status() {
            StatusCode::CREATED => debug!("Created collection {}", dir),
            StatusCode::METHOD_NOT_ALLOWED => {}
            s if s.is_success() => {}
            s => warn!("MKCOL {} returned {}", dir, s),
        }
    }
    Ok(())
}

/// Size reported by `HEAD`, if the server sends one
async fn remote_size(conn: &WebDavConnection, url: &str) -> Option<u64> {
    let response = conn
        .auth
        .apply(conn.client.head(url))
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

pub(crate) async fn upload(
    conn: &mut WebDavConnection,
    request: &UploadRequest,
    ctx: &UploadContext,
    transfer: &TransferConfig,
) -> Result<UploadResult, UploadError> {
    ctx.check_cancelled()?;
    ctx.progress.begin_attempt(0);
    make_parents(conn, &request.remote_path).await?;

    let url = join_url(&conn.base_url, &request.remote_path);
    let body = file_body(request, ctx, transfer.chunk_size).await?;
    let response = conn
        .auth
        .apply(conn.client.put(&url))
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
    ctx.progress.flush();

    let remote_size = if transfer.verify_remote_size {
        remote_size(conn, &url).await
    } else {
        None
    };
    Ok(UploadResult {
        bytes_sent: request.bytes_total,
        resumed_from: 0,
        remote_size,
    })
}
