//! AWS Signature Version 4 for S3 requests
//!
//! 1. Canonical request (method, encoded path, sorted query, signed headers,
//!    payload hash)
//! 2. String to sign over the request's hash and credential scope
//! 3. Signing key derived from the secret via an HMAC chain
//! 4. `Authorization` header carrying the signature
//!
//! Streamed bodies are signed as `UNSIGNED-PAYLOAD`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Payload hash for bodies that are streamed rather than hashed up front
pub(crate) const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// RFC 3986 unreserved characters stay as-is
const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Clone)]
pub(crate) struct SigV4Signer {
    access_key_id: String,
    secret_access_key: SecretString,
    region: String,
    service: &'static str,
}

impl std::fmt::Debug for SigV4Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigV4Signer")
            .field("access_key_id", &self.access_key_id)
            .field("region", &self.region)
            .finish()
    }
}

impl SigV4Signer {
    pub fn s3(access_key_id: &str, secret_access_key: SecretString, region: &str) -> Self {
        Self {
            access_key_id: access_key_id.to_string(),
            secret_access_key,
            region: region.to_string(),
            service: "s3",
        }
    }

    /// Headers to add to the request, `authorization` included.
    ///
    /// `canonical_uri` must already be encoded with [`uri_encode_path`];
    /// `extra` lists additional headers that take part in the signature.
    #[allow(clippy::too_many_arguments)]
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        canonical_uri: &str,
        query: &BTreeMap<String, String>,
        extra: &BTreeMap<String, String>,
        payload_hash: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<BTreeMap<String, String>, InvalidLength> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers: BTreeMap<String, String> = extra
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        headers.insert("host".into(), host.to_string());
        headers.insert("x-amz-content-sha256".into(), payload_hash.to_string());
        headers.insert("x-amz-date".into(), amz_date.clone());

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();
        let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            canonical_uri,
            canonical_query(query),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!("{}/{}/{}/aws4_request", date_stamp, self.region, self.service);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let secret = format!("AWS4{}", self.secret_access_key.expose_secret());
        let k_date = hmac_sha256(secret.as_bytes(), date_stamp.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, self.service.as_bytes())?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

        headers.remove("host");
        headers.insert(
            "authorization".into(),
            format!(
                "{} Credential={}/{}, SignedHeaders={}, Signature={}",
                ALGORITHM, self.access_key_id, scope, signed_headers, signature
            ),
        );
        Ok(headers)
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn uri_encode(input: &str) -> String {
    utf8_percent_encode(input, URI_ENCODE_SET).to_string()
}

/// Encode each path segment, keeping the slashes
pub(crate) fn uri_encode_path(path: &str) -> String {
    path.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

fn canonical_query(query: &BTreeMap<String, String>) -> String {
    query
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}
