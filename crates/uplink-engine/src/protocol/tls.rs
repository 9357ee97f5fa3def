//! Shared TLS client configuration for FTPS
//!
//! One `ClientConfig` is built per process. Sharing it also shares the
//! session cache, which lets FTPS data channels resume the control
//! channel's TLS session as most servers require.

use std::sync::{Arc, OnceLock};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use uplink_core::ConnectError;

static CLIENT_CONFIG: OnceLock<Result<Arc<ClientConfig>, String>> = OnceLock::new();

fn client_config() -> Result<Arc<ClientConfig>, ConnectError> {
    CLIENT_CONFIG
        .get_or_init(|| {
            let roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .map(|builder| {
                Arc::new(
                    builder
                        .with_root_certificates(roots)
                        .with_no_client_auth(),
                )
            })
            .map_err(|e| e.to_string())
        })
        .clone()
        .map_err(|e| ConnectError::Protocol(format!("TLS setup failed: {}", e)))
}

/// Wrap `stream` in a TLS client session for `host`
pub(crate) async fn wrap<S>(stream: S, host: &str) -> Result<TlsStream<S>, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| ConnectError::InvalidEndpoint(format!("invalid TLS server name: {}", host)))?;
    TlsConnector::from(client_config()?)
        .connect(server_name, stream)
        .await
        .map_err(|e| ConnectError::Network(format!("TLS handshake with {} failed: {}", host, e)))
}
