//! Opening the socket to the Autonomia server, optionally over TLS.

use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig as TlsConfig, RootCertStore};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Byte stream carrying one attached session.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

pub type BoxedConnection = Box<dyn Connection>;

fn tls_connector() -> TlsConnector {
    static CONFIG: OnceLock<Arc<TlsConfig>> = OnceLock::new();

    let config = CONFIG.get_or_init(|| {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            TlsConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    });

    TlsConnector::from(Arc::clone(config))
}

/// Open a fresh connection to the configured server.
///
/// # Errors
///
/// Returns `ClientError::Timeout` if the TCP connect does not complete in
/// time, `ClientError::InvalidServerName` if TLS is on and the server name is
/// not a valid DNS name or IP, and `ClientError::Io` for socket failures.
pub async fn open(config: &ClientConfig) -> Result<BoxedConnection> {
    let port = config.port();
    debug!("Connecting to {}:{} (tls: {})", config.server, port, config.use_tls);

    let stream = tokio::time::timeout(
        config.connect_timeout(),
        TcpStream::connect((config.server.as_str(), port)),
    )
    .await
    .map_err(|_| ClientError::Timeout("connecting"))??;
    stream.set_nodelay(true)?;

    if !config.use_tls {
        return Ok(Box::new(stream));
    }

    let domain = ServerName::try_from(config.server.clone())
        .map_err(|e| ClientError::InvalidServerName(format!("{}: {e}", config.server)))?;
    let tls = tls_connector().connect(domain, stream).await?;
    debug!("TLS session established with {}", config.server);

    Ok(Box::new(tls))
}
