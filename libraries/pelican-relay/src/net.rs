//! Connection helpers: plain TCP, implicit TLS, and STARTTLS upgrade over
//! rustls.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::RelayError;

/// Budget for establishing the TCP connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for each read or write on an established connection.
pub const IO_TIMEOUT: Duration = Duration::from_secs(3);

/// Root store: platform certificates first, Mozilla roots as fallback.
fn root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    if let Ok(certs) = rustls_native_certs::load_native_certs() {
        for cert in certs {
            let _ = roots.add(cert);
        }
    }
    if roots.is_empty() {
        roots.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    roots
}

static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();

fn connector() -> &'static TlsConnector {
    CONNECTOR.get_or_init(|| {
        let config = ClientConfig::builder()
            .with_root_certificates(root_store())
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    })
}

fn server_name(host: &str) -> Result<ServerName<'static>, RelayError> {
    ServerName::try_from(host.to_string()).map_err(|_| RelayError::Tls("invalid host name".into()))
}

/// Open a plain TCP connection within [`DIAL_TIMEOUT`].
pub async fn connect_plain(host: &str, port: u16) -> Result<TcpStream, RelayError> {
    let connect = TcpStream::connect((host, port));
    match timeout(DIAL_TIMEOUT, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(RelayError::Dial(err.to_string())),
        Err(_) => Err(RelayError::Dial(format!("dial {host}:{port} timed out"))),
    }
}

/// Open a connection with an immediate TLS handshake (implicit TLS, port
/// 465).
pub async fn connect_implicit_tls(host: &str, port: u16) -> Result<TlsStream<TcpStream>, RelayError> {
    let tcp = connect_plain(host, port).await?;
    let name = server_name(host)?;
    match timeout(DIAL_TIMEOUT, connector().connect(name, tcp)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(RelayError::Tls(err.to_string())),
        Err(_) => Err(RelayError::Tls("tls handshake timed out".into())),
    }
}

/// Upgrade an established plain connection after a STARTTLS exchange.
pub async fn upgrade_tls(tcp: TcpStream, host: &str) -> Result<TlsStream<TcpStream>, RelayError> {
    let name = server_name(host)?;
    match timeout(DIAL_TIMEOUT, connector().connect(name, tcp)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(RelayError::Tls(err.to_string())),
        Err(_) => Err(RelayError::Tls("tls handshake timed out".into())),
    }
}
