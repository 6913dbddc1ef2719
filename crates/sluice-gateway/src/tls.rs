//! TLS termination for webhook ports.
//!
//! [`load_server_config`] turns configured PEM files into a rustls server
//! config, requiring client certificates when a CA bundle is configured.
//! [`TlsListener`] plugs the handshake into `axum::serve`, so HTTPS ports
//! get the same graceful shutdown as plaintext ones.

use std::{io, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use rustls::{
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    RootCertStore, ServerConfig,
};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tracing::debug;

use crate::config::TlsSettings;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors loading TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A PEM file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that failed
        path: String,
        /// Underlying I/O error
        source: io::Error,
    },

    /// Certificate PEM was unusable.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Private key PEM was unusable.
    #[error("private key error: {0}")]
    PrivateKey(String),

    /// rustls rejected the assembled configuration.
    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// Builds the server config for one port.
///
/// # Errors
///
/// Returns [`TlsError`] when a file is unreadable or the PEM material does
/// not form a valid certificate chain and key.
pub async fn load_server_config(settings: &TlsSettings) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = parse_certificates(&read_pem(&settings.cert_path).await?)?;
    if certs.is_empty() {
        return Err(TlsError::Certificate("no certificates found".into()));
    }
    let key = parse_private_key(&read_pem(&settings.key_path).await?)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(e.to_string()))?;

    let mut config = match &settings.client_ca_path {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in parse_certificates(&read_pem(ca_path).await?)? {
                roots.add(cert).map_err(|e| {
                    TlsError::Certificate(format!("failed to add CA certificate: {e}"))
                })?;
            }
            if roots.is_empty() {
                return Err(TlsError::Certificate("no CA certificates found".into()));
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| TlsError::Config(format!("client verifier error: {e}")))?;
            builder.with_client_cert_verifier(verifier).with_single_cert(certs, key)
        },
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| TlsError::Config(e.to_string()))?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| TlsError::Read { path: path.display().to_string(), source })
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("failed to parse certificates: {e}")))
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| TlsError::PrivateKey(format!("failed to parse private key: {e}")))
}

/// TCP listener that yields connections after a completed TLS handshake.
///
/// Handshakes run on their own tasks so a slow client cannot stall the
/// accept loop. Dropping the listener closes the socket.
#[derive(Debug)]
pub struct TlsListener {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
    accept_task: JoinHandle<()>,
}

impl TlsListener {
    /// Wraps a bound listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be read.
    pub fn new(listener: TcpListener, config: Arc<ServerConfig>) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (sender, incoming) = mpsc::channel(64);
        let accept_task = tokio::spawn(accept_loop(listener, TlsAcceptor::from(config), sender));
        Ok(Self { local_addr, incoming, accept_task })
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    sender: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(connection) => connection,
            Err(e) => {
                debug!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            },
        };

        let acceptor = acceptor.clone();
        let sender = sender.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let _ = sender.send((tls, peer)).await;
                },
                Ok(Err(e)) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                Err(_) => debug!(peer = %peer, "TLS handshake timed out"),
            }
        });
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(connection) => connection,
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    struct Material {
        _dir: tempfile::TempDir,
        cert: PathBuf,
        key: PathBuf,
    }

    fn self_signed() -> Material {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

        Material { _dir: dir, cert: cert_path, key: key_path }
    }

    #[tokio::test]
    async fn loads_server_certificate() {
        let material = self_signed();
        let settings =
            TlsSettings { cert_path: material.cert.clone(), key_path: material.key.clone(), client_ca_path: None };

        let config = load_server_config(&settings).await.unwrap();

        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[tokio::test]
    async fn client_verification_uses_ca_bundle() {
        let material = self_signed();
        let settings = TlsSettings {
            cert_path: material.cert.clone(),
            key_path: material.key.clone(),
            client_ca_path: Some(material.cert.clone()),
        };

        assert!(load_server_config(&settings).await.is_ok());
    }

    #[tokio::test]
    async fn missing_files_are_reported() {
        let settings = TlsSettings {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
            client_ca_path: None,
        };

        let err = load_server_config(&settings).await.unwrap_err();

        assert!(matches!(err, TlsError::Read { .. }));
    }

    #[tokio::test]
    async fn garbage_certificate_rejected() {
        let material = self_signed();
        std::fs::write(&material.cert, "not a certificate").unwrap();
        let settings =
            TlsSettings { cert_path: material.cert.clone(), key_path: material.key.clone(), client_ca_path: None };

        assert!(load_server_config(&settings).await.is_err());
    }
}
