use std::io::Cursor;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{self, ServerConfig};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read certificate file: {0}")]
    CertificateRead(#[from] std::io::Error),

    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),

    #[error("failed to parse private key: {0}")]
    PrivateKeyParse(String),

    #[error("tls configuration error: {0}")]
    Config(#[from] rustls::Error),

    #[error("no valid certificate found in file")]
    NoCertificate,

    #[error("no valid private key found in file")]
    NoPrivateKey,
}

/// Build the DoH server's TLS acceptor from PEM files: TLS 1.2 minimum,
/// 1.3 maximum, ALPN h2 then http/1.1.
pub fn build_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TlsError> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let certs = load_certificates(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    // http/2 is recommended for DoH; without the ALPN entry the upgrade
    // never happens.
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certificates(cert_path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let data = std::fs::read(cert_path)?;
    let mut cursor = Cursor::new(data);

    let certs: Result<Vec<CertificateDer<'static>>, _> =
        rustls_pemfile::certs(&mut cursor).collect();
    let certs = certs.map_err(|err| TlsError::CertificateParse(err.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificate);
    }
    info!("loaded {} certificate(s) from {}", certs.len(), cert_path);
    Ok(certs)
}

fn load_private_key(key_path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let data = std::fs::read(key_path)?;

    let mut cursor = Cursor::new(&data);
    let keys: Result<Vec<_>, _> = rustls_pemfile::pkcs8_private_keys(&mut cursor).collect();
    let keys = keys.map_err(|err| TlsError::PrivateKeyParse(err.to_string()))?;
    if let Some(key) = keys.into_iter().next() {
        info!("loaded pkcs8 private key from {}", key_path);
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    let mut cursor = Cursor::new(&data);
    let keys: Result<Vec<_>, _> = rustls_pemfile::rsa_private_keys(&mut cursor).collect();
    let keys = keys.map_err(|err| TlsError::PrivateKeyParse(err.to_string()))?;
    if let Some(key) = keys.into_iter().next() {
        info!("loaded rsa private key from {}", key_path);
        return Ok(PrivateKeyDer::Pkcs1(key));
    }

    Err(TlsError::NoPrivateKey)
}
