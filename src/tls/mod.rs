//! TLS material handling shared by the front door, the issuance client and
//! the upstream connector.
//!
//! All rustls configs are built against an explicit `ring` provider so the
//! process never depends on a globally installed default.

pub mod server;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub use server::ServerTls;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    #[error("Failed to load certificate: {0}")]
    CertLoad(String),

    #[error("Invalid certificate: {0}")]
    InvalidCert(String),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse every certificate in a PEM bundle.
pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidCert(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::InvalidCert("no certificates found in PEM".into()));
    }

    Ok(certs)
}

/// Parse the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM document.
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| TlsError::InvalidKey(e.to_string()))?
        .ok_or_else(|| TlsError::InvalidKey("no private key found in PEM".into()))
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = fs::read(path)
        .map_err(|e| TlsError::CertLoad(format!("{}: {}", path.display(), e)))?;
    parse_certs(&pem)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = fs::read(path)
        .map_err(|e| TlsError::CertLoad(format!("{}: {}", path.display(), e)))?;
    parse_private_key(&pem)
}

pub fn root_store(certs: &[CertificateDer<'static>]) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs.iter().cloned());

    if added == 0 {
        return Err(TlsError::InvalidCert(format!(
            "none of the {} trust roots could be parsed",
            ignored
        )));
    }

    Ok(roots)
}

/// Client config presenting `chain`/`key` to a server validated against `roots`.
pub fn mutual_client_config(
    roots: Arc<RootCertStore>,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    http2: bool,
) -> Result<ClientConfig, TlsError> {
    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)?;

    config.alpn_protocols = if http2 {
        vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
    } else {
        vec![ALPN_HTTP11.to_vec()]
    };

    Ok(config)
}
