//! Server-side TLS for the proxy's own front door.
//!
//! The certificate/key pair comes from configuration, or is generated once at
//! startup as an ephemeral self-signed certificate that lives only in memory.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

use super::{load_certs, load_private_key, provider, TlsError, ALPN_H2, ALPN_HTTP11};
use crate::config::ListenConfig;

pub struct ServerTls {
    config: Arc<ServerConfig>,
    /// PEM of the generated certificate, so clients can be told what to trust.
    generated_pem: Option<String>,
}

impl ServerTls {
    pub fn from_config(listen: &ListenConfig) -> Result<Self, TlsError> {
        match (&listen.cert_file, &listen.key_file) {
            (Some(cert_path), Some(key_path)) => {
                tracing::info!(cert = ?cert_path, "Loading listener certificate");
                let chain = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                let config = Self::build(chain, key, listen.http2)?;
                Ok(Self {
                    config,
                    generated_pem: None,
                })
            }
            _ => {
                tracing::info!(
                    hosts = ?listen.self_signed_hosts,
                    "No listener certificate configured, generating ephemeral self-signed pair"
                );
                Self::self_signed(&listen.self_signed_hosts, listen.http2)
            }
        }
    }

    pub fn self_signed(hosts: &[String], http2: bool) -> Result<Self, TlsError> {
        let (cert_pem, chain, key) = Self::generate_self_signed(hosts)?;
        let config = Self::build(chain, key, http2)?;
        Ok(Self {
            config,
            generated_pem: Some(cert_pem),
        })
    }

    fn generate_self_signed(
        hosts: &[String],
    ) -> Result<(String, Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
        let mut params = CertificateParams::new(hosts.to_vec())
            .map_err(|e| TlsError::CertGeneration(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            hosts.first().map(String::as_str).unwrap_or("pinniped-proxy"),
        );
        dn.push(DnType::OrganizationName, "pinniped-proxy");
        params.distinguished_name = dn;

        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(365);

        let key_pair = KeyPair::generate().map_err(|e| TlsError::CertGeneration(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TlsError::CertGeneration(e.to_string()))?;

        let private_key = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| TlsError::InvalidKey(e.to_string()))?;

        Ok((cert.pem(), vec![cert.der().clone()], private_key))
    }

    fn build(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        http2: bool,
    ) -> Result<Arc<ServerConfig>, TlsError> {
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| TlsError::InvalidCert(e.to_string()))?;

        config.alpn_protocols = if http2 {
            vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
        } else {
            vec![ALPN_HTTP11.to_vec()]
        };

        Ok(Arc::new(config))
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }

    pub fn generated_certificate_pem(&self) -> Option<&str> {
        self.generated_pem.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_self_signed_when_unconfigured() {
        let listen = ListenConfig::default();
        let tls = ServerTls::from_config(&listen).expect("Failed to build listener TLS");

        let pem = tls.generated_certificate_pem().expect("Expected generated cert");
        assert!(pem.contains("BEGIN CERTIFICATE"));
        assert_eq!(
            tls.server_config().alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_configured_pair_is_loaded() {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["proxy.internal".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();

        let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let cert_path = dir.path().join("tls.crt");
        let key_path = dir.path().join("tls.key");
        std::fs::File::create(&cert_path)
            .unwrap()
            .write_all(cert.pem().as_bytes())
            .unwrap();
        std::fs::File::create(&key_path)
            .unwrap()
            .write_all(key.serialize_pem().as_bytes())
            .unwrap();

        let listen = ListenConfig {
            cert_file: Some(cert_path),
            key_file: Some(key_path),
            http2: false,
            ..Default::default()
        };
        let tls = ServerTls::from_config(&listen).expect("Failed to load listener TLS");

        assert!(tls.generated_certificate_pem().is_none());
        assert_eq!(tls.server_config().alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_missing_files_fail() {
        let listen = ListenConfig {
            cert_file: Some("/nonexistent/tls.crt".into()),
            key_file: Some("/nonexistent/tls.key".into()),
            ..Default::default()
        };
        assert!(matches!(
            ServerTls::from_config(&listen),
            Err(TlsError::CertLoad(_))
        ));
    }
}
