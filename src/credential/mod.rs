//! Bearer tokens, exchanged client credentials and the exchange seam.
//!
//! Neither type in this module implements `Clone` or `Serialize`: each value
//! has exactly one owner and its secret bytes are zeroed when it is dropped.
//! Copies made while decoding a credential are zeroed as soon as the retained
//! copy exists; buffers owned by the HTTP client and TLS stack are not.

pub mod api;
pub mod issuer;

use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use secrecy::zeroize::Zeroize;
use secrecy::{ExposeSecret, SecretBox, SecretString};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

use crate::error::ExchangeError;
use crate::tls;

pub use issuer::{CredentialIssuer, HttpIssuer};

#[cfg(test)]
pub use issuer::MockCredentialIssuer;

/// Opaque token taken from `Authorization: Bearer <token>`.
pub struct BearerToken(SecretString);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken([REDACTED])")
    }
}

/// SHA-256 of the leaf certificate; the pool key for connections opened with it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CredentialIdentity([u8; 32]);

impl CredentialIdentity {
    pub fn of(leaf: &CertificateDer<'_>) -> Self {
        Self(Sha256::digest(leaf.as_ref()).into())
    }
}

impl fmt::Display for CredentialIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CredentialIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialIdentity({})", self)
    }
}

/// A short-lived client certificate and key returned by the issuance service.
pub struct ExchangedCredential {
    chain: Vec<CertificateDer<'static>>,
    key: SecretBox<Vec<u8>>,
    not_before: Option<DateTime<Utc>>,
    not_after: DateTime<Utc>,
    target: String,
    identity: CredentialIdentity,
}

impl ExchangedCredential {
    /// Build a credential from the PEM documents an issuance service returns.
    pub fn from_pem(
        target: &str,
        cert_pem: &str,
        key_pem: &str,
        not_before: Option<DateTime<Utc>>,
        not_after: DateTime<Utc>,
    ) -> Result<Self, ExchangeError> {
        let chain = tls::parse_certs(cert_pem.as_bytes())
            .map_err(|e| ExchangeError::MalformedIssuanceResponse(e.to_string()))?;
        if let Some(not_before) = not_before {
            if not_before >= not_after {
                return Err(ExchangeError::MalformedIssuanceResponse(
                    "credential validity window is empty".into(),
                ));
            }
        }

        // Error text from key parsing never contains key bytes.
        let mut parsed = tls::parse_private_key(key_pem.as_bytes())
            .map_err(|e| ExchangeError::MalformedIssuanceResponse(e.to_string()))?;
        let key = SecretBox::new(Box::new(parsed.secret_der().to_vec()));
        parsed.zeroize();

        let identity = CredentialIdentity::of(&chain[0]);
        Ok(Self {
            chain,
            key,
            not_before,
            not_after,
            target: target.to_string(),
            identity,
        })
    }

    pub fn identity(&self) -> CredentialIdentity {
        self.identity
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Whether the credential is usable at `now` and stays usable for at least `margin`.
    pub fn covers(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        covers(self.not_before, self.not_after, now, margin)
    }

    /// Copy the key into the form rustls consumes. The copy's lifetime is bound
    /// to the TLS session that takes it.
    pub(crate) fn private_key(&self) -> Result<PrivateKeyDer<'static>, &'static str> {
        PrivateKeyDer::try_from(self.key.expose_secret().clone())
    }
}

impl fmt::Debug for ExchangedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangedCredential")
            .field("target", &self.target)
            .field("identity", &self.identity)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

pub(crate) fn covers(
    not_before: Option<DateTime<Utc>>,
    not_after: DateTime<Utc>,
    now: DateTime<Utc>,
    margin: Duration,
) -> bool {
    let margin = match chrono::Duration::from_std(margin) {
        Ok(margin) => margin,
        Err(_) => return false,
    };

    not_before.map_or(true, |nb| nb <= now) && now + margin <= not_after
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn pem_pair() -> (String, String) {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["client".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = BearerToken::new("super-secret");
        assert_eq!(token.expose(), "super-secret");
        assert!(!format!("{:?}", token).contains("super-secret"));
    }

    #[test]
    fn test_credential_from_pem() {
        let (cert, key) = pem_pair();
        let not_after = Utc::now() + ChronoDuration::minutes(5);
        let credential = ExchangedCredential::from_pem("cluster-a", &cert, &key, None, not_after)
            .expect("Failed to build credential");

        assert_eq!(credential.target(), "cluster-a");
        assert_eq!(credential.not_after(), not_after);
        assert_eq!(credential.chain().len(), 1);
        // The retained key survives wiping the decoded copy.
        let parsed = tls::parse_private_key(key.as_bytes()).unwrap();
        assert_eq!(
            credential.private_key().unwrap().secret_der(),
            parsed.secret_der()
        );
        assert_eq!(
            credential.identity(),
            CredentialIdentity::of(&credential.chain()[0])
        );

        let debug = format!("{:?}", credential);
        assert!(!debug.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_identity_differs_per_certificate() {
        let (cert_a, key_a) = pem_pair();
        let (cert_b, key_b) = pem_pair();
        let not_after = Utc::now() + ChronoDuration::minutes(5);

        let a = ExchangedCredential::from_pem("t", &cert_a, &key_a, None, not_after).unwrap();
        let b = ExchangedCredential::from_pem("t", &cert_b, &key_b, None, not_after).unwrap();
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn test_malformed_material_is_rejected() {
        let (cert, key) = pem_pair();
        let not_after = Utc::now() + ChronoDuration::minutes(5);

        assert!(matches!(
            ExchangedCredential::from_pem("t", "nope", &key, None, not_after),
            Err(ExchangeError::MalformedIssuanceResponse(_))
        ));
        assert!(matches!(
            ExchangedCredential::from_pem("t", &cert, "nope", None, not_after),
            Err(ExchangeError::MalformedIssuanceResponse(_))
        ));
        assert!(matches!(
            ExchangedCredential::from_pem("t", &cert, &key, Some(not_after), not_after),
            Err(ExchangeError::MalformedIssuanceResponse(_))
        ));
    }

    #[test]
    fn test_covers_honours_margin_and_not_before() {
        let now = Utc::now();
        let margin = Duration::from_secs(30);

        assert!(covers(None, now + ChronoDuration::minutes(5), now, margin));
        assert!(covers(None, now + ChronoDuration::seconds(30), now, margin));
        assert!(!covers(None, now + ChronoDuration::seconds(29), now, margin));
        assert!(!covers(
            Some(now + ChronoDuration::seconds(1)),
            now + ChronoDuration::minutes(5),
            now,
            margin
        ));
        assert!(covers(
            Some(now - ChronoDuration::minutes(1)),
            now + ChronoDuration::minutes(5),
            now,
            margin
        ));
    }
}
