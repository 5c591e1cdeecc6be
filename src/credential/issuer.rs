use async_trait::async_trait;
use http::StatusCode;
use secrecy::zeroize::Zeroizing;
use std::collections::HashMap;
use std::time::Duration;

use super::api::{self, ApiStatus, TokenCredentialRequest, TokenCredentialResponse};
use super::{BearerToken, ExchangedCredential};
use crate::error::{ExchangeError, ProxyError};
use crate::target::{IssuanceEndpoint, Target, TargetRegistry};
use crate::tls::TlsError;

/// Converts a bearer token into a short-lived client credential for a target.
///
/// Implementations make at most one call to the issuance service per
/// invocation and never retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialIssuer: Send + Sync + 'static {
    async fn exchange(
        &self,
        target: &Target,
        token: &BearerToken,
    ) -> Result<ExchangedCredential, ExchangeError>;
}

/// Issuer speaking the concierge `TokenCredentialRequest` API over HTTPS.
pub struct HttpIssuer {
    clients: HashMap<String, reqwest::Client>,
}

impl HttpIssuer {
    /// Build one HTTPS client per target, each trusting only that target's
    /// issuance roots.
    pub fn new(targets: &TargetRegistry, timeout: Duration) -> Result<Self, ProxyError> {
        let mut clients = HashMap::new();
        for target in targets.iter() {
            let client = Self::build_client(&target.issuance, timeout)?;
            clients.insert(target.name.clone(), client);
        }
        Ok(Self { clients })
    }

    fn build_client(
        endpoint: &IssuanceEndpoint,
        timeout: Duration,
    ) -> Result<reqwest::Client, TlsError> {
        let roots = reqwest::Certificate::from_pem_bundle(&endpoint.ca_pem)
            .map_err(|e| TlsError::InvalidCert(e.to_string()))?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .https_only(true)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(timeout)
            .timeout(timeout);
        for root in roots {
            builder = builder.add_root_certificate(root);
        }

        builder
            .build()
            .map_err(|e| TlsError::CertLoad(format!("issuance client: {}", e)))
    }

    fn endpoint_url(endpoint: &IssuanceEndpoint) -> String {
        format!(
            "{}{}",
            endpoint.url.as_str().trim_end_matches('/'),
            api::request_path(&endpoint.api_group_suffix)
        )
    }
}

#[async_trait]
impl CredentialIssuer for HttpIssuer {
    async fn exchange(
        &self,
        target: &Target,
        token: &BearerToken,
    ) -> Result<ExchangedCredential, ExchangeError> {
        let client = self.clients.get(&target.name).ok_or_else(|| {
            ExchangeError::IssuanceUnreachable(format!(
                "no issuance client for target '{}'",
                target.name
            ))
        })?;

        let endpoint = &target.issuance;
        let url = Self::endpoint_url(endpoint);
        tracing::debug!(target = %target.name, %url, "Requesting client credential");

        let response = client
            .post(&url)
            .json(&TokenCredentialRequest::new(endpoint, token.expose()))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = read_body(response).await?;

        if !status.is_success() {
            return Err(status_error(status, &body[..]));
        }

        let parsed: TokenCredentialResponse = serde_json::from_slice(&body[..])
            .map_err(|e| ExchangeError::MalformedIssuanceResponse(e.to_string()))?;
        let status = parsed.status.ok_or_else(|| {
            ExchangeError::MalformedIssuanceResponse("response has no status".into())
        })?;

        let credential = match (status.credential, status.message) {
            (Some(credential), _) => credential,
            (None, Some(message)) => return Err(ExchangeError::TokenRejected(message)),
            (None, None) => {
                return Err(ExchangeError::MalformedIssuanceResponse(
                    "response has neither credential nor message".into(),
                ))
            }
        };

        let (cert_pem, key_pem) = match (
            credential.client_certificate_data.as_deref(),
            credential.client_key_data.as_deref(),
        ) {
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                return Err(ExchangeError::MalformedIssuanceResponse(
                    "credential is missing certificate or key data".into(),
                ))
            }
        };

        let exchanged = ExchangedCredential::from_pem(
            &target.name,
            cert_pem,
            key_pem,
            credential.not_before,
            credential.expiration_timestamp,
        )?;

        tracing::debug!(
            target = %target.name,
            identity = %exchanged.identity(),
            not_after = %exchanged.not_after(),
            "Received client credential"
        );

        Ok(exchanged)
    }
}

/// Preallocation cap for bodies announcing a content length.
const MAX_PREALLOCATED_BODY: u64 = 1 << 20;

/// Collect a response body into a buffer that is zeroed on drop. A successful
/// body carries the private key PEM.
async fn read_body(mut response: reqwest::Response) -> Result<Zeroizing<Vec<u8>>, ExchangeError> {
    let capacity = response
        .content_length()
        .unwrap_or(0)
        .min(MAX_PREALLOCATED_BODY) as usize;
    let mut body = Zeroizing::new(Vec::with_capacity(capacity));
    while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
        append(&mut body, &chunk);
    }
    Ok(body)
}

/// Append without letting `Vec` reallocate, which would free the old
/// allocation unzeroed.
fn append(body: &mut Zeroizing<Vec<u8>>, chunk: &[u8]) {
    if body.capacity() - body.len() < chunk.len() {
        let needed = body.len() + chunk.len();
        let mut grown = Zeroizing::new(Vec::with_capacity(needed.max(body.capacity() * 2)));
        grown.extend_from_slice(&body[..]);
        *body = grown;
    }
    body.extend_from_slice(chunk);
}

fn transport_error(error: reqwest::Error) -> ExchangeError {
    if error.is_timeout() {
        ExchangeError::Timeout
    } else {
        ExchangeError::IssuanceUnreachable(error.without_url().to_string())
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> ExchangeError {
    let detail = serde_json::from_slice::<ApiStatus>(body)
        .ok()
        .and_then(|s| s.message.or(s.reason))
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::UNPROCESSABLE_ENTITY => ExchangeError::TokenRejected(detail),
        StatusCode::NOT_FOUND => {
            ExchangeError::IssuanceUnreachable(format!("issuance API not served: {}", detail))
        }
        s if s.is_server_error() => {
            ExchangeError::IssuanceUnreachable(format!("issuance service returned {}", s))
        }
        s => ExchangeError::MalformedIssuanceResponse(format!("unexpected status {}", s)),
    }
}
