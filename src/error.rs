use bytes::Bytes;
use http::{header, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use std::io;
use thiserror::Error;

use crate::proxy::relay::ProxyBody;
use crate::tls::TlsError;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Client-input errors, raised before any network call is made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("missing or malformed bearer credential")]
    MissingCredential,

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("token rejected by issuance service: {0}")]
    TokenRejected(String),

    #[error("issuance service unreachable: {0}")]
    IssuanceUnreachable(String),

    #[error("malformed issuance response: {0}")]
    MalformedIssuanceResponse(String),

    #[error("credential exchange timed out")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream server certificate rejected: {0}")]
    UpstreamTlsRejected(String),

    #[error("credential does not cover the safety margin")]
    CredentialExpired,

    #[error("credential cannot be used as a client certificate: {0}")]
    InvalidCredential(String),

    #[error("upstream connect timed out")]
    Timeout,
}

#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("upstream stream error: {0}")]
    UpstreamStream(String),

    #[error("client stream error: {0}")]
    ClientStream(String),

    #[error("relay cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ExchangeError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeError::TokenRejected(_) => "token_rejected",
            ExchangeError::IssuanceUnreachable(_) => "issuance_unreachable",
            ExchangeError::MalformedIssuanceResponse(_) => "malformed_issuance_response",
            ExchangeError::Timeout => "issuance_timeout",
        }
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Request(RequestError::MissingCredential) => StatusCode::UNAUTHORIZED,
            ProxyError::Request(_) => StatusCode::BAD_REQUEST,
            ProxyError::Exchange(ExchangeError::TokenRejected(_)) => StatusCode::UNAUTHORIZED,
            ProxyError::Exchange(ExchangeError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Exchange(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Connect(ConnectError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Connect(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Relay(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable name used in error bodies and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "config",
            ProxyError::Request(RequestError::MissingCredential) => "missing_credential",
            ProxyError::Request(RequestError::UnknownTarget(_)) => "unknown_target",
            ProxyError::Request(RequestError::MalformedRequest(_)) => "malformed_request",
            ProxyError::Exchange(e) => e.kind(),
            ProxyError::Connect(ConnectError::UpstreamUnreachable(_)) => "upstream_unreachable",
            ProxyError::Connect(ConnectError::UpstreamTlsRejected(_)) => "upstream_tls_rejected",
            ProxyError::Connect(ConnectError::CredentialExpired) => "credential_expired",
            ProxyError::Connect(ConnectError::InvalidCredential(_)) => "invalid_credential",
            ProxyError::Connect(ConnectError::Timeout) => "upstream_timeout",
            ProxyError::Relay(_) => "upstream_stream_error",
            ProxyError::Tls(_) => "tls",
            ProxyError::Io(_) => "io",
        }
    }

    /// Render the error as a status-coded JSON response. Only valid before any
    /// response bytes have reached the client.
    pub fn into_response(self) -> Response<ProxyBody> {
        let body = serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        });

        let mut response = Response::new(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        );
        *response.status_mut() = self.status();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if response.status() == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}
