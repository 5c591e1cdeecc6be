//! Wire types for the concierge `TokenCredentialRequest` API.

use chrono::{DateTime, Utc};
use secrecy::zeroize::Zeroize;
use serde::{Deserialize, Serialize};

use crate::target::IssuanceEndpoint;

pub const KIND: &str = "TokenCredentialRequest";
pub const VERSION: &str = "v1alpha1";

pub fn api_version(suffix: &str) -> String {
    format!("login.concierge.{}/{}", suffix, VERSION)
}

pub fn request_path(suffix: &str) -> String {
    format!(
        "/apis/login.concierge.{}/{}/tokencredentialrequests",
        suffix, VERSION
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCredentialRequest<'a> {
    pub api_version: String,
    pub kind: &'static str,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub spec: TokenCredentialRequestSpec<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCredentialRequestSpec<'a> {
    pub token: &'a str,
    pub authenticator: TypedLocalObjectReference<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedLocalObjectReference<'a> {
    pub api_group: &'a str,
    pub kind: &'a str,
    pub name: &'a str,
}

impl<'a> TokenCredentialRequest<'a> {
    pub fn new(endpoint: &'a IssuanceEndpoint, token: &'a str) -> Self {
        Self {
            api_version: api_version(&endpoint.api_group_suffix),
            kind: KIND,
            metadata: serde_json::Map::new(),
            spec: TokenCredentialRequestSpec {
                token,
                authenticator: TypedLocalObjectReference {
                    api_group: &endpoint.authenticator.api_group,
                    kind: &endpoint.authenticator.kind,
                    name: &endpoint.authenticator.name,
                },
            },
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenCredentialResponse {
    #[serde(default)]
    pub status: Option<TokenCredentialStatus>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenCredentialStatus {
    #[serde(default)]
    pub credential: Option<ClusterCredential>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCredential {
    pub expiration_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub client_certificate_data: Option<String>,
    #[serde(default)]
    pub client_key_data: Option<String>,
}

impl ClusterCredential {
    /// Zero the key PEM held by this response.
    pub fn wipe(&mut self) {
        self.client_key_data.zeroize();
    }
}

impl Drop for ClusterCredential {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl std::fmt::Debug for ClusterCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCredential")
            .field("expiration_timestamp", &self.expiration_timestamp)
            .field("not_before", &self.not_before)
            .finish_non_exhaustive()
    }
}

/// Error body returned by Kubernetes-style API servers (`kind: Status`).
#[derive(Deserialize, Debug, Default)]
pub struct ApiStatus {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}
