use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    pub targets: HashMap<String, TargetConfig>,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenConfig {
    #[serde(default = "default_listen_address")]
    pub address: String,
    /// Server certificate chain. When both this and `key_file` are absent an
    /// ephemeral self-signed pair is generated at startup.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default = "default_self_signed_hosts")]
    pub self_signed_hosts: Vec<String>,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub http2: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default)]
    pub default_target: Option<String>,
    #[serde(default = "default_target_header")]
    pub target_header: String,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: Option<String>,
}

/// A backend API server reachable over mutual TLS.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    pub url: String,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub ca_pem: Option<String>,
    /// Name to verify the backend certificate against, when it differs from the URL host.
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub issuance: IssuanceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceConfig {
    /// Defaults to the target URL; the concierge API is aggregated into the API server.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub ca_pem: Option<String>,
    #[serde(default = "default_api_group_suffix")]
    pub api_group_suffix: String,
    #[serde(default)]
    pub authenticator: AuthenticatorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorConfig {
    /// Defaults to `authentication.concierge.<apiGroupSuffix>`.
    #[serde(default)]
    pub api_group: Option<String>,
    #[serde(default = "default_authenticator_kind")]
    pub kind: String,
    #[serde(default = "default_authenticator_name")]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,
    #[serde(default = "default_max_idle_per_key")]
    pub max_idle_per_key: usize,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
    #[serde(default = "default_true")]
    pub http2: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    #[serde(default = "default_buffer_frames")]
    pub buffer_frames: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_listen_address() -> String {
    "0.0.0.0:3333".to_string()
}

fn default_self_signed_hosts() -> Vec<String> {
    vec!["localhost".to_string(), "127.0.0.1".to_string()]
}

fn default_handshake_timeout() -> u64 {
    10000
}

fn default_target_header() -> String {
    "x-proxy-target".to_string()
}

fn default_path_prefix() -> Option<String> {
    Some("/targets".to_string())
}

fn default_api_group_suffix() -> String {
    "pinniped.dev".to_string()
}

fn default_authenticator_kind() -> String {
    "JWTAuthenticator".to_string()
}

fn default_authenticator_name() -> String {
    "jwt-authenticator".to_string()
}

fn default_exchange_timeout() -> u64 {
    10000
}

fn default_connect_timeout() -> u64 {
    10000
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_safety_margin() -> u64 {
    30
}

fn default_max_idle_per_key() -> usize {
    8
}

fn default_reap_interval() -> u64 {
    15
}

fn default_buffer_frames() -> usize {
    16
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            cert_file: None,
            key_file: None,
            self_signed_hosts: default_self_signed_hosts(),
            handshake_timeout_ms: default_handshake_timeout(),
            http2: true,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_target: None,
            target_header: default_target_header(),
            path_prefix: default_path_prefix(),
        }
    }
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            url: None,
            ca_file: None,
            ca_pem: None,
            api_group_suffix: default_api_group_suffix(),
            authenticator: AuthenticatorConfig::default(),
        }
    }
}

impl Default for AuthenticatorConfig {
    fn default() -> Self {
        Self {
            api_group: None,
            kind: default_authenticator_kind(),
            name: default_authenticator_name(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_exchange_timeout(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            safety_margin_secs: default_safety_margin(),
            max_idle_per_key: default_max_idle_per_key(),
            reap_interval_secs: default_reap_interval(),
            http2: true,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_frames: default_buffer_frames(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Config {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.listen.handshake_timeout_ms)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.idle_timeout_secs)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.upstream.safety_margin_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.upstream.reap_interval_secs)
    }
}

impl IssuanceConfig {
    pub fn authenticator_api_group(&self) -> String {
        self.authenticator
            .api_group
            .clone()
            .unwrap_or_else(|| format!("authentication.concierge.{}", self.api_group_suffix))
    }
}
