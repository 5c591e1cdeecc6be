//! Resolved backend targets.
//!
//! Built once from configuration at startup; trust roots are parsed here so a
//! bad CA bundle fails the process instead of the first request.

use http::uri::Authority;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use url::Url;

use crate::config::{Config, TargetConfig};
use crate::error::{ConfigError, Result};
use crate::tls;

#[derive(Debug, Clone)]
pub struct Authenticator {
    pub api_group: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct IssuanceEndpoint {
    pub url: Url,
    /// PEM bundle trusted for the issuance endpoint only.
    pub ca_pem: Vec<u8>,
    pub api_group_suffix: String,
    pub authenticator: Authenticator,
}

#[derive(Debug)]
pub struct Target {
    pub name: String,
    pub url: Url,
    pub host: String,
    pub port: u16,
    pub authority: Authority,
    pub server_name: ServerName<'static>,
    pub roots: Arc<RootCertStore>,
    pub issuance: IssuanceEndpoint,
}

impl Target {
    pub fn from_config(name: &str, config: &TargetConfig) -> Result<Self> {
        let url = Url::parse(&config.url).map_err(|e| {
            ConfigError::Validation(format!("Target '{}' has invalid url: {}", name, e))
        })?;
        let (host, host_str) = match (url.host(), url.host_str()) {
            (Some(url::Host::Ipv6(addr)), Some(raw)) => (addr.to_string(), raw.to_string()),
            (Some(_), Some(raw)) => (raw.to_string(), raw.to_string()),
            _ => {
                return Err(
                    ConfigError::Validation(format!("Target '{}' url has no host", name)).into(),
                )
            }
        };
        let port = url.port_or_known_default().unwrap_or(443);

        let authority_str = match url.port() {
            Some(port) => format!("{}:{}", host_str, port),
            None => host_str,
        };
        let authority = authority_str.parse::<Authority>().map_err(|e| {
            ConfigError::Validation(format!("Target '{}' has invalid authority: {}", name, e))
        })?;

        let tls_name = config
            .server_name
            .clone()
            .unwrap_or_else(|| host.clone());
        let server_name = ServerName::try_from(tls_name).map_err(|e| {
            ConfigError::Validation(format!("Target '{}' has invalid server name: {}", name, e))
        })?;

        let ca_pem = read_pem(name, "caFile", config.ca_file.as_deref(), config.ca_pem.as_deref())?;
        let roots = tls::root_store(&tls::parse_certs(&ca_pem)?)?;

        let issuance_config = &config.issuance;
        let issuance_url = match &issuance_config.url {
            Some(raw) => Url::parse(raw).map_err(|e| {
                ConfigError::Validation(format!(
                    "Target '{}' has invalid issuance url: {}",
                    name, e
                ))
            })?,
            None => url.clone(),
        };
        let issuance_ca_pem = if issuance_config.ca_file.is_some() || issuance_config.ca_pem.is_some()
        {
            read_pem(
                name,
                "issuance.caFile",
                issuance_config.ca_file.as_deref(),
                issuance_config.ca_pem.as_deref(),
            )?
        } else {
            ca_pem
        };
        // Fail early on an unusable issuance bundle as well.
        tls::parse_certs(&issuance_ca_pem)?;

        Ok(Self {
            name: name.to_string(),
            url,
            host,
            port,
            authority,
            server_name,
            roots: Arc::new(roots),
            issuance: IssuanceEndpoint {
                url: issuance_url,
                ca_pem: issuance_ca_pem,
                api_group_suffix: issuance_config.api_group_suffix.clone(),
                authenticator: Authenticator {
                    api_group: issuance_config.authenticator_api_group(),
                    kind: issuance_config.authenticator.kind.clone(),
                    name: issuance_config.authenticator.name.clone(),
                },
            },
        })
    }

    /// Join the target's base path with a request path and query.
    pub fn upstream_path(&self, path: &str, query: Option<&str>) -> String {
        let base = self.url.path().trim_end_matches('/');
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        match query {
            Some(query) => format!("{}{}?{}", base, path, query),
            None => format!("{}{}", base, path),
        }
    }
}

fn read_pem(
    target: &str,
    field: &str,
    file: Option<&std::path::Path>,
    inline: Option<&str>,
) -> Result<Vec<u8>> {
    if let Some(pem) = inline {
        return Ok(pem.as_bytes().to_vec());
    }

    match file {
        Some(path) => Ok(fs::read(path).map_err(|e| {
            ConfigError::Validation(format!(
                "Target '{}' {} {}: {}",
                target,
                field,
                path.display(),
                e
            ))
        })?),
        None => Err(ConfigError::MissingField(format!("targets.{}.{}", target, field)).into()),
    }
}

/// Immutable lookup table of configured targets.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: HashMap<String, Arc<Target>>,
    default_target: Option<String>,
}

impl TargetRegistry {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut targets = HashMap::new();
        for (name, target_config) in &config.targets {
            let target = Target::from_config(name, target_config)?;
            tracing::info!(
                target = %name,
                url = %target.url,
                issuance = %target.issuance.url,
                "Resolved target"
            );
            targets.insert(name.clone(), Arc::new(target));
        }

        Ok(Self {
            targets,
            default_target: config.routing.default_target.clone(),
        })
    }

    pub fn new(targets: Vec<Target>, default_target: Option<String>) -> Self {
        Self {
            targets: targets
                .into_iter()
                .map(|t| (t.name.clone(), Arc::new(t)))
                .collect(),
            default_target,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Target>> {
        self.targets.get(name).cloned()
    }

    pub fn default_target(&self) -> Option<Arc<Target>> {
        self.default_target.as_deref().and_then(|name| self.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Target>> {
        self.targets.values()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
