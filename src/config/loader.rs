use super::schema::{Config, TargetConfig};
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use url::Url;

const ENV_PREFIX: &str = "PINNIPED_PROXY_";

pub fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("pinniped-proxy.toml"))
        .merge(Json::file("pinniped-proxy.json"))
        .merge(Yaml::file("pinniped-proxy.yaml"))
        .merge(Yaml::file("pinniped-proxy.yml"))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;

    Ok(config)
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.targets.is_empty() {
        return Err(ConfigError::Validation("At least one target must be configured".into()).into());
    }

    if let Some(default) = &config.routing.default_target {
        if !config.targets.contains_key(default) {
            return Err(ConfigError::Validation(format!(
                "Default target '{}' is not configured",
                default
            ))
            .into());
        }
    }

    if config.routing.target_header.is_empty() {
        return Err(ConfigError::Validation("Target header must not be empty".into()).into());
    }

    if let Some(prefix) = &config.routing.path_prefix {
        if !prefix.starts_with('/') || prefix.len() < 2 {
            return Err(ConfigError::Validation(format!(
                "Path prefix '{}' must start with '/' and name a segment",
                prefix
            ))
            .into());
        }
    }

    for (name, target) in &config.targets {
        validate_target(name, target)?;
    }

    if config.listen.cert_file.is_some() != config.listen.key_file.is_some() {
        return Err(ConfigError::Validation(
            "Listener certFile and keyFile must be configured together".into(),
        )
        .into());
    }

    if config.upstream.safety_margin_secs == 0 {
        return Err(
            ConfigError::Validation("Safety margin must be greater than 0".into()).into(),
        );
    }

    if config.upstream.idle_timeout_secs == 0 {
        return Err(ConfigError::Validation("Idle timeout must be greater than 0".into()).into());
    }

    if config.upstream.reap_interval_secs == 0 {
        return Err(
            ConfigError::Validation("Reap interval must be greater than 0".into()).into(),
        );
    }

    if config.relay.buffer_frames == 0 {
        return Err(
            ConfigError::Validation("Relay buffer must hold at least one frame".into()).into(),
        );
    }

    Ok(())
}

fn validate_target(name: &str, target: &TargetConfig) -> Result<()> {
    require_https(name, "url", &target.url)?;

    if let Some(url) = &target.issuance.url {
        require_https(name, "issuance url", url)?;
    }

    if target.ca_file.is_none() && target.ca_pem.is_none() {
        return Err(ConfigError::MissingField(format!("targets.{}.caFile", name)).into());
    }

    if target.issuance.authenticator.name.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "targets.{}.issuance.authenticator.name",
            name
        ))
        .into());
    }

    Ok(())
}

fn require_https(name: &str, field: &str, raw: &str) -> Result<()> {
    let url = Url::parse(raw).map_err(|e| {
        ConfigError::Validation(format!("Target '{}' has invalid {}: {}", name, field, e))
    })?;

    if url.scheme() != "https" || url.host_str().is_none() {
        return Err(ConfigError::Validation(format!(
            "Target '{}' {} must be an https URL with a host",
            name, field
        ))
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    config.listen.cert_file = substitute_path(config.listen.cert_file.take())?;
    config.listen.key_file = substitute_path(config.listen.key_file.take())?;

    for (_, target) in config.targets.iter_mut() {
        target.url = substitute_env_vars(&target.url)?;
        target.ca_file = substitute_path(target.ca_file.take())?;

        if let Some(url) = &mut target.issuance.url {
            *url = substitute_env_vars(url)?;
        }
        target.issuance.ca_file = substitute_path(target.issuance.ca_file.take())?;
    }

    Ok(config)
}

fn substitute_path(path: Option<PathBuf>) -> Result<Option<PathBuf>> {
    match path {
        Some(path) => {
            let raw = path.to_string_lossy();
            Ok(Some(PathBuf::from(substitute_env_vars(&raw)?)))
        }
        None => Ok(None),
    }
}

fn env_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("valid pattern"))
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();

    for cap in env_pattern().captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                // ${VAR:-default}
                if let Some((name, default)) = var_name.split_once(":-") {
                    match std::env::var(name) {
                        Ok(value) => result = result.replace(&cap[0], &value),
                        Err(_) => result = result.replace(&cap[0], default),
                    }
                } else {
                    return Err(ConfigError::EnvVar(format!(
                        "Environment variable '{}' not found",
                        var_name
                    ))
                    .into());
                }
            }
        }
    }

    Ok(result)
}
