use crate::config::Config;
use crate::error::Result;
use crate::target::TargetRegistry;
use crate::tls::ServerTls;
use tracing::info;

/// Validate configuration, resolve every target's trust material and build
/// the listener TLS config, without opening any socket.
pub fn run_config_check(config: &Config) -> Result<()> {
    info!("Checking configuration...");

    crate::config::validate(config)?;
    info!("✓ Configuration is valid");

    let tls = ServerTls::from_config(&config.listen)?;
    if tls.generated_certificate_pem().is_some() {
        info!(
            "✓ Listener will use an ephemeral self-signed certificate for {:?}",
            config.listen.self_signed_hosts
        );
    } else {
        info!("✓ Listener certificate and key loaded");
    }

    let targets = TargetRegistry::from_config(config)?;
    let mut names: Vec<_> = targets.iter().map(|t| t.name.clone()).collect();
    names.sort();

    for name in &names {
        if let Some(target) = targets.get(name) {
            info!("\nTarget: {}", target.name);
            info!("  Backend: {}", target.url);
            info!("  Issuance: {}", target.issuance.url);
            info!(
                "  Authenticator: {}/{} ({})",
                target.issuance.authenticator.kind,
                target.issuance.authenticator.name,
                target.issuance.authenticator.api_group
            );
        }
    }

    match &config.routing.default_target {
        Some(default) => info!("\nDefault target: {}", default),
        None => info!("\nNo default target; requests must name one"),
    }
    info!(
        "Safety margin: {}s, idle timeout: {}s",
        config.upstream.safety_margin_secs, config.upstream.idle_timeout_secs
    );

    info!("✓ {} target(s) resolved", names.len());
    Ok(())
}
