use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

use pinniped_proxy::commands;
use pinniped_proxy::config;
use pinniped_proxy::logging::{self, LogFormat};
use pinniped_proxy::proxy::ProxyServer;
use pinniped_proxy::state::AppState;
use pinniped_proxy::web;

#[derive(Parser, Debug)]
#[command(name = "pinniped-proxy")]
#[command(
    about = "Reverse proxy that trades bearer tokens for short-lived client certificates",
    long_about = None
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Console log format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Also write JSON logs to a daily rolling file in this directory
    #[arg(long, value_name = "DIR", global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the proxy (default)
    Run,
    /// Load and validate configuration, resolve targets, then exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.debug, args.log_format, args.log_dir.as_deref());

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?
        }
        None => {
            info!("Loading configuration from default locations");
            config::load_from_env_or_file().context("Failed to load configuration")?
        }
    };

    if let Some(Command::Check) = args.command {
        commands::run_config_check(&config)?;
        return Ok(());
    }

    info!("Starting pinniped-proxy");
    info!("Loaded {} target configuration(s)", config.targets.len());
    let metrics_enabled = config.metrics.enabled;

    let (state, _shutdown_rx) = AppState::new(config).context("Failed to initialise proxy")?;

    let proxy_server = ProxyServer::bind(state.clone())
        .await
        .context("Failed to bind proxy listener")?;
    if proxy_server.generated_certificate_pem().is_some() {
        info!("Serving an ephemeral self-signed certificate; clients must trust it explicitly");
    }
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!("Proxy server error: {}", e);
        }
    });

    let reaper_handle = state
        .pool
        .spawn_reaper(state.config.reap_interval(), state.shutdown_tx.subscribe());

    let web_handle = if metrics_enabled {
        let web_state = state.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = web::start_server(web_state).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    shutdown_signal().await;
    info!("Shutting down pinniped-proxy");

    let shutdown = tokio::time::timeout(tokio::time::Duration::from_secs(30), async {
        state.shutdown();

        if let Some(web_handle) = web_handle {
            let _ = tokio::join!(proxy_handle, reaper_handle, web_handle);
        } else {
            let _ = tokio::join!(proxy_handle, reaper_handle);
        }
    })
    .await;

    match shutdown {
        Ok(_) => info!("Graceful shutdown completed"),
        Err(_) => {
            error!("Shutdown timeout exceeded, forcing exit");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
