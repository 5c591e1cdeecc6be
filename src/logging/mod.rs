//! Process-wide tracing subscriber.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn filter(debug: bool) -> EnvFilter {
    let fallback = if debug {
        "pinniped_proxy=debug,info"
    } else {
        "pinniped_proxy=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    if !debug {
        return filter;
    }
    match "pinniped_proxy=debug".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

/// Install the global subscriber. With `log_dir` set, JSON records also go
/// to a daily rolling file; keep the returned guard alive until exit so the
/// background writer flushes.
pub fn init(debug: bool, format: LogFormat, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stdout = match format {
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
    };

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pinniped-proxy.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter(debug));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(stdout.with_filter(filter(debug)))
        .with(file)
        .try_init();
    if let Err(e) = installed {
        eprintln!("Logging already initialised: {}", e);
    }

    guard
}
