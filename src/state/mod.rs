use crate::config::Config;
use crate::credential::{CredentialIssuer, HttpIssuer};
use crate::error::Result;
use crate::proxy::RequestRouter;
use crate::target::TargetRegistry;
use crate::upstream::{ConnectionPool, PoolSettings, UpstreamConnector};
use std::sync::Arc;
use tokio::sync::broadcast;

pub mod metrics;

pub use metrics::{Metrics, RelayGauge, RequestTimer};

/// Process-wide state, built once at startup and never mutated afterwards
/// apart from the connection pool.
pub struct AppState {
    pub config: Arc<Config>,
    pub targets: Arc<TargetRegistry>,
    pub router: RequestRouter,
    pub issuer: Arc<dyn CredentialIssuer>,
    pub pool: Arc<ConnectionPool>,
    pub metrics: Arc<Metrics>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(config: Config) -> Result<(Arc<Self>, broadcast::Receiver<()>)> {
        let targets = Arc::new(TargetRegistry::from_config(&config)?);
        let issuer = Arc::new(HttpIssuer::new(&targets, config.exchange_timeout())?);
        Self::with_issuer(config, targets, issuer)
    }

    /// Build state around a caller-supplied issuer.
    pub fn with_issuer(
        config: Config,
        targets: Arc<TargetRegistry>,
        issuer: Arc<dyn CredentialIssuer>,
    ) -> Result<(Arc<Self>, broadcast::Receiver<()>)> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
        let metrics = Arc::new(Metrics::new());

        let router = RequestRouter::new(targets.clone(), &config.routing)?;
        let connector = UpstreamConnector::new(
            config.connect_timeout(),
            config.upstream.http2,
            metrics.clone(),
        );
        let pool = Arc::new(ConnectionPool::new(
            connector,
            PoolSettings {
                safety_margin: config.safety_margin(),
                idle_timeout: config.idle_timeout(),
                max_idle_per_key: config.upstream.max_idle_per_key,
            },
            metrics.clone(),
        ));

        let state = Arc::new(Self {
            config: Arc::new(config),
            targets,
            router,
            issuer,
            pool,
            metrics,
            shutdown_tx,
        });

        Ok((state, shutdown_rx))
    }

    pub fn shutdown(&self) {
        tracing::info!("Initiating application shutdown");
        let _ = self.shutdown_tx.send(());
        self.pool.close_all();
    }
}
