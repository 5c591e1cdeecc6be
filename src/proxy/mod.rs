use crate::error::Result;
use crate::state::AppState;
use crate::tls::ServerTls;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

pub mod handler;
pub mod relay;
pub mod router;

pub use handler::RequestHandler;
pub use relay::ProxyBody;
pub use router::{ProxiedRequest, RequestHead, RequestRouter};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The TLS front door: accepts client connections and hands every request on
/// them to the [`RequestHandler`].
pub struct ProxyServer {
    state: Arc<AppState>,
    handler: Arc<RequestHandler>,
    listener: TcpListener,
    tls: ServerTls,
}

impl ProxyServer {
    /// Bind the configured listen address with the configured (or generated)
    /// server certificate.
    pub async fn bind(state: Arc<AppState>) -> Result<Self> {
        let tls = ServerTls::from_config(&state.config.listen)?;
        Self::bind_with_tls(state, tls).await
    }

    pub async fn bind_with_tls(state: Arc<AppState>, tls: ServerTls) -> Result<Self> {
        let listener = TcpListener::bind(&state.config.listen.address).await?;
        let handler = Arc::new(RequestHandler::new(state.clone()));

        Ok(Self {
            state,
            handler,
            listener,
            tls,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// PEM of the ephemeral certificate, when one was generated.
    pub fn generated_certificate_pem(&self) -> Option<&str> {
        self.tls.generated_certificate_pem()
    }

    pub async fn run(self) -> Result<()> {
        let ProxyServer {
            state,
            handler,
            listener,
            tls,
        } = self;

        tracing::info!("Proxy server listening on https://{}", listener.local_addr()?);

        let acceptor = TlsAcceptor::from(tls.server_config());
        let builder = auto::Builder::new(TokioExecutor::new());
        let graceful = GracefulShutdown::new();
        let handshake_timeout = state.config.handshake_timeout();
        let mut shutdown = state.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (tcp, remote_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let _ = tcp.set_nodelay(true);

                    let acceptor = acceptor.clone();
                    let builder = builder.clone();
                    let watcher = graceful.watcher();
                    let handler = handler.clone();
                    let metrics = state.metrics.clone();

                    tokio::spawn(async move {
                        let stream = match tokio::time::timeout(handshake_timeout, acceptor.accept(tcp)).await {
                            Ok(Ok(stream)) => stream,
                            Ok(Err(e)) => {
                                tracing::debug!(%remote_addr, "Client TLS handshake failed: {}", e);
                                metrics.record_client_tls_failure();
                                return;
                            }
                            Err(_) => {
                                tracing::debug!(%remote_addr, "Client TLS handshake timed out");
                                metrics.record_client_tls_failure();
                                return;
                            }
                        };

                        let service = service_fn(move |request: Request<Incoming>| {
                            let handler = handler.clone();
                            async move { Ok::<_, Infallible>(handler.handle(request).await) }
                        });

                        let connection = builder.serve_connection(TokioIo::new(stream), service);
                        if let Err(e) = watcher.watch(connection).await {
                            tracing::debug!(%remote_addr, "Client connection closed: {}", e);
                        }
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("Proxy server received shutdown signal");
                    break;
                }
            }
        }

        drop(listener);
        tokio::select! {
            _ = graceful.shutdown() => tracing::info!("All client connections drained"),
            _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
                tracing::warn!("Timed out waiting for client connections to drain")
            }
        }

        tracing::info!("Proxy server stopped");
        Ok(())
    }
}
