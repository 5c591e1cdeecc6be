//! Plain HTTP side listener exposing `/metrics` and `/healthz`.

use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::error::{ConfigError, Result};
use crate::state::{AppState, Metrics};

pub async fn start_server(state: Arc<AppState>) -> Result<()> {
    let addr: SocketAddr = state.config.metrics.address.parse().map_err(|e| {
        ConfigError::Parse(format!("Invalid metrics address: {}", e))
    })?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}", listener.local_addr()?);
    serve(listener, state).await
}

pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let mut shutdown = state.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (tcp, _) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Metrics server failed to accept: {}", e);
                        continue;
                    }
                };

                let metrics = state.metrics.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request: Request<hyper::body::Incoming>| {
                        let response = respond(&metrics, &request);
                        async move { Ok::<_, Infallible>(response) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(tcp), service)
                        .await
                    {
                        tracing::debug!("Metrics connection error: {}", e);
                    }
                });
            }
            _ = shutdown.recv() => break,
        }
    }

    tracing::info!("Metrics server stopped");
    Ok(())
}

fn respond<B>(metrics: &Metrics, request: &Request<B>) -> Response<Full<Bytes>> {
    let (status, content_type, body) = match (request.method(), request.uri().path()) {
        (&Method::GET, "/metrics") => (
            StatusCode::OK,
            "text/plain; version=0.0.4",
            Bytes::from(metrics.encode_text()),
        ),
        (&Method::GET, "/healthz") => (StatusCode::OK, "text/plain", Bytes::from_static(b"ok")),
        _ => (
            StatusCode::NOT_FOUND,
            "text/plain",
            Bytes::from_static(b"not found"),
        ),
    };

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(content_type),
    );
    response
}
