use bytes::Bytes;
use http::{Request, Response};
use http_body::Body;
use std::fmt::Display;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::Instrument;
use uuid::Uuid;

use super::relay::{self, ProxyBody};
use super::router::ProxiedRequest;
use crate::credential::{BearerToken, ExchangedCredential};
use crate::error::{ExchangeError, ProxyError};
use crate::state::{AppState, RequestTimer};
use crate::target::Target;

pub struct RequestHandler {
    state: Arc<AppState>,
}

impl RequestHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Proxy one client request. Failures before the upstream responds are
    /// rendered as status-coded JSON errors.
    pub async fn handle<B>(&self, request: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Display + Send,
    {
        let span = tracing::info_span!(
            "request",
            request_id = %Uuid::new_v4(),
            method = %request.method(),
            path = %request.uri().path(),
            target = tracing::field::Empty,
        );

        async move {
            let timer = RequestTimer::new(self.state.metrics.clone());

            match self.proxy(request).await {
                Ok(response) => {
                    tracing::info!(status = %response.status(), "Proxied request");
                    timer.finish();
                    response
                }
                Err(e) => {
                    if e.status().is_server_error() {
                        tracing::warn!(kind = e.kind(), "Request failed: {}", e);
                    } else {
                        tracing::info!(kind = e.kind(), "Request rejected: {}", e);
                    }
                    timer.fail(e.kind());
                    e.into_response()
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn proxy<B>(&self, request: Request<B>) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Display + Send,
    {
        let ProxiedRequest {
            target,
            token,
            head,
            body,
        } = self.state.router.intercept(request)?;
        tracing::Span::current().record("target", target.name.as_str());

        let credential = self.exchange(&target, token).await?;
        let conn = self.state.pool.acquire(&target, credential).await?;

        relay::forward(
            conn,
            &target,
            head,
            body,
            self.state.config.relay.buffer_frames,
            self.state.metrics.clone(),
        )
        .await
    }

    /// Exchange `token` exactly once. The token is dropped as soon as the
    /// issuance call settles, whatever its outcome.
    async fn exchange(
        &self,
        target: &Target,
        token: BearerToken,
    ) -> Result<ExchangedCredential, ExchangeError> {
        let result = match timeout(
            self.state.config.exchange_timeout(),
            self.state.issuer.exchange(target, &token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout),
        };
        drop(token);

        self.state
            .metrics
            .record_exchange(result.as_ref().err().map(ExchangeError::kind));
        result
    }
}
