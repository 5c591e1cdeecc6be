//! Streaming relay between the client and an upstream connection.
//!
//! Each direction is a producer task pulling frames from one body and pushing
//! them into a bounded channel that the other side's body reads from. The two
//! producers share a cancellation token: a failed client stream stops the
//! upstream request, and a client that stops reading the response tears the
//! upstream stream down instead of draining it.

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::uri::{Scheme, Uri};
use http::{Request, Response, Version};
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::router::{strip_hop_by_hop, RequestHead};
use crate::error::{ProxyError, RelayError};
use crate::state::metrics::RelayGauge;
use crate::state::Metrics;
use crate::target::Target;
use crate::upstream::PooledConnection;

pub type ProxyBody = BoxBody<Bytes, RelayError>;

type FrameResult = Result<Frame<Bytes>, RelayError>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Body fed by a relay producer through a bounded channel.
pub struct ChannelBody {
    rx: mpsc::Receiver<FrameResult>,
    size_hint: SizeHint,
}

impl ChannelBody {
    fn new(capacity: usize, size_hint: SizeHint) -> (mpsc::Sender<FrameResult>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx, size_hint })
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = RelayError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx.poll_recv(cx)
    }

    fn size_hint(&self) -> SizeHint {
        self.size_hint.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The source ended and every frame was handed to the consumer.
    Completed,
    /// The consumer dropped its end.
    ConsumerGone,
    /// The source failed; the error was forwarded to the consumer.
    SourceFailed,
    Cancelled,
}

/// Move frames from `source` into `tx` until one side finishes.
async fn pump<B, F>(
    source: B,
    tx: mpsc::Sender<FrameResult>,
    cancel: CancellationToken,
    on_error: F,
) -> PumpOutcome
where
    B: Body<Data = Bytes>,
    F: Fn(B::Error) -> RelayError,
{
    let mut source = Box::pin(source);
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = tx.try_send(Err(RelayError::Cancelled));
                return PumpOutcome::Cancelled;
            }
            _ = tx.closed() => return PumpOutcome::ConsumerGone,
            frame = source.frame() => frame,
        };

        match frame {
            None => return PumpOutcome::Completed,
            Some(Ok(frame)) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return PumpOutcome::Cancelled,
                    sent = tx.send(Ok(frame)) => {
                        if sent.is_err() {
                            return PumpOutcome::ConsumerGone;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                let _ = tx.send(Err(on_error(e))).await;
                return PumpOutcome::SourceFailed;
            }
        }
    }
}

/// Send `head`/`body` to `target` over `conn` and stream the response back.
///
/// Errors returned here happened before any response byte was produced and
/// can still be turned into a status-coded response. Failures after that
/// point truncate the streamed body.
pub async fn forward<B>(
    mut conn: PooledConnection,
    target: &Target,
    head: RequestHead,
    body: B,
    capacity: usize,
    metrics: Arc<Metrics>,
) -> Result<Response<ProxyBody>, ProxyError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Display + Send,
{
    let cancel = CancellationToken::new();
    let http2 = conn.is_http2();

    let (upstream_body, request_pump) = if body.is_end_stream() {
        (empty_body(), None)
    } else {
        let (tx, channel) = ChannelBody::new(capacity, body.size_hint());
        let task = tokio::spawn(
            {
                let cancel = cancel.clone();
                async move {
                    let outcome = pump(body, tx, cancel.clone(), |e| {
                        RelayError::ClientStream(e.to_string())
                    })
                    .await;
                    if outcome == PumpOutcome::SourceFailed {
                        tracing::debug!("Client request body failed, cancelling relay");
                        cancel.cancel();
                    }
                    outcome
                }
            }
            .in_current_span(),
        );
        (channel.boxed(), Some(task))
    };

    let request = match upstream_request(target, head, upstream_body, http2) {
        Ok(request) => request,
        Err(e) => {
            cancel.cancel();
            return Err(e);
        }
    };

    let response = match conn.send_request(request).await {
        Ok(response) => response,
        Err(e) => {
            cancel.cancel();
            return Err(RelayError::UpstreamStream(e.to_string()).into());
        }
    };

    let (mut parts, upstream) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    tracing::debug!(status = %parts.status, reused = conn.is_reused(), "Upstream responded");

    if upstream.is_end_stream() {
        finish(conn, PumpOutcome::Completed, request_pump, &cancel);
        return Ok(Response::from_parts(parts, empty_body()));
    }

    let (tx, channel) = ChannelBody::new(capacity, upstream.size_hint());
    tokio::spawn(
        async move {
            let _gauge = RelayGauge::new(metrics);
            let outcome = pump(upstream, tx, cancel.clone(), |e| {
                RelayError::UpstreamStream(e.to_string())
            })
            .await;
            match outcome {
                PumpOutcome::Completed => {}
                PumpOutcome::ConsumerGone => {
                    tracing::debug!("Client went away mid-response, abandoning upstream stream")
                }
                PumpOutcome::SourceFailed => tracing::warn!("Upstream response stream failed"),
                PumpOutcome::Cancelled => tracing::debug!("Response relay cancelled"),
            }
            finish(conn, outcome, request_pump, &cancel);
        }
        .in_current_span(),
    );

    Ok(Response::from_parts(parts, channel.boxed()))
}

/// Return the connection to the pool only when both directions ended cleanly.
fn finish(
    conn: PooledConnection,
    outcome: PumpOutcome,
    request_pump: Option<JoinHandle<PumpOutcome>>,
    cancel: &CancellationToken,
) {
    let request_done = request_pump.as_ref().map_or(true, |task| task.is_finished());
    if outcome == PumpOutcome::Completed && request_done && !cancel.is_cancelled() {
        conn.release();
    } else {
        cancel.cancel();
        drop(conn);
    }
}

fn upstream_request(
    target: &Target,
    head: RequestHead,
    body: ProxyBody,
    http2: bool,
) -> Result<Request<ProxyBody>, ProxyError> {
    let RequestHead {
        method,
        version: _,
        path_and_query,
        headers,
    } = head;

    let uri = if http2 {
        Uri::builder()
            .scheme(Scheme::HTTPS)
            .authority(target.authority.clone())
            .path_and_query(path_and_query)
            .build()
    } else {
        Uri::builder().path_and_query(path_and_query).build()
    }
    .map_err(|e| RelayError::UpstreamStream(format!("invalid upstream uri: {}", e)))?;

    let mut request = Request::new(body);
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.headers_mut() = headers;

    if http2 {
        *request.version_mut() = Version::HTTP_2;
    } else {
        *request.version_mut() = Version::HTTP_11;
        let host = HeaderValue::from_str(target.authority.as_str())
            .map_err(|e| RelayError::UpstreamStream(format!("invalid host: {}", e)))?;
        request.headers_mut().insert(header::HOST, host);
    }

    Ok(request)
}
