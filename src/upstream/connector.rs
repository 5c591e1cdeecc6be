use chrono::{DateTime, Utc};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::credential::ExchangedCredential;
use crate::error::ConnectError;
use crate::proxy::relay::ProxyBody;
use crate::state::Metrics;
use crate::target::Target;
use crate::tls::{self, ALPN_H2};

/// Request half of an established upstream connection.
pub enum UpstreamSender {
    Http1(http1::SendRequest<ProxyBody>),
    Http2(http2::SendRequest<ProxyBody>),
}

impl UpstreamSender {
    pub async fn send(
        &mut self,
        request: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, hyper::Error> {
        match self {
            UpstreamSender::Http1(sender) => {
                sender.ready().await?;
                sender.send_request(request).await
            }
            UpstreamSender::Http2(sender) => {
                sender.ready().await?;
                sender.send_request(request).await
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            UpstreamSender::Http1(sender) => sender.is_closed(),
            UpstreamSender::Http2(sender) => sender.is_closed(),
        }
    }

    /// HTTP/2 connections multiplex streams and may be handed to several requests at once.
    pub fn is_shared(&self) -> bool {
        matches!(self, UpstreamSender::Http2(_))
    }

    pub(crate) fn share(&self) -> Option<UpstreamSender> {
        match self {
            UpstreamSender::Http2(sender) => Some(UpstreamSender::Http2(sender.clone())),
            UpstreamSender::Http1(_) => None,
        }
    }
}

/// A freshly handshaken mutual-TLS connection.
pub struct Established {
    pub sender: UpstreamSender,
    pub task: AbortHandle,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: DateTime<Utc>,
}

/// Opens mutual-TLS connections to backend targets.
pub struct UpstreamConnector {
    connect_timeout: Duration,
    http2: bool,
    metrics: Arc<Metrics>,
}

impl UpstreamConnector {
    pub fn new(connect_timeout: Duration, http2: bool, metrics: Arc<Metrics>) -> Self {
        Self {
            connect_timeout,
            http2,
            metrics,
        }
    }

    /// Connect to `target` presenting `credential` as the client certificate.
    ///
    /// The key is copied into the TLS session only; once this returns the
    /// caller may drop the credential.
    pub async fn connect(
        &self,
        target: &Target,
        credential: &ExchangedCredential,
    ) -> Result<Established, ConnectError> {
        let key = credential
            .private_key()
            .map_err(|e| ConnectError::InvalidCredential(e.to_string()))?;
        let config = tls::mutual_client_config(
            target.roots.clone(),
            credential.chain().to_vec(),
            key,
            self.http2,
        )
        .map_err(|e| ConnectError::InvalidCredential(e.to_string()))?;

        let tcp = timeout(
            self.connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        .map_err(|_| ConnectError::Timeout)?
        .map_err(|e| {
            ConnectError::UpstreamUnreachable(format!("{}:{}: {}", target.host, target.port, e))
        })?;
        let _ = tcp.set_nodelay(true);

        let stream = timeout(
            self.connect_timeout,
            TlsConnector::from(Arc::new(config)).connect(target.server_name.clone(), tcp),
        )
        .await
        .map_err(|_| ConnectError::Timeout)?
        .map_err(classify_handshake_error)?;

        let negotiated_h2 = stream.get_ref().1.alpn_protocol() == Some(ALPN_H2);
        let io = TokioIo::new(stream);
        let target_name = target.name.clone();

        let (sender, task) = if negotiated_h2 {
            let (sender, connection) = http2::handshake(TokioExecutor::new(), io)
                .await
                .map_err(|e| ConnectError::UpstreamUnreachable(e.to_string()))?;
            let task = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::debug!(target = %target_name, "Upstream h2 connection closed: {}", e);
                }
            });
            (UpstreamSender::Http2(sender), task.abort_handle())
        } else {
            let (sender, connection) = http1::handshake(io)
                .await
                .map_err(|e| ConnectError::UpstreamUnreachable(e.to_string()))?;
            let task = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::debug!(target = %target_name, "Upstream connection closed: {}", e);
                }
            });
            (UpstreamSender::Http1(sender), task.abort_handle())
        };

        self.metrics.record_handshake();
        tracing::debug!(
            target = %target.name,
            identity = %credential.identity(),
            http2 = negotiated_h2,
            "Established upstream connection"
        );

        Ok(Established {
            sender,
            task,
            not_before: credential.not_before(),
            not_after: credential.not_after(),
        })
    }
}

fn classify_handshake_error(error: io::Error) -> ConnectError {
    let tls_error = error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());

    match tls_error {
        Some(rustls::Error::InvalidCertificate(reason)) => {
            ConnectError::UpstreamTlsRejected(format!("{:?}", reason))
        }
        Some(other) => ConnectError::UpstreamUnreachable(format!("TLS handshake failed: {}", other)),
        None => ConnectError::UpstreamUnreachable(format!("TLS handshake failed: {}", error)),
    }
}
