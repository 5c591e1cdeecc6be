#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method, Request, Response, Uri, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use pinniped_proxy::config::Config;
use pinniped_proxy::credential::{BearerToken, CredentialIssuer, ExchangedCredential};
use pinniped_proxy::error::ExchangeError;
use pinniped_proxy::proxy::ProxyServer;
use pinniped_proxy::state::AppState;
use pinniped_proxy::target::{Target, TargetRegistry};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

pub type TestBody = BoxBody<Bytes, Infallible>;
pub type Handler = Arc<dyn Fn(RecordedRequest) -> Response<TestBody> + Send + Sync>;

pub fn full(bytes: impl Into<Bytes>) -> TestBody {
    Full::new(bytes.into()).boxed()
}

/// A throwaway certificate authority issuing server and client certificates.
pub struct TestPki {
    ca: rcgen::Certificate,
    ca_key: KeyPair,
}

impl TestPki {
    pub fn new(name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_key = KeyPair::generate().unwrap();
        let ca = params.self_signed(&ca_key).unwrap();
        Self { ca, ca_key }
    }

    pub fn ca_pem(&self) -> String {
        self.ca.pem()
    }

    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca.der().clone()).unwrap();
        roots
    }

    fn issue(
        &self,
        names: Vec<String>,
        common_name: &str,
        usage: ExtendedKeyUsagePurpose,
        lifetime: time::Duration,
    ) -> (rcgen::Certificate, KeyPair) {
        let mut params = CertificateParams::new(names).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.extended_key_usages = vec![usage];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::minutes(1);
        params.not_after = time::OffsetDateTime::now_utc() + lifetime;

        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();
        (cert, key)
    }

    /// Server certificate valid for `localhost` and `127.0.0.1`.
    pub fn server_identity(&self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let (cert, key) = self.issue(
            vec!["localhost".to_string(), "127.0.0.1".to_string()],
            "localhost",
            ExtendedKeyUsagePurpose::ServerAuth,
            time::Duration::days(1),
        );
        (
            vec![cert.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
    }

    /// PEM client certificate and key, valid from a minute ago for `lifetime`.
    pub fn client_pem(&self, user: &str, lifetime: time::Duration) -> (String, String) {
        let (cert, key) = self.issue(
            Vec::new(),
            user,
            ExtendedKeyUsagePurpose::ClientAuth,
            lifetime,
        );
        (cert.pem(), key.serialize_pem())
    }

    /// TLS config for a mock server. With `client_ca` set, clients must
    /// present a certificate issued by it.
    pub fn server_config(&self, client_ca: Option<&TestPki>, http2: bool) -> ServerConfig {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let (chain, key) = self.server_identity();

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .unwrap();
        let mut config = match client_ca {
            Some(ca) => {
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(ca.roots()), provider)
                        .build()
                        .unwrap();
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(chain, key)
                    .unwrap()
            }
            None => builder.with_no_client_auth().with_single_cert(chain, key).unwrap(),
        };

        config.alpn_protocols = if http2 {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };
        config
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// HTTPS server that records every request and counts TLS handshakes.
pub struct MockServer {
    pub addr: SocketAddr,
    handshakes: Arc<AtomicUsize>,
    failed_handshakes: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockServer {
    pub async fn start(config: ServerConfig, handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let handshakes = Arc::new(AtomicUsize::new(0));
        let failed_handshakes = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let server = Self {
            addr,
            handshakes: handshakes.clone(),
            failed_handshakes: failed_handshakes.clone(),
            requests: requests.clone(),
        };

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let handshakes = handshakes.clone();
                let failed_handshakes = failed_handshakes.clone();
                let requests = requests.clone();
                let handler = handler.clone();

                tokio::spawn(async move {
                    let stream = match acceptor.accept(tcp).await {
                        Ok(stream) => {
                            handshakes.fetch_add(1, Ordering::SeqCst);
                            stream
                        }
                        Err(_) => {
                            failed_handshakes.fetch_add(1, Ordering::SeqCst);
                            return;
                        }
                    };

                    let service = service_fn(move |request: Request<Incoming>| {
                        let handler = handler.clone();
                        let requests = requests.clone();
                        async move {
                            let (parts, body) = request.into_parts();
                            let body = body
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes())
                                .unwrap_or_default();
                            let recorded = RecordedRequest {
                                method: parts.method,
                                uri: parts.uri,
                                version: parts.version,
                                headers: parts.headers,
                                body,
                            };
                            requests.lock().unwrap().push(recorded.clone());
                            Ok::<_, Infallible>(handler(recorded))
                        }
                    });

                    let _ = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        server
    }

    pub fn url(&self) -> String {
        format!("https://127.0.0.1:{}", self.addr.port())
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn failed_handshakes(&self) -> usize {
        self.failed_handshakes.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Upstream API server requiring client certificates from `client_ca`.
pub async fn start_upstream(
    pki: &TestPki,
    client_ca: &TestPki,
    http2: bool,
    handler: Handler,
) -> MockServer {
    MockServer::start(pki.server_config(Some(client_ca), http2), handler).await
}

pub fn json_handler(body: &'static str) -> Handler {
    Arc::new(move |_| {
        Response::builder()
            .header("content-type", "application/json")
            .body(full(body))
            .unwrap()
    })
}

/// In-process issuer handing out certificates from a test CA.
pub struct TestIssuer {
    pki: Arc<TestPki>,
    /// Returned for every successful exchange when set; otherwise each call mints a new pair.
    shared: Option<(String, String)>,
    lifetime: chrono::Duration,
    calls: AtomicUsize,
}

impl TestIssuer {
    pub fn minting(pki: Arc<TestPki>, lifetime: chrono::Duration) -> Self {
        Self {
            pki,
            shared: None,
            lifetime,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn shared(pki: Arc<TestPki>, lifetime: chrono::Duration) -> Self {
        let shared = pki.client_pem("alice", to_time(lifetime));
        Self {
            pki,
            shared: Some(shared),
            lifetime,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn to_time(duration: chrono::Duration) -> time::Duration {
    time::Duration::seconds(duration.num_seconds())
}

#[async_trait]
impl CredentialIssuer for TestIssuer {
    async fn exchange(
        &self,
        target: &Target,
        token: &BearerToken,
    ) -> Result<ExchangedCredential, ExchangeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if token.expose() != "good-token" {
            return Err(ExchangeError::TokenRejected(
                "authentication failed".to_string(),
            ));
        }

        let (cert, key) = match &self.shared {
            Some(pair) => pair.clone(),
            None => self.pki.client_pem("alice", to_time(self.lifetime)),
        };
        ExchangedCredential::from_pem(
            &target.name,
            &cert,
            &key,
            Some(Utc::now() - chrono::Duration::minutes(1)),
            Utc::now() + self.lifetime,
        )
    }
}

pub fn proxy_config(upstream_url: &str, ca_pem: &str, http2: bool) -> Config {
    serde_json::from_value(serde_json::json!({
        "listen": { "address": "127.0.0.1:0" },
        "routing": { "defaultTarget": "cluster-a" },
        "targets": {
            "cluster-a": { "url": upstream_url, "caPem": ca_pem }
        },
        "upstream": { "http2": http2, "connectTimeoutMs": 5000 },
        "exchange": { "timeoutMs": 5000 },
    }))
    .unwrap()
}

/// A running proxy bound to an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    certificate_pem: String,
}

impl TestProxy {
    pub async fn start(config: Config, issuer: Arc<dyn CredentialIssuer>) -> Self {
        let targets = Arc::new(TargetRegistry::from_config(&config).unwrap());
        let (state, _) = AppState::with_issuer(config, targets, issuer).unwrap();
        Self::serve(state).await
    }

    /// Start with the production HTTPS issuer.
    pub async fn start_with_http_issuer(config: Config) -> Self {
        let (state, _) = AppState::new(config).unwrap();
        Self::serve(state).await
    }

    async fn serve(state: Arc<AppState>) -> Self {
        let server = ProxyServer::bind(state.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let certificate_pem = server
            .generated_certificate_pem()
            .expect("test proxy uses a generated certificate")
            .to_string();
        tokio::spawn(server.run());

        Self {
            addr,
            state,
            certificate_pem,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("https://localhost:{}{}", self.addr.port(), path)
    }

    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(
                reqwest::Certificate::from_pem(self.certificate_pem.as_bytes()).unwrap(),
            )
            .resolve("localhost", self.addr)
            .build()
            .unwrap()
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.state.shutdown();
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Run `future` with a deadline, failing the test on a hang.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .expect("operation hung")
}
