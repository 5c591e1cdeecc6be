use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

pub struct Metrics {
    registry: Registry,

    // Request metrics
    pub total_requests: IntCounter,
    pub failed_requests: IntCounterVec,
    pub request_duration: Histogram,

    // Credential exchange metrics
    pub exchanges_total: IntCounter,
    pub exchange_failures: IntCounterVec,

    // Upstream metrics
    pub upstream_handshakes: IntCounter,
    pub upstream_connect_errors: IntCounter,
    pub pool_hits: IntCounter,
    pub pool_evictions: IntCounter,
    pub active_relays: IntGauge,

    // Front door metrics
    pub client_tls_failures: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let total_requests = IntCounter::new(
            "pinniped_proxy_requests_total",
            "Total number of proxied requests",
        )
        .expect("metric creation failed");
        let failed_requests = IntCounterVec::new(
            Opts::new(
                "pinniped_proxy_requests_failed_total",
                "Requests answered with a proxy-generated error",
            ),
            &["kind"],
        )
        .expect("metric creation failed");
        let request_duration = Histogram::with_opts(prometheus::HistogramOpts::new(
            "pinniped_proxy_request_duration_seconds",
            "Time until response headers were produced, in seconds",
        ))
        .expect("metric creation failed");

        let exchanges_total = IntCounter::new(
            "pinniped_proxy_exchanges_total",
            "Total number of credential exchange calls",
        )
        .expect("metric creation failed");
        let exchange_failures = IntCounterVec::new(
            Opts::new(
                "pinniped_proxy_exchange_failures_total",
                "Failed credential exchange calls",
            ),
            &["kind"],
        )
        .expect("metric creation failed");

        let upstream_handshakes = IntCounter::new(
            "pinniped_proxy_upstream_handshakes_total",
            "Mutual TLS handshakes completed with upstream servers",
        )
        .expect("metric creation failed");
        let upstream_connect_errors = IntCounter::new(
            "pinniped_proxy_upstream_connect_errors_total",
            "Failed upstream connection attempts",
        )
        .expect("metric creation failed");
        let pool_hits = IntCounter::new(
            "pinniped_proxy_pool_hits_total",
            "Requests dispatched on a pooled upstream connection",
        )
        .expect("metric creation failed");
        let pool_evictions = IntCounter::new(
            "pinniped_proxy_pool_evictions_total",
            "Upstream connections evicted from the pool",
        )
        .expect("metric creation failed");
        let active_relays = IntGauge::new(
            "pinniped_proxy_active_relays",
            "Response bodies currently being relayed",
        )
        .expect("metric creation failed");

        let client_tls_failures = IntCounter::new(
            "pinniped_proxy_client_tls_failures_total",
            "Client connections closed during the TLS handshake",
        )
        .expect("metric creation failed");

        registry.register(Box::new(total_requests.clone())).unwrap();
        registry
            .register(Box::new(failed_requests.clone()))
            .unwrap();
        registry
            .register(Box::new(request_duration.clone()))
            .unwrap();
        registry
            .register(Box::new(exchanges_total.clone()))
            .unwrap();
        registry
            .register(Box::new(exchange_failures.clone()))
            .unwrap();
        registry
            .register(Box::new(upstream_handshakes.clone()))
            .unwrap();
        registry
            .register(Box::new(upstream_connect_errors.clone()))
            .unwrap();
        registry.register(Box::new(pool_hits.clone())).unwrap();
        registry
            .register(Box::new(pool_evictions.clone()))
            .unwrap();
        registry.register(Box::new(active_relays.clone())).unwrap();
        registry
            .register(Box::new(client_tls_failures.clone()))
            .unwrap();

        Self {
            registry,
            total_requests,
            failed_requests,
            request_duration,
            exchanges_total,
            exchange_failures,
            upstream_handshakes,
            upstream_connect_errors,
            pool_hits,
            pool_evictions,
            active_relays,
            client_tls_failures,
        }
    }

    pub fn record_request(&self) {
        self.total_requests.inc();
    }

    pub fn record_failed_request(&self, kind: &str) {
        self.failed_requests.with_label_values(&[kind]).inc();
    }

    pub fn record_request_duration(&self, duration: std::time::Duration) {
        self.request_duration.observe(duration.as_secs_f64());
    }

    pub fn record_exchange(&self, failure: Option<&str>) {
        self.exchanges_total.inc();
        if let Some(kind) = failure {
            self.exchange_failures.with_label_values(&[kind]).inc();
        }
    }

    pub fn record_handshake(&self) {
        self.upstream_handshakes.inc();
    }

    pub fn record_connect_error(&self) {
        self.upstream_connect_errors.inc();
    }

    pub fn record_pool_hit(&self) {
        self.pool_hits.inc();
    }

    pub fn record_eviction(&self) {
        self.pool_evictions.inc();
    }

    pub fn record_client_tls_failure(&self) {
        self.client_tls_failures.inc();
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode_text(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.gather_metrics(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Decrements `active_relays` when the relayed body finishes or is dropped.
pub struct RelayGauge {
    metrics: Arc<Metrics>,
}

impl RelayGauge {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.active_relays.inc();
        Self { metrics }
    }
}

impl Drop for RelayGauge {
    fn drop(&mut self) {
        self.metrics.active_relays.dec();
    }
}

pub struct RequestTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl RequestTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.record_request();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        self.metrics.record_request_duration(duration);
    }

    pub fn fail(self, kind: &str) {
        let duration = self.start.elapsed();
        self.metrics.record_request_duration(duration);
        self.metrics.record_failed_request(kind);
    }
}
