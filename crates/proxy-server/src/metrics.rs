//! Prometheus metrics for the proxy server, plus the scrape endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use http::{header, HeaderValue, Response, StatusCode};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use common::error::Result;

/// Labels for per-backend metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    /// Backend base URL
    pub backend: String,
}

/// Labels for request outcome metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// Backend base URL
    pub backend: String,
    /// Outcome (success, error)
    pub outcome: String,
}

/// Every metric the proxy exports, with the registry that encodes them.
pub struct ProxyMetrics {
    pub registry: Registry,

    /// Proxied requests by backend and outcome
    requests_total: Family<OutcomeLabels, Counter>,
    /// Upstream response time
    upstream_duration_seconds: Family<BackendLabels, Histogram>,
    /// Current backend health (1=healthy, 0=unhealthy)
    backend_healthy: Family<BackendLabels, Gauge>,
    /// Current consecutive failure count
    consecutive_failures: Family<BackendLabels, Gauge>,
    /// Cache lookups that were served locally
    cache_hits_total: Counter,
    /// Cache lookups that went upstream
    cache_misses_total: Counter,
}

impl ProxyMetrics {
    /// Builds the registry and registers every metric family.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "proxy_requests_total",
            "Proxied requests by backend and outcome",
            requests_total.clone(),
        );

        let upstream_duration_seconds =
            Family::<BackendLabels, Histogram>::new_with_constructor(|| {
                // Exponential buckets from 1ms to ~30s
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "proxy_upstream_duration_seconds",
            "Upstream response time in seconds",
            upstream_duration_seconds.clone(),
        );

        let backend_healthy = Family::<BackendLabels, Gauge>::default();
        registry.register(
            "proxy_backend_healthy",
            "Backend health (1=healthy, 0=unhealthy)",
            backend_healthy.clone(),
        );

        let consecutive_failures = Family::<BackendLabels, Gauge>::default();
        registry.register(
            "proxy_backend_consecutive_failures",
            "Current consecutive failure count",
            consecutive_failures.clone(),
        );

        let cache_hits_total = Counter::default();
        registry.register(
            "proxy_cache_hits_total",
            "GET responses served from the local cache",
            cache_hits_total.clone(),
        );

        let cache_misses_total = Counter::default();
        registry.register(
            "proxy_cache_misses_total",
            "GET cache lookups that went upstream",
            cache_misses_total.clone(),
        );

        Self {
            registry,
            requests_total,
            upstream_duration_seconds,
            backend_healthy,
            consecutive_failures,
            cache_hits_total,
            cache_misses_total,
        }
    }

    /// Record one proxied request outcome
    pub fn record_request(&self, backend: &str, success: bool, duration: Duration) {
        self.requests_total
            .get_or_create(&OutcomeLabels {
                backend: backend.to_string(),
                outcome: if success { "success" } else { "error" }.to_string(),
            })
            .inc();

        self.upstream_duration_seconds
            .get_or_create(&BackendLabels {
                backend: backend.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    /// Update the health gauges for one backend
    pub fn set_backend_health(&self, backend: &str, healthy: bool, failures: u32) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.backend_healthy
            .get_or_create(&labels)
            .set(i64::from(healthy));
        self.consecutive_failures
            .get_or_create(&labels)
            .set(i64::from(failures));
    }

    /// Record a cache hit
    pub fn record_cache_hit(&self) {
        self.cache_hits_total.inc();
    }

    /// Record a cache miss
    pub fn record_cache_miss(&self) {
        self.cache_misses_total.inc();
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves the Prometheus text endpoint on its own listener.
///
/// The exporter is deliberately separate from the ingress: scrapes must
/// keep working while the proxy itself is saturated or failing over, and
/// nothing here passes through the dispatcher. Runs until the process
/// exits.
pub async fn serve_exporter(metrics: Arc<ProxyMetrics>, listen: &str) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(listen_addr = %listen, "Prometheus exporter listening");

    let app = Router::new()
        .route("/metrics", get(export))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(metrics);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Renders the registry in the Prometheus text exposition format.
async fn export(State(metrics): State<Arc<ProxyMetrics>>) -> Response<Body> {
    let mut text = String::new();
    let mut response = Response::new(Body::empty());
    match encode(&mut text, &metrics.registry) {
        Ok(()) => {
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            *response.body_mut() = Body::from(text);
        }
        Err(e) => {
            warn!(error = %e, "metrics encoding failed");
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    response
}
