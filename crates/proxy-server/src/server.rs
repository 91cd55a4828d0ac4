//! Ingress HTTP server and component wiring.
//!
//! Special paths (CORS preflight, favicon, the development metrics dump)
//! are answered before dispatch; every other request of any method goes
//! through the dispatcher. All responses leaving the proxy, errors
//! included, carry the CORS header set.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::Router;
use chrono::Utc;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use common::error::{Error, Result};
use dispatch::{HealthProber, Registry};

use crate::cache::ResponseCache;
use crate::config::{Config, Environment};
use crate::cors;
use crate::dispatcher::Dispatcher;
use crate::forwarder::Forwarder;
use crate::metrics::{self, ProxyMetrics};

/// Shared state behind the ingress router.
pub struct AppState {
    dispatcher: Dispatcher,
    registry: Arc<Registry>,
    environment: Environment,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, registry: Arc<Registry>, environment: Environment) -> Self {
        Self {
            dispatcher,
            registry,
            environment,
        }
    }
}

/// The proxy server: builds every component from the configuration and
/// serves the ingress listener until shutdown.
pub struct ProxyServer {
    config: Config,
}

impl ProxyServer {
    /// Create a new proxy server from a validated configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the server.
    pub async fn run(self) -> Result<()> {
        info!("Starting proxy server");

        let backends = self.config.backends();
        let registry = Arc::new(Registry::new(
            backends.clone(),
            self.config.proxy.circuit_breaker_threshold,
            self.config.proxy.health_check_interval,
            HealthProber::new()?,
        ));
        let forwarder = Forwarder::new(self.config.proxy.retry_attempts)?;
        let cache = self
            .config
            .proxy
            .enable_caching
            .then(|| ResponseCache::new(self.config.proxy.cache_max_age));

        // Prometheus exporter runs only when a listener is configured.
        let metrics = self
            .config
            .metrics
            .listen
            .is_some()
            .then(|| Arc::new(ProxyMetrics::new()));
        if let Some(metrics) = &metrics {
            for backend in &backends {
                metrics.set_backend_health(&backend.url, true, 0);
            }
            if let Some(listen) = self.config.metrics.listen.clone() {
                let exporter_metrics = Arc::clone(metrics);
                tokio::spawn(async move {
                    if let Err(e) = metrics::serve_exporter(exporter_metrics, &listen).await {
                        warn!(error = %e, "Prometheus exporter error");
                    }
                });
            }
        }

        if let Some(cache) = cache.clone() {
            let period = self.config.proxy.cache_max_age.max(Duration::from_secs(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // Skip first immediate tick
                loop {
                    interval.tick().await;
                    cache.purge_expired();
                }
            });
        }

        let dispatcher = Dispatcher::new(Arc::clone(&registry), forwarder, cache, metrics);
        let state = Arc::new(AppState::new(
            dispatcher,
            registry,
            self.config.server.environment,
        ));

        let app = router(state);
        let listener = TcpListener::bind(&self.config.server.listen).await?;
        info!(
            listen_addr = %self.config.server.listen,
            backends = backends.len(),
            "Proxy listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Proxy server stopped");
        Ok(())
    }
}

/// Builds the ingress router: a single fallback handler so every method
/// and path reaches the same entry point.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(handle)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
}

/// Ingress entry point: special paths first, everything else dispatches.
async fn handle(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response<Body> {
    if req.method() == Method::OPTIONS {
        return cors::preflight();
    }

    match req.uri().path() {
        "/favicon.ico" => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NO_CONTENT;
            cors::decorate(response.headers_mut());
            response
        }
        "/metrics" if state.environment == Environment::Development => {
            metrics_dump(&state.registry)
        }
        _ => match state.dispatcher.dispatch(req).await {
            Ok(mut response) => {
                cors::decorate(response.headers_mut());
                response
            }
            Err(error) => error_response(&error),
        },
    }
}

/// JSON dump of per-backend stats, exposed only in development.
fn metrics_dump(registry: &Registry) -> Response<Body> {
    let stats = registry.stats();
    let body = match serde_json::to_vec(&stats) {
        Ok(body) => body,
        Err(e) => return error_response(&Error::Serialization(e)),
    };

    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    cors::decorate(response.headers_mut());
    response
}

/// Renders an error as the client-facing JSON body with CORS headers.
pub fn error_response(error: &Error) -> Response<Body> {
    let status = error.client_status();
    let payload = serde_json::json!({
        "error": error.to_string(),
        "status": status,
        "timestamp": Utc::now().to_rfc3339(),
    });

    let mut response = Response::new(Body::from(payload.to_string()));
    *response.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    cors::decorate(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = error_response(&Error::NoHealthyBackends);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert!(response.headers().contains_key("access-control-allow-origin"));

        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload["status"], 503);
        assert_eq!(payload["error"], "no healthy backends available");
        assert!(payload["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_error_response_client_abort_status() {
        let response = error_response(&Error::aborted("connection reset"));
        assert_eq!(response.status().as_u16(), 499);
    }
}
