//! Per-request orchestration: cache, selection, forwarding, failover.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use common::error::{Error, Result};
use dispatch::{selector, Backend, Registry, RequestContext};
use http::{header, HeaderMap, HeaderValue, Method, Request, Response};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cache::{self, ResponseCache};
use crate::forwarder::Forwarder;
use crate::metrics::ProxyMetrics;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;

/// Upper bound on failover iterations within one request.
const MAX_FAILOVER_ATTEMPTS: usize = 3;

/// Orchestrates one client request end to end: cache lookup, healthy-set
/// filter, selection, forwarding, failover, outcome classification,
/// metrics update and cache store.
pub struct Dispatcher {
    registry: Arc<Registry>,
    forwarder: Forwarder,
    cache: Option<ResponseCache>,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        forwarder: Forwarder,
        cache: Option<ResponseCache>,
        metrics: Option<Arc<ProxyMetrics>>,
    ) -> Self {
        Self {
            registry,
            forwarder,
            cache,
            metrics,
        }
    }

    /// Handles one client request, returning either the upstream response
    /// or the error the ingress layer renders for the client.
    pub async fn dispatch(&self, req: Request<Body>) -> Result<Response<Body>> {
        let ctx = request_context(&req);
        let request_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let span = info_span!(
            "dispatch",
            id = %request_id,
            method = %ctx.method,
            path = %ctx.path_query,
            country = %ctx.country,
        );
        self.dispatch_inner(req, ctx).instrument(span).await
    }

    async fn dispatch_inner(
        &self,
        req: Request<Body>,
        ctx: RequestContext,
    ) -> Result<Response<Body>> {
        // Oversize rejection happens before any cache or upstream work.
        if let Some(length) = content_length(req.headers()) {
            if length > MAX_BODY_BYTES {
                warn!(length, "rejecting oversize request");
                return Err(Error::OversizePayload {
                    limit: MAX_BODY_BYTES,
                });
            }
        }

        let method = req.method().clone();

        if method == Method::GET {
            if let Some(cache) = &self.cache {
                if let Some(hit) = cache.lookup(&ctx.path_query) {
                    debug!(path = %ctx.path_query, "cache hit");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_cache_hit();
                    }
                    return Ok(hit);
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_cache_miss();
                }
            }
        }

        let healthy = self.registry.healthy_backends().await;
        if healthy.is_empty() {
            warn!("no healthy backends available");
            return Err(Error::NoHealthyBackends);
        }

        let (parts, body) = req.into_parts();
        let scheme = parts.uri.scheme_str().unwrap_or("http").to_string();
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let client_headers = parts.headers;

        let body = if method == Method::GET || method == Method::HEAD {
            None
        } else {
            let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES as usize)
                .await
                .map_err(classify_body_error)?;
            Some(bytes)
        };

        let start = Instant::now();
        let attempts = healthy.len().min(MAX_FAILOVER_ATTEMPTS);
        let mut tried: Vec<String> = Vec::with_capacity(attempts);
        let mut last_error = Error::NoHealthyBackends;

        for attempt in 0..attempts {
            // Already-tried backends are excluded from re-selection; the
            // full healthy set backs an exhausted exclusion list.
            let remaining: Vec<Backend> = healthy
                .iter()
                .filter(|b| !tried.contains(&b.url))
                .cloned()
                .collect();
            let candidates = if remaining.is_empty() {
                healthy.clone()
            } else {
                remaining
            };

            let backend = {
                let snapshot = self.registry.metrics_snapshot();
                let mut rng = rand::thread_rng();
                selector::select(&candidates, &ctx, Some(&snapshot), &mut rng).cloned()
            };
            let Some(backend) = backend else {
                break;
            };
            tried.push(backend.url.clone());

            match self
                .forwarder
                .forward(
                    &backend,
                    &ctx,
                    &client_headers,
                    &scheme,
                    host.as_deref(),
                    body.clone(),
                )
                .await
            {
                Ok(response) if response.status().as_u16() >= 500 => {
                    warn!(
                        backend = %backend.url,
                        status = response.status().as_u16(),
                        attempt,
                        "upstream server error, failing over"
                    );
                    self.registry.mark_failure(&backend.url);
                    self.sync_health_gauge(&backend.url);
                    last_error = Error::UpstreamStatus {
                        status: response.status().as_u16(),
                    };
                }
                Ok(response) => {
                    let duration = start.elapsed();
                    let success = response.status().is_success();
                    self.registry.mark_healthy(&backend.url);
                    self.registry
                        .record_outcome(&backend.url, duration.as_millis() as u64, success);
                    self.sync_health_gauge(&backend.url);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_request(&backend.url, success, duration);
                    }
                    info!(
                        backend = %backend.url,
                        status = response.status().as_u16(),
                        duration_ms = duration.as_millis() as u64,
                        "request proxied"
                    );
                    return self.finish_response(&method, &ctx, backend, response).await;
                }
                Err(error) => {
                    warn!(
                        backend = %backend.url,
                        error = %error,
                        attempt,
                        "upstream attempt failed"
                    );
                    self.registry.mark_failure(&backend.url);
                    self.sync_health_gauge(&backend.url);
                    if !error.is_network_class() {
                        return Err(error);
                    }
                    last_error = error;
                }
            }
        }

        Err(last_error)
    }

    /// Annotates the upstream response, stores it in the cache when the
    /// policy permits, and converts it into the client response. Cacheable
    /// bodies are buffered; everything else streams through.
    async fn finish_response(
        &self,
        method: &Method,
        ctx: &RequestContext,
        backend: Backend,
        upstream: reqwest::Response,
    ) -> Result<Response<Body>> {
        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        // The ingress connection is re-framed by the server stack.
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONNECTION);
        if let Ok(value) = HeaderValue::from_str(&backend.url) {
            headers.insert("x-backend-url", value);
        }
        if let Ok(value) = HeaderValue::from_str(&backend.region) {
            headers.insert("x-backend-region", value);
        }

        let storable = self.cache.is_some()
            && *method == Method::GET
            && cache::is_storable(status, &headers);

        let body = if storable {
            let bytes = upstream.bytes().await.map_err(Error::transport)?;
            if let Some(cache) = &self.cache {
                cache.store(&ctx.path_query, status, &headers, bytes.clone());
            }
            Body::from(bytes)
        } else {
            Body::from_stream(upstream.bytes_stream())
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    fn sync_health_gauge(&self, url: &str) {
        if let (Some(metrics), Some(health)) = (&self.metrics, self.registry.health_of(url)) {
            metrics.set_backend_health(url, health.is_healthy, health.consecutive_failures);
        }
    }
}

/// Extracts the engine's view of the client request.
///
/// Client IP and country come from the edge headers; both fall back to
/// the `"unknown"` sentinel.
pub fn request_context(req: &Request<Body>) -> RequestContext {
    let header_str = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    RequestContext {
        method: req.method().as_str().to_string(),
        path_query: req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        client_ip: header_str("cf-connecting-ip").unwrap_or_else(|| "unknown".to_string()),
        country: header_str("cf-ipcountry").unwrap_or_else(|| "unknown".to_string()),
        user_agent: header_str("user-agent").unwrap_or_default(),
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Maps a failed inbound body read: length-limit breaches are oversize
/// rejections, everything else is a client abort.
fn classify_body_error(e: axum::Error) -> Error {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&e);
    while let Some(err) = source {
        if err.is::<http_body_util::LengthLimitError>() {
            return Error::OversizePayload {
                limit: MAX_BODY_BYTES,
            };
        }
        source = err.source();
    }
    Error::aborted(e)
}
