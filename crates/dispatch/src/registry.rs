//! Backend registry: the single owner of per-backend mutable state.
//!
//! Health and Metrics for one backend live in the same map entry, so every
//! mutation re-derives the health flag under the entry lock and a reader
//! can never observe `consecutive_failures >= threshold` together with
//! `is_healthy == true`. Distinct backends update independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::probe::HealthProber;
use crate::types::{Backend, BackendStats, Health, Metrics};

/// Mutable per-backend record.
#[derive(Debug, Default)]
struct BackendState {
    health: Health,
    metrics: Metrics,
    /// Guards single-flight probing; at most one probe per backend.
    probe_inflight: bool,
}

/// Owns the configured backend list and all per-backend Health and
/// Metrics records for the process lifetime.
pub struct Registry {
    backends: Vec<Backend>,
    states: Arc<DashMap<String, BackendState>>,
    prober: HealthProber,
    threshold: u32,
    check_interval: Duration,
}

impl Registry {
    /// Create a registry over the configured backends.
    ///
    /// `threshold` is the circuit-breaker limit on consecutive failures;
    /// `check_interval` is how stale a health check may get before the
    /// next [`healthy_backends`](Self::healthy_backends) call re-probes.
    pub fn new(
        backends: Vec<Backend>,
        threshold: u32,
        check_interval: Duration,
        prober: HealthProber,
    ) -> Self {
        let states = Arc::new(DashMap::new());
        for backend in &backends {
            states.insert(backend.url.clone(), BackendState::default());
        }
        Self {
            backends,
            states,
            prober,
            threshold,
            check_interval,
        }
    }

    /// The full configured list, in insertion order.
    pub fn all(&self) -> &[Backend] {
        &self.backends
    }

    /// Backends currently eligible for selection.
    ///
    /// Probes every backend whose last check is older than the configured
    /// interval and waits for those probes before filtering, so an
    /// unhealthy backend whose health endpoint recovered re-enters the set
    /// on this call. An empty result means every backend is unavailable.
    pub async fn healthy_backends(&self) -> Vec<Backend> {
        self.refresh_stale().await;
        self.backends
            .iter()
            .filter(|b| self.is_healthy(&b.url))
            .cloned()
            .collect()
    }

    /// Whether one backend is currently healthy; unknown URLs are not.
    pub fn is_healthy(&self, url: &str) -> bool {
        self.states
            .get(url)
            .map(|s| s.health.is_healthy)
            .unwrap_or(false)
    }

    /// Health snapshot of one backend.
    pub fn health_of(&self, url: &str) -> Option<Health> {
        self.states.get(url).map(|s| s.health.clone())
    }

    /// Read-only copy of the counters of every backend that has served
    /// traffic. Consistent per backend; cross-backend consistency is not
    /// guaranteed and not needed by the selector.
    pub fn metrics_snapshot(&self) -> HashMap<String, Metrics> {
        self.states
            .iter()
            .filter(|e| e.value().metrics.requests > 0)
            .map(|e| (e.key().clone(), e.value().metrics))
            .collect()
    }

    /// Records the outcome of one proxied request against `url`.
    ///
    /// Bumps the request counter and total time, counts an error when
    /// `!success`, and folds the duration into the smoothed response time
    /// with `avg <- (avg + d) / 2`, all under one entry lock.
    pub fn record_outcome(&self, url: &str, duration_ms: u64, success: bool) {
        if let Some(mut state) = self.states.get_mut(url) {
            state.metrics.requests += 1;
            state.metrics.total_time += duration_ms;
            if !success {
                state.metrics.errors += 1;
            }
            state.health.avg_response_time =
                (state.health.avg_response_time + duration_ms as f64) / 2.0;
        }
    }

    /// Resets the failure counter after a good upstream response.
    pub fn mark_healthy(&self, url: &str) {
        if let Some(mut state) = self.states.get_mut(url) {
            let was_healthy = state.health.is_healthy;
            state.health.consecutive_failures = 0;
            state.health.is_healthy = true;
            if !was_healthy {
                info!(backend = %url, "backend recovered");
            }
        }
    }

    /// Counts one failure and re-derives health against the threshold.
    pub fn mark_failure(&self, url: &str) {
        if let Some(mut state) = self.states.get_mut(url) {
            state.health.consecutive_failures += 1;
            let healthy = state.health.consecutive_failures < self.threshold;
            if state.health.is_healthy && !healthy {
                warn!(
                    backend = %url,
                    failures = state.health.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            state.health.is_healthy = healthy;
        }
    }

    /// Per-backend stats for the development metrics endpoint.
    pub fn stats(&self) -> HashMap<String, BackendStats> {
        self.backends
            .iter()
            .filter_map(|backend| {
                let state = self.states.get(&backend.url)?;
                Some((
                    backend.url.clone(),
                    BackendStats {
                        requests: state.metrics.requests,
                        errors: state.metrics.errors,
                        error_rate: state.metrics.error_rate(),
                        avg_response_time: state.metrics.avg_time(),
                        is_healthy: state.health.is_healthy,
                        consecutive_failures: state.health.consecutive_failures,
                    },
                ))
            })
            .collect()
    }

    /// Probes every backend whose last check is stale and waits for the
    /// probes started here. Probes run as detached tasks, so a client
    /// disconnect that drops the calling future never cancels them.
    async fn refresh_stale(&self) {
        let now = now_millis();
        let mut handles = Vec::new();
        for backend in &self.backends {
            let stale = self
                .states
                .get(&backend.url)
                .map(|s| now.saturating_sub(s.health.last_check) > self.check_interval.as_millis() as u64)
                .unwrap_or(false);
            if stale {
                if let Some(handle) = self.spawn_probe(backend) {
                    handles.push(handle);
                }
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Starts a probe task for one backend unless one is already in
    /// flight. Probe success resets the failure counter; probe failure
    /// counts like any other failure. Both outcomes stamp `last_check`.
    fn spawn_probe(&self, backend: &Backend) -> Option<tokio::task::JoinHandle<()>> {
        {
            let mut state = self.states.get_mut(&backend.url)?;
            if state.probe_inflight {
                return None;
            }
            state.probe_inflight = true;
        }

        let url = backend.url.clone();
        let prober = self.prober.clone();
        let states = Arc::clone(&self.states);
        let threshold = self.threshold;
        Some(tokio::spawn(async move {
            let healthy = prober.probe(&url).await;
            if let Some(mut state) = states.get_mut(&url) {
                state.probe_inflight = false;
                state.health.last_check = now_millis();
                if healthy {
                    state.health.consecutive_failures = 0;
                    state.health.is_healthy = true;
                } else {
                    state.health.consecutive_failures += 1;
                    state.health.is_healthy = state.health.consecutive_failures < threshold;
                }
                debug!(
                    backend = %url,
                    healthy = state.health.is_healthy,
                    failures = state.health.consecutive_failures,
                    "probe result applied"
                );
            }
        }))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
