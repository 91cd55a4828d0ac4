//! Core data model for backend selection and health tracking.

use serde::Serialize;

/// A configured upstream origin.
///
/// Immutable after configuration load; the URL is the unique key for all
/// per-backend state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    /// Base URL of the origin (no trailing slash).
    pub url: String,

    /// Region tag, compared case-insensitively.
    pub region: String,

    /// Static selection weight (>= 1).
    pub weight: u32,
}

impl Backend {
    /// Create a new backend description.
    pub fn new(url: impl Into<String>, region: impl Into<String>, weight: u32) -> Self {
        Self {
            url: url.into(),
            region: region.into(),
            weight,
        }
    }
}

/// Client request attributes consumed by the dispatch engine.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// HTTP method, uppercase.
    pub method: String,

    /// Path plus query string, as received.
    pub path_query: String,

    /// Client IP as reported by the edge, or `"unknown"`.
    pub client_ip: String,

    /// ISO-2 country code, or `"unknown"`.
    pub country: String,

    /// Client user agent, possibly empty.
    pub user_agent: String,
}

/// Mutable health record, one per backend.
#[derive(Debug, Clone)]
pub struct Health {
    /// Derived flag: `consecutive_failures < circuit_breaker_threshold`.
    pub is_healthy: bool,

    /// Failures since the last success or successful probe.
    pub consecutive_failures: u32,

    /// Millis since epoch of the last active probe; 0 = never probed.
    pub last_check: u64,

    /// Smoothed response time: `avg <- (avg + d) / 2`.
    pub avg_response_time: f64,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            is_healthy: true,
            consecutive_failures: 0,
            last_check: 0,
            avg_response_time: 0.0,
        }
    }
}

/// Mutable request counters, one per backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics {
    /// Requests whose outcome was recorded against this backend.
    pub requests: u64,

    /// Recorded outcomes that were not 2xx.
    pub errors: u64,

    /// Accumulated upstream time in millis.
    pub total_time: u64,
}

impl Metrics {
    /// Fraction of recorded outcomes that were errors (0 when idle).
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64
        }
    }

    /// Mean recorded upstream time in millis (0 when idle).
    pub fn avg_time(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_time as f64 / self.requests as f64
        }
    }
}

/// Per-backend snapshot exposed on the development metrics endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStats {
    pub requests: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub avg_response_time: f64,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
}
