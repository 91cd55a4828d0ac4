//! Opportunistic response cache for GET requests.
//!
//! A TTL map keyed by path and query. Entries are dropped lazily on
//! access and by a periodic sweep; writes are best-effort and never block
//! the response path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use tracing::debug;

/// Content-type prefixes eligible for caching.
const CACHEABLE_TYPES: [&str; 3] = ["application/json", "text/", "application/xml"];

#[derive(Clone)]
struct CachedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    stored_at: Instant,
}

/// TTL cache for successful GET responses.
#[derive(Clone)]
pub struct ResponseCache {
    entries: Arc<DashMap<String, CachedResponse>>,
    max_age: Duration,
}

impl ResponseCache {
    /// Create a cache whose entries expire after `max_age`.
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_age,
        }
    }

    /// Returns a response for `key` when a fresh entry exists.
    pub fn lookup(&self, key: &str) -> Option<Response<Body>> {
        let entry = self.entries.get(key)?;
        if entry.stored_at.elapsed() > self.max_age {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        let cached = entry.clone();
        drop(entry);

        let mut response = Response::new(Body::from(cached.body));
        *response.status_mut() = cached.status;
        *response.headers_mut() = cached.headers;
        Some(response)
    }

    /// Stores a response copy under `key`, stamping the cache headers.
    pub fn store(&self, key: &str, status: StatusCode, headers: &HeaderMap, body: Bytes) {
        let mut stored = headers.clone();
        if let Ok(value) = HeaderValue::from_str(&format!("max-age={}", self.max_age.as_secs())) {
            stored.insert(header::CACHE_CONTROL, value);
        }
        if let Ok(value) = HeaderValue::from_str(&Utc::now().to_rfc3339()) {
            stored.insert("x-cached-at", value);
        }
        debug!(key = %key, bytes = body.len(), "response cached");
        self.entries.insert(
            key.to_string(),
            CachedResponse {
                status,
                headers: stored,
                body,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drops every entry older than the TTL.
    pub fn purge_expired(&self) {
        self.entries
            .retain(|_, entry| entry.stored_at.elapsed() <= self.max_age);
    }

    /// Number of live entries (expired-but-unswept included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether a GET response may be stored, judged from status and headers:
/// 2xx only, no `no-cache`/`private` directives, and a cacheable content
/// type.
pub fn is_storable(status: StatusCode, headers: &HeaderMap) -> bool {
    if !status.is_success() {
        return false;
    }

    if let Some(cache_control) = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
    {
        let directives = cache_control.to_ascii_lowercase();
        if directives.contains("no-cache") || directives.contains("private") {
            return false;
        }
    }

    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    CACHEABLE_TYPES
        .iter()
        .any(|prefix| content_type.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers
    }

    // ========== Store policy ==========

    #[test]
    fn test_storable_json_response() {
        assert!(is_storable(StatusCode::OK, &json_headers()));
    }

    #[test]
    fn test_storable_text_and_xml() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        assert!(is_storable(StatusCode::OK, &headers));

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml"),
        );
        assert!(is_storable(StatusCode::OK, &headers));
    }

    #[test]
    fn test_non_2xx_not_storable() {
        assert!(!is_storable(StatusCode::NOT_FOUND, &json_headers()));
        assert!(!is_storable(StatusCode::BAD_GATEWAY, &json_headers()));
    }

    #[test]
    fn test_no_cache_directive_blocks_store() {
        let mut headers = json_headers();
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("No-Cache, max-age=60"),
        );
        assert!(!is_storable(StatusCode::OK, &headers));

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
        assert!(!is_storable(StatusCode::OK, &headers));
    }

    #[test]
    fn test_binary_content_not_storable() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        assert!(!is_storable(StatusCode::OK, &headers));

        assert!(!is_storable(StatusCode::OK, &HeaderMap::new()));
    }

    // ========== Cache behavior ==========

    #[test]
    fn test_lookup_returns_stored_response() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.store(
            "/api/items",
            StatusCode::OK,
            &json_headers(),
            Bytes::from_static(b"[1,2,3]"),
        );

        let response = cache.lookup("/api/items").unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "max-age=60"
        );
        assert!(response.headers().contains_key("x-cached-at"));
    }

    #[test]
    fn test_lookup_misses_unknown_key() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        assert!(cache.lookup("/nope").is_none());
    }

    #[test]
    fn test_expired_entry_misses_and_is_dropped() {
        let cache = ResponseCache::new(Duration::from_millis(0));
        cache.store(
            "/api/items",
            StatusCode::OK,
            &json_headers(),
            Bytes::from_static(b"{}"),
        );
        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.lookup("/api/items").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_drops_only_expired() {
        let cache = ResponseCache::new(Duration::from_millis(50));
        cache.store("/old", StatusCode::OK, &json_headers(), Bytes::new());
        std::thread::sleep(Duration::from_millis(60));
        cache.store("/fresh", StatusCode::OK, &json_headers(), Bytes::new());

        cache.purge_expired();
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup("/fresh").is_some());
    }
}
