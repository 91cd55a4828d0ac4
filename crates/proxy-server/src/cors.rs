//! CORS decoration applied to every response leaving the proxy.

use axum::body::Body;
use http::{HeaderMap, HeaderValue, Response, StatusCode};

pub const ALLOW_ORIGIN: &str = "*";
pub const ALLOW_METHODS: &str = "GET,POST,PUT,DELETE,OPTIONS,PATCH";
pub const ALLOW_HEADERS: &str = "Content-Type,Authorization,X-Requested-With,Accept,Origin";
pub const MAX_AGE: &str = "86400";

/// Advertised proxy identity.
pub const PROXY_BY: &str = "Cloudflare-Workers";

/// Applies the fixed CORS set and the proxy identity header.
pub fn decorate(headers: &mut HeaderMap) {
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static(ALLOW_ORIGIN),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    headers.insert("access-control-max-age", HeaderValue::from_static(MAX_AGE));
    headers.insert("x-proxy-by", HeaderValue::from_static(PROXY_BY));
}

/// Response for a CORS preflight request.
pub fn preflight() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    decorate(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decorate_sets_full_header_set() {
        let mut headers = HeaderMap::new();
        decorate(&mut headers);
        assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
        assert_eq!(
            headers.get("access-control-allow-methods").unwrap(),
            "GET,POST,PUT,DELETE,OPTIONS,PATCH"
        );
        assert_eq!(
            headers.get("access-control-allow-headers").unwrap(),
            "Content-Type,Authorization,X-Requested-With,Accept,Origin"
        );
        assert_eq!(headers.get("access-control-max-age").unwrap(), "86400");
        assert_eq!(headers.get("x-proxy-by").unwrap(), "Cloudflare-Workers");
    }

    #[test]
    fn test_preflight_is_ok_with_cors() {
        let response = preflight();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("access-control-allow-origin"));
        assert!(response.headers().contains_key("access-control-max-age"));
    }
}
