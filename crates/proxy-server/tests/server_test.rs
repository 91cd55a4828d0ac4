//! Integration tests for the ingress router: special paths, CORS
//! decoration and the development metrics endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use http::{header, Method, StatusCode};

use dispatch::{Backend, HealthProber, Registry};
use proxy_server::cache::ResponseCache;
use proxy_server::dispatcher::Dispatcher;
use proxy_server::forwarder::Forwarder;
use proxy_server::server::{router, AppState};
use proxy_server::Environment;

/// Spawns a stub backend answering `/health` with 200 and everything
/// else with a JSON body.
async fn spawn_backend() -> String {
    let app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .fallback(|| async {
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"from":"backend"}"#,
            )
                .into_response()
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Serves the full ingress router over a backend; returns the proxy
/// address and the backend URL.
async fn spawn_proxy(environment: Environment) -> (SocketAddr, String) {
    let backend_url = spawn_backend().await;
    let registry = Arc::new(Registry::new(
        vec![Backend::new(backend_url.clone(), "us-west", 1)],
        5,
        Duration::from_secs(30),
        HealthProber::new().unwrap(),
    ));
    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        Forwarder::new(0).unwrap(),
        Some(ResponseCache::new(Duration::from_secs(300))),
        None,
    );
    let state = Arc::new(AppState::new(dispatcher, registry, environment));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, backend_url)
}

#[tokio::test]
async fn test_options_preflight_answers_with_cors() {
    let (addr, _backend) = spawn_proxy(Environment::Production).await;
    let client = reqwest::Client::new();

    let response = client
        .request(Method::OPTIONS, format!("http://{addr}/anything"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    assert_eq!(
        headers.get("access-control-allow-methods").unwrap(),
        "GET,POST,PUT,DELETE,OPTIONS,PATCH"
    );
    assert_eq!(headers.get("access-control-max-age").unwrap(), "86400");
    assert_eq!(headers.get("x-proxy-by").unwrap(), "Cloudflare-Workers");
}

#[tokio::test]
async fn test_favicon_returns_no_content() {
    let (addr, _backend) = spawn_proxy(Environment::Production).await;

    let response = reqwest::get(format!("http://{addr}/favicon.ico"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_proxied_response_is_decorated() {
    let (addr, backend_url) = spawn_proxy(Environment::Production).await;

    let response = reqwest::get(format!("http://{addr}/api/items"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers.get("x-backend-url").unwrap(), backend_url.as_str());
    assert_eq!(headers.get("x-backend-region").unwrap(), "us-west");
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    assert_eq!(headers.get("x-proxy-by").unwrap(), "Cloudflare-Workers");

    let body = response.text().await.unwrap();
    assert_eq!(body, r#"{"from":"backend"}"#);
}

#[tokio::test]
async fn test_development_exposes_metrics_dump() {
    let (addr, backend_url) = spawn_proxy(Environment::Development).await;

    // Generate one proxied request so the counters move.
    reqwest::get(format!("http://{addr}/api/items"))
        .await
        .unwrap();

    let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );

    let stats: serde_json::Value = response.json().await.unwrap();
    let entry = &stats[&backend_url];
    assert_eq!(entry["requests"], 1);
    assert_eq!(entry["errors"], 0);
    assert_eq!(entry["isHealthy"], true);
    assert_eq!(entry["consecutiveFailures"], 0);
}

#[tokio::test]
async fn test_production_proxies_metrics_path() {
    let (addr, _backend) = spawn_proxy(Environment::Production).await;

    // Outside development /metrics is an ordinary path and reaches the
    // backend like any other request.
    let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-backend-url"));
    assert_eq!(response.text().await.unwrap(), r#"{"from":"backend"}"#);
}

#[tokio::test]
async fn test_unavailable_backends_yield_json_error() {
    let registry = Arc::new(Registry::new(
        vec![Backend::new("http://127.0.0.1:1", "us-west", 1)],
        1,
        Duration::from_secs(30),
        HealthProber::new().unwrap(),
    ));
    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        Forwarder::new(0).unwrap(),
        None,
        None,
    );
    let state = Arc::new(AppState::new(
        dispatcher,
        registry,
        Environment::Production,
    ));
    let app = router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Threshold 1: the first failed probe opens the breaker, so the
    // request is refused with the JSON error body.
    let response = reqwest::get(format!("http://{addr}/api")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    assert!(response.headers().contains_key("access-control-allow-origin"));

    let payload: serde_json::Value = response.json().await.unwrap();
    assert_eq!(payload["status"], 503);
    assert!(payload["error"].is_string());
    assert!(payload["timestamp"].is_string());
}
