//! Request dispatch engine for the Meridian multi-region reverse proxy.
//!
//! This crate owns the per-backend state and the selection logic the proxy
//! server builds on:
//!
//! - **Registry**: owns the configured backend list plus one Health and one
//!   Metrics record per backend, and triggers active health probes.
//! - **Selector**: a pure function from candidates, request context and a
//!   metrics snapshot to one backend (regional preference, performance
//!   scoring, weighted random).
//! - **HealthProber**: `HEAD /health` probes with a hard 5 second deadline.
//!
//! The four pieces form a feedback loop: selection reads health and
//! metrics, request outcomes update them. Everything mutable lives behind
//! the registry so the loop stays consistent under concurrent requests.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use dispatch::{selector, Backend, HealthProber, Registry, RequestContext};
//!
//! # async fn example() -> common::Result<()> {
//! let backends = vec![
//!     Backend::new("http://origin-us.example.com", "us-west", 2),
//!     Backend::new("http://origin-eu.example.com", "europe-west", 1),
//! ];
//! let registry = Registry::new(backends, 5, Duration::from_secs(30), HealthProber::new()?);
//!
//! let ctx = RequestContext {
//!     method: "GET".to_string(),
//!     path_query: "/api/items".to_string(),
//!     client_ip: "203.0.113.9".to_string(),
//!     country: "DE".to_string(),
//!     user_agent: String::new(),
//! };
//!
//! let healthy = registry.healthy_backends().await;
//! let snapshot = registry.metrics_snapshot();
//! let mut rng = rand::thread_rng();
//! if let Some(backend) = selector::select(&healthy, &ctx, Some(&snapshot), &mut rng) {
//!     // forward the request, then:
//!     registry.record_outcome(&backend.url, 42, true);
//!     registry.mark_healthy(&backend.url);
//! }
//! # Ok(())
//! # }
//! ```

pub mod probe;
pub mod region;
pub mod registry;
pub mod selector;
pub mod types;

pub use probe::HealthProber;
pub use registry::Registry;
pub use types::{Backend, BackendStats, Health, Metrics, RequestContext};
