//! Upstream request execution: header rewrite, timeout, retry with backoff.

use std::time::Duration;

use bytes::Bytes;
use common::error::{Error, Result};
use dispatch::{Backend, RequestContext};
use http::{HeaderMap, HeaderValue, Method};
use tracing::{debug, warn};

/// Hard deadline for a single upstream attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Ingress-edge headers never forwarded upstream.
const STRIPPED_HEADERS: [&str; 4] = ["cf-connecting-ip", "cf-ray", "cf-visitor", "cf-ipcountry"];

/// Executes single upstream attempts with internal retry on network
/// errors.
///
/// The forwarder owns exactly one concern: getting one client request to
/// one chosen backend. Any received HTTP response, 5xx included, returns
/// immediately; failing over to a different backend is the dispatcher's
/// decision, not this one's.
pub struct Forwarder {
    client: reqwest::Client,
    retry_attempts: u32,
}

impl Forwarder {
    /// Create a forwarder retrying network failures `retry_attempts`
    /// times per backend.
    pub fn new(retry_attempts: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to build upstream client: {e}")))?;
        Ok(Self {
            client,
            retry_attempts,
        })
    }

    /// Forwards the client request to one backend.
    ///
    /// Sleeps `2^attempt` seconds between attempts (1 s, 2 s, ...) and
    /// retries only network-class errors.
    pub async fn forward(
        &self,
        backend: &Backend,
        ctx: &RequestContext,
        client_headers: &HeaderMap,
        scheme: &str,
        host: Option<&str>,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response> {
        let target = format!("{}{}", backend.url, ctx.path_query);
        let headers = build_upstream_headers(client_headers, &ctx.client_ip, scheme, host);
        let method = Method::from_bytes(ctx.method.as_bytes())
            .map_err(|e| Error::config(format!("invalid method {:?}: {e}", ctx.method)))?;

        let mut attempt = 0u32;
        loop {
            let mut request = self
                .client
                .request(method.clone(), &target)
                .headers(headers.clone());
            // GET and HEAD never carry a body upstream.
            if method != Method::GET && method != Method::HEAD {
                if let Some(bytes) = &body {
                    request = request.body(bytes.clone());
                }
            }

            match request.send().await {
                Ok(response) => {
                    debug!(
                        target = %target,
                        status = response.status().as_u16(),
                        attempt,
                        "upstream responded"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    let error = classify(e);
                    if !error.is_network_class() || attempt >= self.retry_attempts {
                        return Err(error);
                    }
                    let delay = backoff(attempt);
                    warn!(
                        target = %target,
                        attempt,
                        error = %error,
                        backoff_s = delay.as_secs(),
                        "retrying upstream request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Exponential backoff schedule: 1 s after the first failure, doubling.
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(16))
}

/// Sorts a transport failure into the error taxonomy. Builder misuse is a
/// configuration problem and is never retried.
fn classify(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::timeout(e)
    } else if e.is_connect() {
        Error::connect(e)
    } else if e.is_builder() {
        Error::config(e)
    } else {
        Error::transport(e)
    }
}

/// Builds the header set sent upstream from the client's headers.
///
/// Copies everything except the ingress-edge set (matched
/// case-insensitively; `HeaderName` is normalized to lowercase) and the
/// hop-owned `Host`/`Content-Length`, then adds the forwarding identity
/// headers.
pub fn build_upstream_headers(
    client_headers: &HeaderMap,
    client_ip: &str,
    scheme: &str,
    host: Option<&str>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in client_headers {
        let lower = name.as_str();
        if STRIPPED_HEADERS.contains(&lower) || lower == "host" || lower == "content-length" {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let ip = if client_ip.is_empty() {
        "unknown"
    } else {
        client_ip
    };
    if let Ok(value) = HeaderValue::from_str(ip) {
        headers.insert("x-forwarded-for", value.clone());
        headers.insert("x-real-ip", value);
    }
    if let Ok(value) = HeaderValue::from_str(scheme) {
        headers.insert("x-forwarded-proto", value);
    }
    if let Some(host) = host {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert("x-forwarded-host", value);
        }
    }
    headers
}
