//! Active backend health probing.

use std::time::Duration;

use common::error::{Error, Result};
use tracing::{debug, warn};

/// Hard deadline for one probe; a slow health endpoint counts as down.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends `HEAD {base}/health` probes through a dedicated HTTP client.
///
/// The client is separate from the forwarding client so probe traffic
/// never competes with request traffic for the connection pool, and so
/// the 5 second probe deadline stays independent of the request timeout.
#[derive(Clone)]
pub struct HealthProber {
    client: reqwest::Client,
}

impl HealthProber {
    /// Create a new prober with its own client.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to build probe client: {e}")))?;
        Ok(Self { client })
    }

    /// Probes one backend; true when its health endpoint answered 2xx.
    ///
    /// Network failures, timeouts and non-2xx statuses all count as a
    /// failed probe.
    pub async fn probe(&self, base_url: &str) -> bool {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        match self.client.head(&url).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                debug!(
                    url = %url,
                    status = response.status().as_u16(),
                    healthy,
                    "health probe completed"
                );
                healthy
            }
            Err(e) => {
                warn!(url = %url, error = %e, "health probe failed");
                false
            }
        }
    }
}
