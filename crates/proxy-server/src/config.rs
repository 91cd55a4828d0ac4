//! Configuration loading and validation for the proxy server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dispatch::Backend;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError};

// Re-export Validate trait for derive macro
#[allow(unused_imports)]
use validator::Validate as _;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found in search paths")]
    FileNotFound,

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,

    pub proxy: ProxySettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.server.validate()?;
        self.proxy.validate()?;
        for backend in &self.proxy.backends {
            backend.validate()?;
        }
        Ok(())
    }
}

/// Environment the proxy runs in; development exposes the JSON metrics
/// dump on the ingress listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

/// Server-level settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerSettings {
    /// Ingress listen address.
    #[serde(default = "default_listen")]
    #[validate(length(min = 1))]
    pub listen: String,

    #[serde(default = "default_environment")]
    pub environment: Environment,
}

/// One configured upstream origin
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BackendSettings {
    #[validate(custom = "validate_backend_url")]
    pub url: String,

    #[serde(default = "default_weight")]
    #[validate(range(min = 1))]
    pub weight: u32,

    #[validate(length(min = 1))]
    pub region: String,
}

/// Dispatch engine settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProxySettings {
    #[validate(length(min = 1))]
    pub backends: Vec<BackendSettings>,

    /// Internal forwarder retries for network errors.
    #[serde(default = "default_retry_attempts")]
    #[validate(range(min = 0, max = 10))]
    pub retry_attempts: u32,

    #[serde(default = "default_true")]
    pub enable_caching: bool,

    #[serde(with = "humantime_serde", default = "default_cache_max_age")]
    pub cache_max_age: Duration,

    #[serde(with = "humantime_serde", default = "default_health_check_interval")]
    #[validate(custom = "validate_health_check_interval")]
    pub health_check_interval: Duration,

    #[serde(default = "default_circuit_breaker_threshold")]
    #[validate(range(min = 1, max = 100))]
    pub circuit_breaker_threshold: u32,
}

/// Prometheus exporter settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Exporter listen address; None disables the exporter.
    pub listen: Option<String>,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

// Default implementations

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            environment: default_environment(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_environment() -> Environment {
    Environment::Production
}

fn default_weight() -> u32 {
    1
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_cache_max_age() -> Duration {
    Duration::from_secs(300)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

// Custom validators

fn validate_backend_url(url: &str) -> Result<(), ValidationError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("backend_url_empty"));
    }
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return Err(ValidationError::new("backend_url_scheme"));
    }
    Ok(())
}

fn validate_health_check_interval(interval: &Duration) -> Result<(), ValidationError> {
    let millis = interval.as_millis();
    if millis < 100 || millis > 3_600_000 {
        return Err(ValidationError::new("health_check_interval_out_of_range"));
    }
    Ok(())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from the first `proxy.yaml` the search finds.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::find_config_file().ok_or(ConfigError::FileNotFound)?;
        tracing::info!("Loading configuration from: {}", path.display());
        Self::load_from_file(path)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// First existing `proxy.yaml`, checking the working directory, then
    /// the user config directory, then the system-wide path.
    fn find_config_file() -> Option<PathBuf> {
        let user_config = dirs::home_dir().map(|home| home.join(".config/meridian/proxy.yaml"));

        std::iter::once(PathBuf::from("./proxy.yaml"))
            .chain(user_config)
            .chain(std::iter::once(PathBuf::from("/etc/meridian/proxy.yaml")))
            .find(|path| path.is_file())
    }

    /// Backend list for the registry, with URLs normalized.
    pub fn backends(&self) -> Vec<Backend> {
        self.proxy
            .backends
            .iter()
            .map(|b| Backend::new(b.url.trim_end_matches('/'), b.region.to_lowercase(), b.weight))
            .collect()
    }
}
