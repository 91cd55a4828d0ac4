//! Common error types for Meridian proxy components.

use std::fmt;

/// A specialized Result type for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no healthy backends available")]
    NoHealthyBackends,

    #[error("request body exceeds {limit} bytes")]
    OversizePayload { limit: u64 },

    #[error("upstream request timed out: {0}")]
    Timeout(String),

    #[error("upstream connection failed: {0}")]
    Connect(String),

    #[error("client aborted the request: {0}")]
    Aborted(String),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16 },
}

impl Error {
    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new upstream timeout error.
    pub fn timeout(msg: impl fmt::Display) -> Self {
        Error::Timeout(msg.to_string())
    }

    /// Create a new upstream connection error.
    pub fn connect(msg: impl fmt::Display) -> Self {
        Error::Connect(msg.to_string())
    }

    /// Create a new client-abort error.
    pub fn aborted(msg: impl fmt::Display) -> Self {
        Error::Aborted(msg.to_string())
    }

    /// Create a new upstream transport error.
    pub fn transport(msg: impl fmt::Display) -> Self {
        Error::Transport(msg.to_string())
    }

    /// True for transport-level failures that merit retry and failover:
    /// anything that happened before a complete HTTP response was received.
    pub fn is_network_class(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Connect(_) | Error::Aborted(_) | Error::Transport(_)
        )
    }

    /// HTTP status reported to the client when this error terminates a request.
    pub fn client_status(&self) -> u16 {
        match self {
            Error::Timeout(_) => 504,
            Error::Connect(_) | Error::Transport(_) => 502,
            Error::Aborted(_) => 499,
            Error::UpstreamStatus { .. } | Error::NoHealthyBackends => 503,
            Error::OversizePayload { .. } => 413,
            Error::Config(_) | Error::Io(_) | Error::Serialization(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_class_covers_transport_failures() {
        assert!(Error::timeout("deadline").is_network_class());
        assert!(Error::connect("refused").is_network_class());
        assert!(Error::aborted("reset by peer").is_network_class());
        assert!(Error::transport("broken pipe").is_network_class());

        assert!(!Error::NoHealthyBackends.is_network_class());
        assert!(!Error::UpstreamStatus { status: 502 }.is_network_class());
        assert!(!Error::config("bad yaml").is_network_class());
    }

    #[test]
    fn test_client_status_mapping() {
        assert_eq!(Error::timeout("t").client_status(), 504);
        assert_eq!(Error::connect("c").client_status(), 502);
        assert_eq!(Error::transport("t").client_status(), 502);
        assert_eq!(Error::aborted("a").client_status(), 499);
        assert_eq!(Error::UpstreamStatus { status: 502 }.client_status(), 503);
        assert_eq!(Error::NoHealthyBackends.client_status(), 503);
        assert_eq!(Error::OversizePayload { limit: 1 }.client_status(), 413);
        assert_eq!(Error::config("c").client_status(), 500);
    }
}
