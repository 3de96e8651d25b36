//! Error types for the node agent
//!
//! This module defines the error types used throughout the application.
//! We use `thiserror` for ergonomic error definitions and `anyhow` for
//! error propagation in application code.

use thiserror::Error;

/// Main error type for node agent operations
#[derive(Error, Debug)]
pub enum WgAgentError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Driver errors (kernel/OS facility adapters: wg, ip, nft, ...)
    #[error("Driver error: {0}")]
    Driver(String),

    /// Malformed SSE event payload
    #[error("Payload error: {0}")]
    Payload(String),

    /// Capacity limit reached (max peers/sessions/rules/tunnels)
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// One or more reconcile handlers failed during a cycle
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),

    /// Control API errors
    #[error("Control API error: {0}")]
    ControlApi(String),

    /// Service/daemon errors
    #[error("Service error: {0}")]
    Service(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Permission errors
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Security-related errors
    #[error("Security error: {0}")]
    Security(String),

    /// Input validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type alias using WgAgentError
pub type Result<T> = std::result::Result<T, WgAgentError>;

impl From<serde_json::Error> for WgAgentError {
    fn from(err: serde_json::Error) -> Self {
        WgAgentError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for WgAgentError {
    fn from(err: toml::de::Error) -> Self {
        WgAgentError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for WgAgentError {
    fn from(err: reqwest::Error) -> Self {
        WgAgentError::ControlApi(err.to_string())
    }
}

/// An aggregation of errors collected while continuing past individual
/// failures (reconcile cycles, teardown sequences, bulk peer application).
///
/// Mirrors the "collect and continue" idiom used throughout the reconciler,
/// the managers' teardown paths, and the buffered batch reporter.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<WgAgentError>,
}

impl AggregateError {
    /// Create an empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error.
    pub fn push(&mut self, err: WgAgentError) {
        self.errors.push(err);
    }

    /// True if no errors were recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Consume self, returning `Ok(())` if empty or a single wrapped
    /// `WgAgentError::Reconciliation` joining every message otherwise.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(WgAgentError::Reconciliation(self.to_string()))
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined = self
            .errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{} error(s): {}", self.errors.len(), joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_empty_is_ok() {
        assert!(AggregateError::new().into_result().is_ok());
    }

    #[test]
    fn aggregate_collects_messages() {
        let mut agg = AggregateError::new();
        agg.push(WgAgentError::Driver("add_route failed".to_string()));
        agg.push(WgAgentError::Driver("add_peer failed".to_string()));
        assert_eq!(agg.len(), 2);
        let err = agg.into_result().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("add_route failed"));
        assert!(msg.contains("add_peer failed"));
    }
}
