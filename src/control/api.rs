//! Control API request and response types
//!
//! This crate's control API is read-only introspection over the node's own
//! reconciled state — there is no connect/disconnect/reload surface, since a
//! single node agent has exactly one mesh interface whose lifecycle is owned
//! by `main`, not by a control client (SPEC_FULL.md §4.A.8).

use serde::{Deserialize, Serialize};

/// Action requested by a control client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    /// Overall node status: interface, peer count, last reconcile outcome.
    Status,
    /// Mesh peer IDs currently allowed through policy and programmed on the
    /// WireGuard interface.
    ListPeers,
    /// Live UDP relay session IDs.
    ListSessions,
    /// Active TCP ingress rule IDs.
    ListIngressRules,
    /// Firewall rules currently applied by the policy enforcer.
    ListFirewallRules,
}

/// API request from a control client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Request ID for correlating with the response.
    #[serde(default = "default_request_id")]
    pub id: String,
    /// Action to perform.
    pub action: ControlAction,
}

impl ApiRequest {
    /// Construct a request with an explicit ID.
    pub fn new(id: String, action: ControlAction) -> Self {
        Self { id, action }
    }

    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ApiError> {
        serde_json::from_str(json).map_err(|e| ApiError::ParseError(e.to_string()))
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, ApiError> {
        serde_json::to_string(self).map_err(|e| ApiError::SerializationError(e.to_string()))
    }
}

/// API response to a control client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Request ID this response corresponds to.
    pub id: String,
    /// Whether the request was handled successfully.
    pub success: bool,
    /// Result payload, present iff `success`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error detail, present iff not `success`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ApiResponse {
    /// Construct a successful response.
    pub fn success(id: String, data: Option<serde_json::Value>) -> Self {
        Self {
            id,
            success: true,
            data,
            error: None,
        }
    }

    /// Construct an error response.
    pub fn error(id: String, error: ApiError) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, ApiError> {
        serde_json::to_string(self).map_err(|e| ApiError::SerializationError(e.to_string()))
    }

    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ApiError> {
        serde_json::from_str(json).map_err(|e| ApiError::ParseError(e.to_string()))
    }
}

/// API error types.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", content = "message")]
pub enum ApiError {
    /// Failed to parse request.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Failed to serialize response.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<crate::error::WgAgentError> for ApiError {
    fn from(err: crate::error::WgAgentError) -> Self {
        ApiError::InternalError(err.to_string())
    }
}

fn default_request_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("req-{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}
