//! Event dispatcher
//!
//! Routes verified inbound push events from the control plane to handlers
//! registered for that event type. See SPEC_FULL.md §4.2, §6.2.

pub mod handlers;

use crate::error::{AggregateError, Result, WgAgentError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// The closed set of event types the core understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Full `Peer` object payload.
    PeerAdded,
    /// `{"peer_id": string}` payload.
    PeerRemoved,
    /// Full `Peer` object payload.
    PeerKeyRotated,
    /// Full `Peer` object payload.
    PeerEndpointChanged,
    /// Trigger-only; payload ignored.
    PolicyUpdated,
    /// Trigger-only; payload ignored.
    BridgeConfigUpdated,
    /// `RelaySessionAssignment` payload.
    RelaySessionAssigned,
    /// `{"session_id": string}` payload.
    RelaySessionRevoked,
    /// Trigger-only; payload ignored.
    SiteToSiteConfigUpdated,
    /// Full `SiteToSiteTunnel` payload.
    SiteToSiteTunnelAssigned,
    /// `{"tunnel_id": string}` payload.
    SiteToSiteTunnelRevoked,
    /// Trigger-only; payload ignored.
    UserAccessConfigUpdated,
    /// Full `UserAccessPeer` payload.
    UserAccessPeerAssigned,
    /// `{"public_key": string}` payload.
    UserAccessPeerRevoked,
    /// Trigger-only; payload ignored.
    IngressConfigUpdated,
    /// Full `IngressRule` payload.
    IngressRuleAssigned,
    /// `{"rule_id": string}` payload.
    IngressRuleRevoked,
}

impl EventType {
    /// Trigger-only handler families (`*_config_updated`, `policy_updated`)
    /// ignore their payload entirely and always succeed, even when malformed
    /// (resolved Open Question 2 — see DESIGN.md).
    pub fn is_trigger_only(&self) -> bool {
        matches!(
            self,
            EventType::PolicyUpdated
                | EventType::BridgeConfigUpdated
                | EventType::SiteToSiteConfigUpdated
                | EventType::UserAccessConfigUpdated
                | EventType::IngressConfigUpdated
        )
    }
}

/// A signed push event from the control plane. Signature verification is
/// delegated to a separately-specified verifier consulted upstream of
/// `dispatch` (SPEC_FULL.md §1 Non-goals) — by the time an envelope reaches
/// the dispatcher its signature is assumed already verified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// Event type.
    pub event_type: EventType,
    /// Idempotency key. The dispatcher performs no deduplication itself.
    pub event_id: String,
    /// JSON sub-schema chosen by `event_type`.
    pub payload: serde_json::Value,
    /// Signature bytes, verified upstream of dispatch.
    #[serde(default)]
    pub signature: Vec<u8>,
}

/// A handler registered against one `EventType`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;
    /// Handle one envelope already matched to this handler's event type.
    async fn handle(&self, envelope: &SignedEnvelope) -> Result<()>;
}

/// Fan-in point for inbound push events.
///
/// `dispatch` does not hold a global lock while handlers run: it snapshots
/// the relevant handler list under the read lock, drops the lock, then
/// invokes the handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<EventType, Vec<std::sync::Arc<dyn EventHandler>>>>,
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `event_type`. Multiple handlers per type are
    /// allowed; invocation order equals registration order.
    pub async fn register(&self, event_type: EventType, handler: std::sync::Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Dispatch one envelope to every handler registered for its event type.
    pub async fn dispatch(&self, envelope: &SignedEnvelope) -> Result<()> {
        let handlers = {
            let guard = self.handlers.read().await;
            match guard.get(&envelope.event_type) {
                Some(hs) => hs.clone(),
                None => {
                    debug!(
                        "event dispatcher: no handlers registered for {:?}, dropping event {}",
                        envelope.event_type, envelope.event_id
                    );
                    return Ok(());
                }
            }
        };

        let mut aggregate = AggregateError::new();
        for handler in &handlers {
            if let Err(e) = handler.handle(envelope).await {
                warn!(
                    "event dispatcher: handler '{}' failed for event {}: {}",
                    handler.name(),
                    envelope.event_id,
                    e
                );
                aggregate.push(e);
            }
        }
        aggregate.into_result()
    }
}

/// Build a no-op trigger-only handler that calls `trigger` on every dispatch,
/// ignoring the payload and any parse failure, per the trigger-only family
/// contract (SPEC_FULL.md §4.2).
pub struct TriggerOnlyHandler<F: Fn() + Send + Sync> {
    name: String,
    trigger: F,
}

impl<F: Fn() + Send + Sync> TriggerOnlyHandler<F> {
    /// Create a trigger-only handler that calls `trigger` unconditionally.
    pub fn new(name: impl Into<String>, trigger: F) -> Self {
        Self {
            name: name.into(),
            trigger,
        }
    }
}

#[async_trait]
impl<F: Fn() + Send + Sync> EventHandler for TriggerOnlyHandler<F> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _envelope: &SignedEnvelope) -> Result<()> {
        (self.trigger)();
        Ok(())
    }
}

/// Parse the `{"peer_id": string}` style revocation payloads shared by
/// several mutating handlers.
pub fn parse_id_field(payload: &serde_json::Value, field: &str) -> Result<String> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| WgAgentError::Payload(format!("missing or non-string field '{}'", field)))
}
