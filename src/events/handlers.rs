//! Mutating event handlers
//!
//! Concrete `EventHandler` implementations for the "mutating" event
//! families (SPEC_FULL.md §4.2): `peer_*`, `relay_session_*`,
//! `site_to_site_tunnel_*`, `user_access_peer_*`, `ingress_rule_*`. Each
//! parses its envelope's payload into the matching full object (assign) or
//! `{"x_id": string}` (revoke) and mutates its subsystem's Manager directly.
//! On a malformed payload the handler returns an error without touching any
//! state (SPEC_FULL.md §7 "Payload errors").
//!
//! Trigger-only handlers (`*_config_updated`, `policy_updated`) need no
//! concrete type of their own — `events::TriggerOnlyHandler` covers all
//! five, wired up in `main`.

use crate::error::{Result, WgAgentError};
use crate::events::{parse_id_field, EventHandler, SignedEnvelope};
use crate::ingress::{IngressManager, IngressRuleSpec};
use crate::policy::PeerApplier;
use crate::relay::{Relay, RelaySessionAssignment};
use crate::sitetosite::SiteToSiteManager;
use crate::state::{IngressRule, Peer, SiteToSiteTunnel, UserAccessPeer};
use crate::useraccess::UserAccessManager;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

fn parse_payload<T: for<'de> Deserialize<'de>>(envelope: &SignedEnvelope) -> Result<T> {
    serde_json::from_value(envelope.payload.clone())
        .map_err(|e| WgAgentError::Payload(format!("invalid payload: {}", e)))
}

/// Handles `peer_added` / `peer_key_rotated` / `peer_endpoint_changed`: the
/// full `Peer` payload, upserted into the WireGuard manager (its kernel
/// config is upsert semantics already, so add/rotate/endpoint-change share
/// one code path — SPEC_FULL.md §4.3).
pub struct PeerUpsertHandler {
    applier: Arc<dyn PeerApplier>,
}

impl PeerUpsertHandler {
    /// Construct a handler that applies upserts through `applier`.
    pub fn new(applier: Arc<dyn PeerApplier>) -> Self {
        Self { applier }
    }
}

#[async_trait]
impl EventHandler for PeerUpsertHandler {
    fn name(&self) -> &str {
        "peer-upsert"
    }

    async fn handle(&self, envelope: &SignedEnvelope) -> Result<()> {
        let peer: Peer = parse_payload(envelope)?;
        self.applier.add_peer(&peer).await
    }
}

/// Handles `peer_removed`: `{"peer_id": string}`.
pub struct PeerRemovedHandler {
    applier: Arc<dyn PeerApplier>,
}

impl PeerRemovedHandler {
    /// Construct a handler that removes peers through `applier`.
    pub fn new(applier: Arc<dyn PeerApplier>) -> Self {
        Self { applier }
    }
}

#[async_trait]
impl EventHandler for PeerRemovedHandler {
    fn name(&self) -> &str {
        "peer-removed"
    }

    async fn handle(&self, envelope: &SignedEnvelope) -> Result<()> {
        let peer_id = parse_id_field(&envelope.payload, "peer_id")?;
        self.applier.remove_peer_by_id(&peer_id).await
    }
}

/// Wire shape for `relay_session_assigned`, mirroring `state::RelaySession`'s
/// field names so FetchState and the event path agree on one representation.
#[derive(Debug, Deserialize)]
struct RelaySessionAssignedPayload {
    session_id: String,
    peer_a: String,
    peer_b: String,
    expiry_unix: i64,
}

/// Handles `relay_session_assigned`.
pub struct RelaySessionAssignedHandler {
    relay: Arc<Relay>,
}

impl RelaySessionAssignedHandler {
    /// Construct a handler around the running relay.
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl EventHandler for RelaySessionAssignedHandler {
    fn name(&self) -> &str {
        "relay-session-assigned"
    }

    async fn handle(&self, envelope: &SignedEnvelope) -> Result<()> {
        let payload: RelaySessionAssignedPayload = parse_payload(envelope)?;
        let peer_a = payload
            .peer_a
            .parse()
            .map_err(|e| WgAgentError::Payload(format!("invalid peer_a endpoint: {}", e)))?;
        let peer_b = payload
            .peer_b
            .parse()
            .map_err(|e| WgAgentError::Payload(format!("invalid peer_b endpoint: {}", e)))?;
        let expiry = std::time::UNIX_EPOCH + Duration::from_secs(payload.expiry_unix.max(0) as u64);

        self.relay
            .add_session(RelaySessionAssignment {
                id: payload.session_id,
                peer_a,
                peer_b,
                expiry,
            })
            .await
    }
}

/// Handles `relay_session_revoked`: `{"session_id": string}`.
pub struct RelaySessionRevokedHandler {
    relay: Arc<Relay>,
}

impl RelaySessionRevokedHandler {
    /// Construct a handler around the running relay.
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl EventHandler for RelaySessionRevokedHandler {
    fn name(&self) -> &str {
        "relay-session-revoked"
    }

    async fn handle(&self, envelope: &SignedEnvelope) -> Result<()> {
        let session_id = parse_id_field(&envelope.payload, "session_id")?;
        self.relay.remove_session(&session_id).await;
        Ok(())
    }
}

/// Handles `site_to_site_tunnel_assigned`: the full `SiteToSiteTunnel`.
pub struct SiteToSiteTunnelAssignedHandler {
    manager: Arc<SiteToSiteManager>,
}

impl SiteToSiteTunnelAssignedHandler {
    /// Construct a handler around the running manager.
    pub fn new(manager: Arc<SiteToSiteManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl EventHandler for SiteToSiteTunnelAssignedHandler {
    fn name(&self) -> &str {
        "site-to-site-tunnel-assigned"
    }

    async fn handle(&self, envelope: &SignedEnvelope) -> Result<()> {
        let tunnel: SiteToSiteTunnel = parse_payload(envelope)?;
        self.manager.add_tunnel(&tunnel).await
    }
}

/// Handles `site_to_site_tunnel_revoked`: `{"tunnel_id": string}`.
pub struct SiteToSiteTunnelRevokedHandler {
    manager: Arc<SiteToSiteManager>,
}

impl SiteToSiteTunnelRevokedHandler {
    /// Construct a handler around the running manager.
    pub fn new(manager: Arc<SiteToSiteManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl EventHandler for SiteToSiteTunnelRevokedHandler {
    fn name(&self) -> &str {
        "site-to-site-tunnel-revoked"
    }

    async fn handle(&self, envelope: &SignedEnvelope) -> Result<()> {
        let tunnel_id = parse_id_field(&envelope.payload, "tunnel_id")?;
        self.manager.remove_tunnel(&tunnel_id).await
    }
}

/// Handles `user_access_peer_assigned`: the full `UserAccessPeer`.
pub struct UserAccessPeerAssignedHandler {
    manager: Arc<UserAccessManager>,
}

impl UserAccessPeerAssignedHandler {
    /// Construct a handler around the running manager.
    pub fn new(manager: Arc<UserAccessManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl EventHandler for UserAccessPeerAssignedHandler {
    fn name(&self) -> &str {
        "user-access-peer-assigned"
    }

    async fn handle(&self, envelope: &SignedEnvelope) -> Result<()> {
        let peer: UserAccessPeer = parse_payload(envelope)?;
        self.manager.add_peer(&peer).await
    }
}

/// Handles `user_access_peer_revoked`: `{"public_key": string}`.
pub struct UserAccessPeerRevokedHandler {
    manager: Arc<UserAccessManager>,
}

impl UserAccessPeerRevokedHandler {
    /// Construct a handler around the running manager.
    pub fn new(manager: Arc<UserAccessManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl EventHandler for UserAccessPeerRevokedHandler {
    fn name(&self) -> &str {
        "user-access-peer-revoked"
    }

    async fn handle(&self, envelope: &SignedEnvelope) -> Result<()> {
        let public_key = parse_id_field(&envelope.payload, "public_key")?;
        self.manager.remove_peer(&public_key).await
    }
}

/// Handles `ingress_rule_assigned`: the full `IngressRule`. The per-rule
/// dial timeout isn't carried on the wire (it's subsystem configuration,
/// not per-rule), so the handler is constructed with the configured
/// default.
pub struct IngressRuleAssignedHandler {
    manager: Arc<IngressManager>,
    dial_timeout: Duration,
}

impl IngressRuleAssignedHandler {
    /// Construct a handler around the running manager, applying
    /// `dial_timeout` to every assigned rule.
    pub fn new(manager: Arc<IngressManager>, dial_timeout: Duration) -> Self {
        Self { manager, dial_timeout }
    }
}

#[async_trait]
impl EventHandler for IngressRuleAssignedHandler {
    fn name(&self) -> &str {
        "ingress-rule-assigned"
    }

    async fn handle(&self, envelope: &SignedEnvelope) -> Result<()> {
        let rule: IngressRule = parse_payload(envelope)?;
        let spec = IngressRuleSpec {
            id: rule.id,
            listen_port: rule.listen_port,
            target: rule.target,
            terminate_tls: rule.mode == "terminate",
            tls_cert_pem: rule.tls_cert_pem,
            tls_key_pem: rule.tls_key_pem,
            dial_timeout: self.dial_timeout,
        };
        self.manager.add_rule(spec).await.map(|_| ())
    }
}

/// Handles `ingress_rule_revoked`: `{"rule_id": string}`.
pub struct IngressRuleRevokedHandler {
    manager: Arc<IngressManager>,
}

impl IngressRuleRevokedHandler {
    /// Construct a handler around the running manager.
    pub fn new(manager: Arc<IngressManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl EventHandler for IngressRuleRevokedHandler {
    fn name(&self) -> &str {
        "ingress-rule-revoked"
    }

    async fn handle(&self, envelope: &SignedEnvelope) -> Result<()> {
        let rule_id = parse_id_field(&envelope.payload, "rule_id")?;
        self.manager.remove_rule(&rule_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::state::Peer;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingApplier {
        added: StdMutex<Vec<String>>,
        removed: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerApplier for RecordingApplier {
        async fn add_peer(&self, peer: &Peer) -> Result<()> {
            self.added.lock().unwrap().push(peer.id.clone());
            Ok(())
        }
        async fn remove_peer_by_id(&self, peer_id: &str) -> Result<()> {
            self.removed.lock().unwrap().push(peer_id.to_string());
            Ok(())
        }
    }

    fn envelope(event_type: EventType, payload: serde_json::Value) -> SignedEnvelope {
        SignedEnvelope {
            event_type,
            event_id: "evt-1".to_string(),
            payload,
            signature: vec![],
        }
    }

    #[tokio::test]
    async fn peer_upsert_handler_applies_full_peer() {
        let applier = Arc::new(RecordingApplier::default());
        let handler = PeerUpsertHandler::new(applier.clone());

        let payload = serde_json::json!({
            "id": "peer-a",
            "public_key": "AAAA",
            "mesh_ip": "10.0.0.2",
            "endpoint": "",
            "allowed_ips": [],
        });
        handler
            .handle(&envelope(EventType::PeerAdded, payload))
            .await
            .unwrap();

        assert_eq!(applier.added.lock().unwrap().as_slice(), ["peer-a".to_string()]);
    }

    #[tokio::test]
    async fn peer_upsert_handler_rejects_malformed_payload() {
        let applier = Arc::new(RecordingApplier::default());
        let handler = PeerUpsertHandler::new(applier.clone());

        let result = handler
            .handle(&envelope(EventType::PeerAdded, serde_json::json!({"nonsense": true})))
            .await;
        assert!(result.is_err());
        assert!(applier.added.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn peer_removed_handler_parses_peer_id() {
        let applier = Arc::new(RecordingApplier::default());
        let handler = PeerRemovedHandler::new(applier.clone());

        handler
            .handle(&envelope(EventType::PeerRemoved, serde_json::json!({"peer_id": "peer-b"})))
            .await
            .unwrap();

        assert_eq!(applier.removed.lock().unwrap().as_slice(), ["peer-b".to_string()]);
    }

    #[tokio::test]
    async fn relay_session_assigned_handler_parses_endpoints() {
        let relay = Arc::new(Relay::new(4, Duration::from_secs(300)));
        relay.start(0).await.unwrap();
        let handler = RelaySessionAssignedHandler::new(relay.clone());

        let payload = serde_json::json!({
            "session_id": "s1",
            "peer_a": "127.0.0.1:4000",
            "peer_b": "127.0.0.1:4001",
            "expiry_unix": 4_102_444_800i64,
        });
        handler
            .handle(&envelope(EventType::RelaySessionAssigned, payload))
            .await
            .unwrap();

        assert_eq!(relay.session_count().await, 1);
    }

    #[tokio::test]
    async fn relay_session_revoked_handler_removes_session() {
        let relay = Arc::new(Relay::new(4, Duration::from_secs(300)));
        relay.start(0).await.unwrap();
        relay
            .add_session(RelaySessionAssignment {
                id: "s1".to_string(),
                peer_a: "127.0.0.1:4000".parse().unwrap(),
                peer_b: "127.0.0.1:4001".parse().unwrap(),
                expiry: std::time::SystemTime::now() + Duration::from_secs(300),
            })
            .await
            .unwrap();

        let handler = RelaySessionRevokedHandler::new(relay.clone());
        handler
            .handle(&envelope(EventType::RelaySessionRevoked, serde_json::json!({"session_id": "s1"})))
            .await
            .unwrap();

        assert_eq!(relay.session_count().await, 0);
    }
}
