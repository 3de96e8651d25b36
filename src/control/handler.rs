//! Command handler for the control API
//!
//! Dispatches `ApiRequest`s against the live reconciled-state handles shared
//! by `main` — no tunnel lifecycle to manage, just read access.

use crate::control::{ApiRequest, ApiResponse, ControlAction};
use crate::ingress::IngressManager;
use crate::policy::Enforcer;
use crate::relay::Relay;
use crate::wireguard::PeerIndex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Read-only handles into the running node's subsystems, shared between the
/// reconciler's handlers and the control API.
pub struct NodeHandles {
    /// Mesh interface name.
    pub interface: String,
    /// Mesh peer index, shared with `WireGuardManager`.
    pub peer_index: Arc<PeerIndex>,
    /// Policy enforcer, shared with `PolicyReconcileHandler`.
    pub enforcer: Arc<Enforcer>,
    /// UDP relay, if enabled.
    pub relay: Option<Arc<Relay>>,
    /// TCP ingress manager, if enabled.
    pub ingress: Option<Arc<IngressManager>>,
}

/// Command handler executes read-only `ApiRequest`s against `NodeHandles`.
pub struct CommandHandler {
    handles: NodeHandles,
    started_at: Instant,
}

impl CommandHandler {
    /// Construct a handler over the given node handles.
    pub fn new(handles: NodeHandles) -> Self {
        Self {
            handles,
            started_at: Instant::now(),
        }
    }

    /// Handle a single API request, converting any internal error to an
    /// `ApiResponse::error`.
    pub async fn handle_request(&self, request: ApiRequest) -> ApiResponse {
        debug!("control: handling request {}: {:?}", request.id, request.action);

        let data = match request.action {
            ControlAction::Status => self.handle_status().await,
            ControlAction::ListPeers => self.handle_list_peers().await,
            ControlAction::ListSessions => self.handle_list_sessions().await,
            ControlAction::ListIngressRules => self.handle_list_ingress_rules().await,
            ControlAction::ListFirewallRules => self.handle_list_firewall_rules().await,
        };

        info!("control: request {} ({:?}) completed", request.id, request.action);
        ApiResponse::success(request.id, Some(data))
    }

    async fn handle_status(&self) -> serde_json::Value {
        serde_json::json!({
            "interface": self.handles.interface,
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "peer_count": self.handles.peer_index.len().await,
            "relay_enabled": self.handles.relay.is_some(),
            "ingress_enabled": self.handles.ingress.is_some(),
        })
    }

    async fn handle_list_peers(&self) -> serde_json::Value {
        let peer_ids = self.handles.peer_index.peer_ids().await;
        let allowed = self.handles.enforcer.allowed_peer_ids().await;
        serde_json::json!({
            "peer_ids": peer_ids,
            "allowed_peer_ids": allowed,
        })
    }

    async fn handle_list_sessions(&self) -> serde_json::Value {
        match &self.handles.relay {
            Some(relay) => serde_json::json!({ "session_ids": relay.session_ids().await }),
            None => serde_json::json!({ "session_ids": Vec::<String>::new() }),
        }
    }

    async fn handle_list_ingress_rules(&self) -> serde_json::Value {
        match &self.handles.ingress {
            Some(ingress) => serde_json::json!({ "rule_ids": ingress.rule_ids().await }),
            None => serde_json::json!({ "rule_ids": Vec::<String>::new() }),
        }
    }

    async fn handle_list_firewall_rules(&self) -> serde_json::Value {
        serde_json::json!({ "rules": self.handles.enforcer.current_rules() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Enforcer, FirewallController};
    use crate::error::Result;
    use crate::state::FirewallRule;

    struct NoopController;
    impl FirewallController for NoopController {
        fn ensure_chain(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        fn apply_rules(&self, _chain: &str, _rules: &[FirewallRule]) -> Result<()> {
            Ok(())
        }
        fn flush_chain(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        fn delete_chain(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn handles() -> NodeHandles {
        NodeHandles {
            interface: "wg-mesh0".to_string(),
            peer_index: Arc::new(PeerIndex::new()),
            enforcer: Arc::new(Enforcer::new(
                Arc::new(NoopController),
                "meshnode-agent",
                "wg-mesh0",
                "node-a",
                true,
            )),
            relay: None,
            ingress: None,
        }
    }

    #[tokio::test]
    async fn status_reports_interface_and_peer_count() {
        let handler = CommandHandler::new(handles());
        handler.handles.peer_index.insert("peer-1", "a-key").await;

        let response = handler
            .handle_request(ApiRequest::new("t1".to_string(), ControlAction::Status))
            .await;

        assert!(response.success);
        let data = response.data.unwrap();
        assert_eq!(data["interface"], "wg-mesh0");
        assert_eq!(data["peer_count"], 1);
    }

    #[tokio::test]
    async fn list_sessions_empty_when_relay_disabled() {
        let handler = CommandHandler::new(handles());
        let response = handler
            .handle_request(ApiRequest::new("t1".to_string(), ControlAction::ListSessions))
            .await;

        assert!(response.success);
        assert_eq!(response.data.unwrap()["session_ids"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn list_firewall_rules_reflects_enforcer_state() {
        let handler = CommandHandler::new(handles());
        let response = handler
            .handle_request(ApiRequest::new("t1".to_string(), ControlAction::ListFirewallRules))
            .await;

        assert!(response.success);
        assert_eq!(response.data.unwrap()["rules"], serde_json::json!([]));
    }
}
