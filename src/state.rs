//! Desired-state data model
//!
//! Core entities shared by the reconciler and every subsystem manager: the
//! document the control plane hands down (`StateResponse`), and the diff the
//! reconciler computes between two successive snapshots.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A mesh participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Globally unique peer identifier (opaque string).
    pub id: String,
    /// Base64-encoded WireGuard public key (32 bytes decoded).
    pub public_key: String,
    /// Single IPv4 mesh address.
    pub mesh_ip: String,
    /// Public endpoint "host:port", or empty if unknown (behind NAT, relayed).
    #[serde(default)]
    pub endpoint: String,
    /// Allowed-IP CIDRs advertised for this peer.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Optional base64-encoded pre-shared key.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub preshared_key: Option<String>,
}

/// A single rule within a named `Policy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Source peer ID, or "*" for any.
    pub src: String,
    /// Destination peer ID, or "*" for any.
    pub dst: String,
    /// Port, 0 = any.
    #[serde(default)]
    pub port: u16,
    /// Protocol: "tcp", "udp", or "" for any.
    #[serde(default)]
    pub protocol: String,
    /// "allow" or "deny".
    pub action: String,
}

/// A named, ordered collection of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Policy identifier.
    pub id: String,
    /// Ordered rules.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// The compiled, IP-concrete form of a `PolicyRule` for a specific node and
/// interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Interface the rule applies to.
    pub interface: String,
    /// Source CIDR.
    pub src_cidr: String,
    /// Destination CIDR.
    pub dst_cidr: String,
    /// Port, 0 = any.
    pub port: u16,
    /// Protocol: "tcp", "udp", or "" for any.
    pub protocol: String,
    /// "allow" or "deny".
    pub action: String,
}

impl FirewallRule {
    /// The mandatory trailing default-deny rule every chain install ends with.
    pub fn default_deny() -> Self {
        Self {
            interface: String::new(),
            src_cidr: "0.0.0.0/0".to_string(),
            dst_cidr: "0.0.0.0/0".to_string(),
            port: 0,
            protocol: String::new(),
            action: "deny".to_string(),
        }
    }
}

/// Access-side routing/NAT configuration for the bridge role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Whether the bridge role is enabled at all.
    #[serde(default)]
    pub enabled: bool,
    /// Access-side interface name that routes are installed against.
    #[serde(default)]
    pub access_interface: String,
    /// Access-side CIDRs to route onto the mesh.
    #[serde(default)]
    pub access_subnets: Vec<String>,
    /// Whether to install NAT masquerade. `None` defaults to enabled.
    #[serde(default)]
    pub nat: Option<bool>,
}

/// A single relay session between two peers that can't connect directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySession {
    /// Session identifier, unique within a relay.
    pub id: String,
    /// Peer A's UDP endpoint "ip:port".
    pub peer_a: String,
    /// Peer B's UDP endpoint "ip:port".
    pub peer_b: String,
    /// Absolute expiry, seconds since the Unix epoch.
    pub expiry_unix: i64,
}

/// Relay subsystem configuration and the sessions it should hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Whether the relay subsystem is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Configured sessions.
    #[serde(default)]
    pub sessions: Vec<RelaySession>,
}

/// A WireGuard tunnel to an external network, installed alongside the mesh
/// tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteToSiteTunnel {
    /// Tunnel identifier.
    pub id: String,
    /// Caller-supplied interface name.
    pub interface: String,
    /// Local listen port.
    pub listen_port: u16,
    /// Remote endpoint "host:port".
    pub remote_endpoint: String,
    /// Remote base64-encoded public key.
    pub remote_public_key: String,
    /// Optional base64-encoded pre-shared key.
    #[serde(default)]
    pub preshared_key: Option<String>,
    /// Remote subnets reachable through this tunnel.
    #[serde(default)]
    pub remote_subnets: Vec<String>,
    /// Local subnets advertised to the remote side.
    #[serde(default)]
    pub local_subnets: Vec<String>,
}

/// Site-to-site subsystem configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteToSiteConfig {
    /// Whether the site-to-site subsystem is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Configured tunnels.
    #[serde(default)]
    pub tunnels: Vec<SiteToSiteTunnel>,
}

/// A single TCP ingress rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressRule {
    /// Rule identifier.
    pub id: String,
    /// Listen port (0 = ephemeral).
    pub listen_port: u16,
    /// Target "host:port" to proxy into.
    pub target: String,
    /// "tcp" (plain passthrough) or "terminate" (TLS termination).
    pub mode: String,
    /// PEM-encoded certificate, required when mode = "terminate".
    #[serde(default)]
    pub tls_cert_pem: Option<String>,
    /// PEM-encoded private key, required when mode = "terminate".
    #[serde(default)]
    pub tls_key_pem: Option<String>,
}

/// Ingress subsystem configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Whether the ingress subsystem is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Configured rules.
    #[serde(default)]
    pub rules: Vec<IngressRule>,
}

/// An external client device peer served by the user-access interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccessPeer {
    /// Base64-encoded public key.
    pub public_key: String,
    /// Allowed-IP CIDRs for this client.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Optional base64-encoded pre-shared key.
    #[serde(default)]
    pub preshared_key: Option<String>,
    /// Human-readable label.
    #[serde(default)]
    pub label: String,
}

/// User-access subsystem configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserAccessConfig {
    /// Whether the user-access subsystem is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Shared interface name.
    #[serde(default)]
    pub interface: String,
    /// Configured client peers.
    #[serde(default)]
    pub peers: Vec<UserAccessPeer>,
}

/// The top-level desired-state document returned by `StateFetcher::fetch_state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateResponse {
    /// Mesh peers.
    #[serde(default)]
    pub peers: Vec<Peer>,
    /// Policies.
    #[serde(default)]
    pub policies: Vec<Policy>,
    /// Bridge configuration.
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Relay configuration.
    #[serde(default)]
    pub relay: RelayConfig,
    /// Site-to-site configuration.
    #[serde(default)]
    pub site_to_site: SiteToSiteConfig,
    /// User-access configuration.
    #[serde(default)]
    pub user_access: UserAccessConfig,
    /// Ingress configuration.
    #[serde(default)]
    pub ingress: IngressConfig,
    /// Opaque metadata used to detect "something structurally-undiffed changed".
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// The output of diffing two `StateResponse`s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDiff {
    /// Peers present in `current` but absent in `previous`.
    pub peers_to_add: Vec<Peer>,
    /// Peers present in both with at least one field differing.
    pub peers_to_update: Vec<Peer>,
    /// Peer IDs present in `previous` but absent in `current`.
    pub peers_to_remove: Vec<String>,
    /// Policies new, or whose rules differ from `previous`.
    pub policies_to_add: Vec<Policy>,
    /// Policy IDs absent from `current`.
    pub policies_to_remove: Vec<String>,
    /// Whether `previous.metadata != current.metadata`.
    pub metadata_changed: bool,
}

impl StateDiff {
    /// True if nothing changed at all (reconciler's coarse notion of "empty").
    pub fn is_empty(&self) -> bool {
        self.peers_to_add.is_empty()
            && self.peers_to_update.is_empty()
            && self.peers_to_remove.is_empty()
            && self.policies_to_add.is_empty()
            && self.policies_to_remove.is_empty()
            && !self.metadata_changed
    }
}

/// Compute the diff between two desired-state snapshots.
///
/// Sub-schemas (bridge, relay, ingress, site-to-site, user-access) are
/// deliberately not diffed here — see SPEC_FULL.md §4.1.1 and the resolved
/// Open Question 1 in DESIGN.md. Their handlers self-diff against their own
/// tracked state on every cycle.
pub fn diff(previous: &StateResponse, current: &StateResponse) -> StateDiff {
    let mut out = StateDiff::default();

    let prev_peers: HashMap<&str, &Peer> =
        previous.peers.iter().map(|p| (p.id.as_str(), p)).collect();
    let curr_peers: HashMap<&str, &Peer> =
        current.peers.iter().map(|p| (p.id.as_str(), p)).collect();

    for peer in &current.peers {
        match prev_peers.get(peer.id.as_str()) {
            None => out.peers_to_add.push(peer.clone()),
            Some(prev) if *prev != peer => out.peers_to_update.push(peer.clone()),
            Some(_) => {}
        }
    }
    for peer in &previous.peers {
        if !curr_peers.contains_key(peer.id.as_str()) {
            out.peers_to_remove.push(peer.id.clone());
        }
    }

    let prev_policies: HashMap<&str, &Policy> = previous
        .policies
        .iter()
        .map(|p| (p.id.as_str(), p))
        .collect();
    let curr_policies: HashMap<&str, &Policy> = current
        .policies
        .iter()
        .map(|p| (p.id.as_str(), p))
        .collect();

    for policy in &current.policies {
        match prev_policies.get(policy.id.as_str()) {
            None => out.policies_to_add.push(policy.clone()),
            Some(prev) if prev.rules != policy.rules => out.policies_to_add.push(policy.clone()),
            Some(_) => {}
        }
    }
    for policy in &previous.policies {
        if !curr_policies.contains_key(policy.id.as_str()) {
            out.policies_to_remove.push(policy.id.clone());
        }
    }

    out.metadata_changed = previous.metadata != current.metadata;

    out
}

/// A drift report handed to `StateFetcher::report_drift` after a cycle in
/// which a handler applied a correction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriftReport {
    /// Free-form per-subsystem correction summaries, keyed by subsystem name.
    pub corrections: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, ip: &str) -> Peer {
        Peer {
            id: id.to_string(),
            public_key: "AAA".to_string(),
            mesh_ip: ip.to_string(),
            endpoint: String::new(),
            allowed_ips: vec![],
            preshared_key: None,
        }
    }

    #[test]
    fn diff_detects_add_update_remove() {
        let previous = StateResponse {
            peers: vec![peer("peer-a", "10.0.0.1"), peer("peer-b", "10.0.0.2")],
            ..Default::default()
        };
        let current = StateResponse {
            peers: vec![peer("peer-b", "10.0.0.99"), peer("peer-c", "10.0.0.3")],
            ..Default::default()
        };

        let d = diff(&previous, &current);
        assert_eq!(d.peers_to_add.len(), 1);
        assert_eq!(d.peers_to_add[0].id, "peer-c");
        assert_eq!(d.peers_to_update.len(), 1);
        assert_eq!(d.peers_to_update[0].id, "peer-b");
        assert_eq!(d.peers_to_remove, vec!["peer-a".to_string()]);
        assert!(!d.metadata_changed);
    }

    #[test]
    fn diff_empty_for_identical_states() {
        let state = StateResponse {
            peers: vec![peer("peer-a", "10.0.0.1")],
            ..Default::default()
        };
        let d = diff(&state, &state.clone());
        assert!(d.is_empty());
    }

    #[test]
    fn policy_rule_change_is_remove_plus_add() {
        let previous = StateResponse {
            policies: vec![Policy {
                id: "p1".to_string(),
                rules: vec![PolicyRule {
                    src: "node-a".to_string(),
                    dst: "peer-b".to_string(),
                    port: 0,
                    protocol: String::new(),
                    action: "allow".to_string(),
                }],
            }],
            ..Default::default()
        };
        let mut current = previous.clone();
        current.policies[0].rules[0].dst = "peer-x".to_string();

        let d = diff(&previous, &current);
        assert_eq!(d.policies_to_add.len(), 1);
        assert!(d.policies_to_remove.is_empty());
    }

    #[test]
    fn metadata_change_detected() {
        let previous = StateResponse::default();
        let mut current = StateResponse::default();
        current.metadata.insert("rev".to_string(), "2".to_string());
        assert!(diff(&previous, &current).metadata_changed);
    }
}
