//! Policy engine and enforcer
//!
//! Filters peer visibility and compiles firewall rules, deny-by-default
//! (SPEC_FULL.md §4.4).

use crate::error::{AggregateError, Result, WgAgentError};
use crate::reconcile::ReconcileHandler;
use crate::state::{FirewallRule, Peer, Policy, StateDiff, StateResponse};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::process::Command;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Driver seam for the local firewall. Linux implementation shells `nft`.
pub trait FirewallController: Send + Sync {
    /// Create the chain if absent. Idempotent.
    fn ensure_chain(&self, name: &str) -> Result<()>;
    /// Atomically replace the chain's rule set.
    fn apply_rules(&self, chain: &str, rules: &[FirewallRule]) -> Result<()>;
    /// Remove every rule from the chain. Idempotent.
    fn flush_chain(&self, name: &str) -> Result<()>;
    /// Delete the chain. Idempotent.
    fn delete_chain(&self, name: &str) -> Result<()>;
}

/// Linux `nft` driven controller. Rules are applied as a single `nft -f`
/// script per `apply_rules` call so a chain's rule set replaces atomically.
pub struct LinuxFirewallController {
    table: String,
}

impl LinuxFirewallController {
    /// Construct a controller operating on the given `nft` table (created
    /// lazily by `ensure_chain`).
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into() }
    }

    fn run_nft(&self, script: &str) -> Result<()> {
        debug!("policy driver: nft -f <script>\n{}", script);
        let mut child = Command::new("nft")
            .args(["-f", "-"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| WgAgentError::Driver(format!("failed to spawn nft: {}", e)))?;

        {
            use std::io::Write;
            let stdin = child
                .stdin
                .as_mut()
                .ok_or_else(|| WgAgentError::Driver("nft stdin unavailable".to_string()))?;
            stdin
                .write_all(script.as_bytes())
                .map_err(|e| WgAgentError::Driver(format!("failed to write nft script: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| WgAgentError::Driver(format!("failed to wait for nft: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WgAgentError::Driver(format!("nft script failed: {}", stderr)));
        }
        Ok(())
    }

    fn rule_to_nft(&self, chain: &str, rule: &FirewallRule) -> String {
        let mut parts = vec![format!("add rule inet {} {}", self.table, chain)];
        if !rule.interface.is_empty() {
            parts.push(format!("iifname \"{}\"", rule.interface));
        }
        parts.push(format!("ip saddr {}", rule.src_cidr));
        parts.push(format!("ip daddr {}", rule.dst_cidr));
        if !rule.protocol.is_empty() && rule.port != 0 {
            parts.push(format!("{} dport {}", rule.protocol, rule.port));
        }
        parts.push(if rule.action == "allow" { "accept".to_string() } else { "drop".to_string() });
        parts.join(" ")
    }
}

impl FirewallController for LinuxFirewallController {
    fn ensure_chain(&self, name: &str) -> Result<()> {
        let script = format!(
            "add table inet {table}\n\
             add chain inet {table} {chain} {{ type filter hook forward priority 0; policy drop; }}\n",
            table = self.table,
            chain = name,
        );
        self.run_nft(&script)
    }

    fn apply_rules(&self, chain: &str, rules: &[FirewallRule]) -> Result<()> {
        let mut script = format!("flush chain inet {} {}\n", self.table, chain);
        for rule in rules {
            script.push_str(&self.rule_to_nft(chain, rule));
            script.push('\n');
        }
        self.run_nft(&script)
    }

    fn flush_chain(&self, name: &str) -> Result<()> {
        self.run_nft(&format!("flush chain inet {} {}\n", self.table, name))
    }

    fn delete_chain(&self, name: &str) -> Result<()> {
        self.run_nft(&format!(
            "flush chain inet {table} {chain}\ndelete chain inet {table} {chain}\n",
            table = self.table,
            chain = name,
        ))
    }
}

/// Pure filtering/compilation logic, free of any driver or I/O concern.
pub struct PolicyEngine;

impl PolicyEngine {
    /// Deny-by-default peer visibility filter (SPEC_FULL.md §4.4 Filter).
    ///
    /// A peer is included iff at least one `allow` rule in any policy
    /// matches either direction between the local node and that peer. The
    /// local node itself is always excluded.
    pub fn filter_peers(peers: &[Peer], policies: &[Policy], local_node_id: &str) -> Vec<Peer> {
        if policies.is_empty() {
            return Vec::new();
        }

        peers
            .iter()
            .filter(|peer| peer.id != local_node_id)
            .filter(|peer| {
                policies.iter().any(|policy| {
                    policy.rules.iter().any(|rule| {
                        rule.action == "allow"
                            && ((matches(&rule.src, local_node_id) && matches(&rule.dst, &peer.id))
                                || (matches(&rule.src, &peer.id) && matches(&rule.dst, local_node_id)))
                    })
                })
            })
            .cloned()
            .collect()
    }

    /// Compile policy rules into concrete `FirewallRule`s for `local_node_id`,
    /// resolving peer IDs to mesh IPs via `ip_of` (SPEC_FULL.md §4.4
    /// FirewallRule compilation). Always ends with the trailing default-deny.
    pub fn compile_firewall_rules(
        policies: &[Policy],
        local_node_id: &str,
        ip_of: &HashMap<String, String>,
    ) -> Vec<FirewallRule> {
        let mut rules = Vec::new();

        for policy in policies {
            for rule in &policy.rules {
                if !matches!(rule.protocol.as_str(), "" | "tcp" | "udp") {
                    warn!(
                        "policy engine: skipping rule with unsupported protocol '{}'",
                        rule.protocol
                    );
                    continue;
                }
                if !(matches(&rule.src, local_node_id) || matches(&rule.dst, local_node_id)) {
                    continue;
                }

                let (Some(src_cidr), Some(dst_cidr)) =
                    (resolve(&rule.src, local_node_id, ip_of), resolve(&rule.dst, local_node_id, ip_of))
                else {
                    debug!(
                        "policy engine: skipping rule with unresolvable endpoint: {:?}",
                        rule
                    );
                    continue;
                };

                rules.push(FirewallRule {
                    interface: String::new(),
                    src_cidr,
                    dst_cidr,
                    port: rule.port,
                    protocol: rule.protocol.clone(),
                    action: rule.action.clone(),
                });
            }
        }

        rules.push(FirewallRule::default_deny());
        rules
    }
}

fn matches(rule_side: &str, id: &str) -> bool {
    rule_side == "*" || rule_side == id
}

fn resolve(rule_side: &str, local_node_id: &str, ip_of: &HashMap<String, String>) -> Option<String> {
    if rule_side == "*" {
        return Some("0.0.0.0/0".to_string());
    }
    if rule_side == local_node_id {
        return ip_of.get(local_node_id).cloned();
    }
    ip_of.get(rule_side).cloned()
}

/// Driver-backed enforcer tracking the currently-allowed peer set across
/// invocations, so the reconcile handler can compute add/remove deltas.
pub struct Enforcer {
    controller: Arc<dyn FirewallController>,
    chain_name: String,
    interface: String,
    local_node_id: String,
    enabled: bool,
    allowed_peers: Mutex<HashSet<String>>,
    last_applied_rules: std::sync::Mutex<Vec<FirewallRule>>,
}

/// Callback seam into the WireGuard manager used to add/remove peers as
/// policy visibility changes. Kept as a trait rather than a direct
/// dependency on `wireguard::WireGuardManager` so the enforcer can be tested
/// in isolation.
#[async_trait]
pub trait PeerApplier: Send + Sync {
    /// Add (or update) a peer on the mesh interface.
    async fn add_peer(&self, peer: &Peer) -> Result<()>;
    /// Remove a peer from the mesh interface by ID.
    async fn remove_peer_by_id(&self, peer_id: &str) -> Result<()>;
}

impl Enforcer {
    /// Construct an enforcer for `interface`, `chain_name` reconciling
    /// against `local_node_id`. `enabled=false` makes `filter_peers` a
    /// passthrough and `apply_firewall_rules`/`teardown` no-ops.
    pub fn new(
        controller: Arc<dyn FirewallController>,
        chain_name: impl Into<String>,
        interface: impl Into<String>,
        local_node_id: impl Into<String>,
        enabled: bool,
    ) -> Self {
        Self {
            controller,
            chain_name: chain_name.into(),
            interface: interface.into(),
            local_node_id: local_node_id.into(),
            enabled,
            allowed_peers: Mutex::new(HashSet::new()),
            last_applied_rules: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the peer IDs currently allowed through, for read-only
    /// introspection.
    pub async fn allowed_peer_ids(&self) -> Vec<String> {
        self.allowed_peers.lock().await.iter().cloned().collect()
    }

    /// Snapshot of the firewall rules last applied to the chain, for
    /// read-only introspection.
    pub fn current_rules(&self) -> Vec<FirewallRule> {
        self.last_applied_rules.lock().expect("lock poisoned").clone()
    }

    /// Delegates to `PolicyEngine::filter_peers` when enabled; passes
    /// through unfiltered when disabled.
    pub fn filter_peers(&self, peers: &[Peer], policies: &[Policy]) -> Vec<Peer> {
        if !self.enabled {
            return peers.to_vec();
        }
        PolicyEngine::filter_peers(peers, policies, &self.local_node_id)
    }

    /// Ensure the chain exists, then atomically apply the compiled rules.
    /// No-op when disabled.
    pub fn apply_firewall_rules(&self, rules: &[FirewallRule]) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.controller.ensure_chain(&self.chain_name)?;
        let scoped: Vec<FirewallRule> = rules
            .iter()
            .cloned()
            .map(|mut r| {
                if r.interface.is_empty() {
                    r.interface = self.interface.clone();
                }
                r
            })
            .collect();
        self.controller.apply_rules(&self.chain_name, &scoped)?;
        *self.last_applied_rules.lock().expect("lock poisoned") = scoped;
        Ok(())
    }

    /// Flush then delete the chain. Idempotent.
    pub fn teardown(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.controller.flush_chain(&self.chain_name)?;
        self.controller.delete_chain(&self.chain_name)?;
        self.last_applied_rules.lock().expect("lock poisoned").clear();
        Ok(())
    }

    /// Run the full reconcile sequence described in SPEC_FULL.md §4.4
    /// Enforcer: filter, compile, apply, then diff the allowed set against
    /// the tracked one and push the peer deltas through `applier`.
    pub async fn reconcile_with(
        &self,
        desired: &StateResponse,
        applier: &dyn PeerApplier,
    ) -> Result<usize> {
        let allowed = self.filter_peers(&desired.peers, &desired.policies);

        let mut ip_of: HashMap<String, String> = allowed
            .iter()
            .map(|p| (p.id.clone(), format!("{}/32", p.mesh_ip)))
            .collect();
        if let Some(local) = desired.peers.iter().find(|p| p.id == self.local_node_id) {
            ip_of.insert(local.id.clone(), format!("{}/32", local.mesh_ip));
        }

        let compiled = PolicyEngine::compile_firewall_rules(&desired.policies, &self.local_node_id, &ip_of);

        let mut aggregate = AggregateError::new();
        if let Err(e) = self.apply_firewall_rules(&compiled) {
            aggregate.push(e);
        }

        let new_allowed: HashSet<String> = allowed.iter().map(|p| p.id.clone()).collect();
        let mut tracked = self.allowed_peers.lock().await;

        let to_remove: Vec<String> = tracked.difference(&new_allowed).cloned().collect();
        let to_add: Vec<Peer> = allowed
            .iter()
            .filter(|p| !tracked.contains(&p.id))
            .cloned()
            .collect();

        let mut changed = 0usize;
        for peer_id in &to_remove {
            match applier.remove_peer_by_id(peer_id).await {
                Ok(()) => changed += 1,
                Err(e) => aggregate.push(e),
            }
        }
        for peer in &to_add {
            match applier.add_peer(peer).await {
                Ok(()) => changed += 1,
                Err(e) => aggregate.push(e),
            }
        }

        *tracked = new_allowed;
        drop(tracked);

        aggregate.into_result()?;
        Ok(changed)
    }
}

/// Wraps an `Enforcer` plus a `PeerApplier` as a `ReconcileHandler`, running
/// only when the diff reports peer or policy changes (SPEC_FULL.md §4.4).
pub struct PolicyReconcileHandler {
    enforcer: Arc<Enforcer>,
    applier: Arc<dyn PeerApplier>,
}

impl PolicyReconcileHandler {
    /// Construct a handler pairing an enforcer with its peer applier. The
    /// `Arc<Enforcer>` is shared with the control API for read-only
    /// introspection of the currently-allowed peer set and applied rules.
    pub fn new(enforcer: Arc<Enforcer>, applier: Arc<dyn PeerApplier>) -> Self {
        Self { enforcer, applier }
    }
}

#[async_trait]
impl ReconcileHandler for PolicyReconcileHandler {
    fn name(&self) -> &str {
        "policy"
    }

    async fn reconcile(&self, desired: &StateResponse, diff: &StateDiff) -> Result<Option<String>> {
        let policy_or_peer_changed = !diff.peers_to_add.is_empty()
            || !diff.peers_to_update.is_empty()
            || !diff.peers_to_remove.is_empty()
            || !diff.policies_to_add.is_empty()
            || !diff.policies_to_remove.is_empty();

        if !policy_or_peer_changed {
            return Ok(None);
        }

        let changed = self.enforcer.reconcile_with(desired, self.applier.as_ref()).await?;
        if changed == 0 {
            Ok(None)
        } else {
            Ok(Some(format!("{} peer visibility change(s) applied", changed)))
        }
    }
}
