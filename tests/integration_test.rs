//! Integration tests for meshnode-agent
//!
//! Exercises the reconciler, WireGuard manager, and policy enforcer wired
//! together against mock drivers, the way `main` wires the real ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use meshnode_agent::config::{validate_interface_name, validate_mtu};
use meshnode_agent::error::Result;
use meshnode_agent::policy::{Enforcer, FirewallController, PeerApplier, PolicyReconcileHandler};
use meshnode_agent::reconcile::{Reconciler, StateFetcher};
use meshnode_agent::state::{DriftReport, FirewallRule, Peer, Policy, PolicyRule, StateResponse};
use meshnode_agent::wireguard::driver::{PeerConfig, WgController};
use meshnode_agent::wireguard::{WireGuardManager, WireGuardSettings};

fn peer(id: &str, ip: &str) -> Peer {
    Peer {
        id: id.to_string(),
        public_key: format!("{}-key", id),
        mesh_ip: ip.to_string(),
        endpoint: String::new(),
        allowed_ips: vec![],
        preshared_key: None,
    }
}

fn allow_rule(src: &str, dst: &str) -> PolicyRule {
    PolicyRule {
        src: src.to_string(),
        dst: dst.to_string(),
        port: 0,
        protocol: String::new(),
        action: "allow".to_string(),
    }
}

/// In-memory `WgController` recording every upsert/removal, standing in for
/// the real `LinuxWgController` so the manager can be exercised without a
/// kernel WireGuard interface.
#[derive(Default)]
struct MockWgController {
    upserted: std::sync::Mutex<Vec<PeerConfig>>,
    removed: std::sync::Mutex<Vec<String>>,
}

impl WgController for MockWgController {
    fn setup_interface(&self, _name: &str, _private_key: &str, _listen_port: u16) -> Result<()> {
        Ok(())
    }
    fn teardown_interface(&self, _name: &str) -> Result<()> {
        Ok(())
    }
    fn set_address(&self, _name: &str, _mesh_ip: &str) -> Result<()> {
        Ok(())
    }
    fn set_mtu(&self, _name: &str, _mtu: u16) -> Result<()> {
        Ok(())
    }
    fn upsert_peer(&self, _interface: &str, peer: &PeerConfig) -> Result<()> {
        self.upserted.lock().unwrap().push(peer.clone());
        Ok(())
    }
    fn remove_peer(&self, _interface: &str, public_key: &str) -> Result<()> {
        self.removed.lock().unwrap().push(public_key.to_string());
        Ok(())
    }
}

/// In-memory `FirewallController` recording each atomic rule-set application.
#[derive(Default)]
struct MockFirewallController {
    applies: std::sync::Mutex<Vec<Vec<FirewallRule>>>,
}

impl FirewallController for MockFirewallController {
    fn ensure_chain(&self, _name: &str) -> Result<()> {
        Ok(())
    }
    fn apply_rules(&self, _chain: &str, rules: &[FirewallRule]) -> Result<()> {
        self.applies.lock().unwrap().push(rules.to_vec());
        Ok(())
    }
    fn flush_chain(&self, _name: &str) -> Result<()> {
        Ok(())
    }
    fn delete_chain(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// A `StateFetcher` serving a fixed sequence of `StateResponse`s, one per
/// call, repeating the last once exhausted. Drift reports are recorded.
struct ScriptedFetcher {
    states: AsyncMutex<Vec<StateResponse>>,
    fetch_count: AtomicUsize,
    drift_reports: AsyncMutex<Vec<DriftReport>>,
}

impl ScriptedFetcher {
    fn new(states: Vec<StateResponse>) -> Self {
        Self {
            states: AsyncMutex::new(states),
            fetch_count: AtomicUsize::new(0),
            drift_reports: AsyncMutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StateFetcher for ScriptedFetcher {
    async fn fetch_state(&self, _node_id: &str) -> Result<StateResponse> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let mut states = self.states.lock().await;
        if states.len() > 1 {
            Ok(states.remove(0))
        } else {
            Ok(states.first().cloned().unwrap_or_default())
        }
    }

    async fn report_drift(&self, _node_id: &str, report: DriftReport) -> Result<()> {
        self.drift_reports.lock().await.push(report);
        Ok(())
    }
}

/// S1 (SPEC_FULL.md §8): the first reconcile cycle against a policy allowing
/// only peer-b installs exactly one firewall rule set (allow + default-deny)
/// and adds only peer-b to the WireGuard interface.
#[tokio::test]
async fn s1_initial_reconcile_installs_firewall_and_allowed_peer_only() {
    let wg_driver = Arc::new(MockWgController::default());
    let wg_manager = Arc::new(WireGuardManager::new(
        WireGuardSettings {
            interface: "wg0".to_string(),
            private_key: "node-a-private".to_string(),
            listen_port: 51820,
            mesh_address: "10.0.0.1/24".to_string(),
            mtu: 0,
            persistent_keepalive: 0,
        },
        wg_driver.clone(),
    ));

    let fw_driver = Arc::new(MockFirewallController::default());
    let enforcer = Arc::new(Enforcer::new(fw_driver.clone(), "meshnode-agent", "wg0", "node-a", true));
    let policy_handler = Arc::new(PolicyReconcileHandler::new(
        enforcer.clone(),
        wg_manager.clone() as Arc<dyn PeerApplier>,
    ));

    let desired = StateResponse {
        peers: vec![peer("peer-b", "10.0.0.2"), peer("peer-c", "10.0.0.3")],
        policies: vec![Policy {
            id: "p1".to_string(),
            rules: vec![allow_rule("node-a", "peer-b")],
        }],
        ..Default::default()
    };

    let fetcher = Arc::new(ScriptedFetcher::new(vec![desired]));
    let reconciler = Arc::new(Reconciler::new(fetcher.clone(), Duration::from_secs(3600)));
    reconciler.register_handler(wg_manager.clone()).await;
    reconciler.register_handler(policy_handler).await;

    let token = CancellationToken::new();
    let run_token = token.clone();
    let reconciler_clone = reconciler.clone();
    let handle = tokio::spawn(async move {
        reconciler_clone.run(run_token, "node-a").await;
    });

    // Give the immediate initial cycle time to run, then cancel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();
    handle.await.unwrap();

    assert_eq!(fw_driver.applies.lock().unwrap().len(), 1);
    let applied = &fw_driver.applies.lock().unwrap()[0];
    assert_eq!(applied.len(), 2, "allow rule + default-deny");
    assert_eq!(applied.last().unwrap().action, "deny");

    let upserted = wg_driver.upserted.lock().unwrap();
    assert_eq!(upserted.len(), 1);
    assert_eq!(upserted[0].public_key, "peer-b-key");
}

/// S2: a policy change that revokes a previously-allowed peer removes it
/// from the WireGuard interface on the next cycle.
#[tokio::test]
async fn s2_policy_removal_revokes_peer_access() {
    let wg_driver = Arc::new(MockWgController::default());
    let wg_manager = Arc::new(WireGuardManager::new(
        WireGuardSettings {
            interface: "wg0".to_string(),
            private_key: "node-a-private".to_string(),
            listen_port: 51820,
            mesh_address: "10.0.0.1/24".to_string(),
            mtu: 0,
            persistent_keepalive: 0,
        },
        wg_driver.clone(),
    ));

    let fw_driver = Arc::new(MockFirewallController::default());
    let enforcer = Arc::new(Enforcer::new(fw_driver, "meshnode-agent", "wg0", "node-a", true));
    let policy_handler = Arc::new(PolicyReconcileHandler::new(
        enforcer,
        wg_manager.clone() as Arc<dyn PeerApplier>,
    ));

    let first = StateResponse {
        peers: vec![peer("peer-b", "10.0.0.2")],
        policies: vec![Policy {
            id: "p1".to_string(),
            rules: vec![allow_rule("node-a", "peer-b")],
        }],
        ..Default::default()
    };
    let second = StateResponse {
        peers: vec![peer("peer-b", "10.0.0.2")],
        policies: vec![Policy {
            id: "p1".to_string(),
            rules: vec![allow_rule("node-a", "peer-x")],
        }],
        ..Default::default()
    };

    let fetcher = Arc::new(ScriptedFetcher::new(vec![first, second]));
    let reconciler = Arc::new(Reconciler::new(fetcher.clone(), Duration::from_millis(20)));
    reconciler.register_handler(wg_manager.clone()).await;
    reconciler.register_handler(policy_handler).await;

    let token = CancellationToken::new();
    let run_token = token.clone();
    let reconciler_clone = reconciler.clone();
    let handle = tokio::spawn(async move {
        reconciler_clone.run(run_token, "node-a").await;
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    token.cancel();
    handle.await.unwrap();

    assert!(wg_driver.removed.lock().unwrap().contains(&"peer-b-key".to_string()));
}

/// S6: coalescing — many triggers fired back-to-back between cycles collapse
/// into a single extra `fetch_state` call.
#[tokio::test]
async fn s6_coalesces_triggers_between_cycles() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![StateResponse::default()]));
    let reconciler = Arc::new(Reconciler::new(fetcher.clone(), Duration::from_secs(3600)));

    let token = CancellationToken::new();
    let run_token = token.clone();
    let reconciler_clone = reconciler.clone();
    let handle = tokio::spawn(async move {
        reconciler_clone.run(run_token, "node-a").await;
    });

    // Let the initial cycle complete.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let after_initial = fetcher.fetch_count.load(Ordering::SeqCst);
    assert_eq!(after_initial, 1);

    for _ in 0..20 {
        reconciler.trigger_reconcile();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();
    handle.await.unwrap();

    assert_eq!(
        fetcher.fetch_count.load(Ordering::SeqCst),
        after_initial + 1,
        "20 coalescing triggers should yield exactly one extra cycle"
    );
}

/// Config validation rejects the same shapes the teacher's validator did:
/// interface names, MTU ranges.
#[test]
fn config_validation_rejects_invalid_interface_and_mtu() {
    assert!(validate_interface_name("wg0").is_ok());
    assert!(validate_interface_name("wg_mesh0").is_ok());
    assert!(validate_interface_name("").is_err());
    assert!(validate_interface_name("wg/0").is_err());
    assert!(validate_interface_name(&"w".repeat(16)).is_err());

    assert!(validate_mtu(1420).is_ok());
    assert!(validate_mtu(1200).is_err(), "below the 1280-1500 valid range");
}

/// `AddPeer` followed by `RemovePeerByID` leaves the peer index unchanged
/// from its pre-add state (SPEC_FULL.md §8 round-trip law).
#[tokio::test]
async fn wireguard_manager_add_then_remove_peer_is_a_round_trip() {
    let wg_driver = Arc::new(MockWgController::default());
    let wg_manager = WireGuardManager::new(
        WireGuardSettings {
            interface: "wg0".to_string(),
            private_key: "node-a-private".to_string(),
            listen_port: 51820,
            mesh_address: "10.0.0.1/24".to_string(),
            mtu: 0,
            persistent_keepalive: 0,
        },
        wg_driver,
    );

    let index = wg_manager.peer_index();
    assert_eq!(index.len().await, 0);

    let p = peer("peer-b", "10.0.0.2");
    wg_manager.add_peer(&p).await.unwrap();
    assert_eq!(index.len().await, 1);
    assert_eq!(index.public_key_for("peer-b").await, Some("peer-b-key".to_string()));

    wg_manager.remove_peer_by_id("peer-b").await.unwrap();
    assert_eq!(index.len().await, 0);
}

/// Sanity check that the compiled `ip_of` map used by the policy enforcer
/// never produces a rule set longer than rules-mentioning-local + 1, and
/// always ends with the default-deny (SPEC_FULL.md §8 quantified invariant).
#[test]
fn compiled_rule_count_is_bounded_by_local_rules_plus_one() {
    let policies = vec![Policy {
        id: "p1".to_string(),
        rules: vec![
            allow_rule("node-a", "peer-b"),
            allow_rule("peer-x", "peer-y"), // doesn't mention node-a, skipped
            allow_rule("*", "node-a"),
        ],
    }];
    let mut ip_of = HashMap::new();
    ip_of.insert("node-a".to_string(), "10.0.0.1/32".to_string());
    ip_of.insert("peer-b".to_string(), "10.0.0.2/32".to_string());

    let rules = meshnode_agent::policy::PolicyEngine::compile_firewall_rules(&policies, "node-a", &ip_of);
    assert!(rules.len() <= 2 + 1);
    assert_eq!(rules.last().unwrap().action, "deny");
    assert_eq!(rules.last().unwrap().src_cidr, "0.0.0.0/0");
    assert_eq!(rules.last().unwrap().dst_cidr, "0.0.0.0/0");
}
