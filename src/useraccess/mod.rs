//! User-access manager
//!
//! A shared WireGuard interface serving external client devices, with
//! per-peer CRUD reconciled against desired config (SPEC_FULL.md §4.8).

use crate::error::{AggregateError, Result, WgAgentError};
use crate::reconcile::ReconcileHandler;
use crate::state::{StateDiff, StateResponse, UserAccessConfig, UserAccessPeer};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Driver seam for the shared user-access interface.
pub trait UserAccessController: Send + Sync {
    /// Create the shared interface. Idempotent.
    fn create_interface(&self, interface: &str) -> Result<()>;
    /// Enable forwarding from the access interface onto the mesh.
    fn enable_forwarding(&self, interface: &str) -> Result<()>;
    /// Add or update a client peer.
    fn add_peer(&self, interface: &str, peer: &UserAccessPeer) -> Result<()>;
    /// Remove a client peer by public key. Idempotent.
    fn remove_peer(&self, interface: &str, public_key: &str) -> Result<()>;
    /// Disable forwarding. Idempotent.
    fn disable_forwarding(&self, interface: &str) -> Result<()>;
    /// Destroy the shared interface. Idempotent.
    fn destroy_interface(&self, interface: &str) -> Result<()>;
}

/// Linux `ip`/`wg` driven controller for the shared user-access interface.
pub struct LinuxUserAccessController;

impl LinuxUserAccessController {
    /// Construct a new controller. Stateless: every call shells out fresh.
    pub fn new() -> Self {
        Self
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!("useraccess driver: {} {:?}", program, args);
        let output = Command::new(program).args(args).output().map_err(|e| {
            WgAgentError::Driver(format!("failed to execute {} {}: {}", program, args.join(" "), e))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WgAgentError::Driver(format!(
                "command failed: {} {}: {}",
                program,
                args.join(" "),
                stderr
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_best_effort(&self, program: &str, args: &[&str]) {
        if let Err(e) = self.run(program, args) {
            warn!("useraccess driver: best-effort command failed: {}", e);
        }
    }
}

impl Default for LinuxUserAccessController {
    fn default() -> Self {
        Self::new()
    }
}

impl UserAccessController for LinuxUserAccessController {
    fn create_interface(&self, interface: &str) -> Result<()> {
        self.run("ip", &["link", "add", "dev", interface, "type", "wireguard"])?;
        self.run("ip", &["link", "set", interface, "up"])?;
        info!("useraccess driver: interface {} created", interface);
        Ok(())
    }

    fn enable_forwarding(&self, interface: &str) -> Result<()> {
        self.run("sysctl", &["-w", "net.ipv4.ip_forward=1"])?;
        debug!("useraccess driver: forwarding enabled for {}", interface);
        Ok(())
    }

    fn add_peer(&self, interface: &str, peer: &UserAccessPeer) -> Result<()> {
        let allowed = peer.allowed_ips.join(",");
        let mut args = vec![
            "set".to_string(),
            interface.to_string(),
            "peer".to_string(),
            peer.public_key.clone(),
            "allowed-ips".to_string(),
            allowed,
        ];

        let mut keyfile = None;
        if let Some(psk) = peer.preshared_key.as_deref() {
            let file = crate::wireguard::driver::write_temp_key(psk)?;
            let path = file
                .path()
                .to_str()
                .ok_or_else(|| WgAgentError::Driver("temp psk file path is not valid UTF-8".to_string()))?
                .to_string();
            args.push("preshared-key".to_string());
            args.push(path);
            keyfile = Some(file);
        }

        let args_ref: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.run("wg", &args_ref)?;
        drop(keyfile);
        Ok(())
    }

    fn remove_peer(&self, interface: &str, public_key: &str) -> Result<()> {
        self.run_best_effort("wg", &["set", interface, "peer", public_key, "remove"]);
        Ok(())
    }

    fn disable_forwarding(&self, _interface: &str) -> Result<()> {
        Ok(())
    }

    fn destroy_interface(&self, interface: &str) -> Result<()> {
        self.run_best_effort("ip", &["link", "delete", interface]);
        info!("useraccess driver: interface {} destroyed", interface);
        Ok(())
    }
}

struct State {
    active: bool,
    interface: String,
    peers: HashMap<String, UserAccessPeer>,
}

/// Owns the user-access interface lifecycle and its client-peer set.
pub struct UserAccessManager {
    controller: Arc<dyn UserAccessController>,
    state: Mutex<State>,
}

impl UserAccessManager {
    /// Construct a manager, inactive until `setup` runs.
    pub fn new(controller: Arc<dyn UserAccessController>) -> Self {
        Self {
            controller,
            state: Mutex::new(State {
                active: false,
                interface: String::new(),
                peers: HashMap::new(),
            }),
        }
    }

    /// Create the shared interface and enable forwarding. On mid-failure,
    /// the created interface is removed (SPEC_FULL.md §4.8).
    pub async fn setup(&self, interface: &str) -> Result<()> {
        self.controller.create_interface(interface)?;

        if let Err(e) = self.controller.enable_forwarding(interface) {
            if let Err(de) = self.controller.destroy_interface(interface) {
                warn!("useraccess manager: rollback destroy_interface failed: {}", de);
            }
            return Err(e);
        }

        let mut state = self.state.lock().await;
        state.active = true;
        state.interface = interface.to_string();
        Ok(())
    }

    /// Add or update a client peer on the shared interface.
    pub async fn add_peer(&self, peer: &UserAccessPeer) -> Result<()> {
        let interface = self.state.lock().await.interface.clone();
        self.controller.add_peer(&interface, peer)?;
        self.state
            .lock()
            .await
            .peers
            .insert(peer.public_key.clone(), peer.clone());
        Ok(())
    }

    /// Remove a client peer by public key. Idempotent if unknown.
    pub async fn remove_peer(&self, public_key: &str) -> Result<()> {
        let interface = self.state.lock().await.interface.clone();
        if self.state.lock().await.peers.remove(public_key).is_some() {
            self.controller.remove_peer(&interface, public_key)?;
        }
        Ok(())
    }

    /// Remove every peer, disable forwarding, destroy the interface.
    /// Aggregates errors. Idempotent.
    pub async fn teardown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.active {
            return Ok(());
        }

        let mut aggregate = AggregateError::new();
        for public_key in state.peers.keys().cloned().collect::<Vec<_>>() {
            if let Err(e) = self.controller.remove_peer(&state.interface, &public_key) {
                aggregate.push(e);
            }
        }
        state.peers.clear();

        if let Err(e) = self.controller.disable_forwarding(&state.interface) {
            aggregate.push(e);
        }
        if let Err(e) = self.controller.destroy_interface(&state.interface) {
            aggregate.push(e);
        }
        state.active = false;
        aggregate.into_result()
    }

    /// Diff desired client peers against the tracked set: remove stale,
    /// update changed (remove-then-add), add new. Aggregates errors.
    pub async fn reconcile_config(&self, config: &UserAccessConfig) -> Result<usize> {
        if !config.enabled {
            return Ok(0);
        }
        if !self.state.lock().await.active {
            self.setup(&config.interface).await?;
        }

        let desired: HashMap<String, UserAccessPeer> = config
            .peers
            .iter()
            .map(|p| (p.public_key.clone(), p.clone()))
            .collect();
        let tracked_keys: Vec<String> = self.state.lock().await.peers.keys().cloned().collect();

        let mut aggregate = AggregateError::new();
        let mut changed = 0usize;

        for key in &tracked_keys {
            if !desired.contains_key(key) {
                match self.remove_peer(key).await {
                    Ok(()) => changed += 1,
                    Err(e) => aggregate.push(e),
                }
            }
        }

        for peer in config.peers.iter() {
            let needs_update = {
                let state = self.state.lock().await;
                match state.peers.get(&peer.public_key) {
                    None => true,
                    Some(existing) => existing != peer,
                }
            };
            if !needs_update {
                continue;
            }
            if self.state.lock().await.peers.contains_key(&peer.public_key) {
                if let Err(e) = self.remove_peer(&peer.public_key).await {
                    aggregate.push(e);
                    continue;
                }
            }
            match self.add_peer(peer).await {
                Ok(()) => changed += 1,
                Err(e) => aggregate.push(e),
            }
        }

        aggregate.into_result()?;
        Ok(changed)
    }
}

#[async_trait]
impl ReconcileHandler for UserAccessManager {
    fn name(&self) -> &str {
        "useraccess"
    }

    async fn reconcile(&self, desired: &StateResponse, diff: &StateDiff) -> Result<Option<String>> {
        let drift_signal = !diff.peers_to_add.is_empty()
            || !diff.peers_to_update.is_empty()
            || !diff.peers_to_remove.is_empty()
            || diff.metadata_changed;
        if !drift_signal {
            return Ok(None);
        }

        let changed = self.reconcile_config(&desired.user_access).await?;
        if changed == 0 {
            Ok(None)
        } else {
            Ok(Some(format!("{} client peer(s) reconciled", changed)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn client(key: &str) -> UserAccessPeer {
        UserAccessPeer {
            public_key: key.to_string(),
            allowed_ips: vec!["10.20.0.5/32".to_string()],
            preshared_key: None,
            label: "laptop".to_string(),
        }
    }

    #[derive(Default)]
    struct FakeController {
        fail_forwarding: StdMutex<bool>,
        destroyed: StdMutex<bool>,
        peers_added: StdMutex<Vec<String>>,
        peers_removed: StdMutex<Vec<String>>,
    }

    impl UserAccessController for FakeController {
        fn create_interface(&self, _interface: &str) -> Result<()> {
            Ok(())
        }
        fn enable_forwarding(&self, _interface: &str) -> Result<()> {
            if *self.fail_forwarding.lock().unwrap() {
                return Err(crate::error::WgAgentError::Driver("fail".to_string()));
            }
            Ok(())
        }
        fn add_peer(&self, _interface: &str, peer: &UserAccessPeer) -> Result<()> {
            self.peers_added.lock().unwrap().push(peer.public_key.clone());
            Ok(())
        }
        fn remove_peer(&self, _interface: &str, public_key: &str) -> Result<()> {
            self.peers_removed.lock().unwrap().push(public_key.to_string());
            Ok(())
        }
        fn disable_forwarding(&self, _interface: &str) -> Result<()> {
            Ok(())
        }
        fn destroy_interface(&self, _interface: &str) -> Result<()> {
            *self.destroyed.lock().unwrap() = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn setup_rolls_back_interface_on_forwarding_failure() {
        let controller = Arc::new(FakeController::default());
        *controller.fail_forwarding.lock().unwrap() = true;
        let manager = UserAccessManager::new(controller.clone());

        let result = manager.setup("wg-access0").await;
        assert!(result.is_err());
        assert!(*controller.destroyed.lock().unwrap());
    }

    #[tokio::test]
    async fn reconcile_config_adds_new_client_peers() {
        let controller = Arc::new(FakeController::default());
        let manager = UserAccessManager::new(controller.clone());

        let config = UserAccessConfig {
            enabled: true,
            interface: "wg-access0".to_string(),
            peers: vec![client("keyA")],
        };

        let changed = manager.reconcile_config(&config).await.unwrap();
        assert_eq!(changed, 1);
        assert_eq!(controller.peers_added.lock().unwrap().as_slice(), ["keyA".to_string()]);
    }

    #[tokio::test]
    async fn reconcile_config_removes_revoked_peers() {
        let controller = Arc::new(FakeController::default());
        let manager = UserAccessManager::new(controller.clone());

        let mut config = UserAccessConfig {
            enabled: true,
            interface: "wg-access0".to_string(),
            peers: vec![client("keyA")],
        };
        manager.reconcile_config(&config).await.unwrap();

        config.peers.clear();
        manager.reconcile_config(&config).await.unwrap();

        assert_eq!(controller.peers_removed.lock().unwrap().as_slice(), ["keyA".to_string()]);
    }
}
