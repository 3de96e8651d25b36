//! WireGuard manager
//!
//! Drives the local mesh interface to match desired peer state, via the
//! `PeerIndex` and a `WgController` driver. Registered with the reconciler
//! as a `ReconcileHandler` (SPEC_FULL.md §4.3).

use crate::error::{AggregateError, Result};
use crate::policy::PeerApplier;
use crate::reconcile::ReconcileHandler;
use crate::state::{Peer, StateDiff, StateResponse};
use crate::wireguard::driver::{PeerConfig, WgController};
use crate::wireguard::peer_index::PeerIndex;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Mesh interface settings the manager needs at setup time.
#[derive(Debug, Clone)]
pub struct WireGuardSettings {
    /// Interface name, e.g. "wg-mesh0".
    pub interface: String,
    /// This node's private key, base64.
    pub private_key: String,
    /// UDP listen port.
    pub listen_port: u16,
    /// This node's mesh IP, CIDR notation, e.g. "10.10.0.5/24".
    pub mesh_address: String,
    /// Interface MTU, 0 = leave at the kernel default.
    pub mtu: u16,
    /// Persistent keepalive applied to every peer, 0 = disabled.
    pub persistent_keepalive: u16,
}

/// Owns the mesh WireGuard interface and keeps its peer set converged with
/// desired state.
pub struct WireGuardManager {
    settings: WireGuardSettings,
    controller: Arc<dyn WgController>,
    index: Arc<PeerIndex>,
}

impl WireGuardManager {
    /// Construct a manager for the given interface settings and driver.
    pub fn new(settings: WireGuardSettings, controller: Arc<dyn WgController>) -> Self {
        Self {
            settings,
            controller,
            index: Arc::new(PeerIndex::new()),
        }
    }

    /// Shared peer index, for other subsystems (policy enforcement needs to
    /// translate peer IDs to public keys for its own rule compilation).
    pub fn peer_index(&self) -> Arc<PeerIndex> {
        self.index.clone()
    }

    /// Bring the mesh interface up with this node's identity and address.
    /// Idempotent.
    pub async fn setup(&self) -> Result<()> {
        self.controller.setup_interface(
            &self.settings.interface,
            &self.settings.private_key,
            self.settings.listen_port,
        )?;
        self.controller
            .set_address(&self.settings.interface, &self.settings.mesh_address)?;
        if self.settings.mtu > 0 {
            self.controller.set_mtu(&self.settings.interface, self.settings.mtu)?;
        }
        info!("wireguard manager: interface {} ready", self.settings.interface);
        Ok(())
    }

    /// Tear the interface down, best-effort per peer.
    pub async fn teardown(&self) -> Result<()> {
        let mut aggregate = AggregateError::new();
        for peer_id in self.index.peer_ids().await {
            if let Some(key) = self.index.remove_by_id(&peer_id).await {
                if let Err(e) = self.controller.remove_peer(&self.settings.interface, &key) {
                    aggregate.push(e);
                }
            }
        }
        if let Err(e) = self.controller.teardown_interface(&self.settings.interface) {
            aggregate.push(e);
        }
        aggregate.into_result()
    }

    fn to_peer_config(&self, peer: &Peer) -> PeerConfig {
        PeerConfig {
            public_key: peer.public_key.clone(),
            allowed_ips: if peer.allowed_ips.is_empty() {
                vec![format!("{}/32", peer.mesh_ip)]
            } else {
                peer.allowed_ips.clone()
            },
            endpoint: peer.endpoint.clone(),
            preshared_key: peer.preshared_key.clone(),
            persistent_keepalive: self.settings.persistent_keepalive,
        }
    }

    /// Apply a peer add/update. Idempotent: `wg set ... peer` upserts.
    pub async fn add_peer(&self, peer: &Peer) -> Result<()> {
        self.controller
            .upsert_peer(&self.settings.interface, &self.to_peer_config(peer))?;
        self.index.insert(&peer.id, &peer.public_key).await;
        Ok(())
    }

    /// Remove a peer by ID. Idempotent if the ID is unknown.
    pub async fn remove_peer_by_id(&self, peer_id: &str) -> Result<()> {
        if let Some(public_key) = self.index.remove_by_id(peer_id).await {
            self.controller
                .remove_peer(&self.settings.interface, &public_key)?;
        }
        Ok(())
    }

    /// Apply a full bag of peer changes, collecting and continuing past
    /// individual failures (SPEC_FULL.md §4.3).
    pub async fn configure_peers(&self, diff: &StateDiff) -> Result<usize> {
        let mut aggregate = AggregateError::new();
        let mut applied = 0usize;

        for peer_id in &diff.peers_to_remove {
            match self.remove_peer_by_id(peer_id).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!("wireguard manager: failed to remove peer {}: {}", peer_id, e);
                    aggregate.push(e);
                }
            }
        }
        for peer in diff.peers_to_update.iter().chain(diff.peers_to_add.iter()) {
            match self.add_peer(peer).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!("wireguard manager: failed to apply peer {}: {}", peer.id, e);
                    aggregate.push(e);
                }
            }
        }

        aggregate.into_result()?;
        Ok(applied)
    }
}

#[async_trait]
impl PeerApplier for WireGuardManager {
    async fn add_peer(&self, peer: &Peer) -> Result<()> {
        WireGuardManager::add_peer(self, peer).await
    }

    async fn remove_peer_by_id(&self, peer_id: &str) -> Result<()> {
        WireGuardManager::remove_peer_by_id(self, peer_id).await
    }
}

#[async_trait]
impl ReconcileHandler for WireGuardManager {
    fn name(&self) -> &str {
        "wireguard"
    }

    async fn reconcile(&self, _desired: &StateResponse, diff: &StateDiff) -> Result<Option<String>> {
        if diff.peers_to_add.is_empty() && diff.peers_to_update.is_empty() && diff.peers_to_remove.is_empty() {
            return Ok(None);
        }
        let applied = self.configure_peers(diff).await?;
        Ok(Some(format!("applied {} peer change(s)", applied)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingController {
        upserts: StdMutex<Vec<String>>,
        removals: StdMutex<Vec<String>>,
        fail_on: StdMutex<Option<String>>,
    }

    impl WgController for RecordingController {
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
            if self.fail_on.lock().unwrap().as_deref() == Some(peer.public_key.as_str()) {
                return Err(crate::error::WgAgentError::Driver("forced failure".to_string()));
            }
            self.upserts.lock().unwrap().push(peer.public_key.clone());
            Ok(())
        }
        fn remove_peer(&self, _interface: &str, public_key: &str) -> Result<()> {
            self.removals.lock().unwrap().push(public_key.to_string());
            Ok(())
        }
    }

    fn settings() -> WireGuardSettings {
        WireGuardSettings {
            interface: "wg-mesh0".to_string(),
            private_key: "AAAA".to_string(),
            listen_port: 51820,
            mesh_address: "10.10.0.1/24".to_string(),
            mtu: 1420,
            persistent_keepalive: 25,
        }
    }

    fn peer(id: &str, pubkey: &str) -> Peer {
        Peer {
            id: id.to_string(),
            public_key: pubkey.to_string(),
            mesh_ip: "10.10.0.2".to_string(),
            endpoint: "1.2.3.4:51820".to_string(),
            allowed_ips: vec![],
            preshared_key: None,
        }
    }

    #[tokio::test]
    async fn add_peer_updates_index_and_driver() {
        let controller = Arc::new(RecordingController::default());
        let manager = WireGuardManager::new(settings(), controller.clone());

        manager.add_peer(&peer("peer-a", "keyA")).await.unwrap();

        assert_eq!(manager.peer_index().public_key_for("peer-a").await, Some("keyA".to_string()));
        assert_eq!(controller.upserts.lock().unwrap().as_slice(), ["keyA".to_string()]);
    }

    #[tokio::test]
    async fn remove_peer_by_id_is_idempotent() {
        let controller = Arc::new(RecordingController::default());
        let manager = WireGuardManager::new(settings(), controller.clone());

        manager.remove_peer_by_id("never-added").await.unwrap();
        assert!(controller.removals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn configure_peers_continues_past_individual_failure() {
        let controller = Arc::new(RecordingController::default());
        *controller.fail_on.lock().unwrap() = Some("keyBad".to_string());
        let manager = WireGuardManager::new(settings(), controller.clone());

        let diff = StateDiff {
            peers_to_add: vec![peer("peer-a", "keyGood"), peer("peer-b", "keyBad")],
            ..Default::default()
        };

        let result = manager.configure_peers(&diff).await;
        assert!(result.is_err());
        assert_eq!(controller.upserts.lock().unwrap().as_slice(), ["keyGood".to_string()]);
    }

    #[tokio::test]
    async fn reconcile_is_noop_for_empty_diff() {
        let controller = Arc::new(RecordingController::default());
        let manager = WireGuardManager::new(settings(), controller);
        let result = manager
            .reconcile(&StateResponse::default(), &StateDiff::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
