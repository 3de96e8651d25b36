//! Site-to-site manager
//!
//! Installs WireGuard tunnels to external networks alongside the mesh
//! tunnel, each via a rollback-capable multi-step sequence (SPEC_FULL.md
//! §4.8).

use crate::error::{AggregateError, Result, WgAgentError};
use crate::reconcile::ReconcileHandler;
use crate::state::{SiteToSiteConfig, SiteToSiteTunnel, StateDiff, StateResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Driver seam for installing one site-to-site tunnel's steps.
pub trait SiteToSiteController: Send + Sync {
    /// Create the tunnel's dedicated interface. Idempotent.
    fn create_interface(&self, tunnel: &SiteToSiteTunnel) -> Result<()>;
    /// Configure the remote peer on that interface.
    fn configure_peer(&self, tunnel: &SiteToSiteTunnel) -> Result<()>;
    /// Enable forwarding between the tunnel interface and the mesh.
    fn enable_forwarding(&self, tunnel: &SiteToSiteTunnel) -> Result<()>;
    /// Add a route for one remote subnet.
    fn add_route(&self, tunnel: &SiteToSiteTunnel, subnet: &str) -> Result<()>;
    /// Remove a previously-added route. Idempotent.
    fn remove_route(&self, tunnel: &SiteToSiteTunnel, subnet: &str) -> Result<()>;
    /// Disable forwarding. Idempotent.
    fn disable_forwarding(&self, tunnel: &SiteToSiteTunnel) -> Result<()>;
    /// Remove the remote peer. Idempotent.
    fn remove_peer(&self, tunnel: &SiteToSiteTunnel) -> Result<()>;
    /// Destroy the tunnel's interface. Idempotent.
    fn destroy_interface(&self, tunnel: &SiteToSiteTunnel) -> Result<()>;
}

/// Linux `ip`/`wg` driven controller: each tunnel gets its own WireGuard
/// interface, distinct from the mesh interface `wireguard::driver` manages.
pub struct LinuxSiteToSiteController;

impl LinuxSiteToSiteController {
    /// Construct a new controller. Stateless: every call shells out fresh.
    pub fn new() -> Self {
        Self
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!("sitetosite driver: {} {:?}", program, args);
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
            warn!("sitetosite driver: best-effort command failed: {}", e);
        }
    }
}

impl Default for LinuxSiteToSiteController {
    fn default() -> Self {
        Self::new()
    }
}

impl SiteToSiteController for LinuxSiteToSiteController {
    fn create_interface(&self, tunnel: &SiteToSiteTunnel) -> Result<()> {
        self.run("ip", &["link", "add", "dev", &tunnel.interface, "type", "wireguard"])?;
        let port = tunnel.listen_port.to_string();
        self.run("wg", &["set", &tunnel.interface, "listen-port", &port])?;
        for subnet in &tunnel.local_subnets {
            self.run("ip", &["address", "add", subnet, "dev", &tunnel.interface])?;
        }
        self.run("ip", &["link", "set", &tunnel.interface, "up"])?;
        info!("sitetosite driver: interface {} created", tunnel.interface);
        Ok(())
    }

    fn configure_peer(&self, tunnel: &SiteToSiteTunnel) -> Result<()> {
        let allowed = tunnel.remote_subnets.join(",");
        let mut args = vec![
            "set".to_string(),
            tunnel.interface.clone(),
            "peer".to_string(),
            tunnel.remote_public_key.clone(),
            "endpoint".to_string(),
            tunnel.remote_endpoint.clone(),
            "allowed-ips".to_string(),
            allowed,
        ];

        let mut keyfile = None;
        if let Some(psk) = tunnel.preshared_key.as_deref() {
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

    fn enable_forwarding(&self, tunnel: &SiteToSiteTunnel) -> Result<()> {
        self.run("sysctl", &["-w", "net.ipv4.ip_forward=1"])?;
        debug!("sitetosite driver: forwarding enabled for {}", tunnel.interface);
        Ok(())
    }

    fn add_route(&self, tunnel: &SiteToSiteTunnel, subnet: &str) -> Result<()> {
        self.run("ip", &["route", "replace", subnet, "dev", &tunnel.interface])?;
        Ok(())
    }

    fn remove_route(&self, tunnel: &SiteToSiteTunnel, subnet: &str) -> Result<()> {
        self.run_best_effort("ip", &["route", "del", subnet, "dev", &tunnel.interface]);
        Ok(())
    }

    fn disable_forwarding(&self, _tunnel: &SiteToSiteTunnel) -> Result<()> {
        Ok(())
    }

    fn remove_peer(&self, tunnel: &SiteToSiteTunnel) -> Result<()> {
        self.run_best_effort("wg", &["set", &tunnel.interface, "peer", &tunnel.remote_public_key, "remove"]);
        Ok(())
    }

    fn destroy_interface(&self, tunnel: &SiteToSiteTunnel) -> Result<()> {
        self.run_best_effort("ip", &["link", "delete", &tunnel.interface]);
        info!("sitetosite driver: interface {} destroyed", tunnel.interface);
        Ok(())
    }
}

/// Tracks the live tunnel set and reconciles it against desired config.
pub struct SiteToSiteManager {
    controller: Arc<dyn SiteToSiteController>,
    active: Mutex<HashMap<String, SiteToSiteTunnel>>,
}

impl SiteToSiteManager {
    /// Construct a manager around `controller`.
    pub fn new(controller: Arc<dyn SiteToSiteController>) -> Self {
        Self {
            controller,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// `create_interface → configure_peer → enable_forwarding → add_route
    /// ×N`. Each step's failure rolls back every earlier step, best-effort
    /// (secondary rollback failures are logged, not propagated).
    pub async fn add_tunnel(&self, tunnel: &SiteToSiteTunnel) -> Result<()> {
        self.controller.create_interface(tunnel)?;

        if let Err(e) = self.controller.configure_peer(tunnel) {
            self.rollback_after_interface(tunnel);
            return Err(e);
        }

        if let Err(e) = self.controller.enable_forwarding(tunnel) {
            self.rollback_after_peer(tunnel);
            return Err(e);
        }

        let mut added_routes: Vec<String> = Vec::new();
        for subnet in &tunnel.remote_subnets {
            if let Err(e) = self.controller.add_route(tunnel, subnet) {
                for done in added_routes.iter().rev() {
                    if let Err(re) = self.controller.remove_route(tunnel, done) {
                        warn!("sitetosite manager: rollback remove_route failed: {}", re);
                    }
                }
                self.rollback_after_forwarding(tunnel);
                return Err(e);
            }
            added_routes.push(subnet.clone());
        }

        self.active.lock().await.insert(tunnel.id.clone(), tunnel.clone());
        Ok(())
    }

    fn rollback_after_interface(&self, tunnel: &SiteToSiteTunnel) {
        if let Err(e) = self.controller.destroy_interface(tunnel) {
            warn!("sitetosite manager: rollback destroy_interface failed: {}", e);
        }
    }

    fn rollback_after_peer(&self, tunnel: &SiteToSiteTunnel) {
        if let Err(e) = self.controller.remove_peer(tunnel) {
            warn!("sitetosite manager: rollback remove_peer failed: {}", e);
        }
        self.rollback_after_interface(tunnel);
    }

    fn rollback_after_forwarding(&self, tunnel: &SiteToSiteTunnel) {
        if let Err(e) = self.controller.disable_forwarding(tunnel) {
            warn!("sitetosite manager: rollback disable_forwarding failed: {}", e);
        }
        self.rollback_after_peer(tunnel);
    }

    /// Inverse of `add_tunnel`: remove routes, disable forwarding, remove
    /// peer, destroy interface. Aggregates errors. Idempotent if unknown.
    pub async fn remove_tunnel(&self, tunnel_id: &str) -> Result<()> {
        let tunnel = match self.active.lock().await.remove(tunnel_id) {
            Some(t) => t,
            None => return Ok(()),
        };

        let mut aggregate = AggregateError::new();
        for subnet in &tunnel.remote_subnets {
            if let Err(e) = self.controller.remove_route(&tunnel, subnet) {
                aggregate.push(e);
            }
        }
        if let Err(e) = self.controller.disable_forwarding(&tunnel) {
            aggregate.push(e);
        }
        if let Err(e) = self.controller.remove_peer(&tunnel) {
            aggregate.push(e);
        }
        if let Err(e) = self.controller.destroy_interface(&tunnel) {
            aggregate.push(e);
        }
        aggregate.into_result()
    }

    /// Remove every tracked tunnel. Aggregates errors. Idempotent.
    pub async fn teardown(&self) -> Result<()> {
        let ids: Vec<String> = self.active.lock().await.keys().cloned().collect();
        let mut aggregate = AggregateError::new();
        for id in ids {
            if let Err(e) = self.remove_tunnel(&id).await {
                aggregate.push(e);
            }
        }
        aggregate.into_result()
    }

    /// Diff `desired` tunnels against the tracked set: remove stale, update
    /// changed (remove-then-add), add new. Aggregates errors.
    pub async fn reconcile_config(&self, config: &SiteToSiteConfig) -> Result<usize> {
        if !config.enabled {
            return Ok(0);
        }

        let desired: HashMap<String, SiteToSiteTunnel> =
            config.tunnels.iter().map(|t| (t.id.clone(), t.clone())).collect();
        let tracked_ids: Vec<String> = self.active.lock().await.keys().cloned().collect();

        let mut aggregate = AggregateError::new();
        let mut changed = 0usize;

        for id in &tracked_ids {
            if !desired.contains_key(id) {
                match self.remove_tunnel(id).await {
                    Ok(()) => changed += 1,
                    Err(e) => aggregate.push(e),
                }
            }
        }

        for tunnel in config.tunnels.iter() {
            let needs_update = {
                let active = self.active.lock().await;
                match active.get(&tunnel.id) {
                    None => true,
                    Some(existing) => existing != tunnel,
                }
            };
            if !needs_update {
                continue;
            }

            if self.active.lock().await.contains_key(&tunnel.id) {
                if let Err(e) = self.remove_tunnel(&tunnel.id).await {
                    aggregate.push(e);
                    continue;
                }
            }
            match self.add_tunnel(tunnel).await {
                Ok(()) => changed += 1,
                Err(e) => aggregate.push(e),
            }
        }

        aggregate.into_result()?;
        Ok(changed)
    }
}

#[async_trait]
impl ReconcileHandler for SiteToSiteManager {
    fn name(&self) -> &str {
        "sitetosite"
    }

    async fn reconcile(&self, desired: &StateResponse, diff: &StateDiff) -> Result<Option<String>> {
        let drift_signal = !diff.peers_to_add.is_empty()
            || !diff.peers_to_update.is_empty()
            || !diff.peers_to_remove.is_empty()
            || diff.metadata_changed;
        if !drift_signal {
            return Ok(None);
        }

        let changed = self.reconcile_config(&desired.site_to_site).await?;
        if changed == 0 {
            Ok(None)
        } else {
            Ok(Some(format!("{} tunnel(s) reconciled", changed)))
        }
    }
}
