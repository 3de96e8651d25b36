//! Bridge route manager
//!
//! Installs the OS-level routing and NAT needed for this node to act as a
//! gateway between the mesh and an access-side network (SPEC_FULL.md §4.5).

use crate::error::{AggregateError, Result, WgAgentError};
use crate::reconcile::ReconcileHandler;
use crate::state::{BridgeConfig, StateDiff, StateResponse};
use async_trait::async_trait;
use std::collections::HashSet;
use std::process::Command;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Driver seam for routing/NAT. Linux implementation shells `ip route`,
/// `sysctl`, and `nft`.
pub trait RouteController: Send + Sync {
    /// Enable IP forwarding between `iface_a` and `iface_b`. Idempotent.
    fn enable_forwarding(&self, iface_a: &str, iface_b: &str) -> Result<()>;
    /// Disable forwarding previously enabled. Idempotent.
    fn disable_forwarding(&self, iface_a: &str, iface_b: &str) -> Result<()>;
    /// Add a route for `cidr` via `iface`. Idempotent.
    fn add_route(&self, cidr: &str, iface: &str) -> Result<()>;
    /// Remove a route. Idempotent.
    fn remove_route(&self, cidr: &str, iface: &str) -> Result<()>;
    /// Install NAT masquerade on `iface`. Idempotent.
    fn add_nat_masquerade(&self, iface: &str) -> Result<()>;
    /// Remove NAT masquerade. Idempotent.
    fn remove_nat_masquerade(&self, iface: &str) -> Result<()>;
}

/// Linux `ip route`/`sysctl`/`nft` driven controller.
pub struct LinuxRouteController;

impl LinuxRouteController {
    /// Construct a new controller. Stateless: every call shells out fresh.
    pub fn new() -> Self {
        Self
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!("bridge driver: {} {:?}", program, args);
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
            warn!("bridge driver: best-effort command failed: {}", e);
        }
    }
}

impl Default for LinuxRouteController {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteController for LinuxRouteController {
    fn enable_forwarding(&self, iface_a: &str, iface_b: &str) -> Result<()> {
        self.run("sysctl", &["-w", "net.ipv4.ip_forward=1"])?;
        info!("bridge driver: forwarding enabled between {} and {}", iface_a, iface_b);
        Ok(())
    }

    fn disable_forwarding(&self, _iface_a: &str, _iface_b: &str) -> Result<()> {
        // Left at 1: other bridges or access paths on this host may still
        // depend on forwarding. Per-interface disablement isn't meaningful
        // for a host-wide sysctl.
        Ok(())
    }

    fn add_route(&self, cidr: &str, iface: &str) -> Result<()> {
        self.run("ip", &["route", "replace", cidr, "dev", iface])?;
        Ok(())
    }

    fn remove_route(&self, cidr: &str, iface: &str) -> Result<()> {
        self.run_best_effort("ip", &["route", "del", cidr, "dev", iface]);
        Ok(())
    }

    fn add_nat_masquerade(&self, iface: &str) -> Result<()> {
        self.run(
            "nft",
            &[
                "add", "rule", "ip", "nat", "postrouting", "oifname", iface, "masquerade",
            ],
        )?;
        Ok(())
    }

    fn remove_nat_masquerade(&self, iface: &str) -> Result<()> {
        // `nft` rules have no stable handle without a prior listing pass;
        // best-effort flush of the whole postrouting chain is too broad, so
        // this is a deliberate no-op left to full-chain teardown elsewhere.
        debug!("bridge driver: masquerade removal for {} deferred to chain teardown", iface);
        Ok(())
    }
}

struct State {
    active: bool,
    nat_installed: bool,
    active_routes: HashSet<String>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            active: false,
            nat_installed: false,
            active_routes: HashSet::new(),
        }
    }
}

/// Owns the access-side routing/NAT lifecycle for the mesh interface.
pub struct BridgeRouteManager {
    controller: Arc<dyn RouteController>,
    mesh_interface: String,
    state: Mutex<State>,
}

impl BridgeRouteManager {
    /// Construct a manager that routes onto `mesh_interface`.
    pub fn new(controller: Arc<dyn RouteController>, mesh_interface: impl Into<String>) -> Self {
        Self {
            controller,
            mesh_interface: mesh_interface.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Enable forwarding, add each access subnet, then install NAT (unless
    /// explicitly disabled). No-op if `config.enabled` is false. On mid-loop
    /// route failure, rolls back every route added so far and disables
    /// forwarding, returning the original error (SPEC_FULL.md §4.5, S3).
    pub async fn setup(&self, config: &BridgeConfig) -> Result<()> {
        if !config.enabled {
            return Ok(());
        }

        self.controller
            .enable_forwarding(&self.mesh_interface, &config.access_interface)?;

        let mut added: Vec<String> = Vec::new();
        for subnet in &config.access_subnets {
            match self.controller.add_route(subnet, &config.access_interface) {
                Ok(()) => added.push(subnet.clone()),
                Err(e) => {
                    warn!("bridge manager: add_route({}) failed, rolling back: {}", subnet, e);
                    for done in added.iter().rev() {
                        if let Err(re) = self.controller.remove_route(done, &config.access_interface) {
                            warn!("bridge manager: rollback remove_route({}) failed: {}", done, re);
                        }
                    }
                    if let Err(de) = self
                        .controller
                        .disable_forwarding(&self.mesh_interface, &config.access_interface)
                    {
                        warn!("bridge manager: rollback disable_forwarding failed: {}", de);
                    }
                    return Err(e);
                }
            }
        }

        let want_nat = config.nat.unwrap_or(true);
        if want_nat {
            if let Err(e) = self.controller.add_nat_masquerade(&config.access_interface) {
                warn!("bridge manager: add_nat_masquerade failed, rolling back: {}", e);
                for done in added.iter().rev() {
                    let _ = self.controller.remove_route(done, &config.access_interface);
                }
                let _ = self
                    .controller
                    .disable_forwarding(&self.mesh_interface, &config.access_interface);
                return Err(e);
            }
        }

        let mut state = self.state.lock().await;
        state.active = true;
        state.nat_installed = want_nat;
        state.active_routes = added.into_iter().collect();
        info!("bridge manager: setup complete for {}", config.access_interface);
        Ok(())
    }

    /// Diff `desired_subnets` against the tracked active set; remove stale,
    /// add new. Aggregates errors but continues.
    pub async fn update_routes(&self, access_interface: &str, desired_subnets: &[String]) -> Result<()> {
        let desired: HashSet<String> = desired_subnets.iter().cloned().collect();
        let mut state = self.state.lock().await;
        let mut aggregate = AggregateError::new();

        let stale: Vec<String> = state.active_routes.difference(&desired).cloned().collect();
        for subnet in &stale {
            if let Err(e) = self.controller.remove_route(subnet, access_interface) {
                aggregate.push(e);
            } else {
                state.active_routes.remove(subnet);
            }
        }

        let fresh: Vec<String> = desired.difference(&state.active_routes).cloned().collect();
        for subnet in &fresh {
            if let Err(e) = self.controller.add_route(subnet, access_interface) {
                aggregate.push(e);
            } else {
                state.active_routes.insert(subnet.clone());
            }
        }

        aggregate.into_result()
    }

    /// Remove all tracked routes, remove NAT if installed, disable
    /// forwarding. Idempotent when inactive.
    pub async fn teardown(&self, access_interface: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.active {
            return Ok(());
        }

        let mut aggregate = AggregateError::new();
        for subnet in state.active_routes.drain().collect::<Vec<_>>() {
            if let Err(e) = self.controller.remove_route(&subnet, access_interface) {
                aggregate.push(e);
            }
        }
        if state.nat_installed {
            if let Err(e) = self.controller.remove_nat_masquerade(access_interface) {
                aggregate.push(e);
            }
        }
        if let Err(e) = self
            .controller
            .disable_forwarding(&self.mesh_interface, access_interface)
        {
            aggregate.push(e);
        }

        state.active = false;
        state.nat_installed = false;
        aggregate.into_result()
    }
}

#[async_trait]
impl ReconcileHandler for BridgeRouteManager {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn reconcile(&self, desired: &StateResponse, diff: &StateDiff) -> Result<Option<String>> {
        let drift_signal = !diff.peers_to_add.is_empty()
            || !diff.peers_to_update.is_empty()
            || !diff.peers_to_remove.is_empty()
            || diff.metadata_changed;

        if !drift_signal {
            return Ok(None);
        }
        if !desired.bridge.enabled {
            return Ok(None);
        }

        self.update_routes(&desired.bridge.access_interface, &desired.bridge.access_subnets)
            .await?;
        Ok(Some("routes reconciled".to_string()))
    }
}
