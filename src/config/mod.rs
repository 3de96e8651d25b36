//! Configuration management
//!
//! The root `NodeConfig` and its nested subsystem configs, loaded from a
//! TOML file and validated before the agent starts (SPEC_FULL.md §3.A,
//! §4.A.1). Structurally this mirrors the teacher's `Config`/`NetworkConfig`
//! nesting and `#[serde(default = "...")]` pattern, but the top level is a
//! single node (one mesh interface, one control-plane registration) rather
//! than a map of named networks — the new data model has no concept of
//! multiple independent tunnels.

mod toml_parser;
mod validation;

pub use validation::{
    validate_cidr, validate_endpoint, validate_interface_name, validate_keepalive, validate_mtu,
    validate_public_key,
};

use crate::error::{Result, WgAgentError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration for one node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's ID, as known to the control plane.
    pub node_id: String,
    /// Base URL of the control plane (e.g. `https://mesh.example.com`).
    pub control_plane_url: String,
    /// Mesh WireGuard interface settings.
    pub wireguard: WireGuardConfig,
    /// Reconciler polling interval.
    #[serde(default = "default_reconcile_interval_secs_duration", with = "duration_secs")]
    pub reconcile_interval: Duration,
    /// Bridge (access-side route/NAT) configuration.
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// UDP relay configuration.
    #[serde(default)]
    pub relay: RelayConfig,
    /// TCP ingress configuration.
    #[serde(default)]
    pub ingress: IngressConfig,
    /// Site-to-site tunnel configuration.
    #[serde(default)]
    pub site_to_site: SiteToSiteConfig,
    /// User-access interface configuration.
    #[serde(default)]
    pub user_access: UserAccessConfig,
    /// Telemetry (metrics/logs/audit) configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Local control/introspection API configuration.
    #[serde(default)]
    pub control_api: ControlApiConfig,
    /// Log level, e.g. "info", "debug". Overridden by `RUST_LOG` if set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Mesh WireGuard interface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireGuardConfig {
    /// Interface name, e.g. "wg-mesh0".
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Path to the node's private key file (0600, base64 contents).
    pub private_key_path: String,
    /// UDP listen port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Mesh IP assigned to this node, CIDR notation (e.g. "10.10.0.5/24").
    pub mesh_address: String,
    /// Interface MTU. 0 = driver default.
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Persistent keepalive applied to every peer, 0 = disabled.
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive_secs: u16,
}

/// Access-side route/NAT configuration (SPEC_FULL.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Whether this node acts as a bridge at all.
    #[serde(default)]
    pub enabled: bool,
    /// Access-side network interface (e.g. "eth1").
    #[serde(default)]
    pub access_interface: String,
    /// Access-side CIDRs to route onto the mesh.
    #[serde(default)]
    pub access_subnets: Vec<String>,
    /// Install NAT masquerade for mesh-originated traffic. Defaults to true
    /// when the bridge is enabled (matches §4.5: "NAT flag nil or true").
    #[serde(default = "default_true")]
    pub nat: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            access_interface: String::new(),
            access_subnets: Vec::new(),
            nat: true,
        }
    }
}

/// UDP relay configuration (SPEC_FULL.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Whether the relay should run on this node.
    #[serde(default)]
    pub enabled: bool,
    /// UDP bind port, 0 = OS-assigned.
    #[serde(default)]
    pub bind_port: u16,
    /// Maximum concurrent sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Default session TTL, minimum 30s.
    #[serde(default = "default_relay_ttl_secs_duration", with = "duration_secs")]
    pub default_ttl: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_port: 0,
            max_sessions: default_max_sessions(),
            default_ttl: default_relay_ttl_secs_duration(),
        }
    }
}

/// TCP ingress configuration (SPEC_FULL.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Whether ingress listeners should run on this node.
    #[serde(default)]
    pub enabled: bool,
    /// Maximum concurrent ingress rules.
    #[serde(default = "default_max_ingress_rules")]
    pub max_rules: usize,
    /// Dial timeout for proxied connections to the target, minimum 1s.
    #[serde(default = "default_dial_timeout_secs_duration", with = "duration_secs")]
    pub dial_timeout: Duration,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_rules: default_max_ingress_rules(),
            dial_timeout: default_dial_timeout_secs_duration(),
        }
    }
}

/// Site-to-site tunnel configuration (SPEC_FULL.md §4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteToSiteConfig {
    /// Whether site-to-site tunnels may be provisioned on this node.
    #[serde(default)]
    pub enabled: bool,
}

/// User-access interface configuration (SPEC_FULL.md §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccessConfig {
    /// Whether the user-access interface should run on this node.
    #[serde(default)]
    pub enabled: bool,
    /// Shared WireGuard interface name for external client peers.
    #[serde(default = "default_useraccess_interface")]
    pub interface: String,
    /// UDP listen port for the user-access interface.
    #[serde(default = "default_useraccess_listen_port")]
    pub listen_port: u16,
}

impl Default for UserAccessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interface: default_useraccess_interface(),
            listen_port: default_useraccess_listen_port(),
        }
    }
}

/// Telemetry (metrics/logs/audit buffered batch reporter) configuration
/// (SPEC_FULL.md §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// How often collectors are polled.
    #[serde(default = "default_collect_interval_secs_duration", with = "duration_secs")]
    pub collect_interval: Duration,
    /// How often the buffer is drained and shipped.
    #[serde(default = "default_report_interval_secs_duration", with = "duration_secs")]
    pub report_interval: Duration,
    /// Records per chunk shipped to the reporter.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Buffer capacity cap, expressed as a multiple of `batch_size`
    /// (resolved Open Question 3 — see DESIGN.md).
    #[serde(default = "default_reporter_capacity_multiplier")]
    pub reporter_capacity_multiplier: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            collect_interval: default_collect_interval_secs_duration(),
            report_interval: default_report_interval_secs_duration(),
            batch_size: default_batch_size(),
            reporter_capacity_multiplier: default_reporter_capacity_multiplier(),
        }
    }
}

impl From<&TelemetryConfig> for crate::telemetry::TelemetryConfig {
    fn from(c: &TelemetryConfig) -> Self {
        crate::telemetry::TelemetryConfig {
            collect_interval: c.collect_interval,
            report_interval: c.report_interval,
            batch_size: c.batch_size,
            reporter_capacity_multiplier: c.reporter_capacity_multiplier,
        }
    }
}

/// Local read-only control/introspection API configuration (SPEC_FULL.md §4.A.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlApiConfig {
    /// Whether to bind the control socket at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Unix socket path (ignored on Windows; see `control::server`).
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

impl Default for ControlApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: default_socket_path(),
        }
    }
}

impl NodeConfig {
    /// Load and validate a configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = toml_parser::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every field, delegating to `validation`'s pure functions.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(WgAgentError::Config("node_id cannot be empty".to_string()));
        }
        if self.control_plane_url.is_empty() {
            return Err(WgAgentError::Config(
                "control_plane_url cannot be empty".to_string(),
            ));
        }

        validation::validate_interface_name(&self.wireguard.interface)?;
        validation::validate_file_path(&self.wireguard.private_key_path)?;
        if self.wireguard.mtu != 0 {
            validation::validate_mtu(self.wireguard.mtu)?;
        }
        validation::validate_cidr(&self.wireguard.mesh_address)
            .map_err(|e| WgAgentError::Config(format!("wireguard.mesh_address: {}", e)))?;
        validation::validate_keepalive(self.wireguard.persistent_keepalive_secs)?;

        if self.bridge.enabled {
            if self.bridge.access_interface.is_empty() {
                return Err(WgAgentError::Config(
                    "bridge.access_interface is required when bridge.enabled".to_string(),
                ));
            }
            for subnet in &self.bridge.access_subnets {
                validation::validate_cidr(subnet)
                    .map_err(|e| WgAgentError::Config(format!("bridge.access_subnets: {}", e)))?;
            }
        }

        if self.relay.enabled && self.relay.default_ttl < Duration::from_secs(30) {
            return Err(WgAgentError::Config(
                "relay.default_ttl must be at least 30s".to_string(),
            ));
        }

        if self.ingress.enabled && self.ingress.dial_timeout < Duration::from_secs(1) {
            return Err(WgAgentError::Config(
                "ingress.dial_timeout must be at least 1s".to_string(),
            ));
        }

        if self.user_access.enabled {
            validation::validate_interface_name(&self.user_access.interface)?;
        }

        Ok(())
    }
}

fn default_reconcile_interval_secs_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_interface() -> String {
    "wg-mesh0".to_string()
}

fn default_listen_port() -> u16 {
    51820
}

fn default_mtu() -> u16 {
    1420
}

fn default_keepalive() -> u16 {
    25
}

fn default_true() -> bool {
    true
}

fn default_useraccess_interface() -> String {
    "wg-access0".to_string()
}

fn default_useraccess_listen_port() -> u16 {
    51821
}

fn default_max_sessions() -> usize {
    1024
}

fn default_relay_ttl_secs_duration() -> Duration {
    Duration::from_secs(300)
}


fn default_max_ingress_rules() -> usize {
    256
}

fn default_dial_timeout_secs_duration() -> Duration {
    Duration::from_secs(10)
}


fn default_collect_interval_secs_duration() -> Duration {
    Duration::from_secs(30)
}


fn default_report_interval_secs_duration() -> Duration {
    Duration::from_secs(60)
}


fn default_batch_size() -> usize {
    100
}

fn default_reporter_capacity_multiplier() -> usize {
    2
}


fn default_socket_path() -> String {
    "/var/run/meshnode-agent.sock".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Serializes a `Duration` as whole seconds in TOML, deserializes the same way.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> NodeConfig {
        NodeConfig {
            node_id: "node-a".to_string(),
            control_plane_url: "https://mesh.example.com".to_string(),
            wireguard: WireGuardConfig {
                interface: "wg-mesh0".to_string(),
                private_key_path: "/etc/meshnode-agent/private.key".to_string(),
                listen_port: 51820,
                mesh_address: "10.10.0.5/24".to_string(),
                mtu: 1420,
                persistent_keepalive_secs: 25,
            },
            reconcile_interval: Duration::from_secs(30),
            bridge: BridgeConfig::default(),
            relay: RelayConfig::default(),
            ingress: IngressConfig::default(),
            site_to_site: SiteToSiteConfig::default(),
            user_access: UserAccessConfig::default(),
            telemetry: TelemetryConfig::default(),
            control_api: ControlApiConfig::default(),
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn minimal_config_validates() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn empty_node_id_rejected() {
        let mut c = minimal();
        c.node_id = String::new();
        assert!(c.validate().is_err());
    }

    #[test]
    fn bridge_enabled_requires_access_interface() {
        let mut c = minimal();
        c.bridge.enabled = true;
        assert!(c.validate().is_err());
        c.bridge.access_interface = "eth1".to_string();
        assert!(c.validate().is_ok());
    }

    #[test]
    fn relay_ttl_floor_enforced() {
        let mut c = minimal();
        c.relay.enabled = true;
        c.relay.default_ttl = Duration::from_secs(5);
        assert!(c.validate().is_err());
    }

    #[test]
    fn telemetry_config_converts_to_runtime_type() {
        let c = minimal();
        let rt: crate::telemetry::TelemetryConfig = (&c.telemetry).into();
        assert_eq!(rt.batch_size, c.telemetry.batch_size);
        assert_eq!(rt.reporter_capacity_multiplier, 2);
    }
}
