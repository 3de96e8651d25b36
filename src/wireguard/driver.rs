//! WireGuard interface driver
//!
//! Shells out to the `wg`/`ip` CLI tools the same way `platform::linux`
//! shells out to `ip`/`resolvconf` — the interface is managed at the
//! kernel-module level, never via a userspace crypto engine (SPEC_FULL.md
//! §1 Non-goals).

use crate::error::{Result, WgAgentError};
use std::process::Command;
use tracing::{debug, info, warn};

/// One peer configuration line as the WireGuard driver understands it.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    /// Base64-encoded public key.
    pub public_key: String,
    /// Allowed-IP CIDRs.
    pub allowed_ips: Vec<String>,
    /// "host:port", or empty if the peer has no known endpoint.
    pub endpoint: String,
    /// Optional base64-encoded pre-shared key.
    pub preshared_key: Option<String>,
    /// Persistent keepalive in seconds, 0 = disabled.
    pub persistent_keepalive: u16,
}

/// Driver seam for the local WireGuard interface. A Linux implementation
/// shells to `ip`/`wg`; other platforms would implement this trait against
/// their own primitives.
pub trait WgController: Send + Sync {
    /// Create the interface if absent, and set its private key and listen port.
    fn setup_interface(&self, name: &str, private_key: &str, listen_port: u16) -> Result<()>;
    /// Remove the interface. Idempotent: absent interface is not an error.
    fn teardown_interface(&self, name: &str) -> Result<()>;
    /// Assign an address and bring the interface up.
    fn set_address(&self, name: &str, mesh_ip: &str) -> Result<()>;
    /// Set the interface MTU. Called only when a nonzero MTU is configured.
    fn set_mtu(&self, name: &str, mtu: u16) -> Result<()>;
    /// Add or update a peer (upsert semantics, as `wg set ... peer` already has).
    fn upsert_peer(&self, interface: &str, peer: &PeerConfig) -> Result<()>;
    /// Remove a peer by public key. Idempotent.
    fn remove_peer(&self, interface: &str, public_key: &str) -> Result<()>;
}

/// Linux `wg`/`ip` driven controller.
pub struct LinuxWgController;

impl LinuxWgController {
    /// Construct a new controller. Stateless: every call re-derives what it
    /// needs from the live interface via `wg`/`ip`.
    pub fn new() -> Self {
        Self
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!("wireguard driver: {} {:?}", program, args);
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

    fn interface_exists(&self, name: &str) -> bool {
        Command::new("ip")
            .args(["link", "show", name])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

impl Default for LinuxWgController {
    fn default() -> Self {
        Self::new()
    }
}

impl WgController for LinuxWgController {
    fn setup_interface(&self, name: &str, private_key: &str, listen_port: u16) -> Result<()> {
        if !self.interface_exists(name) {
            info!("wireguard driver: creating interface {}", name);
            self.run("ip", &["link", "add", "dev", name, "type", "wireguard"])?;
        } else {
            debug!("wireguard driver: interface {} already exists", name);
        }

        // `wg setconf` reads from a file; `wg set` takes the key on the
        // command line via a fd, but the simplest portable invocation pipes
        // through a temp file using `wg set ... private-key /dev/stdin`-style
        // is unavailable without extra plumbing, so we use a short-lived
        // temp file with restrictive permissions.
        let mut keyfile = write_temp_key(private_key)?;
        let path = keyfile_path(&mut keyfile)?;
        self.run(
            "wg",
            &[
                "set",
                name,
                "private-key",
                &path,
                "listen-port",
                &listen_port.to_string(),
            ],
        )?;

        Ok(())
    }

    fn teardown_interface(&self, name: &str) -> Result<()> {
        if !self.interface_exists(name) {
            debug!("wireguard driver: interface {} already absent", name);
            return Ok(());
        }
        self.run("ip", &["link", "set", name, "down"])?;
        self.run("ip", &["link", "delete", name])?;
        info!("wireguard driver: interface {} destroyed", name);
        Ok(())
    }

    fn set_address(&self, name: &str, mesh_ip: &str) -> Result<()> {
        self.run("ip", &["address", "add", mesh_ip, "dev", name])?;
        self.run("ip", &["link", "set", name, "up"])?;
        Ok(())
    }

    fn set_mtu(&self, name: &str, mtu: u16) -> Result<()> {
        self.run("ip", &["link", "set", name, "mtu", &mtu.to_string()])?;
        debug!("wireguard driver: set {} mtu to {}", name, mtu);
        Ok(())
    }

    fn upsert_peer(&self, interface: &str, peer: &PeerConfig) -> Result<()> {
        let allowed = peer.allowed_ips.join(",");
        let mut args = vec![
            "set".to_string(),
            interface.to_string(),
            "peer".to_string(),
            peer.public_key.clone(),
            "allowed-ips".to_string(),
            allowed,
        ];

        if !peer.endpoint.is_empty() {
            args.push("endpoint".to_string());
            args.push(peer.endpoint.clone());
        }
        if peer.persistent_keepalive > 0 {
            args.push("persistent-keepalive".to_string());
            args.push(peer.persistent_keepalive.to_string());
        }

        let args_ref: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.run("wg", &args_ref)?;
        debug!(
            "wireguard driver: upserted peer {} on {}",
            peer.public_key, interface
        );
        Ok(())
    }

    fn remove_peer(&self, interface: &str, public_key: &str) -> Result<()> {
        if let Err(e) = self.run("wg", &["set", interface, "peer", public_key, "remove"]) {
            warn!("wireguard driver: remove_peer best-effort failure: {}", e);
        }
        Ok(())
    }
}

/// Write a base64-encoded key to a short-lived, 0600-permissioned temp file,
/// for passing secrets to `wg set ... private-key`/`preshared-key` without
/// putting them on the command line (visible in `ps`). Shared with
/// `sitetosite`'s per-tunnel peer configuration.
pub fn write_temp_key(key: &str) -> Result<tempfile::NamedTempFile> {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let mut file = tempfile::NamedTempFile::new()
        .map_err(|e| WgAgentError::Driver(format!("failed to create temp key file: {}", e)))?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))
        .map_err(|e| WgAgentError::Driver(format!("failed to chmod temp key file: {}", e)))?;
    file.write_all(key.as_bytes())
        .map_err(|e| WgAgentError::Driver(format!("failed to write temp key file: {}", e)))?;
    Ok(file)
}

fn keyfile_path(file: &mut tempfile::NamedTempFile) -> Result<String> {
    file.path()
        .to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| WgAgentError::Driver("temp key file path is not valid UTF-8".to_string()))
}
