//! TOML configuration file loading
//!
//! `NodeConfig` is `serde`-derived and deserializes directly from TOML —
//! unlike the teacher's multi-network schema there is no intermediate
//! wire-shape struct to convert from, since one node agent owns exactly one
//! mesh interface and one control-plane registration.

use super::NodeConfig;
use crate::error::{Result, WgAgentError};
use std::fs;
use std::path::Path;

/// Read and parse a `NodeConfig` from a TOML file. Does not validate —
/// callers should call `NodeConfig::validate` (as `NodeConfig::from_file` does).
pub fn load<P: AsRef<Path>>(path: P) -> Result<NodeConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .map_err(|e| WgAgentError::Config(format!("failed to read config file {:?}: {}", path, e)))?;
    parse(&contents)
}

/// Parse a `NodeConfig` from a TOML string.
pub fn parse(toml: &str) -> Result<NodeConfig> {
    toml::from_str(toml).map_err(|e| WgAgentError::Config(format!("failed to parse TOML config: {}", e)))
}
