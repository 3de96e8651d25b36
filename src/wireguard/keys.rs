//! WireGuard key material
//!
//! Base64-encoded 32-byte key wrappers with redacting `Debug`/`Display`
//! impls. Node-identity key generation is out of scope (SPEC_FULL.md §1
//! Non-goals) — the node's own key pair is always loaded from configuration,
//! never minted here. `PrivateKey::generate`/`KeyPair::generate` are kept as
//! test utilities only.

use crate::error::{Result, WgAgentError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// WireGuard private key (32 bytes, x25519).
#[derive(Clone)]
pub struct PrivateKey {
    secret: Zeroizing<[u8; 32]>,
}

impl PrivateKey {
    /// Generate a random private key. Test/tooling utility only — the
    /// running agent always loads its key from configuration.
    #[cfg(test)]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self {
            secret: Zeroizing::new(secret.to_bytes()),
        }
    }

    /// Create a private key from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: Zeroizing::new(bytes),
        }
    }

    /// Parse a private key from a base64-encoded string.
    pub fn from_base64(s: &str) -> Result<Self> {
        let decoded = BASE64
            .decode(s.trim())
            .map_err(|e| WgAgentError::Config(format!("invalid base64 private key: {}", e)))?;

        if decoded.len() != 32 {
            return Err(WgAgentError::Config(format!(
                "invalid private key length: expected 32 bytes, got {}",
                decoded.len()
            )));
        }

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(Self::from_bytes(bytes))
    }

    /// Load a private key from a file, requiring 0600 (or stricter) permissions.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        #[cfg(unix)]
        {
            let metadata = fs::metadata(path).map_err(|e| {
                WgAgentError::Config(format!("failed to read key file {:?}: {}", path, e))
            })?;
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(WgAgentError::Permission(format!(
                    "private key file {:?} has insecure permissions: {:o} (should be 0600)",
                    path,
                    mode & 0o777
                )));
            }
        }

        let content = fs::read_to_string(path).map_err(|e| {
            WgAgentError::Config(format!("failed to read private key file {:?}: {}", path, e))
        })?;

        Self::from_base64(content.trim())
    }

    /// Save the private key to a file with 0600 permissions.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let encoded = self.to_base64();

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| WgAgentError::Config(format!("failed to create key file {:?}: {}", path, e)))?;

        file.write_all(encoded.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|e| WgAgentError::Config(format!("failed to write key file {:?}: {}", path, e)))?;

        Ok(())
    }

    /// Encode to base64.
    pub fn to_base64(&self) -> String {
        BASE64.encode(*self.secret)
    }

    /// Derive the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(*self.secret);
        let public = X25519PublicKey::from(&secret);
        PublicKey {
            key: public.to_bytes(),
        }
    }

    /// Raw bytes, for handing to the `wg` CLI driver.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

impl fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// WireGuard public key (32 bytes, x25519).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: [u8; 32],
}

impl PublicKey {
    /// Create a public key from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { key: bytes }
    }

    /// Parse a public key from a base64-encoded string.
    pub fn from_base64(s: &str) -> Result<Self> {
        let decoded = BASE64
            .decode(s.trim())
            .map_err(|e| WgAgentError::Config(format!("invalid base64 public key: {}", e)))?;

        if decoded.len() != 32 {
            return Err(WgAgentError::Config(format!(
                "invalid public key length: expected 32 bytes, got {}",
                decoded.len()
            )));
        }

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(Self::from_bytes(bytes))
    }

    /// Encode to base64.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// A base64-encoded 32-byte pre-shared key. Validated the same way as a
/// public key but kept as a distinct type so it's never accidentally passed
/// where a public key is expected.
#[derive(Clone)]
pub struct PresharedKey {
    key: Zeroizing<[u8; 32]>,
}

impl PresharedKey {
    /// Parse a pre-shared key from a base64-encoded string.
    pub fn from_base64(s: &str) -> Result<Self> {
        let decoded = BASE64
            .decode(s.trim())
            .map_err(|e| WgAgentError::Config(format!("invalid base64 preshared key: {}", e)))?;
        if decoded.len() != 32 {
            return Err(WgAgentError::Config(format!(
                "invalid preshared key length: expected 32 bytes, got {}",
                decoded.len()
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(Self {
            key: Zeroizing::new(bytes),
        })
    }

    /// Encode to base64.
    pub fn to_base64(&self) -> String {
        BASE64.encode(*self.key)
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PresharedKey([REDACTED])")
    }
}

/// A private/public key pair.
#[derive(Clone)]
pub struct KeyPair {
    /// Private half.
    pub private: PrivateKey,
    /// Public half, derived from `private`.
    pub public: PublicKey,
}

impl KeyPair {
    /// Test/tooling utility only.
    #[cfg(test)]
    pub fn generate() -> Self {
        let private = PrivateKey::generate();
        let public = private.public_key();
        Self { private, public }
    }

    /// Build a pair from an already-loaded private key.
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    /// Load the node's key pair from its configured private key file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let private = PrivateKey::from_file(path)?;
        Ok(Self::from_private(private))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"[REDACTED]")
            .field("public", &self.public)
            .finish()
    }
}
