//! WireGuard interface management
//!
//! Key material, the peer-ID⇄pubkey index, the interface driver, and the
//! manager that keeps the mesh interface converged with desired state. The
//! interface is managed at the kernel-module level via `wg`/`ip` — there is
//! no userspace crypto/TUN engine here (SPEC_FULL.md §1 Non-goals).

pub mod driver;
mod keys;
pub mod manager;
pub mod peer_index;

pub use driver::{LinuxWgController, PeerConfig, WgController};
pub use keys::{KeyPair, PresharedKey, PrivateKey, PublicKey};
pub use manager::{WireGuardManager, WireGuardSettings};
pub use peer_index::PeerIndex;
