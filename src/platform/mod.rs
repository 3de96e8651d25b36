//! Platform detection
//!
//! The teacher's `Platform` trait (TUN-device creation, DNS configuration)
//! has no counterpart here: this crate's drivers operate at the kernel
//! WireGuard-interface level (`wireguard::driver::WgController`) and the
//! route/NAT level (`bridge::RouteController`), never raw TUN I/O
//! (SPEC_FULL.md §4.A.7). What survives is OS/container environment
//! detection, used by `service::ServiceMode::detect` and diagnostics.

mod detection;

pub use detection::{detect_environment, ContainerEnvironment, PlatformInfo};
