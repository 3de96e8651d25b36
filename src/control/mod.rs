//! Local control/introspection API
//!
//! Read-only introspection over this node's own reconciled state, served
//! over a Unix socket (Linux/macOS) or Named Pipe (Windows) as
//! line-delimited JSON. There is no connect/disconnect/reload surface here:
//! a node agent's single mesh interface is owned by `main`, not by a
//! control client (SPEC_FULL.md §4.A.8).

mod api;
mod handler;
mod server;

pub use api::{ApiError, ApiRequest, ApiResponse, ControlAction};
pub use handler::{CommandHandler, NodeHandles};
pub use server::{ControlServer, DEFAULT_SOCKET_PATH};

#[cfg(windows)]
pub use server::DEFAULT_PIPE_NAME;
