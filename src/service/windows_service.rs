//! Windows Service Control Manager integration
//!
//! This module provides integration with Windows Service Control Manager (SCM).
//! Currently a stub implementation - full Windows service support to be added.

use super::{Service, ServiceState, ServiceStatus};
use crate::error::WgAgentError;
use std::time::Instant;
use tracing::{info, warn};

/// Windows Service implementation
pub struct WindowsService {
    running: bool,
    start_time: Option<Instant>,
}

impl WindowsService {
    /// Create a new Windows service
    pub fn new() -> Self {
        Self {
            running: false,
            start_time: None,
        }
    }
}

impl Default for WindowsService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for WindowsService {
    fn init(&mut self) -> Result<(), WgAgentError> {
        warn!("Windows Service not yet fully implemented");
        Ok(())
    }

    fn start(&mut self) -> Result<(), WgAgentError> {
        info!("Starting Windows service (stub)");
        self.running = true;
        self.start_time = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), WgAgentError> {
        info!("Stopping Windows service (stub)");
        self.running = false;
        Ok(())
    }

    fn reload(&mut self) -> Result<(), WgAgentError> {
        info!("Reloading Windows service (stub)");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn status(&self) -> ServiceStatus {
        let uptime = self
            .start_time
            .map(|start| Instant::now().duration_since(start));

        ServiceStatus {
            state: if self.running {
                ServiceState::Running
            } else {
                ServiceState::Stopped
            },
            uptime,
            pid: Some(std::process::id()),
            last_error: None,
        }
    }

    fn notify_ready(&self) -> Result<(), WgAgentError> {
        info!("Windows service ready (stub)");
        // Would notify SCM here
        Ok(())
    }

    fn notify_stopping(&self) -> Result<(), WgAgentError> {
        info!("Windows service stopping (stub)");
        Ok(())
    }

    fn setup_signal_handlers(&mut self) -> Result<(), WgAgentError> {
        info!("Setting up signal handlers for Windows service (stub)");
        // Would set up Windows event handlers here
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_service_creation() {
        let service = WindowsService::new();
        assert!(!service.is_running());
    }

    #[test]
    fn test_windows_service_lifecycle() {
        let mut service = WindowsService::new();
        
        service.init().unwrap();
        service.start().unwrap();
        assert!(service.is_running());

        let status = service.status();
        assert_eq!(status.state, ServiceState::Running);

        service.stop().unwrap();
        assert!(!service.is_running());
    }
}
