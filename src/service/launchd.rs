//! LaunchDaemon service integration for macOS
//!
//! This module provides integration with macOS launchd service manager.

use super::{Service, ServiceState, ServiceStatus};
use crate::error::WgAgentError;
use std::time::Instant;
use tracing::{debug, info};

/// LaunchDaemon service implementation
pub struct LaunchdService {
    running: bool,
    start_time: Option<Instant>,
}

impl LaunchdService {
    /// Create a new launchd service
    pub fn new() -> Self {
        Self {
            running: false,
            start_time: None,
        }
    }
}

impl Default for LaunchdService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for LaunchdService {
    fn init(&mut self) -> Result<(), WgAgentError> {
        info!("Initializing launchd service");
        Ok(())
    }

    fn start(&mut self) -> Result<(), WgAgentError> {
        info!("Starting launchd service");
        self.running = true;
        self.start_time = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), WgAgentError> {
        info!("Stopping launchd service");
        self.running = false;
        Ok(())
    }

    fn reload(&mut self) -> Result<(), WgAgentError> {
        info!("Reloading launchd service");
        // Reload logic would go here
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
        debug!("Launchd service ready");
        // Launchd doesn't require explicit readiness notification
        Ok(())
    }

    fn notify_stopping(&self) -> Result<(), WgAgentError> {
        debug!("Launchd service stopping");
        Ok(())
    }

    fn setup_signal_handlers(&mut self) -> Result<(), WgAgentError> {
        info!("Setting up signal handlers for launchd service");
        // Signal handling would be implemented here
        // Typically SIGTERM for graceful shutdown, SIGHUP for reload
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launchd_service_creation() {
        let service = LaunchdService::new();
        assert!(!service.is_running());
    }

    #[test]
    fn test_launchd_service_lifecycle() {
        let mut service = LaunchdService::new();
        
        service.init().unwrap();
        service.start().unwrap();
        assert!(service.is_running());

        let status = service.status();
        assert_eq!(status.state, ServiceState::Running);

        service.stop().unwrap();
        assert!(!service.is_running());
    }
}
