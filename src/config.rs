//! Session configuration

use std::time::Duration;

/// Configuration shared by every device session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a command waits for its response before giving up
    pub command_timeout: Duration,

    /// How long device selection may scan before reporting no device
    pub scan_timeout: Duration,

    /// Take control of a fitness machine and reset it right after connecting
    pub request_control_on_connect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(3),
            scan_timeout: Duration::from_secs(30),
            request_control_on_connect: true,
        }
    }
}

impl SessionConfig {
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    pub fn with_request_control(mut self, enabled: bool) -> Self {
        self.request_control_on_connect = enabled;
        self
    }
}
