//! Runtime configuration.

use std::time::Duration;

/// Resolved settings for a relayd instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP address the inbound server binds.
    pub bind_addr: String,
    /// Deadline for a whole outbound exchange; `None` leaves it unbounded.
    pub upstream_timeout: Option<Duration>,
}

impl RelayConfig {
    /// Builds a config from flag-level values. A zero timeout disables the
    /// outbound deadline entirely.
    pub fn new(bind_addr: impl Into<String>, upstream_timeout_secs: u64) -> Self {
        let upstream_timeout = match upstream_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            bind_addr: bind_addr.into(),
            upstream_timeout,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:8080", 30)
    }
}
