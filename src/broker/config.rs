//! Broker configuration

use std::time::Duration;

/// Lease broker configuration options
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Display width applied when a lease request does not name a mode
    pub default_width: u32,

    /// Display height applied when a lease request does not name a mode
    pub default_height: u32,

    /// Ceiling on slot enable during a lease grant
    pub enable_timeout: Duration,

    /// Ceiling on the serving teardown inside release
    pub teardown_timeout: Duration,

    /// How long a disconnected workload may reclaim its lease before the
    /// slot is taken back. Zero tears down immediately on connection loss.
    pub grace_period: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_width: 1920,
            default_height: 1080,
            enable_timeout: Duration::from_secs(10),
            teardown_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    /// Set the mode used when a request does not carry one
    pub fn default_mode(mut self, width: u32, height: u32) -> Self {
        self.default_width = width;
        self.default_height = height;
        self
    }

    /// Set the enable timeout
    pub fn enable_timeout(mut self, timeout: Duration) -> Self {
        self.enable_timeout = timeout;
        self
    }

    /// Set the teardown timeout
    pub fn teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    /// Set the reclaim grace period
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();

        assert_eq!(config.default_width, 1920);
        assert_eq!(config.default_height, 1080);
        assert_eq!(config.enable_timeout, Duration::from_secs(10));
        assert_eq!(config.teardown_timeout, Duration::from_secs(10));
        assert_eq!(config.grace_period, Duration::from_secs(10));
    }

    #[test]
    fn test_builder_chaining() {
        let config = BrokerConfig::default()
            .default_mode(1280, 720)
            .enable_timeout(Duration::from_secs(3))
            .teardown_timeout(Duration::from_secs(4))
            .grace_period(Duration::from_secs(30));

        assert_eq!(config.default_width, 1280);
        assert_eq!(config.default_height, 720);
        assert_eq!(config.enable_timeout, Duration::from_secs(3));
        assert_eq!(config.teardown_timeout, Duration::from_secs(4));
        assert_eq!(config.grace_period, Duration::from_secs(30));
    }
}
