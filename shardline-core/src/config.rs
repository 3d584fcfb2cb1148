//! Replication configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Consistency level a read is served at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadMode {
    /// Served by the broadcaster's local store, ordered after every write
    /// already dispatched on the branch
    #[default]
    Linearizable,
    /// May be served by any caught-up replier; falls back to the broadcaster
    Outdated,
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// How long a write waits for acknowledgements before the ack policy
    /// is evaluated for the last time
    pub ack_timeout: Duration,

    /// How long a listener waits for the broadcaster to answer its registration
    pub registration_timeout: Duration,

    /// How long a client proxy waits for a master to answer
    pub request_timeout: Duration,

    /// Number of versions a replier may trail the broadcaster and still serve reads
    pub freshness_bound: u64,

    /// Writes kept in the broadcaster's in-memory log for listener catch-up
    pub max_log_size: usize,

    /// Read mode used by `MasterAccess::read`
    pub default_read_mode: ReadMode,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            registration_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            freshness_bound: 0,
            max_log_size: 10_000,
            default_read_mode: ReadMode::Linearizable,
        }
    }
}

impl ReplicationConfig {
    /// Set ack timeout
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set registration timeout
    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    /// Set request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set replier freshness bound
    pub fn with_freshness_bound(mut self, versions: u64) -> Self {
        self.freshness_bound = versions;
        self
    }

    /// Set catch-up log size
    pub fn with_max_log_size(mut self, size: usize) -> Self {
        self.max_log_size = size;
        self
    }

    /// Set default read mode
    pub fn with_read_mode(mut self, mode: ReadMode) -> Self {
        self.default_read_mode = mode;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.ack_timeout.is_zero() {
            return Err(Error::config("ack_timeout must be non-zero"));
        }

        if self.registration_timeout.is_zero() {
            return Err(Error::config("registration_timeout must be non-zero"));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::config("request_timeout must be non-zero"));
        }

        if self.max_log_size == 0 {
            return Err(Error::config("max_log_size must be at least 1"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReplicationConfig::default();
        assert_eq!(config.default_read_mode, ReadMode::Linearizable);
        assert_eq!(config.freshness_bound, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ReplicationConfig::default()
            .with_ack_timeout(Duration::from_millis(200))
            .with_freshness_bound(4)
            .with_read_mode(ReadMode::Outdated)
            .with_max_log_size(16);
        assert_eq!(config.ack_timeout, Duration::from_millis(200));
        assert_eq!(config.freshness_bound, 4);
        assert_eq!(config.default_read_mode, ReadMode::Outdated);
        assert_eq!(config.max_log_size, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_log_size_rejected() {
        let config = ReplicationConfig::default().with_max_log_size(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_ack_timeout_rejected() {
        let config = ReplicationConfig::default().with_ack_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ReplicationConfig::default().with_read_mode(ReadMode::Outdated);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReplicationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.default_read_mode, ReadMode::Outdated);
        assert_eq!(parsed.ack_timeout, config.ack_timeout);
    }
}
