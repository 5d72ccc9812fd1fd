//! Configuration types for devmapper
//!
//! Every field has a default, so an empty document deserializes to the
//! stock configuration.

use crate::types::{DEFAULT_KEYS_PER_NODE, MAX_KEYS_PER_NODE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default minor-number capacity
pub const DEFAULT_MAX_DEVICES: u32 = 256;

/// Root configuration for a device mapper instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Number of minor numbers available (minors `0..max_devices`)
    pub max_devices: u32,
    /// Keys per index node (fan-out of the lookup tree)
    pub keys_per_node: usize,
    /// Suspend behaviour
    pub suspend: SuspendConfig,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            max_devices: DEFAULT_MAX_DEVICES,
            keys_per_node: DEFAULT_KEYS_PER_NODE,
            suspend: SuspendConfig::default(),
        }
    }
}

impl MapperConfig {
    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_devices == 0 {
            return Err(ConfigError::NoDevices);
        }
        if self.keys_per_node < 2 {
            return Err(ConfigError::FanoutTooSmall(self.keys_per_node));
        }
        if self.keys_per_node > MAX_KEYS_PER_NODE {
            return Err(ConfigError::FanoutTooLarge(self.keys_per_node));
        }
        if self.suspend.drain_timeout_ms == Some(0) {
            return Err(ConfigError::ZeroDrainTimeout);
        }
        Ok(())
    }
}

/// Suspend configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspendConfig {
    /// Give up draining in-flight I/O after this many milliseconds.
    /// `None` waits for every outstanding request to complete.
    pub drain_timeout_ms: Option<u64>,
}

impl SuspendConfig {
    /// Drain timeout as a `Duration`
    #[must_use]
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_devices must be at least 1")]
    NoDevices,
    #[error("keys_per_node must be at least 2, got {0}")]
    FanoutTooSmall(usize),
    #[error("keys_per_node must be at most {max}, got {0}", max = MAX_KEYS_PER_NODE)]
    FanoutTooLarge(usize),
    #[error("suspend.drain_timeout_ms must be positive when set")]
    ZeroDrainTimeout,
}
