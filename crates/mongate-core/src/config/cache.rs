//! Authorization context cache configuration.

use chrono::{Duration, TimeDelta};
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Configuration for the per-user authorization context cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a resolved context stays valid, in seconds. Must be positive.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
        }
    }
}

impl CacheConfig {
    /// The TTL as a duration.
    pub fn ttl(&self) -> Duration {
        i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_seconds == 0 {
            return Err(ConfigError::Config(
                "cache.ttl_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_ttl_seconds() -> u64 {
    300
}
