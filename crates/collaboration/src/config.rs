/// Engine configuration
use serde::{Deserialize, Serialize};

use crate::{CollaborationError, Result};

/// Longest accepted heartbeat interval or rate-limit window (one year)
pub const MAX_INTERVAL_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// Configuration for the collaboration engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum silence before a presence record is dropped
    pub heartbeat_interval_ms: u64,

    /// Request admission limits, shared by connects and edits
    pub rate_limit: RateLimitConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON config. Missing fields fall back to the defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CollaborationError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject intervals that are zero or longer than [`MAX_INTERVAL_MS`],
    /// and a zero request budget
    pub fn validate(&self) -> Result<()> {
        check_interval("heartbeat_interval_ms", self.heartbeat_interval_ms)?;
        check_interval("rate_limit.window_ms", self.rate_limit.window_ms)?;
        if self.rate_limit.max_requests == 0 {
            return Err(CollaborationError::InvalidConfig(
                "rate_limit.max_requests must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> chrono::Duration {
        interval(self.heartbeat_interval_ms)
    }
}

/// Sliding-window rate limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> chrono::Duration {
        interval(self.window_ms)
    }
}

fn check_interval(field: &str, ms: u64) -> Result<()> {
    if ms == 0 || ms > MAX_INTERVAL_MS {
        return Err(CollaborationError::InvalidConfig(format!(
            "{} must be between 1 and {}, got {}",
            field, MAX_INTERVAL_MS, ms
        )));
    }
    Ok(())
}

/// Milliseconds as a duration, capped at [`MAX_INTERVAL_MS`]
fn interval(ms: u64) -> chrono::Duration {
    let ms = i64::try_from(ms.min(MAX_INTERVAL_MS)).unwrap_or(i64::MAX);
    chrono::Duration::milliseconds(ms)
}
