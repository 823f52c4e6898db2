//! Per-actor sliding window rate limiter.

use dashmap::DashMap;

use crate::RateLimitConfig;

/// Sliding window of admitted request times per actor key.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Vec<chrono::DateTime<chrono::Utc>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Admit or reject a request from `key`.
    ///
    /// Rejected requests are not recorded, so they do not extend the window.
    pub fn is_allowed(&self, key: &str, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.check(key, now).is_ok()
    }

    /// Like [`is_allowed`](Self::is_allowed), but returns how long until the
    /// oldest request in the window expires when the limit is hit.
    pub fn check(
        &self,
        key: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), chrono::Duration> {
        let window = self.config.window();

        let mut entry = self.windows.entry(key.to_string()).or_default();
        let timestamps = entry.value_mut();

        // Remove expired timestamps
        timestamps.retain(|t| now - *t < window);

        if timestamps.len() >= self.config.max_requests {
            let oldest = timestamps.first().copied().unwrap_or(now);
            let retry_after = oldest
                .checked_add_signed(window)
                .map(|expires| expires - now)
                .unwrap_or(window);
            return Err(retry_after.max(chrono::Duration::zero()));
        }

        timestamps.push(now);
        Ok(())
    }

    /// Drop keys with no requests inside the window to bound memory.
    pub fn cleanup(&self, now: chrono::DateTime<chrono::Utc>) {
        let window = self.config.window();
        self.windows.retain(|_, timestamps| {
            timestamps.retain(|t| now - *t < window);
            !timestamps.is_empty()
        });
    }

    pub fn clear(&self) {
        self.windows.clear();
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
