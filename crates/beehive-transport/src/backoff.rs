//! Exponential backoff for send retries

use beehive_core::TransportConfig;
use std::time::Duration;

/// How failed sends are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Total attempts, including the first
    pub retry_count_max: u32,
}

impl RetryPolicy {
    pub fn new(base_ms: u64, max_ms: u64, retry_count_max: u32) -> Self {
        debug_assert!(max_ms >= base_ms);
        debug_assert!(retry_count_max > 0);
        Self {
            base_ms,
            max_ms,
            retry_count_max,
        }
    }

    /// A single attempt with no waiting
    pub fn none() -> Self {
        Self::new(0, 0, 1)
    }

    /// Wait after failed attempt number `attempt` (0-based)
    ///
    /// `min(base * 2^attempt, max)`
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.max_ms)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }

    /// Whether another attempt follows failed attempt `attempt`
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.retry_count_max
    }
}

impl From<&TransportConfig> for RetryPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self::new(
            config.backoff_base_ms,
            config.backoff_max_ms,
            config.retry_count_max,
        )
    }
}
