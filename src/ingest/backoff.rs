//! Bounded exponential backoff between failed ingest cycles.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay after the first failure, in milliseconds.
    pub base_ms: u64,
    /// Cap on any single delay, in milliseconds.
    pub max_ms: u64,
    /// Growth factor per additional consecutive failure.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 300_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    /// Delay after `consecutive_failures` failures in a row (1 = first failure).
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures <= 1 {
            return Duration::from_millis(self.base_ms.min(self.max_ms));
        }
        let exp = i32::try_from(consecutive_failures - 1).unwrap_or(i32::MAX);
        let ms = self.base_ms as f64 * self.multiplier.powi(exp);
        if !ms.is_finite() || ms >= self.max_ms as f64 {
            Duration::from_millis(self.max_ms)
        } else {
            Duration::from_millis(ms as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps() {
        let p = BackoffPolicy {
            base_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
        };
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
        assert_eq!(p.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_millis(1_000));
    }
}
