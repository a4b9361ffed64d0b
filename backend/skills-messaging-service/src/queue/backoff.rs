//! Exponential backoff for queued jobs, with optional jitter
use rand::Rng;
use std::time::Duration;

use crate::config::DeliveryConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Delay before the second attempt; doubles per attempt after that
    pub base: Duration,
    pub max: Duration,
    /// Add random jitter to retry delays (±20%)
    pub jitter: bool,
}

impl Backoff {
    pub fn from_config(cfg: &DeliveryConfig) -> Self {
        Self {
            initial_delay: cfg.initial_delay,
            base: cfg.backoff_base,
            max: cfg.backoff_max,
            jitter: cfg.jitter,
        }
    }

    /// Delay before attempt number `attempt` (1-based).
    ///
    /// Attempt 1 waits `initial_delay`; attempt `n >= 2` waits
    /// `min(base * 2^(n-2), max)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay;
        }
        let exponent = (attempt - 2).min(31);
        let base_ms = self.base.as_millis() as u64;
        let ms = base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max.as_millis() as u64);
        apply_jitter(Duration::from_millis(ms), self.jitter)
    }
}

fn apply_jitter(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let mut rng = rand::rng();
        let factor = 1.0 + rng.random_range(-0.2..0.2);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    } else {
        base
    }
}
