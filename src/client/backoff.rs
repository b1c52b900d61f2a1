use std::time::Duration;

use anyhow::{anyhow, Result};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(250);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);

/// Reconnect schedule: `max_attempts` connects, with a growing sleep between
/// consecutive failures.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl BackoffPolicy {
    /// Sleep after the `failures`th consecutive failure (1-based).
    ///
    /// `base * multiplier^(failures-1)`, capped at `max_delay`. Never decreases
    /// as `failures` grows.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(1024) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// The sleeps of one full round: one fewer than `max_attempts`.
    pub fn delays(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|n| self.delay_for(n)).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("backoff max_attempts must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(anyhow!(
                "backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(anyhow!(
                "backoff max_delay ({:?}) is shorter than base_delay ({:?})",
                self.max_delay,
                self.base_delay
            ));
        }
        Ok(())
    }
}
