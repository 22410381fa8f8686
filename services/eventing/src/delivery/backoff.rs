//! Exponential backoff between attempts.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Upper bound of the random extra delay, as a fraction of the delay.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// A backoff that never waits.
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before the attempt following `retries` failures:
    /// `base * 2^retries`, capped at `max`, plus jitter.
    pub fn delay(&self, retries: u32) -> Duration {
        let factor = 2u32.saturating_pow(retries.min(31));
        let capped = self.base.saturating_mul(factor).min(self.max);
        if self.jitter <= 0.0 || capped.is_zero() {
            return capped;
        }
        let extra = rand::rng().random_range(0.0..self.jitter);
        capped + capped.mul_f64(extra)
    }
}
