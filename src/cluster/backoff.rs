//! Exponential backoff for registration retries

use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with uniform additive jitter
///
/// `delay(n) = min(base * 2^(n-1), cap) + jitter`, where jitter is uniform in
/// `[0, jitter_ratio * un-jittered delay]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter_ratio: 0.25,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            ..Default::default()
        }
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Delay before retry `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.cap)
    }

    /// Delay with jitter placed at `unit` (0.0..=1.0) of the jitter window
    pub fn delay_at(&self, attempt: u32, unit: f64) -> Duration {
        let delay = self.base_delay(attempt);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0) * unit.clamp(0.0, 1.0);
        delay + delay.mul_f64(ratio)
    }

    /// Delay before retry `attempt` (1-based) with random jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let unit: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_at(attempt, unit)
    }
}
