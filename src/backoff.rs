//! Retry delay policy.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with jitter.
///
/// `delay(n)` is `min(base * 2^(n-1), max)` plus up to `jitter * delay`, and
/// never below a provider-supplied retry-after.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32, retry_after: Option<Duration>) -> Duration {
        let sample = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=1.0)
        } else {
            0.0
        };
        self.delay_with(failures, retry_after, sample)
    }

    /// Deterministic form of [`Backoff::delay`]; `sample` is in `0.0..=1.0`.
    pub fn delay_with(&self, failures: u32, retry_after: Option<Duration>, sample: f64) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let raw = self.base.saturating_mul(1u32 << exponent).min(self.max);
        let spread = raw.mul_f64(self.jitter * sample.clamp(0.0, 1.0));
        let delay = raw.saturating_add(spread);

        match retry_after {
            Some(floor) if floor > delay => floor,
            _ => delay,
        }
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_secs(config.base_secs),
            Duration::from_secs(config.max_secs),
            config.jitter,
        )
    }
}
