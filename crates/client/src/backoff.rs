//! Delays between attempts.

use std::fmt::Debug;
use std::time::Duration;

use rand::Rng;

/// Decides how long to wait before a retry.
pub trait Backoff: Debug + Send + Sync + 'static {
    /// Delay before retry number `retry` (zero for the first retry).
    fn delay(&self, retry: u32) -> Duration;
}

/// Configuration for [`ExponentialBackoff`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any delay, jitter included.
    pub max: Duration,
    /// Fraction of the delay randomly added or removed, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

/// `base * 2^retry`, capped at `max`, with symmetric random jitter.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
}

impl ExponentialBackoff {
    /// Create an exponential backoff.
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// The delay for `retry` before jitter is applied.
    pub fn nominal(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.config
            .base
            .checked_mul(factor)
            .map_or(self.config.max, |delay| delay.min(self.config.max))
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal(retry);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }

        let scale = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        nominal.mul_f64(scale).min(self.config.max)
    }
}

/// The same delay before every retry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConstantBackoff(pub Duration);

impl Backoff for ConstantBackoff {
    fn delay(&self, _retry: u32) -> Duration {
        self.0
    }
}
