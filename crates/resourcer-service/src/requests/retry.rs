use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use super::RequestError;

/// Controls how failed fetches are retried.
///
/// Delays grow exponentially from `initial_backoff` by `multiplier` per attempt and are capped
/// at `max_backoff`. Each delay is then randomly shifted by up to `jitter` times its value.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// How often a failed fetch is retried before the error is final.
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// The maximum relative deviation applied to every delay, between `0.0` and `1.0`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// The delay before retrying after the `attempt`-th failure, counting from `0`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + rand::rng().random_range(-jitter..=jitter)
        } else {
            1.0
        };

        Duration::from_secs_f64((capped * factor).max(0.0))
    }

    /// The delay before retrying after `error`, honoring the error's own retry hint.
    pub fn backoff(&self, attempt: u32, error: &RequestError) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        match error.retry_after() {
            Some(after) => delay.max(after),
            None => delay,
        }
    }
}
