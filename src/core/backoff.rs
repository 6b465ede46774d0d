//! Bounded exponential backoff with jitter for channel reconnects.
use std::time::Duration;

use rand::Rng;

use crate::config::models::ReconnectConfig;

/// Reconnect policy in parsed form
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Relative jitter in `[0, 1)`
    pub jitter: f64,
    pub max_consecutive_failures: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.3,
            max_consecutive_failures: 8,
        }
    }
}

impl TryFrom<&ReconnectConfig> for BackoffPolicy {
    type Error = humantime::DurationError;

    fn try_from(config: &ReconnectConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            base_delay: humantime::parse_duration(&config.base_delay)?,
            max_delay: humantime::parse_duration(&config.max_delay)?,
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 0.99),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
        })
    }
}

/// Delay generator for one run of consecutive failures.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Capped delay for `attempt` before jitter.
    fn nominal(&self, attempt: u32) -> f64 {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.policy.base_delay.as_secs_f64() * self.policy.multiplier.powi(exponent);
        raw.min(self.policy.max_delay.as_secs_f64())
    }

    /// Next delay, growing per call until [`Backoff::reset`].
    pub fn next_delay(&mut self) -> Duration {
        let capped = self.nominal(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if self.policy.jitter <= 0.0 || capped <= 0.0 {
            return Duration::from_secs_f64(capped.max(0.0));
        }

        let spread = capped * self.policy.jitter;
        let jittered = rand::rng().random_range((capped - spread)..=(capped + spread));
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
