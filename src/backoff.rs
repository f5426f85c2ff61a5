//! Reconnect delay calculation.
//!
//! `delay(n) = min(initial * multiplier^n * (1 + jitter), max)`
//!
//! Jitter is drawn from `[0, jitter]` and capped at `multiplier - 1`, so the
//! sequence of delays never decreases until it is reset.

use crate::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

// Keeps multiplier^n finite; any realistic config hits max_delay long before.
const MAX_EXPONENT: u32 = 64;

/// Exponential backoff state for one session
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay to wait before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.effective_jitter();
        let factor = if jitter > 0.0 {
            1.0 + rand::rng().random_range(0.0..=jitter)
        } else {
            1.0
        };

        Duration::from_secs_f64(base.as_secs_f64() * factor).min(self.config.max_delay)
    }

    /// Back to the initial delay, after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.min(MAX_EXPONENT)).unwrap_or(i32::MAX);
        let secs = self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let capped = secs.min(self.config.max_delay.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped.max(0.0))
        } else {
            self.config.max_delay
        }
    }

    fn effective_jitter(&self) -> f64 {
        self.config
            .jitter
            .min(self.config.multiplier - 1.0)
            .max(0.0)
    }
}
