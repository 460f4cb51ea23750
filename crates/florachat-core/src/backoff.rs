//! Bounded exponential backoff
//!
//! Shared by connection recovery and history retries. Delays grow by a
//! multiplier from an initial value, are capped, and the number of attempts is
//! bounded.

use crate::config::BackoffConfig;
use core::time::Duration;

/// Attempt counter over a [`BackoffConfig`]
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the given zero-based attempt
    pub fn delay_for(config: &BackoffConfig, attempt: u32) -> Duration {
        let base = config.initial_delay_ms as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = base * config.multiplier.powi(exponent);
        let capped = if delay_ms.is_finite() {
            delay_ms.min(config.max_delay_ms as f64)
        } else {
            config.max_delay_ms as f64
        };
        Duration::from_millis(capped as u64)
    }

    /// Delay for the next attempt, or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = Self::delay_for(&self.config, self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Attempts handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
