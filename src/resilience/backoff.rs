use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential part of the delay before retry number `attempt` (0 for the first retry),
/// capped at `max_delay`. No jitter.
pub fn base_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base_ms = config.initial_delay.as_millis() as f64;
    let max_ms = config.max_delay.as_millis() as f64;
    let backoff_ms = base_ms * config.exponential_factor.powi(attempt.min(i32::MAX as u32) as i32);

    // Overflowing factors saturate at the cap
    let capped_ms = if backoff_ms.is_finite() {
        backoff_ms.min(max_ms)
    } else {
        max_ms
    };

    Duration::from_millis(capped_ms.max(0.0).round() as u64)
}

/// Uniform jitter in `[0, jitter)`, whole milliseconds
pub fn jitter(config: &RetryConfig) -> Duration {
    let jitter_ms = config.jitter.as_millis() as f64;
    if jitter_ms <= 0.0 {
        return Duration::ZERO;
    }
    let sample = rand::random::<f64>() * jitter_ms;
    Duration::from_millis((sample.floor() as u64).min(jitter_ms as u64 - 1))
}

/// Full delay before retry `attempt`: `min(initial * factor^attempt, max) + [0, jitter)`
pub fn delay_for(config: &RetryConfig, attempt: u32) -> Duration {
    base_delay(config, attempt) + jitter(config)
}

/// Stateful cursor over the retry delays of one call
pub struct ExponentialBackoff {
    /// Retries handed out so far
    current_attempt: u32,
    /// Configuration for the retry strategy
    config: RetryConfig,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            current_attempt: 0,
            config,
        }
    }

    /// Get the next backoff duration, or None once `max_retries` delays were handed out
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.current_attempt >= self.config.max_retries {
            return None;
        }

        let delay = delay_for(&self.config, self.current_attempt);
        self.current_attempt += 1;
        Some(delay)
    }

    /// Retries consumed so far
    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    /// Reset the backoff to start from the beginning
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
