//! Retry configuration and backoff calculation.
//!
//! The executor itself lives on [`ErrorHandler`](crate::ErrorHandler) because
//! it shares the circuit breaker and the error reporting path; this module
//! only describes *how* to retry.

use crate::classify::is_retryable_message;
use crate::settings::ResilienceSettings;
use std::time::Duration;

/// Per-operation retry behavior supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one. Never below 1.
    pub max_attempts: usize,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap applied to every computed delay.
    pub max_delay: Duration,
    /// Factor applied per attempt. Never below 1.0.
    pub backoff_multiplier: f64,
    /// Phrases that mark an error as retryable; `None` uses the defaults.
    pub retryable_errors: Option<Vec<String>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            retryable_errors: None,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the default config from loaded settings.
    pub fn from_settings(settings: &ResilienceSettings) -> Self {
        Self::new()
            .with_max_attempts(settings.max_attempts)
            .with_base_delay(settings.base_delay)
            .with_max_delay(settings.max_delay)
            .with_backoff_multiplier(settings.backoff_multiplier)
    }

    /// Set the total number of attempts (clamped to at least 1).
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the backoff multiplier (clamped to at least 1.0).
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    /// Replace the default retryable phrases.
    pub fn with_retryable_errors<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// `min(base_delay * backoff_multiplier^(attempt - 1), max_delay)`,
    /// computed in whole milliseconds.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let exponential = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;

        Duration::from_millis(exponential.min(cap) as u64)
    }

    /// Whether an error with this message should be retried.
    pub fn is_retryable(&self, message: &str) -> bool {
        is_retryable_message(message, self.retryable_errors.as_deref())
    }
}

/// Predefined retry configs for common scenarios.
impl RetryConfig {
    /// Quick operations: short delays, few attempts.
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            retryable_errors: None,
        }
    }

    pub fn standard() -> Self {
        Self::default()
    }

    /// Expensive operations such as catalog synchronization.
    pub fn slow() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            retryable_errors: None,
        }
    }

    /// Remote function invocations.
    pub fn network() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retryable_errors: None,
        }
    }

    /// Data store reads and writes.
    pub fn database() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            retryable_errors: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_should_grow_exponentially_up_to_cap() {
        // Given: base 100ms, multiplier 2, cap 1s
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_max_delay(Duration::from_millis(1000));

        // When: computing delays for attempts 1..=7
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| config.delay_for_attempt(attempt).as_millis() as u64)
            .collect();

        // Then: the sequence doubles and then saturates
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000, 1000]);
    }

    #[test]
    fn test_multiplier_of_one_should_give_constant_delays() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(300))
            .with_backoff_multiplier(1.0);

        for attempt in 1..=5 {
            assert_eq!(config.delay_for_attempt(attempt), Duration::from_millis(300));
        }
    }

    #[test]
    fn test_huge_attempt_numbers_should_stay_capped() {
        let config = RetryConfig::standard();
        assert_eq!(config.delay_for_attempt(10_000), config.max_delay);
    }

    #[test]
    fn test_builder_should_clamp_invalid_values() {
        let config = RetryConfig::new()
            .with_max_attempts(0)
            .with_backoff_multiplier(0.25);

        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.backoff_multiplier, 1.0);
    }

    #[test]
    fn test_custom_retryable_errors_should_drive_classification() {
        let config = RetryConfig::new().with_retryable_errors(["lock not available"]);

        assert!(config.is_retryable("ERROR: Lock Not Available"));
        assert!(!config.is_retryable("network error"));
        assert!(RetryConfig::new().is_retryable("network error"));
    }

    #[test]
    fn test_from_settings_should_copy_backoff_parameters() {
        let settings = ResilienceSettings {
            max_attempts: 7,
            base_delay: Duration::from_millis(20),
            ..ResilienceSettings::default()
        };
        let config = RetryConfig::from_settings(&settings);

        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.base_delay, Duration::from_millis(20));
        assert_eq!(config.max_delay, settings.max_delay);
    }
}
