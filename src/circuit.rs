//! Per-operation circuit breaker.
//!
//! # States
//! - Closed: failures below the threshold, calls go through
//! - Open: threshold reached, calls fail fast
//!
//! # Transitions
//! ```text
//! Closed -> Open:   failures >= threshold with no success in between
//! Open   -> Closed: time since the last failure exceeds the cooldown
//! any    -> Closed: a successful call (failures reset to 0)
//! ```
//!
//! Keys are operation names only, so unrelated call sites that share an
//! operation name share failure state.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Default)]
struct BreakerEntry {
    failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    is_open: bool,
}

/// Read-only view of one operation's breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub is_open: bool,
}

/// Failure counters keyed by operation name.
///
/// The lock is only taken between suspension points and never held across
/// an `.await`.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<String, BreakerEntry>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether calls for `operation` must fail fast.
    ///
    /// An open circuit whose last failure is older than the cooldown is
    /// closed here, with its failure count reset.
    pub fn is_open(&self, operation: &str) -> bool {
        let mut states = self.states.lock();
        let entry = states.entry(operation.to_string()).or_default();
        if !entry.is_open {
            return false;
        }

        let cooled_down = entry
            .last_failure
            .map(|at| at.elapsed() > self.cooldown)
            .unwrap_or(true);
        if cooled_down {
            tracing::info!(operation, "circuit breaker cooled down, closing");
            *entry = BreakerEntry::default();
            return false;
        }
        true
    }

    pub(crate) fn record_success(&self, operation: &str) {
        let mut states = self.states.lock();
        let entry = states.entry(operation.to_string()).or_default();
        *entry = BreakerEntry::default();
    }

    pub(crate) fn record_failure(&self, operation: &str) {
        let mut states = self.states.lock();
        let entry = states.entry(operation.to_string()).or_default();
        entry.failures = entry.failures.saturating_add(1);
        entry.last_failure = Some(Instant::now());
        entry.last_failure_at = Some(Utc::now());

        if entry.failures >= self.failure_threshold && !entry.is_open {
            entry.is_open = true;
            tracing::warn!(
                operation,
                failures = entry.failures,
                "circuit breaker opened"
            );
        }
    }

    /// Current state of `operation`, if it has ever been referenced.
    pub fn snapshot(&self, operation: &str) -> Option<CircuitSnapshot> {
        self.states.lock().get(operation).map(|entry| CircuitSnapshot {
            failures: entry.failures,
            last_failure: entry.last_failure_at,
            is_open: entry.is_open,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_breaker_should_open_at_threshold() {
        let breaker = CircuitBreaker::default();

        for _ in 0..4 {
            breaker.record_failure("sync_orders");
        }
        assert!(!breaker.is_open("sync_orders"));

        breaker.record_failure("sync_orders");
        assert!(breaker.is_open("sync_orders"));
        assert_eq!(breaker.snapshot("sync_orders").unwrap().failures, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_should_reset_failures() {
        let breaker = CircuitBreaker::default();
        breaker.record_failure("ship");
        breaker.record_failure("ship");

        breaker.record_success("ship");

        let snapshot = breaker.snapshot("ship").unwrap();
        assert_eq!(snapshot.failures, 0);
        assert!(!snapshot.is_open);
        assert!(snapshot.last_failure.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_should_close_after_cooldown() {
        // Given: an open breaker
        let breaker = CircuitBreaker::new(2, Duration::from_secs(300));
        breaker.record_failure("refund");
        breaker.record_failure("refund");
        assert!(breaker.is_open("refund"));

        // When: exactly the cooldown has passed, it is still open
        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(breaker.is_open("refund"));

        // Then: once past the cooldown it closes with a clean count
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!breaker.is_open("refund"));
        assert_eq!(breaker.snapshot("refund").unwrap().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_reference_should_create_closed_state() {
        let breaker = CircuitBreaker::default();
        assert!(breaker.snapshot("new_op").is_none());
        assert!(!breaker.is_open("new_op"));
        assert_eq!(
            breaker.snapshot("new_op"),
            Some(CircuitSnapshot {
                failures: 0,
                last_failure: None,
                is_open: false
            })
        );
    }
}
