//! Error classification for retry decisions.
//!
//! Collaborator errors are opaque, so classification works on message text:
//! an error is transient when its message contains one of a list of known
//! phrases, compared case-insensitively.

use serde::{Deserialize, Serialize};

/// Phrases that mark an error as transient when no custom list is given.
pub const DEFAULT_RETRYABLE_PATTERNS: [&str; 7] = [
    "fetch failed",
    "network error",
    "timeout",
    "connection refused",
    "rate limit",
    "service unavailable",
    "internal server error",
];

/// Failure taxonomy of the resilience layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Network, timeout, rate-limit and 5xx-style failures; retried with backoff.
    Transient,
    /// Everything else, and anything that exhausted its attempts.
    Terminal,
    /// A compensation step failed while unwinding a transaction. Logged only.
    CompensationFailure,
}

impl ErrorClass {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Terminal => "terminal",
            ErrorClass::CompensationFailure => "compensation_failure",
        }
    }

    /// Classify an error message against `patterns`, or the defaults.
    pub fn of_message(message: &str, patterns: Option<&[String]>) -> Self {
        if is_retryable_message(message, patterns) {
            ErrorClass::Transient
        } else {
            ErrorClass::Terminal
        }
    }
}

/// Check whether `message` contains any retryable phrase.
///
/// # Arguments
/// * `message` - Error message to inspect
/// * `patterns` - Custom phrases; `None` uses [`DEFAULT_RETRYABLE_PATTERNS`]
pub fn is_retryable_message(message: &str, patterns: Option<&[String]>) -> bool {
    let message = message.to_lowercase();
    match patterns {
        Some(custom) => custom
            .iter()
            .any(|pattern| message.contains(&pattern.to_lowercase())),
        None => DEFAULT_RETRYABLE_PATTERNS
            .iter()
            .any(|pattern| message.contains(pattern)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_patterns_should_match_case_insensitively() {
        assert!(is_retryable_message("TypeError: Fetch Failed", None));
        assert!(is_retryable_message("Request Timeout after 30s", None));
        assert!(is_retryable_message("503 Service Unavailable", None));
        assert!(is_retryable_message("Rate limit exceeded: slow down", None));
        assert!(!is_retryable_message("duplicate key value violates unique constraint", None));
    }

    #[test]
    fn test_custom_patterns_should_replace_defaults() {
        // Given: a custom list that does not include "timeout"
        let patterns = vec!["deadlock".to_string()];

        // Then: only the custom phrases count
        assert!(is_retryable_message("Deadlock detected", Some(&patterns)));
        assert!(!is_retryable_message("request timeout", Some(&patterns)));
    }

    #[test]
    fn test_error_class_should_follow_message() {
        assert_eq!(
            ErrorClass::of_message("network error: reset", None),
            ErrorClass::Transient
        );
        assert_eq!(
            ErrorClass::of_message("permission denied", None),
            ErrorClass::Terminal
        );
        assert_eq!(ErrorClass::CompensationFailure.name(), "compensation_failure");
    }
}
