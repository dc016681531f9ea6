//! Resilience configuration and environment variable handling.
//!
//! Zero-configuration defaults that can be overridden from the environment.
//! Nothing here is global: callers load a [`ResilienceSettings`] once and
//! hand it to the services they construct.

use std::time::Duration;

const ENV_PREFIX: &str = "TYL_RESILIENCE_";

/// Settings for retry, circuit breaking, log buffering and audit persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceSettings {
    /// Whether terminal errors capture a stack for the audit record.
    pub backtrace_enabled: bool,
    /// Default number of attempts for guarded operations.
    pub max_attempts: usize,
    /// Default delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single retry delay.
    pub max_delay: Duration,
    /// Default exponential backoff factor.
    pub backoff_multiplier: f64,
    /// Consecutive failures that open a circuit.
    pub circuit_failure_threshold: u32,
    /// How long after its last failure an open circuit closes again.
    pub circuit_cooldown: Duration,
    /// Per-user log buffer capacity.
    pub log_capacity: usize,
    /// Table that receives `application_error` audit rows.
    pub audit_table: String,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            backtrace_enabled: false,
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            circuit_failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(5 * 60),
            log_capacity: 1000,
            audit_table: "audit_events".to_string(),
        }
    }
}

impl ResilienceSettings {
    /// Load settings from the process environment.
    ///
    /// # Environment Variables
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `TYL_RESILIENCE_BACKTRACE` | `false` | Capture stacks for audit rows |
    /// | `TYL_RESILIENCE_MAX_ATTEMPTS` | `3` | Attempts per guarded operation |
    /// | `TYL_RESILIENCE_BASE_DELAY_MS` | `1000` | First retry delay |
    /// | `TYL_RESILIENCE_MAX_DELAY_MS` | `10000` | Retry delay cap |
    /// | `TYL_RESILIENCE_BACKOFF_MULTIPLIER` | `2.0` | Backoff factor |
    /// | `TYL_RESILIENCE_CIRCUIT_THRESHOLD` | `5` | Failures that open a circuit |
    /// | `TYL_RESILIENCE_CIRCUIT_COOLDOWN_SECS` | `300` | Open circuit cooldown |
    /// | `TYL_RESILIENCE_LOG_CAPACITY` | `1000` | Per-user log entries kept |
    /// | `TYL_RESILIENCE_AUDIT_TABLE` | `audit_events` | Audit table name |
    /// | `RUST_BACKTRACE` | - | Enables backtraces when the TYL variable is unset |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup.
    ///
    /// Keys are full variable names (`TYL_RESILIENCE_MAX_ATTEMPTS`, ...).
    /// Missing or unparseable values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let parse_u64 = |name: &str| get(name).and_then(|v| v.trim().parse::<u64>().ok());

        let backtrace_enabled = match get("BACKTRACE") {
            Some(value) => value.eq_ignore_ascii_case("true"),
            None => lookup("RUST_BACKTRACE").is_some_and(|v| v.trim() != "0"),
        };

        let max_attempts = get("MAX_ATTEMPTS")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.max_attempts);

        let backoff_multiplier = get("BACKOFF_MULTIPLIER")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 1.0)
            .unwrap_or(defaults.backoff_multiplier);

        let circuit_failure_threshold = get("CIRCUIT_THRESHOLD")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.circuit_failure_threshold);

        let log_capacity = get("LOG_CAPACITY")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.log_capacity);

        Self {
            backtrace_enabled,
            max_attempts,
            base_delay: parse_u64("BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: parse_u64("MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            backoff_multiplier,
            circuit_failure_threshold,
            circuit_cooldown: parse_u64("CIRCUIT_COOLDOWN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.circuit_cooldown),
            log_capacity,
            audit_table: get("AUDIT_TABLE")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.audit_table),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_settings_default() {
        let settings = ResilienceSettings::default();
        assert!(!settings.backtrace_enabled);
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.circuit_failure_threshold, 5);
        assert_eq!(settings.circuit_cooldown, Duration::from_secs(300));
        assert_eq!(settings.log_capacity, 1000);
        assert_eq!(settings.audit_table, "audit_events");
    }

    #[test]
    fn test_settings_from_lookup_should_override_defaults() {
        let settings = ResilienceSettings::from_lookup(lookup_from(&[
            ("TYL_RESILIENCE_MAX_ATTEMPTS", "5"),
            ("TYL_RESILIENCE_BASE_DELAY_MS", "250"),
            ("TYL_RESILIENCE_BACKOFF_MULTIPLIER", "1.5"),
            ("TYL_RESILIENCE_CIRCUIT_COOLDOWN_SECS", "60"),
            ("TYL_RESILIENCE_AUDIT_TABLE", "events"),
            ("TYL_RESILIENCE_BACKTRACE", "TRUE"),
        ]));

        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.base_delay, Duration::from_millis(250));
        assert_eq!(settings.backoff_multiplier, 1.5);
        assert_eq!(settings.circuit_cooldown, Duration::from_secs(60));
        assert_eq!(settings.audit_table, "events");
        assert!(settings.backtrace_enabled);
    }

    #[test]
    fn test_settings_should_ignore_invalid_values() {
        let settings = ResilienceSettings::from_lookup(lookup_from(&[
            ("TYL_RESILIENCE_MAX_ATTEMPTS", "0"),
            ("TYL_RESILIENCE_BACKOFF_MULTIPLIER", "0.5"),
            ("TYL_RESILIENCE_LOG_CAPACITY", "lots"),
        ]));

        assert_eq!(settings, ResilienceSettings::default());
    }

    #[test]
    fn test_rust_backtrace_should_enable_stacks_when_unset() {
        let settings = ResilienceSettings::from_lookup(lookup_from(&[("RUST_BACKTRACE", "1")]));
        assert!(settings.backtrace_enabled);
    }

    #[test]
    fn test_rust_backtrace_zero_should_keep_stacks_disabled() {
        let settings = ResilienceSettings::from_lookup(lookup_from(&[("RUST_BACKTRACE", "0")]));
        assert!(!settings.backtrace_enabled);
    }
}
