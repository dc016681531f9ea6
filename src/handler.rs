//! The error handler service: retry executor, circuit breaker owner and
//! error reporting path.
//!
//! One [`ErrorHandler`] is built per process and shared through `Arc`; the
//! transaction and recovery managers take it by constructor injection.

use crate::circuit::CircuitBreaker;
use crate::classify::ErrorClass;
use crate::context::ErrorContext;
use crate::error::{EnhancedError, ErrorCause, ResilienceResult};
use crate::logger::Logger;
use crate::retry::RetryConfig;
use crate::settings::ResilienceSettings;
use crate::store::{into_row, DataStore, FunctionInvoker};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;

/// `event_type` of persisted error rows.
pub const APPLICATION_ERROR_EVENT: &str = "application_error";

/// Row shape written to the audit table for every reported error.
#[derive(Debug, Serialize)]
struct AuditRecord<'a> {
    event_type: &'a str,
    user_id: Option<&'a str>,
    details: crate::error::ErrorDetails,
}

/// Retry executor and error reporter.
pub struct ErrorHandler {
    logger: Logger,
    breaker: CircuitBreaker,
    audit_store: Option<Arc<dyn DataStore>>,
    settings: ResilienceSettings,
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("breaker", &self.breaker)
            .field("audit", &self.audit_store.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

impl ErrorHandler {
    /// Handler with default settings and no audit persistence.
    pub fn new(logger: Logger) -> Self {
        Self::with_settings(logger, ResilienceSettings::default())
    }

    pub fn with_settings(logger: Logger, settings: ResilienceSettings) -> Self {
        Self {
            breaker: CircuitBreaker::new(
                settings.circuit_failure_threshold,
                settings.circuit_cooldown,
            ),
            logger,
            audit_store: None,
            settings,
        }
    }

    /// Persist reported errors into `store`'s audit table.
    pub fn with_audit_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.audit_store = Some(store);
        self
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn settings(&self) -> &ResilienceSettings {
        &self.settings
    }

    /// Retry config derived from the loaded settings.
    pub fn default_retry_config(&self) -> RetryConfig {
        RetryConfig::from_settings(&self.settings)
    }

    /// Build an [`EnhancedError`], capturing a stack when enabled.
    pub fn create_error<S: Into<String>>(
        &self,
        message: S,
        context: ErrorContext,
        cause: Option<ErrorCause>,
        is_retryable: bool,
    ) -> EnhancedError {
        let error = EnhancedError::new(message, context, cause, is_retryable);
        if self.settings.backtrace_enabled {
            error.with_captured_stack()
        } else {
            error
        }
    }

    /// Wrap an arbitrary failure, report it and hand it back.
    pub async fn handle_error<E>(&self, error: E, context: &ErrorContext) -> EnhancedError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = error.to_string();
        let class = ErrorClass::of_message(&message, None);
        let enhanced = self.create_error(
            message,
            context.clone(),
            Some(Arc::new(error)),
            class == ErrorClass::Transient,
        );
        self.report(&enhanced).await;
        enhanced
    }

    /// Log `error` and persist it to the audit table.
    ///
    /// Persistence failures are logged and swallowed.
    pub async fn report(&self, error: &EnhancedError) {
        let context = error.context();
        self.logger.error(
            &context.component,
            error.message(),
            Some(json!({
                "operation": context.operation,
                "correlation_id": context.correlation_id,
                "original_error": error.original_message(),
                "is_retryable": error.is_retryable(),
            })),
        );

        let Some(store) = &self.audit_store else {
            return;
        };

        let record = AuditRecord {
            event_type: APPLICATION_ERROR_EVENT,
            user_id: context.user_id.as_deref(),
            details: error.audit_details(),
        };
        let row = match serde_json::to_value(&record)
            .map_err(Into::into)
            .and_then(into_row)
        {
            Ok(row) => row,
            Err(err) => {
                tracing::warn!(correlation_id = %context.correlation_id, error = %err, "failed to serialize error record");
                return;
            }
        };

        if let Err(err) = store.insert(&self.settings.audit_table, row).await {
            tracing::warn!(
                correlation_id = %context.correlation_id,
                table = %self.settings.audit_table,
                error = %err,
                "failed to persist error record"
            );
        }
    }

    /// Run `operation` with exponential backoff behind the circuit breaker.
    ///
    /// Fails immediately when the circuit for `context.operation` is open.
    /// Otherwise retries errors whose message is retryable under `config`
    /// until `config.max_attempts` is reached. Terminal failures are
    /// recorded against the breaker, reported, and returned as a
    /// non-retryable [`EnhancedError`] whose context metadata carries
    /// `attempts` and `final_attempt`.
    pub async fn with_retry<T, E, F, Fut>(
        &self,
        mut operation: F,
        config: &RetryConfig,
        context: &ErrorContext,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let name = context.operation.as_str();

        if self.breaker.is_open(name) {
            self.logger.warning(
                "circuit_breaker",
                format!("Circuit breaker is open for operation: {name}"),
                Some(json!({ "operation": name, "correlation_id": context.correlation_id })),
            );
            return Err(self.create_error(
                format!("Circuit breaker is open for operation: {name}"),
                context
                    .clone()
                    .with_metadata("circuit_open", json!(true))
                    .with_metadata("attempts", json!(0)),
                None,
                false,
            ));
        }

        let max_attempts = config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    self.breaker.record_success(name);
                    if attempt > 1 {
                        self.logger.info(
                            "retry",
                            format!("Operation {name} succeeded after {attempt} attempts"),
                            Some(json!({ "operation": name, "attempts": attempt })),
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let message = err.to_string();
                    let retryable = config.is_retryable(&message);

                    if attempt >= max_attempts || !retryable {
                        self.breaker.record_failure(name);
                        let final_context = context
                            .clone()
                            .with_metadata("attempts", json!(attempt))
                            .with_metadata("final_attempt", json!(true));
                        let error = self.create_error(
                            format!("Operation {name} failed after {attempt} attempt(s): {message}"),
                            final_context,
                            Some(Arc::new(err)),
                            false,
                        );
                        self.report(&error).await;
                        return Err(error);
                    }

                    let delay = config.delay_for_attempt(attempt);
                    self.logger.warning(
                        "retry",
                        format!(
                            "Attempt {attempt} of {name} failed, retrying in {}ms",
                            delay.as_millis()
                        ),
                        Some(json!({
                            "operation": name,
                            "attempt": attempt,
                            "delay_ms": delay.as_millis() as u64,
                            "error": message,
                        })),
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Invoke a remote function through [`with_retry`](Self::with_retry).
    pub async fn invoke_with_retry(
        &self,
        invoker: &dyn FunctionInvoker,
        function: &str,
        payload: Value,
        config: &RetryConfig,
        context: &ErrorContext,
    ) -> ResilienceResult<Value> {
        self.with_retry(|| invoker.invoke(function, payload.clone()), config, context)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::logger::{LogLevel, StaticSession};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn handler() -> ErrorHandler {
        ErrorHandler::new(Logger::in_memory(100, Arc::new(StaticSession::user("ops"))))
    }

    fn fast_config(max_attempts: usize) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(max_attempts)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000))
            .with_backoff_multiplier(2.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_retryable_failure_should_use_every_attempt() {
        // Given: an operation that always times out
        let handler = handler();
        let calls = AtomicUsize::new(0);
        let context = ErrorContext::new("fetch_rates", "shipping");

        // When: retrying with four attempts
        let result: ResilienceResult<()> = handler
            .with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(StoreError::timeout("carrier api")) }
                },
                &fast_config(4),
                &context,
            )
            .await;

        // Then: exactly four attempts, terminal error with metadata
        let error = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(!error.is_retryable());
        assert_eq!(error.context().get_metadata("attempts"), Some(&json!(4)));
        assert_eq!(error.context().get_metadata("final_attempt"), Some(&json!(true)));
        assert_eq!(error.correlation_id(), context.correlation_id);
        assert_eq!(error.original_message(), "Request timeout: carrier api");
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_should_attempt_once() {
        let handler = handler();
        let calls = AtomicUsize::new(0);

        let result: ResilienceResult<()> = handler
            .with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(StoreError::validation("sku", "must not be empty")) }
                },
                &fast_config(5),
                &ErrorContext::new("create_product", "catalog"),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_should_match_schedule() {
        // Given: an operation that fails six times, then succeeds
        let handler = handler();
        let calls = AtomicUsize::new(0);
        let start = Instant::now();

        // When: retrying with enough attempts
        let value = handler
            .with_retry(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 6 {
                            Err(StoreError::network("socket hang up"))
                        } else {
                            Ok(n)
                        }
                    }
                },
                &fast_config(10),
                &ErrorContext::new("sync_inventory", "catalog"),
            )
            .await
            .unwrap();

        // Then: waited 100 + 200 + 400 + 800 + 1000 + 1000 ms on the virtual clock
        assert_eq!(value, 6);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3510), "{elapsed:?}");

        let warnings = handler.logger().entries_by_level(LogLevel::Warning);
        assert_eq!(warnings.len(), 6);
        assert_eq!(warnings[0].details.as_ref().unwrap()["delay_ms"], json!(1000));
        assert_eq!(warnings[5].details.as_ref().unwrap()["delay_ms"], json!(100));
        let infos = handler.logger().entries_by_category("retry");
        assert!(infos
            .iter()
            .any(|entry| entry.message == "Operation sync_inventory succeeded after 7 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_config_should_not_retry() {
        let handler = handler();
        let calls = AtomicUsize::new(0);

        let result: ResilienceResult<()> = handler
            .with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(StoreError::network("down")) }
                },
                &fast_config(1),
                &ErrorContext::new("ping", "health"),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_should_open_after_five_terminal_failures() {
        // Given: five failed calls for one operation name
        let handler = handler();
        let calls = AtomicUsize::new(0);
        let context = ErrorContext::new("verify_payment", "billing");
        let failing = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(StoreError::internal("card declined")) }
        };
        for _ in 0..5 {
            assert!(handler.with_retry(failing, &fast_config(3), &context).await.is_err());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        // When: calling a sixth time
        let error = handler
            .with_retry(failing, &fast_config(3), &context)
            .await
            .unwrap_err();

        // Then: it fails fast without attempting
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(error.message().contains("Circuit breaker is open"));
        assert_eq!(error.context().get_metadata("attempts"), Some(&json!(0)));

        // And: after the cooldown the operation is attempted again
        tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
        let value = handler
            .with_retry(|| async { Ok::<_, StoreError>("paid") }, &fast_config(3), &context)
            .await
            .unwrap();
        assert_eq!(value, "paid");
        assert_eq!(handler.circuit_breaker().snapshot("verify_payment").unwrap().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_should_reset_failure_count() {
        let handler = handler();
        let context = ErrorContext::new("label_print", "shipping");

        for _ in 0..3 {
            let _ = handler
                .with_retry(
                    || async { Err::<(), _>(StoreError::conflict("label exists")) },
                    &fast_config(1),
                    &context,
                )
                .await;
        }
        assert_eq!(handler.circuit_breaker().snapshot("label_print").unwrap().failures, 3);

        handler
            .with_retry(|| async { Ok::<_, StoreError>(()) }, &fast_config(1), &context)
            .await
            .unwrap();
        assert_eq!(handler.circuit_breaker().snapshot("label_print").unwrap().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_errors_should_be_persisted_to_audit_table() {
        // Given: a handler with an audit store
        let store = Arc::new(MemoryStore::new());
        let handler = handler().with_audit_store(store.clone());
        let context = ErrorContext::new("refund", "returns").with_user("merchant-1");

        // When: an operation fails terminally
        let error = handler
            .with_retry(
                || async { Err::<(), _>(StoreError::not_found("returns", "r-9")) },
                &fast_config(2),
                &context,
            )
            .await
            .unwrap_err();

        // Then: one application_error row carries the correlation id
        let rows = store.rows("audit_events");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["event_type"], APPLICATION_ERROR_EVENT);
        assert_eq!(rows[0]["user_id"], "merchant-1");
        assert_eq!(
            rows[0]["details"]["correlation_id"],
            json!(error.correlation_id())
        );
        assert_eq!(
            rows[0]["details"]["original_error"],
            "Not found: returns with id r-9"
        );
        assert_eq!(rows[0]["details"]["is_retryable"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audit_failures_should_be_swallowed() {
        let store = Arc::new(MemoryStore::new());
        store.fail_always(
            "audit_events",
            crate::store::OperationKind::Insert,
            StoreError::network("audit down"),
        );
        let handler = handler().with_audit_store(store.clone());

        let error = handler
            .handle_error(
                StoreError::database("boom"),
                &ErrorContext::new("import", "catalog"),
            )
            .await;

        assert_eq!(error.message(), "Database error: boom");
        assert!(store.rows("audit_events").is_empty());
    }

    #[tokio::test]
    async fn test_handle_error_should_classify_retryability() {
        let handler = handler();
        let context = ErrorContext::new("sync", "catalog");

        let transient = handler.handle_error(StoreError::rate_limited("429"), &context).await;
        let terminal = handler.handle_error(StoreError::conflict("dup"), &context).await;

        assert!(transient.is_retryable());
        assert!(!terminal.is_retryable());
    }

    #[test]
    fn test_backtrace_setting_should_capture_stack() {
        let settings = ResilienceSettings {
            backtrace_enabled: true,
            ..ResilienceSettings::default()
        };
        let handler = ErrorHandler::with_settings(Logger::detached(), settings);
        let error = handler.create_error("x", ErrorContext::new("op", "c"), None, false);
        let without = ErrorHandler::new(Logger::detached()).create_error(
            "x",
            ErrorContext::new("op", "c"),
            None,
            false,
        );

        assert!(without.stack().is_none());
        // Capture is unsupported on some targets; when it works it is non-empty.
        if let Some(stack) = error.stack() {
            assert!(!stack.is_empty());
        }
    }

    #[test]
    fn test_default_retry_config_should_follow_settings() {
        let settings = ResilienceSettings {
            max_attempts: 7,
            base_delay: Duration::from_millis(20),
            ..ResilienceSettings::default()
        };
        let handler = ErrorHandler::with_settings(Logger::detached(), settings);

        let config = handler.default_retry_config();

        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(20));
    }
}
