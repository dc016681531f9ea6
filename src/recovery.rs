//! Ordered recovery strategies tried after a failure.
//!
//! Strategies run one at a time, cheapest first. The first one that reports
//! success ends the run. A strategy that errors gets its own rollback (if
//! any) before the next one is tried.

use crate::context::ErrorContext;
use crate::error::StoreError;
use crate::handler::ErrorHandler;
use crate::store::{by_id, DataStore, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed, sendable future returned by strategy actions.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type ExecuteFn = Arc<dyn Fn() -> BoxFuture<'static, Result<bool, StoreError>> + Send + Sync>;
type RollbackFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), StoreError>> + Send + Sync>;

/// Name reported when no strategy succeeded.
pub const NO_STRATEGY: &str = "none";

/// A named recovery action with an optional compensating rollback.
#[derive(Clone)]
pub struct RecoveryStrategy {
    pub name: String,
    pub description: String,
    execute: ExecuteFn,
    rollback: Option<RollbackFn>,
}

impl std::fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("has_rollback", &self.rollback.is_some())
            .finish()
    }
}

impl RecoveryStrategy {
    /// Create a strategy. `execute` resolves to `Ok(true)` when it recovered.
    pub fn new<N, D, F, Fut>(name: N, description: D, execute: F) -> Self
    where
        N: Into<String>,
        D: Into<String>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, StoreError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            execute: Arc::new(move || -> BoxFuture<'static, Result<bool, StoreError>> {
                Box::pin(execute())
            }),
            rollback: None,
        }
    }

    /// Attach an action that undoes a partially applied strategy.
    pub fn with_rollback<F, Fut>(mut self, rollback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StoreError>> + Send + 'static,
    {
        self.rollback = Some(Arc::new(move || -> BoxFuture<'static, Result<(), StoreError>> {
            Box::pin(rollback())
        }));
        self
    }

    pub fn has_rollback(&self) -> bool {
        self.rollback.is_some()
    }
}

/// Outcome of a recovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub success: bool,
    /// Name of the strategy that succeeded, or `"none"`.
    pub strategy: String,
    pub message: String,
    /// Advice for the operator.
    pub next_steps: Vec<String>,
}

/// Runs recovery strategies and reports through the shared handler.
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    handler: Arc<ErrorHandler>,
}

impl RecoveryManager {
    pub fn new(handler: Arc<ErrorHandler>) -> Self {
        Self { handler }
    }

    /// Try `strategies` in order until one succeeds.
    pub async fn execute_recovery(
        &self,
        strategies: &[RecoveryStrategy],
        context: &ErrorContext,
    ) -> RecoveryResult {
        let logger = self.handler.logger();
        logger.info(
            "recovery",
            format!(
                "Starting recovery for {} with {} strategies",
                context.operation,
                strategies.len()
            ),
            Some(json!({ "correlation_id": context.correlation_id })),
        );

        for strategy in strategies {
            logger.info(
                "recovery",
                format!("Attempting recovery strategy: {}", strategy.name),
                Some(json!({ "description": strategy.description })),
            );

            match (strategy.execute)().await {
                Ok(true) => {
                    logger.success(
                        "recovery",
                        format!("Recovery strategy {} succeeded", strategy.name),
                        Some(json!({ "correlation_id": context.correlation_id })),
                    );
                    return RecoveryResult {
                        success: true,
                        strategy: strategy.name.clone(),
                        message: format!("Recovered using {}: {}", strategy.name, strategy.description),
                        next_steps: vec![
                            format!("Verify the state restored by {}", strategy.name),
                            "Monitor the next run for recurring failures".to_string(),
                        ],
                    };
                }
                Ok(false) => {
                    logger.warning(
                        "recovery",
                        format!("Recovery strategy {} did not recover", strategy.name),
                        None,
                    );
                }
                Err(err) => {
                    logger.error(
                        "recovery",
                        format!("Recovery strategy {} failed: {err}", strategy.name),
                        Some(json!({ "correlation_id": context.correlation_id })),
                    );
                    if let Some(rollback) = &strategy.rollback {
                        if let Err(rollback_err) = rollback().await {
                            logger.error(
                                "recovery",
                                format!(
                                    "Rollback of recovery strategy {} failed: {rollback_err}",
                                    strategy.name
                                ),
                                None,
                            );
                        }
                    }
                }
            }
        }

        logger.error(
            "recovery",
            format!("All recovery strategies failed for {}", context.operation),
            Some(json!({ "correlation_id": context.correlation_id })),
        );
        RecoveryResult {
            success: false,
            strategy: NO_STRATEGY.to_string(),
            message: "All recovery strategies failed".to_string(),
            next_steps: vec![
                format!("Review the logs for correlation id {}", context.correlation_id),
                "Check network connectivity and data store availability".to_string(),
                "Manual intervention may be required".to_string(),
            ],
        }
    }

    /// Recover a failed synchronization job row in `table`.
    pub async fn recover_sync_job(
        &self,
        store: Arc<dyn DataStore>,
        table: &str,
        job_id: Value,
        context: &ErrorContext,
    ) -> RecoveryResult {
        let strategies = sync_job_strategies(store, table, job_id);
        self.execute_recovery(&strategies, context).await
    }
}

// === Synchronization job catalog ===

/// Status a recovered job is put back into.
pub const SYNC_STATUS_PENDING: &str = "pending";

fn cleared_error_fields() -> Row {
    let mut patch = Row::new();
    patch.insert("status".to_string(), json!(SYNC_STATUS_PENDING));
    patch.insert("error_message".to_string(), Value::Null);
    patch.insert("error_details".to_string(), Value::Null);
    patch
}

fn job_update(
    store: Arc<dyn DataStore>,
    table: String,
    job_id: Value,
    patch: Row,
) -> impl Fn() -> BoxFuture<'static, Result<bool, StoreError>> + Send + Sync + 'static {
    move || -> BoxFuture<'static, Result<bool, StoreError>> {
        let store = store.clone();
        let table = table.clone();
        let conditions = by_id(job_id.clone());
        let patch = patch.clone();
        Box::pin(async move {
            let updated = store.update(&table, patch, &conditions).await?;
            Ok(!updated.is_empty())
        })
    }
}

/// The two strategies for a failed sync job, least destructive first:
/// resume from the last known state, then restart from the first page.
pub fn sync_job_strategies(store: Arc<dyn DataStore>, table: &str, job_id: Value) -> Vec<RecoveryStrategy> {
    let resume = cleared_error_fields();

    let mut reset = cleared_error_fields();
    reset.insert("cursor".to_string(), Value::Null);
    reset.insert("current_page".to_string(), json!(0));
    reset.insert("processed_items".to_string(), json!(0));

    vec![
        RecoveryStrategy::new(
            "resume_from_last_state",
            "Clear the job's error and mark it pending so it resumes where it stopped",
            job_update(store.clone(), table.to_string(), job_id.clone(), resume),
        ),
        RecoveryStrategy::new(
            "reset_pagination",
            "Reset pagination cursors and restart the job from the beginning",
            job_update(store, table.to_string(), job_id, reset),
        ),
    ]
}
