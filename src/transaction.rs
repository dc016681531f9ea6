//! Application-level transactions over a [`DataStore`].
//!
//! Operations run strictly in declaration order. After each successful step
//! a compensating operation is synthesized and pushed onto the front of the
//! rollback list, so the list is always in reverse execution order. When a
//! step fails, every recorded compensation is replayed from the front.
//!
//! This is a compensation log, not ACID: there is no two-phase commit and
//! no store-native transaction, and a failed compensation leaves the store
//! partially unwound. Compensations synthesized per kind:
//!
//! | step   | compensation |
//! |--------|--------------|
//! | insert | delete the new row by `id` |
//! | update | update back to `rollback_data`, when supplied |
//! | delete | re-insert each deleted row |
//! | upsert | none |
//!
//! With pre-image capture enabled, updates without `rollback_data` and
//! upserts read the affected rows first and compensate by upserting the
//! captured rows back whole, or by deleting a row the upsert created.

use crate::classify::ErrorClass;
use crate::context::ErrorContext;
use crate::error::{EnhancedError, StoreError};
use crate::handler::ErrorHandler;
use crate::recovery::{RecoveryManager, RecoveryResult, RecoveryStrategy};
use crate::store::{by_id, Conditions, DataStore, OperationKind, Row, ID_COLUMN};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// One step of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum TransactionOperation {
    Insert {
        table: String,
        data: Row,
    },
    Update {
        table: String,
        data: Row,
        conditions: Conditions,
        /// Values restored if the transaction is rolled back.
        rollback_data: Option<Row>,
    },
    Delete {
        table: String,
        conditions: Conditions,
    },
    Upsert {
        table: String,
        data: Row,
    },
}

impl TransactionOperation {
    pub fn insert<T: Into<String>>(table: T, data: Row) -> Self {
        Self::Insert {
            table: table.into(),
            data,
        }
    }

    /// Update without a restore image; it will not be compensated unless
    /// pre-image capture is enabled.
    pub fn update<T: Into<String>>(table: T, data: Row, conditions: Conditions) -> Self {
        Self::Update {
            table: table.into(),
            data,
            conditions,
            rollback_data: None,
        }
    }

    /// Update that restores `rollback_data` on the same rows if rolled back.
    pub fn update_with_rollback<T: Into<String>>(
        table: T,
        data: Row,
        conditions: Conditions,
        rollback_data: Row,
    ) -> Self {
        Self::Update {
            table: table.into(),
            data,
            conditions,
            rollback_data: Some(rollback_data),
        }
    }

    pub fn delete<T: Into<String>>(table: T, conditions: Conditions) -> Self {
        Self::Delete {
            table: table.into(),
            conditions,
        }
    }

    pub fn upsert<T: Into<String>>(table: T, data: Row) -> Self {
        Self::Upsert {
            table: table.into(),
            data,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. }
            | Self::Update { table, .. }
            | Self::Delete { table, .. }
            | Self::Upsert { table, .. } => table,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Insert { .. } => OperationKind::Insert,
            Self::Update { .. } => OperationKind::Update,
            Self::Delete { .. } => OperationKind::Delete,
            Self::Upsert { .. } => OperationKind::Upsert,
        }
    }

    async fn apply(&self, store: &dyn DataStore) -> Result<Vec<Row>, StoreError> {
        match self {
            Self::Insert { table, data } => store.insert(table, data.clone()).await,
            Self::Update {
                table,
                data,
                conditions,
                ..
            } => store.update(table, data.clone(), conditions).await,
            Self::Delete { table, conditions } => store.delete(table, conditions).await,
            Self::Upsert { table, data } => store.upsert(table, data.clone()).await,
        }
    }
}

/// Outcome of [`TransactionManager::execute_transaction`].
#[derive(Debug, Clone)]
pub struct TransactionResult {
    pub success: bool,
    /// Rows returned by each successful step, in execution order.
    pub results: Vec<Vec<Row>>,
    /// Compensations recorded for the successful steps, most recent first.
    pub rollback_operations: Vec<TransactionOperation>,
    pub error: Option<EnhancedError>,
    /// Compensations that failed while unwinding.
    pub rollback_failures: usize,
}

/// Executes transactions against one data store.
#[derive(Clone)]
pub struct TransactionManager {
    store: Arc<dyn DataStore>,
    handler: Arc<ErrorHandler>,
    recovery: RecoveryManager,
    capture_pre_images: bool,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("capture_pre_images", &self.capture_pre_images)
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    pub fn new(store: Arc<dyn DataStore>, handler: Arc<ErrorHandler>) -> Self {
        Self {
            store,
            recovery: RecoveryManager::new(handler.clone()),
            handler,
            capture_pre_images: false,
        }
    }

    /// Read affected rows before updates and upserts so they can be undone.
    ///
    /// Off by default; without it, updates lacking `rollback_data` and all
    /// upserts are not compensated.
    pub fn with_pre_image_capture(mut self, enabled: bool) -> Self {
        self.capture_pre_images = enabled;
        self
    }

    /// Execute `operations` in order, unwinding on the first failure.
    pub async fn execute_transaction(
        &self,
        operations: Vec<TransactionOperation>,
        context: &ErrorContext,
    ) -> TransactionResult {
        let logger = self.handler.logger();
        logger.info(
            "transaction",
            format!(
                "Starting transaction {} with {} operations",
                context.operation,
                operations.len()
            ),
            Some(json!({ "correlation_id": context.correlation_id })),
        );

        let mut results = Vec::with_capacity(operations.len());
        let mut rollback_operations: Vec<TransactionOperation> = Vec::new();

        for (index, operation) in operations.iter().enumerate() {
            match self.execute_step(operation).await {
                Ok((rows, compensations)) => {
                    results.push(rows);
                    rollback_operations.splice(0..0, compensations);
                }
                Err(err) => {
                    let step = index + 1;
                    logger.error(
                        "transaction",
                        format!(
                            "Step {step} ({} on {}) failed: {err}",
                            operation.kind(),
                            operation.table()
                        ),
                        Some(json!({
                            "correlation_id": context.correlation_id,
                            "completed_steps": index,
                        })),
                    );

                    let rollback_failures = self.rollback(&rollback_operations, context).await;
                    let failed_context = context
                        .clone()
                        .with_metadata("failed_step", json!(step))
                        .with_metadata("completed_steps", json!(index))
                        .with_metadata("rollback_failures", json!(rollback_failures));
                    let error = self.handler.create_error(
                        format!("Transaction {} failed at step {step}: {err}", context.operation),
                        failed_context,
                        Some(Arc::new(err)),
                        false,
                    );
                    self.handler.report(&error).await;

                    return TransactionResult {
                        success: false,
                        results,
                        rollback_operations,
                        error: Some(error),
                        rollback_failures,
                    };
                }
            }
        }

        logger.success(
            "transaction",
            format!("Transaction {} committed", context.operation),
            Some(json!({
                "correlation_id": context.correlation_id,
                "operations": operations.len(),
            })),
        );
        TransactionResult {
            success: true,
            results,
            rollback_operations,
            error: None,
            rollback_failures: 0,
        }
    }

    /// Execute a transaction; if it fails, run `strategies` after the rollback.
    pub async fn execute_transaction_with_recovery(
        &self,
        operations: Vec<TransactionOperation>,
        context: &ErrorContext,
        strategies: &[RecoveryStrategy],
    ) -> (TransactionResult, Option<RecoveryResult>) {
        let result = self.execute_transaction(operations, context).await;
        if result.success || strategies.is_empty() {
            return (result, None);
        }
        let recovery = self
            .recovery
            .execute_recovery(strategies, &context.child("recovery"))
            .await;
        (result, Some(recovery))
    }

    async fn execute_step(
        &self,
        operation: &TransactionOperation,
    ) -> Result<(Vec<Row>, Vec<TransactionOperation>), StoreError> {
        let pre_image = match operation {
            TransactionOperation::Update {
                table,
                conditions,
                rollback_data: None,
                ..
            } if self.capture_pre_images => Some(self.store.select(table, conditions).await?),
            TransactionOperation::Upsert { table, data } if self.capture_pre_images => {
                match data.get(ID_COLUMN) {
                    Some(id) => Some(self.store.select(table, &by_id(id.clone())).await?),
                    None => None,
                }
            }
            _ => None,
        };

        let rows = operation.apply(self.store.as_ref()).await?;
        if let TransactionOperation::Insert { table, .. } = operation {
            let missing = rows.iter().filter(|row| row_id(row).is_none()).count();
            if missing > 0 {
                self.handler.logger().warning(
                    "transaction",
                    format!("Insert on {table} returned {missing} rows without {ID_COLUMN}; they will not be rolled back"),
                    Some(json!({ "table": table, "rows_without_id": missing })),
                );
            }
        }
        let compensations = compensations_for(operation, &rows, pre_image.as_deref());
        Ok((rows, compensations))
    }

    /// Replay compensations front to back. Returns how many failed.
    async fn rollback(&self, compensations: &[TransactionOperation], context: &ErrorContext) -> usize {
        let logger = self.handler.logger();
        if compensations.is_empty() {
            logger.info("transaction", "Nothing to roll back", None);
            return 0;
        }

        logger.warning(
            "transaction",
            format!("Rolling back {} operations", compensations.len()),
            Some(json!({ "correlation_id": context.correlation_id })),
        );

        let mut failures = 0;
        for compensation in compensations {
            if let Err(err) = compensation.apply(self.store.as_ref()).await {
                failures += 1;
                logger.error(
                    "transaction",
                    format!(
                        "Rollback {} on {} failed: {err}",
                        compensation.kind(),
                        compensation.table()
                    ),
                    Some(json!({
                        "correlation_id": context.correlation_id,
                        "class": ErrorClass::CompensationFailure.name(),
                    })),
                );
            }
        }

        if failures == 0 {
            logger.success(
                "transaction",
                format!("Rolled back {} operations", compensations.len()),
                Some(json!({ "correlation_id": context.correlation_id })),
            );
        } else {
            logger.error(
                "transaction",
                format!(
                    "Rollback finished with {failures} of {} compensations failing",
                    compensations.len()
                ),
                Some(json!({ "correlation_id": context.correlation_id })),
            );
        }
        failures
    }
}

fn row_id(row: &Row) -> Option<&serde_json::Value> {
    row.get(ID_COLUMN)
}

/// Compensations for one successful step, in the order they should run.
fn compensations_for(
    operation: &TransactionOperation,
    rows: &[Row],
    pre_image: Option<&[Row]>,
) -> Vec<TransactionOperation> {
    match operation {
        TransactionOperation::Insert { table, .. } => rows
            .iter()
            .filter_map(row_id)
            .map(|id| TransactionOperation::delete(table.as_str(), by_id(id.clone())))
            .collect(),
        TransactionOperation::Update {
            table,
            conditions,
            rollback_data: Some(restore),
            ..
        } => vec![TransactionOperation::update(
            table.as_str(),
            restore.clone(),
            conditions.clone(),
        )],
        TransactionOperation::Update { table, .. } => restore_rows(table, pre_image.unwrap_or_default()),
        TransactionOperation::Delete { table, .. } => rows
            .iter()
            .map(|row| TransactionOperation::insert(table.as_str(), row.clone()))
            .collect(),
        TransactionOperation::Upsert { table, .. } => match pre_image {
            Some(existing) if !existing.is_empty() => restore_rows(table, existing),
            Some(_) => rows
                .iter()
                .filter_map(row_id)
                .map(|id| TransactionOperation::delete(table.as_str(), by_id(id.clone())))
                .collect(),
            None => Vec::new(),
        },
    }
}

/// Whole-row replacements back to the captured pre-image.
fn restore_rows(table: &str, pre_image: &[Row]) -> Vec<TransactionOperation> {
    pre_image
        .iter()
        .filter(|row| row_id(row).is_some())
        .map(|row| TransactionOperation::upsert(table, row.clone()))
        .collect()
}
