//! # TYL Resilience
//!
//! Error handling and recovery services for the TYL (The YAML Life) console.
//!
//! This crate wraps fallible data-store calls and remote function
//! invocations with structured logging, retries with exponential backoff, a
//! per-operation circuit breaker, application-level transactions with
//! compensating rollback, and ordered recovery strategies.
//!
//! ## Features
//!
//! - **Structured Logging**: Per-user bounded activity log mirrored to `tracing`
//! - **Error Enrichment**: Correlation ids, operation context and audit persistence
//! - **Retry Logic**: Exponential backoff with message-based classification
//! - **Circuit Breaker**: Fail fast after repeated terminal failures
//! - **Transactions**: Sequential steps unwound by synthesized compensations
//! - **Recovery**: Cheapest-first strategies with optional rollbacks
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tyl_resilience::{ErrorContext, ErrorHandler, Logger, RetryConfig, StaticSession, StoreError};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let logger = Logger::in_memory(100, Arc::new(StaticSession::user("ops")));
//! let handler = ErrorHandler::new(logger);
//! let config = RetryConfig::fast().with_base_delay(Duration::from_millis(1));
//! let context = ErrorContext::new("fetch_orders", "sync");
//!
//! let orders = handler
//!     .with_retry(|| async { Ok::<_, StoreError>(vec!["order-1"]) }, &config, &context)
//!     .await;
//! assert_eq!(orders.unwrap(), vec!["order-1"]);
//! # }
//! ```
//!
//! ## Transactions
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use tyl_resilience::{
//!     by_id, into_row, ErrorContext, ErrorHandler, Logger, MemoryStore, OperationKind,
//!     StoreError, TransactionManager, TransactionOperation,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(MemoryStore::new());
//! store.fail_always("payments", OperationKind::Insert, StoreError::network("connection reset"));
//! let handler = Arc::new(ErrorHandler::new(Logger::detached()));
//! let manager = TransactionManager::new(store.clone(), handler);
//!
//! let result = manager
//!     .execute_transaction(
//!         vec![
//!             TransactionOperation::insert("orders", into_row(json!({"total": 40})).unwrap()),
//!             TransactionOperation::insert("payments", into_row(json!({"amount": 40})).unwrap()),
//!         ],
//!         &ErrorContext::new("checkout", "billing"),
//!     )
//!     .await;
//!
//! assert!(!result.success);
//! assert_eq!(result.rollback_operations, vec![TransactionOperation::delete("orders", by_id(json!(1)))]);
//! assert!(store.rows("orders").is_empty());
//! # }
//! ```

pub mod circuit;
pub mod classify;
pub mod context;
pub mod error;
pub mod handler;
pub mod logger;
pub mod recovery;
pub mod retry;
pub mod settings;
pub mod store;
pub mod transaction;

pub use circuit::{CircuitBreaker, CircuitSnapshot, DEFAULT_COOLDOWN, DEFAULT_FAILURE_THRESHOLD};
pub use classify::{is_retryable_message, ErrorClass, DEFAULT_RETRYABLE_PATTERNS};
pub use context::ErrorContext;
pub use error::{EnhancedError, ErrorCause, ErrorDetails, ResilienceResult, StoreError};
pub use handler::{ErrorHandler, APPLICATION_ERROR_EVENT};
pub use logger::{
    LogEntry, LogLevel, LogSink, Logger, MemoryLogSink, SessionProvider, StaticSession,
    DEFAULT_LOG_CAPACITY,
};
pub use recovery::{
    sync_job_strategies, BoxFuture, RecoveryManager, RecoveryResult, RecoveryStrategy, NO_STRATEGY,
    SYNC_STATUS_PENDING,
};
pub use retry::RetryConfig;
pub use settings::ResilienceSettings;
pub use store::{
    by_id, into_row, Conditions, DataStore, FunctionInvoker, MemoryStore, OperationKind, Row,
    StoreCall, ID_COLUMN,
};
pub use transaction::{TransactionManager, TransactionOperation, TransactionResult};
