use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tyl_resilience::{
    by_id, into_row, sync_job_strategies, ErrorContext, ErrorHandler, Logger, MemoryStore,
    OperationKind, ResilienceSettings, RetryConfig, StaticSession, StoreError, TransactionManager,
    TransactionOperation,
};

#[tokio::main]
async fn main() -> Result<(), StoreError> {
    tracing_subscriber::fmt().init();

    println!("TYL Resilience - Transaction Rollback Example");

    let settings = ResilienceSettings::from_env();
    let store = Arc::new(MemoryStore::new());
    let logger = Logger::from_settings(&settings, Arc::new(StaticSession::user("demo-user")));
    let handler = Arc::new(ErrorHandler::with_settings(logger, settings).with_audit_store(store.clone()));

    retry_example(&handler).await;
    rollback_example(store.clone(), handler.clone()).await?;

    println!("\n=== Activity Log ===");
    for entry in handler.logger().entries().iter().rev() {
        println!("[{}] {}: {}", entry.level.as_str(), entry.category, entry.message);
    }
    Ok(())
}

async fn retry_example(handler: &ErrorHandler) {
    println!("\n=== Retry With Backoff ===");

    let config = RetryConfig::fast().with_base_delay(Duration::from_millis(20));
    let context = ErrorContext::new("fetch_inventory", "catalog");
    let attempts = std::sync::atomic::AtomicUsize::new(0);

    let result = handler
        .with_retry(
            || {
                let attempt = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(StoreError::network("connection refused"))
                    } else {
                        Ok(42)
                    }
                }
            },
            &config,
            &context,
        )
        .await;

    match result {
        Ok(items) => println!("Fetched {items} items after {} attempts", attempts.into_inner()),
        Err(e) => println!("Gave up: {e}"),
    }
}

async fn rollback_example(store: Arc<MemoryStore>, handler: Arc<ErrorHandler>) -> Result<(), StoreError> {
    println!("\n=== Transaction Rollback ===");

    store.seed(
        "sync_jobs",
        [into_row(json!({"status": "failed", "error_message": "timeout", "cursor": "p-4"}))?],
    );
    store.fail_always("payments", OperationKind::Insert, StoreError::timeout("payments gateway"));

    let manager = TransactionManager::new(store.clone(), handler);
    let operations = vec![
        TransactionOperation::insert("orders", into_row(json!({"total": 120}))?),
        TransactionOperation::update_with_rollback(
            "sync_jobs",
            into_row(json!({"status": "running"}))?,
            by_id(json!(1)),
            into_row(json!({"status": "failed"}))?,
        ),
        TransactionOperation::insert("payments", into_row(json!({"amount": 120}))?),
    ];
    let strategies = sync_job_strategies(store.clone(), "sync_jobs", json!(1));

    let (result, recovery) = manager
        .execute_transaction_with_recovery(operations, &ErrorContext::new("checkout", "billing"), &strategies)
        .await;

    println!("Committed: {}", result.success);
    if let Some(error) = &result.error {
        println!("Error: {error}");
    }
    println!("Compensations run: {}", result.rollback_operations.len());
    println!("Orders left: {}", store.rows("orders").len());
    if let Some(recovery) = recovery {
        println!("Recovery via {}: {}", recovery.strategy, recovery.message);
    }
    println!("Sync job now: {}", json!(store.rows("sync_jobs")[0]));
    Ok(())
}
