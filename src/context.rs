//! Correlation context attached to every guarded operation.
//!
//! An [`ErrorContext`] names the logical action being performed and the
//! subsystem performing it, and carries a correlation id that ties a
//! client-visible failure to its persisted audit record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Context information for a guarded operation.
///
/// Values are immutable once built: the builder methods consume `self` and
/// return the updated context, so a per-attempt variant is a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Unique identifier used to correlate logs and audit rows.
    pub correlation_id: Uuid,
    /// Name of the logical action; also the circuit breaker key.
    pub operation: String,
    /// Name of the calling subsystem.
    pub component: String,
    /// Auxiliary values for debugging and monitoring.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Authenticated user the operation runs for, if known.
    pub user_id: Option<String>,
    /// When the context was created.
    pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
    /// Create a new context with a fresh correlation id.
    ///
    /// # Arguments
    /// * `operation` - Name of the logical action being performed
    /// * `component` - Name of the calling subsystem
    ///
    /// # Example
    /// ```rust
    /// use tyl_resilience::ErrorContext;
    ///
    /// let context = ErrorContext::new("sync_products", "catalog")
    ///     .with_user("user-42")
    ///     .with_metadata("store_id", serde_json::json!("st_1"));
    /// assert_eq!(context.operation, "sync_products");
    /// ```
    pub fn new<O: Into<String>, C: Into<String>>(operation: O, component: C) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            operation: operation.into(),
            component: component.into(),
            metadata: HashMap::new(),
            user_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Return a copy of this context with `key` set to `value`.
    pub fn with_metadata<K: Into<String>>(mut self, key: K, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Return a copy of this context bound to `user_id`.
    pub fn with_user<U: Into<String>>(mut self, user_id: U) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Return a copy of this context that reuses `correlation_id`.
    ///
    /// Used when a follow-up action (rollback, recovery) must correlate with
    /// the failure that triggered it.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Get metadata value by key.
    pub fn get_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    /// Check if this context has metadata for the given key.
    pub fn has_metadata(&self, key: &str) -> bool {
        self.metadata.contains_key(key)
    }

    /// Derive a context for a sub-operation of this one.
    ///
    /// The correlation id, component, user and metadata carry over; the
    /// operation name becomes `"{operation}.{step}"`.
    pub fn child<S: AsRef<str>>(&self, step: S) -> Self {
        Self {
            correlation_id: self.correlation_id,
            operation: format!("{}.{}", self.operation, step.as_ref()),
            component: self.component.clone(),
            metadata: self.metadata.clone(),
            user_id: self.user_id.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builder_should_not_touch_the_original() {
        // Given: a base context
        let base = ErrorContext::new("create_return", "returns");

        // When: deriving an attempt-specific copy
        let attempt = base
            .clone()
            .with_metadata("attempts", serde_json::json!(2));

        // Then: only the copy carries the metadata
        assert!(!base.has_metadata("attempts"));
        assert_eq!(attempt.get_metadata("attempts"), Some(&serde_json::json!(2)));
        assert_eq!(attempt.correlation_id, base.correlation_id);
    }

    #[test]
    fn test_child_context_should_keep_correlation() {
        let parent = ErrorContext::new("ship_order", "shipping").with_user("u1");
        let child = parent.child("rollback");

        assert_eq!(child.operation, "ship_order.rollback");
        assert_eq!(child.correlation_id, parent.correlation_id);
        assert_eq!(child.user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_fresh_contexts_should_have_distinct_ids() {
        let a = ErrorContext::new("op", "c");
        let b = ErrorContext::new("op", "c");
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_ne!(a.correlation_id, Uuid::nil());
    }

    #[test]
    fn test_with_correlation_id_should_link_follow_up_actions() {
        let failure = ErrorContext::new("import", "catalog");
        let follow_up = ErrorContext::new("rollback", "catalog").with_correlation_id(failure.correlation_id);
        assert_eq!(follow_up.correlation_id, failure.correlation_id);
    }
}
