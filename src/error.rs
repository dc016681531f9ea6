//! Error types for the resilience layer.
//!
//! [`StoreError`] is what the external collaborators (data store, remote
//! functions) fail with. [`EnhancedError`] is what the resilience layer hands
//! back to its callers: the failure message, the [`ErrorContext`] it happened
//! in, the wrapped cause and whether a retry could help.

use crate::context::ErrorContext;
use serde::{Deserialize, Serialize};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for operations guarded by the resilience layer.
pub type ResilienceResult<T> = Result<T, EnhancedError>;

/// Shared, type-erased cause of an [`EnhancedError`].
pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors reported by the data store and remote function collaborators.
///
/// The `Display` text matters: the retry classifier inspects it for
/// transient phrases such as "network error" or "timeout".
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreError {
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Request timeout: {message}")]
    Timeout { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimited { message: String },

    #[error("Service unavailable: {service}")]
    Unavailable { service: String },

    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Remote function {function} failed: {message}")]
    Remote { function: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StoreError {
    // === Primary Constructors ===

    /// Create a database-related error.
    pub fn database<S: Into<String>>(message: S) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create a network-related error.
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a rate limiting error.
    pub fn rate_limited<S: Into<String>>(message: S) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    /// Create a "service unavailable" error.
    pub fn unavailable<S: Into<String>>(service: S) -> Self {
        Self::Unavailable {
            service: service.into(),
        }
    }

    /// Create a validation error for a specific field.
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a "not found" error for a specific resource.
    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a conflict error (duplicate rows, constraint violations).
    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create an error for a failed remote function invocation.
    pub fn remote<F: Into<String>, M: Into<String>>(function: F, message: M) -> Self {
        Self::Remote {
            function: function.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("JSON serialization error: {err}"),
        }
    }
}

/// A failure carrying its correlation context.
///
/// Created at the point of failure and never mutated afterwards. Cloning is
/// cheap: the cause is reference counted.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct EnhancedError {
    message: String,
    context: ErrorContext,
    #[source]
    cause: Option<ErrorCause>,
    is_retryable: bool,
    stack: Option<String>,
}

impl EnhancedError {
    /// Create a new error without a captured stack.
    pub fn new<S: Into<String>>(
        message: S,
        context: ErrorContext,
        cause: Option<ErrorCause>,
        is_retryable: bool,
    ) -> Self {
        Self {
            message: message.into(),
            context,
            cause,
            is_retryable,
            stack: None,
        }
    }

    /// Create a terminal error wrapping `cause`.
    pub fn terminal<S, E>(message: S, context: ErrorContext, cause: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(message, context, Some(Arc::new(cause)), false)
    }

    /// Attach the current stack, if the platform can capture one.
    pub fn with_captured_stack(mut self) -> Self {
        let backtrace = Backtrace::force_capture();
        if backtrace.status() == BacktraceStatus::Captured {
            self.stack = Some(backtrace.to_string());
        }
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn correlation_id(&self) -> uuid::Uuid {
        self.context.correlation_id
    }

    /// The wrapped underlying error, if any.
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    pub fn is_retryable(&self) -> bool {
        self.is_retryable
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    /// Message of the wrapped cause, or of this error when there is none.
    pub fn original_message(&self) -> String {
        match &self.cause {
            Some(cause) => cause.to_string(),
            None => self.message.clone(),
        }
    }

    /// Build the JSON blob persisted with an audit record.
    pub fn audit_details(&self) -> ErrorDetails {
        ErrorDetails {
            correlation_id: self.context.correlation_id,
            message: self.message.clone(),
            context: self.context.clone(),
            stack: self.stack.clone(),
            original_error: self.original_message(),
            is_retryable: self.is_retryable,
        }
    }
}

/// Serialized form of an [`EnhancedError`] stored in the audit table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub correlation_id: uuid::Uuid,
    pub message: String,
    pub context: ErrorContext,
    pub stack: Option<String>,
    pub original_error: String,
    pub is_retryable: bool,
}
