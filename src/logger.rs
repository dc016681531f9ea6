//! Structured operations log.
//!
//! Every entry is emitted through `tracing` immediately and then appended to
//! a bounded, per-user buffer that backs the console's activity view. The
//! logger never fails: sink errors are reported at debug level and dropped.

use crate::error::StoreError;
use crate::settings::ResilienceSettings;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Default number of entries kept per user.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Success => "success",
        }
    }
}

/// One persisted log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub user_id: String,
}

/// Resolves the authenticated user at the time of a call.
pub trait SessionProvider: Send + Sync {
    fn current_user(&self) -> Option<String>;
}

impl<F> SessionProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn current_user(&self) -> Option<String> {
        self()
    }
}

/// A session that never changes user.
#[derive(Debug, Clone, Default)]
pub struct StaticSession(pub Option<String>);

impl StaticSession {
    pub fn user<S: Into<String>>(user_id: S) -> Self {
        Self(Some(user_id.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl SessionProvider for StaticSession {
    fn current_user(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Storage for log entries, partitioned by user.
pub trait LogSink: Send + Sync {
    /// Append an entry to its user's buffer, newest first.
    fn append(&self, entry: LogEntry) -> Result<(), StoreError>;

    /// Entries for `user_id`, newest first.
    fn entries(&self, user_id: &str) -> Vec<LogEntry>;

    /// Drop every entry for `user_id`.
    fn clear(&self, user_id: &str);
}

/// In-process [`LogSink`] with a fixed per-user capacity.
#[derive(Debug)]
pub struct MemoryLogSink {
    capacity: usize,
    buffers: Mutex<HashMap<String, VecDeque<LogEntry>>>,
}

impl MemoryLogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MemoryLogSink {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, entry: LogEntry) -> Result<(), StoreError> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(entry.user_id.clone()).or_default();
        buffer.push_front(entry);
        buffer.truncate(self.capacity);
        Ok(())
    }

    fn entries(&self, user_id: &str) -> Vec<LogEntry> {
        self.buffers
            .lock()
            .get(user_id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn clear(&self, user_id: &str) {
        self.buffers.lock().remove(user_id);
    }
}

/// Structured logger shared by the resilience services.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    session: Arc<dyn SessionProvider>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>, session: Arc<dyn SessionProvider>) -> Self {
        Self { sink, session }
    }

    /// Logger backed by a [`MemoryLogSink`] of the given capacity.
    pub fn in_memory(capacity: usize, session: Arc<dyn SessionProvider>) -> Self {
        Self::new(Arc::new(MemoryLogSink::new(capacity)), session)
    }

    /// In-memory logger sized by `settings.log_capacity`.
    pub fn from_settings(settings: &ResilienceSettings, session: Arc<dyn SessionProvider>) -> Self {
        Self::in_memory(settings.log_capacity, session)
    }

    /// Logger that only writes to `tracing`; nothing is persisted.
    pub fn detached() -> Self {
        Self::in_memory(1, Arc::new(StaticSession::anonymous()))
    }

    pub fn info<C: AsRef<str>, M: Into<String>>(&self, category: C, message: M, details: Option<serde_json::Value>) {
        self.log(LogLevel::Info, category.as_ref(), message.into(), details);
    }

    pub fn warning<C: AsRef<str>, M: Into<String>>(&self, category: C, message: M, details: Option<serde_json::Value>) {
        self.log(LogLevel::Warning, category.as_ref(), message.into(), details);
    }

    pub fn error<C: AsRef<str>, M: Into<String>>(&self, category: C, message: M, details: Option<serde_json::Value>) {
        self.log(LogLevel::Error, category.as_ref(), message.into(), details);
    }

    pub fn success<C: AsRef<str>, M: Into<String>>(&self, category: C, message: M, details: Option<serde_json::Value>) {
        self.log(LogLevel::Success, category.as_ref(), message.into(), details);
    }

    fn log(&self, level: LogLevel, category: &str, message: String, details: Option<serde_json::Value>) {
        let details_text = details
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();
        match level {
            LogLevel::Info => tracing::info!(category, details = %details_text, "{message}"),
            LogLevel::Success => {
                tracing::info!(category, outcome = "success", details = %details_text, "{message}")
            }
            LogLevel::Warning => tracing::warn!(category, details = %details_text, "{message}"),
            LogLevel::Error => tracing::error!(category, details = %details_text, "{message}"),
        }

        let Some(user_id) = self.session.current_user() else {
            return;
        };

        let entry = LogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            category: category.to_string(),
            message,
            details,
            user_id,
        };
        if let Err(err) = self.sink.append(entry) {
            tracing::debug!(category, error = %err, "failed to persist log entry");
        }
    }

    // === Read side ===

    /// Entries for the current user, newest first. Empty without a session.
    pub fn entries(&self) -> Vec<LogEntry> {
        match self.session.current_user() {
            Some(user_id) => self.sink.entries(&user_id),
            None => Vec::new(),
        }
    }

    pub fn entries_by_category(&self, category: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.category == category)
            .collect()
    }

    pub fn entries_by_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.level == level)
            .collect()
    }

    /// Drop the current user's entries.
    pub fn clear(&self) {
        if let Some(user_id) = self.session.current_user() {
            self.sink.clear(&user_id);
        }
    }
}
