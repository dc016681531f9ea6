//! Ports to the external collaborators and an in-memory data store.
//!
//! The resilience layer never talks to a backend directly. It drives a
//! [`DataStore`] (named collections of JSON rows) and a [`FunctionInvoker`]
//! (named remote procedures taking and returning JSON).

use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A single row of a collection.
pub type Row = Map<String, Value>;

/// Key/value equality filter. A row matches when every key is present with an equal value.
pub type Conditions = BTreeMap<String, Value>;

/// Name of the primary key column.
pub const ID_COLUMN: &str = "id";

/// Kinds of data store calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Upsert,
    Select,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Upsert => "upsert",
            OperationKind::Select => "select",
        };
        f.write_str(name)
    }
}

/// Data store port.
///
/// Every call returns the affected rows. Errors carry store-specific text,
/// which the retry classifier inspects.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn insert(&self, table: &str, row: Row) -> Result<Vec<Row>, StoreError>;

    async fn update(&self, table: &str, patch: Row, conditions: &Conditions) -> Result<Vec<Row>, StoreError>;

    async fn delete(&self, table: &str, conditions: &Conditions) -> Result<Vec<Row>, StoreError>;

    async fn upsert(&self, table: &str, row: Row) -> Result<Vec<Row>, StoreError>;

    async fn select(&self, table: &str, conditions: &Conditions) -> Result<Vec<Row>, StoreError>;
}

/// Remote function port: named procedure plus JSON payload.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, name: &str, payload: Value) -> Result<Value, StoreError>;
}

/// Validate that a JSON value is a row (a JSON object).
pub fn into_row(value: Value) -> Result<Row, StoreError> {
    match value {
        Value::Object(row) => Ok(row),
        other => Err(StoreError::validation(
            "row",
            format!("expected a JSON object, got {other}"),
        )),
    }
}

/// Conditions selecting a single row by primary key.
pub fn by_id(id: Value) -> Conditions {
    let mut conditions = Conditions::new();
    conditions.insert(ID_COLUMN.to_string(), id);
    conditions
}

fn matches(row: &Row, conditions: &Conditions) -> bool {
    conditions
        .iter()
        .all(|(key, expected)| row.get(key) == Some(expected))
}

/// A data store call as observed by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreCall {
    pub kind: OperationKind,
    pub table: String,
    pub conditions: Conditions,
}

#[derive(Debug)]
struct InjectedFailure {
    table: String,
    kind: OperationKind,
    error: StoreError,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct MemoryTables {
    tables: HashMap<String, Vec<Row>>,
    next_id: u64,
    failures: Vec<InjectedFailure>,
    journal: Vec<StoreCall>,
}

impl MemoryTables {
    fn record(&mut self, kind: OperationKind, table: &str, conditions: Conditions) -> Result<(), StoreError> {
        self.journal.push(StoreCall {
            kind,
            table: table.to_string(),
            conditions,
        });

        let position = self
            .failures
            .iter()
            .position(|f| f.kind == kind && f.table == table);
        let Some(index) = position else {
            return Ok(());
        };

        let failure = &mut self.failures[index];
        let error = failure.error.clone();
        let exhausted = match failure.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            self.failures.remove(index);
        }
        Err(error)
    }

    fn assign_id(&mut self, row: &mut Row) {
        match row.get(ID_COLUMN) {
            Some(id) => self.observe_id(id),
            None => {
                self.next_id += 1;
                row.insert(ID_COLUMN.to_string(), Value::from(self.next_id));
            }
        }
    }

    /// Keep generated ids above any integer id supplied by the caller.
    fn observe_id(&mut self, id: &Value) {
        if let Some(id) = id.as_u64() {
            self.next_id = self.next_id.max(id);
        }
    }
}

/// In-process [`DataStore`] with integer id assignment and failure injection.
///
/// Rows without an `id` get the next integer id on insert. Upserts key on
/// `id`. Every call is journaled, including calls that fail.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert rows directly, bypassing the journal and injected failures.
    pub fn seed<I>(&self, table: &str, rows: I)
    where
        I: IntoIterator<Item = Row>,
    {
        let mut inner = self.inner.lock();
        for mut row in rows {
            inner.assign_id(&mut row);
            inner.tables.entry(table.to_string()).or_default().push(row);
        }
    }

    /// Current contents of `table`.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Every call made so far, in order.
    pub fn journal(&self) -> Vec<StoreCall> {
        self.inner.lock().journal.clone()
    }

    /// Fail the next `times` calls of `kind` against `table` with `error`.
    pub fn fail_times(&self, table: &str, kind: OperationKind, error: StoreError, times: usize) {
        if times == 0 {
            return;
        }
        self.inner.lock().failures.push(InjectedFailure {
            table: table.to_string(),
            kind,
            error,
            remaining: Some(times),
        });
    }

    /// Fail every call of `kind` against `table` with `error`.
    pub fn fail_always(&self, table: &str, kind: OperationKind, error: StoreError) {
        self.inner.lock().failures.push(InjectedFailure {
            table: table.to_string(),
            kind,
            error,
            remaining: None,
        });
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn insert(&self, table: &str, mut row: Row) -> Result<Vec<Row>, StoreError> {
        let mut inner = self.inner.lock();
        inner.record(OperationKind::Insert, table, Conditions::new())?;
        inner.assign_id(&mut row);

        let rows = inner.tables.entry(table.to_string()).or_default();
        if let Some(id) = row.get(ID_COLUMN) {
            if rows.iter().any(|existing| existing.get(ID_COLUMN) == Some(id)) {
                return Err(StoreError::conflict(format!(
                    "duplicate key value for {table}.{ID_COLUMN} = {id}"
                )));
            }
        }
        rows.push(row.clone());
        Ok(vec![row])
    }

    async fn update(&self, table: &str, patch: Row, conditions: &Conditions) -> Result<Vec<Row>, StoreError> {
        let mut inner = self.inner.lock();
        inner.record(OperationKind::Update, table, conditions.clone())?;

        let mut updated = Vec::new();
        if let Some(rows) = inner.tables.get_mut(table) {
            for row in rows.iter_mut().filter(|row| matches(row, conditions)) {
                for (key, value) in &patch {
                    row.insert(key.clone(), value.clone());
                }
                updated.push(row.clone());
            }
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, conditions: &Conditions) -> Result<Vec<Row>, StoreError> {
        let mut inner = self.inner.lock();
        inner.record(OperationKind::Delete, table, conditions.clone())?;

        let Some(rows) = inner.tables.get_mut(table) else {
            return Ok(Vec::new());
        };
        let (removed, kept): (Vec<Row>, Vec<Row>) =
            rows.drain(..).partition(|row| matches(row, conditions));
        *rows = kept;
        Ok(removed)
    }

    async fn upsert(&self, table: &str, row: Row) -> Result<Vec<Row>, StoreError> {
        let mut inner = self.inner.lock();
        let id = row
            .get(ID_COLUMN)
            .cloned()
            .ok_or_else(|| StoreError::validation(ID_COLUMN, "upsert requires a primary key"))?;
        inner.record(OperationKind::Upsert, table, by_id(id.clone()))?;
        inner.observe_id(&id);

        let rows = inner.tables.entry(table.to_string()).or_default();
        match rows.iter().position(|existing| existing.get(ID_COLUMN) == Some(&id)) {
            Some(index) => rows[index] = row.clone(),
            None => rows.push(row.clone()),
        }
        Ok(vec![row])
    }

    async fn select(&self, table: &str, conditions: &Conditions) -> Result<Vec<Row>, StoreError> {
        let mut inner = self.inner.lock();
        inner.record(OperationKind::Select, table, conditions.clone())?;

        Ok(inner
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|row| matches(row, conditions)).cloned().collect())
            .unwrap_or_default())
    }
}
