//! The storage driver boundary.
//!
//! This module defines what the engine needs from storage:
//!
//! - [`Connection`] - executes relational plans and persistence statements,
//!   batches them, and manages one transaction with savepoints
//! - [`RowReader`] - forward-only cursor over a query result
//! - [`DriverCapabilities`] - what the driver supports (batching, savepoints,
//!   parameter limits)
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! context for proper cancellation handling.

use std::fmt;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};

use crate::plan::QueryPlan;
use crate::row::{ColumnInfo, Row};
use crate::sql::Dialect;
use crate::statement::Statement;
use crate::value::Value;

/// Features a driver supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverCapabilities {
    /// Multiple statements or queries per round trip
    pub batching: bool,
    /// Nested transaction scopes via savepoints
    pub savepoints: bool,
    /// Largest number of parameters a single query may bind
    pub max_query_params: usize,
    /// Connection-local temporary tables
    pub temp_tables: bool,
}

impl Default for DriverCapabilities {
    fn default() -> Self {
        Self {
            batching: true,
            savepoints: true,
            max_query_params: 2100,
            temp_tables: true,
        }
    }
}

/// Releases a driver-side cursor when dropped.
pub struct CursorGuard {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CursorGuard {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for CursorGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorGuard")
            .field("open", &self.release.is_some())
            .finish()
    }
}

/// Forward-only reader over query results.
///
/// The underlying cursor stays open until the reader is exhausted, closed or
/// dropped, whichever comes first.
#[derive(Debug)]
pub struct RowReader {
    columns: Arc<ColumnInfo>,
    rows: std::vec::IntoIter<Vec<Value>>,
    guard: Option<CursorGuard>,
}

impl RowReader {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns: Arc::new(ColumnInfo::new(columns)),
            rows: rows.into_iter(),
            guard: None,
        }
    }

    /// A reader with no rows and no open cursor.
    pub fn empty(columns: Vec<String>) -> Self {
        Self::new(columns, Vec::new())
    }

    /// Attach the guard that releases the driver cursor.
    #[must_use]
    pub fn with_guard(mut self, guard: CursorGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn columns(&self) -> &Arc<ColumnInfo> {
        &self.columns
    }

    /// Whether the driver cursor is still held.
    pub fn is_open(&self) -> bool {
        self.guard.is_some()
    }

    /// Release the cursor without reading further.
    pub fn close(&mut self) {
        self.guard = None;
        self.rows = Vec::new().into_iter();
    }

    /// Read every remaining row.
    pub fn collect_rows(mut self) -> Vec<Row> {
        let rows = self.by_ref().collect();
        self.close();
        rows
    }
}

impl Iterator for RowReader {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        match self.rows.next() {
            Some(values) => Some(Row::with_columns(Arc::clone(&self.columns), values)),
            None => {
                self.guard = None;
                None
            }
        }
    }
}

/// A query in a batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchQuery<'a> {
    pub plan: &'a QueryPlan,
    pub params: &'a [Value],
}

/// A storage connection.
///
/// All operations are async and take a `Cx` context for cancellation support.
/// Implementations must be `Send + Sync` for use across async boundaries.
///
/// A connection carries at most one transaction. Savepoints nest inside it.
///
/// # Example
///
/// ```rust,ignore
/// conn.begin(&cx).await?;
/// let counts = conn.execute_batch(&cx, &statements).await?;
/// conn.commit(&cx).await?;
/// ```
pub trait Connection: Send + Sync {
    /// Features of this driver.
    fn capabilities(&self) -> DriverCapabilities;

    /// SQL dialect used when rendering plans.
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    /// Execute a plan and return a forward-only reader.
    fn query(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
        params: &[Value],
    ) -> impl Future<Output = Outcome<RowReader, crate::Error>> + Send;

    /// Execute several plans in one round trip.
    fn query_batch(
        &self,
        cx: &Cx,
        queries: &[BatchQuery<'_>],
    ) -> impl Future<Output = Outcome<Vec<RowReader>, crate::Error>> + Send;

    /// Execute a statement and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Execute statements in one round trip, in order.
    ///
    /// Returns rows affected per statement. The batch stops at the first
    /// failure; a statement whose `expected_rows` differs from the actual
    /// count fails with `QueryErrorKind::RowCountMismatch`. Failures carry the
    /// statement index.
    fn execute_batch(
        &self,
        cx: &Cx,
        statements: &[Statement],
    ) -> impl Future<Output = Outcome<Vec<u64>, crate::Error>> + Send;

    /// Begin the connection's transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Commit the transaction, making all changes permanent.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Rollback the transaction, discarding all changes.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Whether a transaction is open.
    fn in_transaction(&self) -> bool;

    /// Create a savepoint within the transaction.
    fn savepoint(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Rollback to a previously created savepoint.
    ///
    /// Changes made after the savepoint are discarded; the savepoint itself
    /// is released.
    fn rollback_to_savepoint(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Release a savepoint, keeping its changes in the transaction.
    fn release_savepoint(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Draw the next value of a named sequence. Sequences ignore rollback.
    fn next_sequence_value(
        &self,
        cx: &Cx,
        sequence: &str,
    ) -> impl Future<Output = Outcome<i64, crate::Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted_reader(open: &Arc<AtomicUsize>, rows: usize) -> RowReader {
        open.fetch_add(1, Ordering::SeqCst);
        let counter = Arc::clone(open);
        RowReader::new(
            vec!["Id".to_string()],
            (0..rows).map(|i| vec![Value::BigInt(i as i64)]).collect(),
        )
        .with_guard(CursorGuard::new(move || {
            counter.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn reader_releases_on_exhaustion() {
        let open = Arc::new(AtomicUsize::new(0));
        let reader = counted_reader(&open, 2);
        assert_eq!(open.load(Ordering::SeqCst), 1);
        assert_eq!(reader.collect_rows().len(), 2);
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reader_releases_on_drop() {
        let open = Arc::new(AtomicUsize::new(0));
        let mut reader = counted_reader(&open, 3);
        let first = reader.next().unwrap();
        assert_eq!(first.get(0), Some(&Value::BigInt(0)));
        assert!(reader.is_open());
        drop(reader);
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn capabilities_round_trip_json() {
        let caps = DriverCapabilities {
            batching: false,
            ..DriverCapabilities::default()
        };
        let json = serde_json::to_string(&caps).unwrap();
        let back: DriverCapabilities = serde_json::from_str(&json).unwrap();
        assert_eq!(back, caps);
    }
}
