//! The shared in-memory database.
//!
//! A [`MemoryDatabase`] holds the latest committed [`Store`] behind a mutex.
//! Connections read it directly outside a transaction; inside one they read
//! a private view, the committed store with the transaction's own statement
//! log replayed over it. Commit replays the log over the then-current
//! committed store and swaps the result in atomically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tessera_core::{DomainModel, Error, QueryError, QueryErrorKind, Row, Statement};

use crate::config::MemoryConfig;
use crate::connection::MemoryConnection;
use crate::store::Store;

/// Counters observed by tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Calls that reached the driver (one per batch)
    pub round_trips: u64,
    /// Plans evaluated
    pub queries: u64,
    /// Persistence statements executed
    pub statements: u64,
    /// Readers not yet exhausted, closed or dropped
    pub open_cursors: usize,
    pub commits: u64,
    pub rollbacks: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    round_trips: AtomicU64,
    queries: AtomicU64,
    statements: AtomicU64,
    open_cursors: AtomicUsize,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl Counters {
    pub(crate) fn round_trip(&self) {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn statement(&self) {
        self.statements.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cursor_opened(&self) {
        self.open_cursors.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn cursor_closed(&self) {
        self.open_cursors.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            round_trips: self.round_trips.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            statements: self.statements.load(Ordering::Relaxed),
            open_cursors: self.open_cursors.load(Ordering::SeqCst),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.round_trips.store(0, Ordering::Relaxed);
        self.queries.store(0, Ordering::Relaxed);
        self.statements.store(0, Ordering::Relaxed);
        self.commits.store(0, Ordering::Relaxed);
        self.rollbacks.store(0, Ordering::Relaxed);
    }
}

struct Committed {
    store: Arc<Store>,
    version: u64,
}

/// State shared by a database and all its connections.
pub(crate) struct Shared {
    pub(crate) config: MemoryConfig,
    committed: Mutex<Committed>,
    sequences: Mutex<HashMap<String, i64>>,
    pub(crate) counters: Counters,
}

impl Shared {
    /// The latest committed store and its version.
    pub(crate) fn snapshot(&self) -> (Arc<Store>, u64) {
        let committed = self.committed.lock().unwrap_or_else(|e| e.into_inner());
        (Arc::clone(&committed.store), committed.version)
    }

    /// Apply one statement outside any transaction.
    #[allow(clippy::result_large_err)]
    pub(crate) fn autocommit(&self, statement: &Statement) -> Result<u64, Error> {
        let mut committed = self.committed.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (*committed.store).clone();
        let affected = next.apply(statement)?;
        committed.store = Arc::new(next);
        committed.version += 1;
        Ok(affected)
    }

    /// Publish a transaction's statements.
    ///
    /// `view` is the transaction's store as of `base_version`; it is reused
    /// when nothing was committed since, otherwise the log is replayed.
    #[allow(clippy::result_large_err)]
    pub(crate) fn commit(&self, log: &[Statement], view: Store, base_version: u64) -> Result<(), Error> {
        let mut committed = self.committed.lock().unwrap_or_else(|e| e.into_inner());
        let next = if committed.version == base_version {
            view
        } else {
            replay(&committed.store, log)?
        };
        if !log.is_empty() {
            committed.store = Arc::new(next);
            committed.version += 1;
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn next_sequence(&self, name: &str) -> Result<i64, Error> {
        let mut sequences = self.sequences.lock().unwrap_or_else(|e| e.into_inner());
        let Some(next) = sequences.get_mut(name) else {
            return Err(Error::Query(QueryError::new(
                QueryErrorKind::NotFound,
                format!("no such sequence '{name}'"),
            )));
        };
        let value = *next;
        *next += 1;
        Ok(value)
    }
}

/// `base` with `log` applied in order.
#[allow(clippy::result_large_err)]
pub(crate) fn replay(base: &Store, log: &[Statement]) -> Result<Store, Error> {
    let mut store = base.clone();
    for statement in log {
        store.apply(statement)?;
    }
    Ok(store)
}

/// An in-memory database built from a model's catalog.
///
/// Cloning is cheap; clones share the same data.
///
/// # Example
///
/// ```ignore
/// let db = MemoryDatabase::from_model(&model, MemoryConfig::default());
/// let conn = db.connect();
/// conn.begin(&cx).await?;
/// ```
#[derive(Clone)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    /// Create empty tables and sequences for every catalog entry.
    pub fn from_model(model: &DomainModel, config: MemoryConfig) -> Self {
        let catalog = model.catalog();
        let sequences = catalog.sequences().iter().map(|s| (s.clone(), 1)).collect();
        tracing::debug!(
            tables = catalog.tables().len(),
            sequences = catalog.sequences().len(),
            "creating in-memory database"
        );
        Self {
            shared: Arc::new(Shared {
                config,
                committed: Mutex::new(Committed {
                    store: Arc::new(Store::from_catalog(catalog)),
                    version: 0,
                }),
                sequences: Mutex::new(sequences),
                counters: Counters::default(),
            }),
        }
    }

    /// Open a new connection.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection::new(Arc::clone(&self.shared))
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.shared.config
    }

    /// Current counters.
    pub fn stats(&self) -> MemoryStats {
        self.shared.counters.snapshot()
    }

    /// Zero every counter except open cursors.
    pub fn reset_stats(&self) {
        self.shared.counters.reset();
    }

    /// Committed rows of a table, in insertion order.
    #[allow(clippy::result_large_err)]
    pub fn committed_rows(&self, table: &str) -> Result<Vec<Row>, Error> {
        let (store, _) = self.shared.snapshot();
        let data = store.table(table).ok_or_else(|| {
            Error::Query(QueryError::new(
                QueryErrorKind::NotFound,
                format!("no such table '{table}'"),
            ))
        })?;
        let columns = Arc::new(tessera_core::ColumnInfo::new(data.column_names()));
        Ok(data
            .rows
            .iter()
            .map(|r| Row::with_columns(Arc::clone(&columns), r.clone()))
            .collect())
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
