//! [`Connection`] implementation over a [`MemoryDatabase`](crate::MemoryDatabase).
//!
//! Transactions are read-committed. A transaction keeps the log of its own
//! statements and a private view of the data: the committed store as of
//! `base_version` with the log replayed over it. Whenever another connection
//! commits, the view is rebuilt from the newer committed store before the
//! next read or write. Savepoints are positions in the log.
//!
//! Temporary tables belong to the connection and ignore transactions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tessera_core::error::{TransactionError, TransactionErrorKind};
use tessera_core::{
    BatchQuery, Connection, CursorGuard, Cx, Dialect, DriverCapabilities, Error, Outcome,
    QueryError, QueryErrorKind, QueryPlan, RowReader, Statement, Value, render_plan,
    render_statement,
};

use crate::database::{Shared, replay};
use crate::eval::{Evaluator, Relation, TempTable};
use crate::store::Store;

#[derive(Debug)]
struct TxState {
    log: Vec<Statement>,
    view: Store,
    base_version: u64,
    savepoints: Vec<(String, usize)>,
}

#[derive(Debug, Default)]
struct ConnState {
    tx: Option<TxState>,
    temps: HashMap<String, TempTable>,
}

/// A connection to an in-memory database.
pub struct MemoryConnection {
    shared: Arc<Shared>,
    state: Mutex<ConnState>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("in_transaction", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

fn tx_error(kind: TransactionErrorKind, message: impl Into<String>) -> Error {
    Error::Transaction(TransactionError {
        kind,
        message: message.into(),
    })
}

fn unsupported(message: impl Into<String>) -> Error {
    Error::Query(QueryError::new(QueryErrorKind::Unsupported, message))
}

/// Tag a statement failure with its position in the batch.
fn at_index(err: Error, index: usize) -> Error {
    match err {
        Error::Query(q) => Error::Query(q.with_statement_index(index)),
        other => other,
    }
}

/// Run `op` unless `cx` is already cancelled.
fn run_sync<T>(cx: &Cx, op: impl FnOnce() -> Result<T, Error>) -> Outcome<T, Error> {
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    op().map_or_else(Outcome::Err, Outcome::Ok)
}

impl MemoryConnection {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            state: Mutex::new(ConnState::default()),
        }
    }

    /// Temporary tables currently held by this connection.
    pub fn temp_tables(&self) -> usize {
        self.lock().temps.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bring the transaction view up to date with the committed store.
    #[allow(clippy::result_large_err)]
    fn refresh(&self, tx: &mut TxState) -> Result<(), Error> {
        let (committed, version) = self.shared.snapshot();
        if version != tx.base_version {
            tracing::trace!(
                from = tx.base_version,
                to = version,
                log = tx.log.len(),
                "rebuilding transaction view"
            );
            tx.view = replay(&committed, &tx.log)?;
            tx.base_version = version;
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn evaluate(&self, state: &mut ConnState, plan: &QueryPlan, params: &[Value]) -> Result<Relation, Error> {
        if tracing::enabled!(tracing::Level::TRACE) {
            let rendered = render_plan(plan, self.shared.config.dialect, params);
            tracing::trace!(sql = %rendered.sql, params = rendered.params.len(), "query");
        }
        self.shared.counters.query();
        let ConnState { tx, temps } = state;
        match tx {
            Some(tx) => {
                self.refresh(tx)?;
                Evaluator::new(&tx.view, temps, params).run(plan)
            }
            None => {
                let (store, _) = self.shared.snapshot();
                Evaluator::new(&store, temps, params).run(plan)
            }
        }
    }

    fn reader(&self, relation: Relation) -> RowReader {
        self.shared.counters.cursor_opened();
        let shared = Arc::clone(&self.shared);
        RowReader::new(relation.columns, relation.rows)
            .with_guard(CursorGuard::new(move || shared.counters.cursor_closed()))
    }

    #[allow(clippy::result_large_err)]
    fn query_sync(&self, plan: &QueryPlan, params: &[Value]) -> Result<RowReader, Error> {
        self.shared.counters.round_trip();
        let mut state = self.lock();
        let relation = self.evaluate(&mut state, plan, params)?;
        tracing::debug!(rows = relation.rows.len(), "query returned");
        Ok(self.reader(relation))
    }

    #[allow(clippy::result_large_err)]
    fn query_batch_sync(&self, queries: &[BatchQuery<'_>]) -> Result<Vec<RowReader>, Error> {
        if !self.shared.config.batching && queries.len() > 1 {
            return Err(unsupported("query batching is disabled"));
        }
        self.shared.counters.round_trip();
        let mut state = self.lock();
        let mut relations = Vec::with_capacity(queries.len());
        for (i, query) in queries.iter().enumerate() {
            let relation = self
                .evaluate(&mut state, query.plan, query.params)
                .map_err(|e| at_index(e, i))?;
            relations.push(relation);
        }
        drop(state);
        tracing::debug!(count = queries.len(), "query batch returned");
        Ok(relations.into_iter().map(|r| self.reader(r)).collect())
    }

    #[allow(clippy::result_large_err)]
    fn apply(&self, state: &mut ConnState, statement: &Statement) -> Result<u64, Error> {
        if tracing::enabled!(tracing::Level::TRACE) {
            let rendered = render_statement(statement, self.shared.config.dialect);
            tracing::trace!(sql = %rendered.sql, params = rendered.params.len(), "statement");
        }
        self.shared.counters.statement();
        match statement {
            Statement::CreateTempTable {
                name,
                columns,
                rows,
            } => {
                if !self.shared.config.temp_tables {
                    return Err(unsupported("temporary tables are disabled"));
                }
                state.temps.insert(
                    name.clone(),
                    TempTable {
                        columns: columns.clone(),
                        rows: rows.clone(),
                    },
                );
                Ok(rows.len() as u64)
            }
            Statement::DropTempTable { name } => Ok(u64::from(state.temps.remove(name).is_some())),
            _ => match &mut state.tx {
                Some(tx) => {
                    self.refresh(tx)?;
                    let affected = tx.view.apply(statement)?;
                    tx.log.push(statement.clone());
                    Ok(affected)
                }
                None => self.shared.autocommit(statement),
            },
        }
    }

    #[allow(clippy::result_large_err)]
    fn execute_sync(&self, statement: &Statement) -> Result<u64, Error> {
        self.shared.counters.round_trip();
        let mut state = self.lock();
        let affected = self.apply(&mut state, statement)?;
        tracing::debug!(
            table = statement.table(),
            kind = statement.kind(),
            affected,
            "statement executed"
        );
        Ok(affected)
    }

    #[allow(clippy::result_large_err)]
    fn execute_batch_sync(&self, statements: &[Statement]) -> Result<Vec<u64>, Error> {
        let mut state = self.lock();
        let mut counts = Vec::with_capacity(statements.len());
        if self.shared.config.batching {
            self.shared.counters.round_trip();
        }
        for (i, statement) in statements.iter().enumerate() {
            if !self.shared.config.batching {
                self.shared.counters.round_trip();
            }
            let affected = self.apply(&mut state, statement).map_err(|e| {
                tracing::debug!(index = i, table = statement.table(), error = %e, "batch statement failed");
                at_index(e, i)
            })?;
            counts.push(affected);
        }
        tracing::debug!(count = statements.len(), "statement batch executed");
        Ok(counts)
    }

    #[allow(clippy::result_large_err)]
    fn begin_sync(&self) -> Result<(), Error> {
        let mut state = self.lock();
        if state.tx.is_some() {
            return Err(tx_error(
                TransactionErrorKind::AlreadyActive,
                "a transaction is already active on this connection",
            ));
        }
        let (store, version) = self.shared.snapshot();
        state.tx = Some(TxState {
            log: Vec::new(),
            view: (*store).clone(),
            base_version: version,
            savepoints: Vec::new(),
        });
        tracing::debug!(version, "transaction started");
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn commit_sync(&self) -> Result<(), Error> {
        let mut state = self.lock();
        let tx = state.tx.take().ok_or_else(|| {
            tx_error(TransactionErrorKind::NotActive, "commit without an active transaction")
        })?;
        let statements = tx.log.len();
        let result = self.shared.commit(&tx.log, tx.view, tx.base_version);
        match &result {
            Ok(()) => {
                self.shared.counters.commit();
                tracing::debug!(statements, "transaction committed");
            }
            Err(e) => {
                self.shared.counters.rollback();
                tracing::warn!(statements, error = %e, "commit failed, transaction discarded");
            }
        }
        result
    }

    #[allow(clippy::result_large_err)]
    fn rollback_sync(&self) -> Result<(), Error> {
        let mut state = self.lock();
        let tx = state.tx.take().ok_or_else(|| {
            tx_error(TransactionErrorKind::NotActive, "rollback without an active transaction")
        })?;
        self.shared.counters.rollback();
        tracing::debug!(statements = tx.log.len(), "transaction rolled back");
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn with_savepoints<T>(
        &self,
        op: impl FnOnce(&Self, &mut TxState) -> Result<T, Error>,
    ) -> Result<T, Error> {
        if !self.shared.config.savepoints {
            return Err(unsupported("savepoints are disabled"));
        }
        let mut state = self.lock();
        let tx = state.tx.as_mut().ok_or_else(|| {
            tx_error(TransactionErrorKind::NotActive, "savepoints require an active transaction")
        })?;
        op(self, tx)
    }

    #[allow(clippy::result_large_err)]
    fn savepoint_position(tx: &TxState, name: &str) -> Result<usize, Error> {
        tx.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| {
                tx_error(
                    TransactionErrorKind::SavepointNotFound,
                    format!("no savepoint named '{name}'"),
                )
            })
    }

    #[allow(clippy::result_large_err)]
    fn savepoint_sync(&self, name: &str) -> Result<(), Error> {
        self.with_savepoints(|_, tx| {
            tx.savepoints.push((name.to_string(), tx.log.len()));
            tracing::trace!(name, mark = tx.log.len(), "savepoint");
            Ok(())
        })
    }

    #[allow(clippy::result_large_err)]
    fn rollback_to_savepoint_sync(&self, name: &str) -> Result<(), Error> {
        self.with_savepoints(|conn, tx| {
            let pos = Self::savepoint_position(tx, name)?;
            let mark = tx.savepoints[pos].1;
            tx.savepoints.truncate(pos);
            let discarded = tx.log.len() - mark;
            tx.log.truncate(mark);
            let (committed, version) = conn.shared.snapshot();
            tx.view = replay(&committed, &tx.log)?;
            tx.base_version = version;
            tracing::debug!(name, discarded, "rolled back to savepoint");
            Ok(())
        })
    }

    #[allow(clippy::result_large_err)]
    fn release_savepoint_sync(&self, name: &str) -> Result<(), Error> {
        self.with_savepoints(|_, tx| {
            let pos = Self::savepoint_position(tx, name)?;
            tx.savepoints.truncate(pos);
            tracing::trace!(name, "savepoint released");
            Ok(())
        })
    }
}

impl Connection for MemoryConnection {
    fn capabilities(&self) -> DriverCapabilities {
        self.shared.config.capabilities()
    }

    fn dialect(&self) -> Dialect {
        self.shared.config.dialect
    }

    #[tracing::instrument(level = "debug", skip_all)]
    fn query(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
        params: &[Value],
    ) -> impl Future<Output = Outcome<RowReader, Error>> + Send {
        let outcome = run_sync(cx, || self.query_sync(plan, params));
        async move { outcome }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = queries.len()))]
    fn query_batch(
        &self,
        cx: &Cx,
        queries: &[BatchQuery<'_>],
    ) -> impl Future<Output = Outcome<Vec<RowReader>, Error>> + Send {
        let outcome = run_sync(cx, || self.query_batch_sync(queries));
        async move { outcome }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(table = statement.table()))]
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let outcome = run_sync(cx, || self.execute_sync(statement));
        async move { outcome }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = statements.len()))]
    fn execute_batch(
        &self,
        cx: &Cx,
        statements: &[Statement],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        let outcome = run_sync(cx, || self.execute_batch_sync(statements));
        async move { outcome }
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = run_sync(cx, || self.begin_sync());
        async move { outcome }
    }

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = run_sync(cx, || self.commit_sync());
        async move { outcome }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        // Rollback runs even under cancellation so the connection is left clean.
        let result = self.rollback_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn in_transaction(&self) -> bool {
        self.lock().tx.is_some()
    }

    fn savepoint(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = run_sync(cx, || self.savepoint_sync(name));
        async move { outcome }
    }

    fn rollback_to_savepoint(
        &self,
        _cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.rollback_to_savepoint_sync(name);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn release_savepoint(
        &self,
        cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = run_sync(cx, || self.release_savepoint_sync(name));
        async move { outcome }
    }

    fn next_sequence_value(
        &self,
        cx: &Cx,
        sequence: &str,
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let outcome = run_sync(cx, || self.shared.next_sequence(sequence));
        async move { outcome }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryConfig, MemoryDatabase};
    use asupersync::runtime::RuntimeBuilder;
    use tessera_core::{
        DomainModel, EntityDecl, FieldDecl, KeyGenerator, ProjectionItem, ScalarExpr, ScalarType,
        SelectPlan, Source,
    };

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            Outcome::Ok(_) => panic!("expected an error"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn database(config: MemoryConfig) -> MemoryDatabase {
        let model = DomainModel::builder()
            .entity(
                EntityDecl::new("Owner")
                    .key("Id", ScalarType::Int)
                    .key_generator(KeyGenerator::Sequence("owner_seq".into()))
                    .field(FieldDecl::scalar("Name", ScalarType::Text)),
            )
            .build()
            .unwrap();
        MemoryDatabase::from_model(&model, config)
    }

    fn insert_owner(id: i32, name: &str) -> Statement {
        Statement::Insert {
            table: "Owner".into(),
            columns: vec!["TypeId".into(), "Id".into(), "Name".into()],
            rows: vec![vec![Value::Int(0), Value::Int(id), Value::Text(name.into())]],
        }
    }

    fn names_plan() -> QueryPlan {
        let mut select = SelectPlan::from_source(Source::Table {
            name: "Owner".into(),
            alias: "o".into(),
        });
        select.projection.push(ProjectionItem {
            expr: ScalarExpr::column("o", "Name"),
            alias: "Name".into(),
        });
        QueryPlan::Select(Box::new(select))
    }

    async fn names(cx: &Cx, conn: &MemoryConnection) -> Vec<String> {
        unwrap_outcome(conn.query(cx, &names_plan(), &[]).await)
            .collect_rows()
            .into_iter()
            .map(|r| match r.get(0) {
                Some(Value::Text(s)) => s.clone(),
                other => panic!("unexpected value {other:?}"),
            })
            .collect()
    }

    #[test]
    fn uncommitted_writes_are_private_to_the_transaction() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let db = database(MemoryConfig::default());
            let a = db.connect();
            let b = db.connect();

            unwrap_outcome(a.begin(&cx).await);
            unwrap_outcome(a.execute(&cx, &insert_owner(1, "ann")).await);
            assert_eq!(names(&cx, &a).await, vec!["ann"]);
            assert!(names(&cx, &b).await.is_empty());

            unwrap_outcome(a.commit(&cx).await);
            assert_eq!(names(&cx, &b).await, vec!["ann"]);
            assert_eq!(db.stats().commits, 1);
        });
    }

    #[test]
    fn open_transaction_sees_other_commits() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let db = database(MemoryConfig::default());
            let a = db.connect();
            let b = db.connect();

            unwrap_outcome(a.begin(&cx).await);
            unwrap_outcome(a.execute(&cx, &insert_owner(1, "ann")).await);
            unwrap_outcome(b.execute(&cx, &insert_owner(2, "bob")).await);

            let mut seen = names(&cx, &a).await;
            seen.sort();
            assert_eq!(seen, vec!["ann", "bob"]);
            unwrap_outcome(a.commit(&cx).await);
            assert_eq!(db.committed_rows("Owner").unwrap().len(), 2);
        });
    }

    #[test]
    fn rollback_discards_the_log() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let db = database(MemoryConfig::default());
            let conn = db.connect();
            unwrap_outcome(conn.begin(&cx).await);
            unwrap_outcome(conn.execute(&cx, &insert_owner(1, "ann")).await);
            unwrap_outcome(conn.rollback(&cx).await);
            assert!(!conn.in_transaction());
            assert!(db.committed_rows("Owner").unwrap().is_empty());

            let err = expect_err(conn.commit(&cx).await);
            assert!(matches!(
                err,
                Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::NotActive,
                    ..
                })
            ));
        });
    }

    #[test]
    fn savepoint_rollback_keeps_earlier_work() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let db = database(MemoryConfig::default());
            let conn = db.connect();
            unwrap_outcome(conn.begin(&cx).await);
            unwrap_outcome(conn.execute(&cx, &insert_owner(1, "ann")).await);
            unwrap_outcome(conn.savepoint(&cx, "sp1").await);
            unwrap_outcome(conn.execute(&cx, &insert_owner(2, "bob")).await);
            unwrap_outcome(conn.rollback_to_savepoint(&cx, "sp1").await);

            assert_eq!(names(&cx, &conn).await, vec!["ann"]);
            let err = expect_err(conn.release_savepoint(&cx, "sp1").await);
            assert!(matches!(
                err,
                Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::SavepointNotFound,
                    ..
                })
            ));
            unwrap_outcome(conn.commit(&cx).await);
            assert_eq!(db.committed_rows("Owner").unwrap().len(), 1);
        });
    }

    #[test]
    fn batch_stops_at_first_failure_with_its_index() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let db = database(MemoryConfig::default());
            let conn = db.connect();
            let batch = vec![
                insert_owner(1, "ann"),
                insert_owner(1, "dup"),
                insert_owner(2, "bob"),
            ];
            let err = expect_err(conn.execute_batch(&cx, &batch).await);
            match err {
                Error::Query(q) => {
                    assert_eq!(q.statement_index, Some(1));
                    assert!(q.is_unique_violation());
                }
                other => panic!("unexpected error {other:?}"),
            }
            assert_eq!(names(&cx, &conn).await, vec!["ann"]);
            assert_eq!(db.stats().round_trips, 2);
        });
    }

    #[test]
    fn unbatched_driver_counts_a_round_trip_per_statement() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let db = database(MemoryConfig::default().batching(false));
            let conn = db.connect();
            let batch = vec![insert_owner(1, "ann"), insert_owner(2, "bob")];
            assert_eq!(unwrap_outcome(conn.execute_batch(&cx, &batch).await), vec![1, 1]);
            assert_eq!(db.stats().round_trips, 2);
        });
    }

    #[test]
    fn readers_release_cursors() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let db = database(MemoryConfig::default());
            let conn = db.connect();
            unwrap_outcome(conn.execute(&cx, &insert_owner(1, "ann")).await);

            let reader = unwrap_outcome(conn.query(&cx, &names_plan(), &[]).await);
            assert_eq!(db.stats().open_cursors, 1);
            drop(reader);
            assert_eq!(db.stats().open_cursors, 0);

            let plans = [names_plan(), names_plan()];
            let batch: Vec<_> = plans.iter().map(|plan| BatchQuery { plan, params: &[] }).collect();
            let readers = unwrap_outcome(conn.query_batch(&cx, &batch).await);
            assert_eq!(db.stats().open_cursors, 2);
            for reader in readers {
                assert_eq!(reader.collect_rows().len(), 1);
            }
            assert_eq!(db.stats().open_cursors, 0);
        });
    }

    #[test]
    fn temp_tables_are_connection_local() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let db = database(MemoryConfig::default());
            let a = db.connect();
            let b = db.connect();
            let create = Statement::CreateTempTable {
                name: "tessera_tmp_0".into(),
                columns: vec!["Value".into()],
                rows: vec![vec![Value::Int(1)], vec![Value::Int(2)]],
            };
            assert_eq!(unwrap_outcome(a.execute(&cx, &create).await), 2);
            assert_eq!((a.temp_tables(), b.temp_tables()), (1, 0));

            let mut select = SelectPlan::from_source(Source::TempTable {
                name: "tessera_tmp_0".into(),
                columns: vec!["Value".into()],
                alias: "t".into(),
            });
            select.projection.push(ProjectionItem {
                expr: ScalarExpr::column("t", "Value"),
                alias: "Value".into(),
            });
            let plan = QueryPlan::Select(Box::new(select));
            assert_eq!(unwrap_outcome(a.query(&cx, &plan, &[]).await).collect_rows().len(), 2);
            assert!(matches!(b.query(&cx, &plan, &[]).await, Outcome::Err(_)));

            let drop_it = Statement::DropTempTable {
                name: "tessera_tmp_0".into(),
            };
            assert_eq!(unwrap_outcome(a.execute(&cx, &drop_it).await), 1);
            assert_eq!(a.temp_tables(), 0);
        });
    }

    #[test]
    fn sequences_ignore_rollback() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let db = database(MemoryConfig::default());
            let conn = db.connect();
            unwrap_outcome(conn.begin(&cx).await);
            assert_eq!(unwrap_outcome(conn.next_sequence_value(&cx, "owner_seq").await), 1);
            unwrap_outcome(conn.rollback(&cx).await);
            assert_eq!(unwrap_outcome(conn.next_sequence_value(&cx, "owner_seq").await), 2);
            assert!(matches!(
                conn.next_sequence_value(&cx, "missing").await,
                Outcome::Err(Error::Query(_))
            ));
        });
    }

    #[test]
    fn disabled_savepoints_are_unsupported() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let db = database(MemoryConfig::default().savepoints(false));
            let conn = db.connect();
            unwrap_outcome(conn.begin(&cx).await);
            match expect_err(conn.savepoint(&cx, "sp").await) {
                Error::Query(q) => assert_eq!(q.kind, QueryErrorKind::Unsupported),
                other => panic!("unexpected error {other:?}"),
            }
        });
    }
}
