//! Deferred queries.
//!
//! [`Session::future`] compiles and binds a query without running it.
//! Resolving any pending future runs every pending one in a single
//! `query_batch` round trip; the others keep their rows until resolved.

use std::collections::HashMap;

use tessera_core::{BatchQuery, Connection, Cx, Error, Outcome, Result, Row, RowReader, try_outcome, try_result};
use tessera_query::{Args, BoundQuery, Query, ResultShape};

use crate::materialize::QueryValue;
use crate::Session;

/// Handle to a deferred query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FutureQuery {
    id: u64,
}

/// Deferred queries of one session.
#[derive(Debug, Default)]
pub(crate) struct FutureBatch {
    next_id: u64,
    pending: Vec<(u64, BoundQuery)>,
    /// Fetched rows; `None` for a statically empty query
    ready: HashMap<u64, Option<(ResultShape, Vec<Row>)>>,
}

impl FutureBatch {
    fn next(&mut self) -> FutureQuery {
        let id = self.next_id;
        self.next_id += 1;
        FutureQuery { id }
    }
}

impl<C: Connection> Session<C> {
    /// Register a query for deferred execution.
    ///
    /// Translation errors surface here, before any I/O.
    #[allow(clippy::result_large_err)]
    pub fn future(&mut self, query: &Query, args: &Args) -> Result<FutureQuery> {
        self.settle_local();
        let (compiled, analysis) = self.cache.prepare(&self.model, query)?;
        let handle = self.futures.next();
        if compiled.is_empty() {
            self.futures.ready.insert(handle.id, None);
            return Ok(handle);
        }
        let bound = compiled.bind_analysis(&analysis, args, &self.conn.capabilities())?;
        self.futures.pending.push((handle.id, bound));
        tracing::debug!(future = handle.id, pending = self.futures.pending.len(), "query deferred");
        Ok(handle)
    }

    /// Number of deferred queries not yet executed.
    pub fn pending_futures(&self) -> usize {
        self.futures.pending.len()
    }

    /// Results of a deferred query.
    ///
    /// The first resolve runs every pending query in one round trip, after an
    /// auto-flush. Each future can be resolved once; a failed batch discards
    /// every future it carried.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn resolve(&mut self, cx: &Cx, future: FutureQuery) -> Outcome<Vec<QueryValue>, Error> {
        try_outcome!(self.settle(cx).await);
        if !self.futures.ready.contains_key(&future.id) {
            if !self.futures.pending.iter().any(|(id, _)| *id == future.id) {
                return Outcome::Err(Error::invalid_operation(format!(
                    "future {} was already resolved or belongs to another session",
                    future.id
                )));
            }
            try_outcome!(self.auto_flush(cx).await);
            try_outcome!(self.run_futures(cx).await);
        }
        match self.futures.ready.remove(&future.id) {
            Some(Some((shape, rows))) => Outcome::Ok(try_result!(self.materialize_rows(&shape, &rows))),
            _ => Outcome::Ok(Vec::new()),
        }
    }

    /// Execute every pending future in one batch.
    async fn run_futures(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let pending = std::mem::take(&mut self.futures.pending);
        let setup: Vec<_> = pending.iter().flat_map(|(_, b)| b.setup.iter().cloned()).collect();
        let teardown: Vec<_> = pending.iter().flat_map(|(_, b)| b.teardown.iter().cloned()).collect();
        let batch: Vec<BatchQuery<'_>> = pending
            .iter()
            .map(|(_, b)| BatchQuery {
                plan: &b.plan,
                params: &b.params,
            })
            .collect();
        let read = match self.execute_statements(cx, &setup).await {
            Outcome::Ok(_) => self
                .conn
                .query_batch(cx, &batch)
                .await
                .map(|readers| readers.into_iter().map(RowReader::collect_rows).collect::<Vec<_>>()),
            failed => failed.map(|_| Vec::new()),
        };
        let results = try_outcome!(self.finish_read(cx, &teardown, read).await);
        tracing::debug!(queries = pending.len(), "futures resolved in one batch");

        for ((id, bound), rows) in pending.into_iter().zip(results) {
            self.futures.ready.insert(id, Some((bound.shape, rows)));
        }
        Outcome::Ok(())
    }
}
