//! Query execution and materialization of result rows.
//!
//! Entity rows are mapped onto tracked states: a row whose key is already
//! tracked yields the existing [`EntityId`] (its unfetched slots are filled
//! from the row, nothing else is overwritten), otherwise a new loaded state is
//! registered. Rows of entities removed in this session are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tessera_core::{
    BinaryOp, Connection, Cx, Error, Key, Outcome, ProjectionItem, QueryPlan, Result, Row, RowReader, ScalarExpr,
    SelectPlan, Source, StructureValue, Tuple, TypeIdx, TypeRef, Value, try_outcome, try_result,
};
use tessera_query::{Args, BoundQuery, Expr, Query, ResultShape};

use crate::identity_map::{EntityLifecycle, EntityState};
use crate::{EntityId, Session};

/// One materialized result element.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Scalar(Value),
    /// A tracked entity; `None` for an outer-join miss or a removed entity
    Entity(Option<EntityId>),
    Structure(StructureValue),
    Record(Vec<(String, QueryValue)>),
}

impl QueryValue {
    pub fn as_entity(&self) -> Option<EntityId> {
        match self {
            QueryValue::Entity(id) => *id,
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            QueryValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_structure(&self) -> Option<&StructureValue> {
        match self {
            QueryValue::Structure(s) => Some(s),
            _ => None,
        }
    }

    /// Field of a record.
    pub fn field(&self, name: &str) -> Option<&QueryValue> {
        match self {
            QueryValue::Record(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl<C: Connection> Session<C> {
    /// Run a query and materialize every result element.
    ///
    /// Translation errors surface before any I/O. Pending changes are flushed
    /// first unless auto-flush is off or suppressed.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn query(&mut self, cx: &Cx, query: &Query, args: &Args) -> Outcome<Vec<QueryValue>, Error> {
        let Some(bound) = try_outcome!(self.prepare_read(cx, query, args).await) else {
            return Outcome::Ok(Vec::new());
        };
        let rows = try_outcome!(self.fetch_rows(cx, &bound).await);
        Outcome::Ok(try_result!(self.materialize_rows(&bound.shape, &rows)))
    }

    /// Run an entity query and return the tracked ids.
    pub async fn query_entities(&mut self, cx: &Cx, query: &Query, args: &Args) -> Outcome<Vec<EntityId>, Error> {
        let values = try_outcome!(self.query(cx, query, args).await);
        Outcome::Ok(values.iter().filter_map(QueryValue::as_entity).collect())
    }

    /// Run an entity query without flushing first.
    pub(crate) async fn query_entities_quiet(&mut self, cx: &Cx, query: &Query) -> Outcome<Vec<EntityId>, Error> {
        let previous = std::mem::replace(&mut self.auto_flush_suppressed, true);
        let result = self.query_entities(cx, query, &Args::new()).await;
        self.auto_flush_suppressed = previous;
        result
    }

    /// Run a scalar query (an aggregate, `any`, ...) and return its value.
    pub async fn query_scalar(&mut self, cx: &Cx, query: &Query, args: &Args) -> Outcome<Value, Error> {
        let values = try_outcome!(self.query(cx, query, args).await);
        match values.into_iter().next() {
            Some(QueryValue::Scalar(value)) => Outcome::Ok(value),
            Some(_) => Outcome::Err(Error::invalid_operation("query does not produce a scalar")),
            None => Outcome::Ok(Value::Null),
        }
    }

    /// Read only the first result element; the cursor is released right after.
    pub async fn first(&mut self, cx: &Cx, query: &Query, args: &Args) -> Outcome<Option<QueryValue>, Error> {
        let Some(bound) = try_outcome!(self.prepare_read(cx, query, args).await) else {
            return Outcome::Ok(None);
        };
        let read = match self.execute_statements(cx, &bound.setup).await {
            Outcome::Ok(_) => self.conn.query(cx, &bound.plan, &bound.params).await.map(|mut reader| {
                let row = reader.next();
                drop(reader);
                row
            }),
            failed => failed.map(|_| None),
        };
        match try_outcome!(self.finish_read(cx, &bound.teardown, read).await) {
            Some(row) => {
                let value = try_result!(self.materialize(&bound.shape, &row));
                Outcome::Ok(Some(value))
            }
            None => Outcome::Ok(None),
        }
    }

    /// Settle abandoned scopes, compile, auto-flush and bind.
    ///
    /// `None` means the query is statically empty and needs no round trip.
    pub(crate) async fn prepare_read(
        &mut self,
        cx: &Cx,
        query: &Query,
        args: &Args,
    ) -> Outcome<Option<BoundQuery>, Error> {
        try_outcome!(self.settle(cx).await);
        let (compiled, analysis) = try_result!(self.cache.prepare(&self.model, query));
        if compiled.is_empty() {
            tracing::debug!("statically empty query, no round trip");
            return Outcome::Ok(None);
        }
        try_outcome!(self.auto_flush(cx).await);
        let caps = self.conn.capabilities();
        Outcome::Ok(Some(try_result!(compiled.bind_analysis(&analysis, args, &caps))))
    }

    /// Flush before a read when the configuration asks for it.
    pub(crate) async fn auto_flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.auto_flush_suppressed || !self.config.flushes_before_reads() || !self.has_pending_changes() {
            return Outcome::Ok(());
        }
        tracing::debug!("auto-flush before read");
        try_outcome!(self.flush(cx).await);
        Outcome::Ok(())
    }

    /// Run a bound query with its temp-table setup and teardown.
    pub(crate) async fn fetch_rows(&self, cx: &Cx, bound: &BoundQuery) -> Outcome<Vec<Row>, Error> {
        let read = match self.execute_statements(cx, &bound.setup).await {
            Outcome::Ok(_) => self
                .conn
                .query(cx, &bound.plan, &bound.params)
                .await
                .map(RowReader::collect_rows),
            failed => failed.map(|_| Vec::new()),
        };
        self.finish_read(cx, &bound.teardown, read).await
    }

    /// Materialize rows; top-level entities removed in this session are dropped.
    #[allow(clippy::result_large_err)]
    pub(crate) fn materialize_rows(&mut self, shape: &ResultShape, rows: &[Row]) -> Result<Vec<QueryValue>> {
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            let value = self.materialize(shape, row)?;
            if matches!(shape, ResultShape::Entity { .. }) && value.as_entity().is_none() {
                continue;
            }
            values.push(value);
        }
        Ok(values)
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn materialize(&mut self, shape: &ResultShape, row: &Row) -> Result<QueryValue> {
        match shape {
            ResultShape::Scalar { column } => Ok(QueryValue::Scalar(row.get(*column).cloned().unwrap_or(Value::Null))),
            ResultShape::Entity {
                ty, type_id, columns, ..
            } => {
                if shape.is_absent(row) {
                    return Ok(QueryValue::Entity(None));
                }
                Ok(QueryValue::Entity(self.register_row(*ty, *type_id, columns, row)?))
            }
            ResultShape::Structure { ty, columns } => {
                let leaves: Vec<Value> = columns
                    .iter()
                    .map(|c| row.get(*c).cloned().unwrap_or(Value::Null))
                    .collect();
                Ok(QueryValue::Structure(StructureValue::from_leaves(&self.model, *ty, &leaves)))
            }
            ResultShape::Record(fields) => {
                let mut values = Vec::with_capacity(fields.len());
                for (name, field) in fields {
                    values.push((name.clone(), self.materialize(field, row)?));
                }
                Ok(QueryValue::Record(values))
            }
        }
    }

    /// Map one entity row onto a tracked state.
    #[allow(clippy::result_large_err)]
    fn register_row(
        &mut self,
        ty: TypeRef,
        type_id: usize,
        columns: &[Option<usize>],
        row: &Row,
    ) -> Result<Option<EntityId>> {
        let model = Arc::clone(&self.model);
        let discriminator = row.get(type_id).cloned().unwrap_or(Value::Null);
        let runtime = model
            .type_from_id(&discriminator)
            .ok_or_else(|| Error::invalid_operation(format!("row carries unknown type id {discriminator}")))?;
        let slots = model.slot_map(ty, runtime).ok_or_else(|| {
            Error::invalid_operation(format!(
                "{} is not an instance of {}",
                model.entity(runtime).name,
                model.type_ref_name(ty)
            ))
        })?;

        let def = model.entity(runtime);
        let tuple = row.scatter(def.columns.len(), &slots, columns);
        let key_values = def.key_columns().map(|s| tuple.values()[s].clone()).collect();
        let key = model.make_key(runtime, key_values)?;
        Ok(self.register_loaded(runtime, key, tuple))
    }

    /// Track a loaded row, or fill the missing slots of the tracked state.
    pub(crate) fn register_loaded(&mut self, runtime: TypeIdx, key: Key, tuple: Tuple) -> Option<EntityId> {
        if let Some(id) = self.states.lookup(&key) {
            let state = self.states.get(id)?;
            if state.is_removed() {
                return None;
            }
            let fills = tuple
                .availability()
                .iter()
                .any(|slot| !state.current.is_available(slot));
            if fills {
                let state = self.states.get_mut(id)?;
                state.current.merge_missing(&tuple);
                if let Some(persisted) = state.persisted.as_mut() {
                    persisted.merge_missing(&tuple);
                }
            }
            return Some(id);
        }
        Some(self.states.insert(EntityState {
            ty: runtime,
            key,
            lifecycle: EntityLifecycle::Loaded,
            current: tuple.clone(),
            persisted: Some(tuple),
            sets: HashMap::new(),
            inverse: HashMap::new(),
            version_written: false,
        }))
    }

    /// Load the entity with `key` as an instance of `ty`.
    pub(crate) async fn load_by_key(&mut self, cx: &Cx, ty: TypeIdx, key: &Key) -> Outcome<Option<EntityId>, Error> {
        let model = Arc::clone(&self.model);
        let def = model.entity(ty);
        let query = Query::all(def.name.clone()).filter(|e| {
            let mut predicate: Option<Expr> = None;
            for (column, value) in def.columns[def.key_columns()].iter().zip(key.values()) {
                let test = e.member(column.name.clone()).eq(value.clone());
                predicate = Some(match predicate {
                    Some(p) => p.and(test),
                    None => test,
                });
            }
            predicate.unwrap_or_else(|| Expr::constant(true))
        });
        let ids = try_outcome!(self.query_entities_quiet(cx, &query).await);
        Outcome::Ok(ids.into_iter().next())
    }

    /// Secondary fetch: read the full row of `id` and fill its missing slots.
    ///
    /// A row that no longer exists turns the state `NotAvailable`.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub(crate) async fn fetch_missing(&mut self, cx: &Cx, id: EntityId) -> Outcome<(), Error> {
        try_outcome!(self.settle(cx).await);
        let model = Arc::clone(&self.model);
        let state = try_result!(self.state(id));
        if state.persisted.is_none() {
            return Outcome::Ok(());
        }
        if !self.config.lazy_load {
            return Outcome::Err(Error::invalid_operation(format!(
                "{} has unloaded fields and lazy loading is disabled",
                model.describe_key(&state.key)
            )));
        }
        let def = model.entity(state.ty);
        let Some(table) = def.table.clone() else {
            return Outcome::Err(Error::invalid_operation(format!("{} has no table", def.name)));
        };
        let key = state.key.clone();

        let columns: Vec<String> = def.columns.iter().map(|c| c.name.clone()).collect();
        let plan = lookup_plan(&table, &columns, &columns[def.key_columns()]);

        let reader = try_outcome!(self.conn.query(cx, &plan, key.values()).await);
        let row = reader.collect_rows().into_iter().next();

        let state = try_result!(self.state_mut(id));
        match row {
            Some(row) => {
                let fetched = Tuple::from_values(row.into_values());
                let filled = state.current.merge_missing(&fetched);
                if let Some(persisted) = state.persisted.as_mut() {
                    persisted.merge_missing(&fetched);
                }
                tracing::debug!(filled, "secondary fetch complete");
            }
            None => {
                tracing::debug!("row vanished during secondary fetch");
                state.lifecycle = EntityLifecycle::NotAvailable;
            }
        }
        Outcome::Ok(())
    }
}

/// `SELECT projection FROM table WHERE filter_1 = $0 AND ...`
pub(crate) fn lookup_plan(table: &str, projection: &[String], filter: &[String]) -> QueryPlan {
    let mut select = SelectPlan::from_source(Source::Table {
        name: table.to_string(),
        alias: "t".to_string(),
    });
    select.projection = projection
        .iter()
        .map(|name| ProjectionItem {
            expr: ScalarExpr::column("t", name.clone()),
            alias: name.clone(),
        })
        .collect();
    select.filter = Some(ScalarExpr::conjunction(filter.iter().enumerate().map(|(i, name)| {
        ScalarExpr::binary(BinaryOp::Eq, ScalarExpr::column("t", name.clone()), ScalarExpr::Param(i))
    })));
    QueryPlan::Select(Box::new(select))
}
