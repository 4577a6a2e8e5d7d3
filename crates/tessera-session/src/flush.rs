//! Flush: writing tracked changes back in dependency order.
//!
//! A flush turns every pending state into statements, in this order:
//!
//! 1. junction rows that go away (removed members, cleared sets, rows of
//!    removed entities)
//! 2. inserts, referenced rows first
//! 3. references that were left NULL to break an insert cycle
//! 4. updates of changed columns
//! 5. new junction rows
//! 6. references nulled to break a delete cycle
//! 7. deletes, referencing rows first
//!
//! Consecutive rows for the same table and column list share one statement,
//! up to the configured batch size. When the driver supports savepoints the
//! statements run inside one, so a failed flush leaves storage as it found it.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tessera_core::{
    Connection, ConstraintViolationError, Cx, DomainModel, EntityTypeDef, Error, FieldDef,
    FieldKind, Key, Outcome, QueryErrorKind, Result, Statement, TransactionError,
    TransactionErrorKind, Value, VersionConflictError, try_outcome, try_result,
};

use crate::association::reference_key;
use crate::change_tracker::changed_columns;
use crate::identity_map::{EntityLifecycle, EntityState};
use crate::unit_of_work::{DependencyGraph, Step, schedule};
use crate::version::{next_version, validate_state};
use crate::{EntityId, Session};

const FLUSH_SAVEPOINT: &str = "tessera_flush";

/// What a flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub links_added: usize,
    pub links_removed: usize,
    /// Statements sent to storage
    pub statements: usize,
}

impl FlushSummary {
    /// Whether the flush had nothing to write.
    pub fn is_empty(&self) -> bool {
        self.statements == 0
    }
}

/// One row of a multi-row insert or delete, before merging.
#[derive(Debug, Clone)]
struct RowOp {
    id: Option<EntityId>,
    table: String,
    columns: Vec<String>,
    values: Vec<Value>,
    /// The row carries a version filter
    versioned: bool,
}

impl RowOp {
    fn link(table: &str, columns: Vec<String>, values: Vec<Value>) -> Self {
        Self {
            id: None,
            table: table.to_string(),
            columns,
            values,
            versioned: false,
        }
    }

    fn same_shape(&self, other: &RowOp) -> bool {
        self.table == other.table && self.columns == other.columns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowKind {
    Insert,
    Delete,
}

/// Entities a statement writes, for error reporting.
#[derive(Debug, Clone, Default)]
struct Origin {
    entities: Vec<EntityId>,
    versioned: bool,
}

/// Statements of one flush, in execution order.
#[derive(Debug, Default)]
struct FlushPlan {
    statements: Vec<Statement>,
    origins: Vec<Origin>,
    /// Version values written by updates, applied once the flush succeeds
    versions: HashMap<EntityId, (usize, Value)>,
    summary: FlushSummary,
}

impl FlushPlan {
    fn push(&mut self, statement: Statement, origin: Origin) {
        self.statements.push(statement);
        self.origins.push(origin);
        self.summary.statements += 1;
    }

    /// Merge row units into multi-row statements.
    ///
    /// A unit is never split across statements; consecutive units of one
    /// shape share a statement while it stays within `batch_size` rows.
    fn push_rows(&mut self, units: Vec<Vec<RowOp>>, kind: RowKind, batch_size: usize) {
        let mut batch: Vec<RowOp> = Vec::new();
        for unit in units {
            if unit.is_empty() {
                continue;
            }
            let joins = batch.first().is_some_and(|b| {
                unit.iter().all(|r| r.same_shape(b)) && batch.len() + unit.len() <= batch_size.max(1)
            });
            if !joins {
                self.emit(std::mem::take(&mut batch), kind);
            }
            batch.extend(unit);
        }
        self.emit(batch, kind);
    }

    fn emit(&mut self, rows: Vec<RowOp>, kind: RowKind) {
        let Some(first) = rows.first() else {
            return;
        };
        let table = first.table.clone();
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for column in &row.columns {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
        }
        let values: Vec<Vec<Value>> = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| {
                        row.columns
                            .iter()
                            .position(|rc| rc == c)
                            .map_or(Value::Null, |i| row.values[i].clone())
                    })
                    .collect()
            })
            .collect();
        let versioned = rows.iter().any(|r| r.versioned);
        let origin = Origin {
            entities: rows.iter().filter_map(|r| r.id).collect(),
            versioned,
        };
        let statement = match kind {
            RowKind::Insert => Statement::Insert {
                table,
                columns,
                rows: values,
            },
            RowKind::Delete => Statement::Delete {
                table,
                filter_columns: columns,
                expected_rows: versioned.then_some(values.len() as u64),
                rows: values,
            },
        };
        self.push(statement, origin);
    }
}

impl<C: Connection> Session<C> {
    /// Write every pending change to storage.
    ///
    /// Validators run first; nothing is written when one fails. Without an
    /// open transaction the flush begins one when `auto_begin` is set and
    /// fails with `Transaction(NotActive)` otherwise. Storage failures are
    /// mapped to `ConstraintViolation` and `VersionConflict` where they can be
    /// attributed, and leave every tracked state pending.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushSummary, Error> {
        try_outcome!(self.settle(cx).await);
        let pending: Vec<EntityId> = self
            .states
            .iter()
            .filter(|(_, s)| s.is_pending())
            .map(|(id, _)| id)
            .collect();
        if pending.is_empty() {
            return Outcome::Ok(FlushSummary::default());
        }
        for &id in &pending {
            let state = try_result!(self.state(id));
            if state.is_live() {
                if let Err(errors) = validate_state(&self.model, state) {
                    return Outcome::Err(Error::Validation(errors));
                }
            }
        }

        let plan = try_result!(self.plan_flush());
        if plan.statements.is_empty() {
            self.promote(&plan, &pending);
            return Outcome::Ok(plan.summary);
        }

        if !self.conn.in_transaction() {
            if !self.config.auto_begin {
                return Outcome::Err(Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::NotActive,
                    message: "flush needs an open transaction and auto_begin is off".to_string(),
                }));
            }
            try_outcome!(self.begin_implicit(cx).await);
        }

        let savepoint = self.conn.capabilities().savepoints;
        if savepoint {
            try_outcome!(self.conn.savepoint(cx, FLUSH_SAVEPOINT).await);
        }
        match self.execute_statements(cx, &plan.statements).await {
            Outcome::Ok(_) => {}
            Outcome::Err(err) => {
                if savepoint {
                    self.abandon_flush(cx).await;
                }
                let err = self.flush_error(err, &plan);
                tracing::warn!(error = %err, "flush failed");
                return Outcome::Err(err);
            }
            Outcome::Cancelled(reason) => {
                if savepoint {
                    self.abandon_flush(cx).await;
                }
                return Outcome::Cancelled(reason);
            }
            Outcome::Panicked(payload) => return Outcome::Panicked(payload),
        }
        if savepoint {
            try_outcome!(self.conn.release_savepoint(cx, FLUSH_SAVEPOINT).await);
        }

        self.promote(&plan, &pending);
        let summary = plan.summary;
        tracing::info!(
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            links_added = summary.links_added,
            links_removed = summary.links_removed,
            statements = summary.statements,
            "flush complete"
        );
        Outcome::Ok(summary)
    }

    /// Flush and commit, beginning a transaction first if none is open.
    ///
    /// Commits the whole session transaction, including any open scopes.
    pub async fn save_changes(&mut self, cx: &Cx) -> Outcome<FlushSummary, Error> {
        try_outcome!(self.settle(cx).await);
        if !self.conn.in_transaction() {
            try_outcome!(self.begin_implicit(cx).await);
        }
        let summary = try_outcome!(self.flush(cx).await);
        try_outcome!(self.commit(cx).await);
        Outcome::Ok(summary)
    }

    async fn abandon_flush(&self, cx: &Cx) {
        if let Outcome::Err(err) = self.conn.rollback_to_savepoint(cx, FLUSH_SAVEPOINT).await {
            tracing::warn!(error = %err, "could not roll back failed flush");
        }
    }

    #[allow(clippy::result_large_err)]
    fn plan_flush(&self) -> Result<FlushPlan> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for (id, state) in self.states.iter() {
            match (state.lifecycle, state.persisted.is_some()) {
                (EntityLifecycle::New | EntityLifecycle::Modified, false) => inserts.push(id),
                (EntityLifecycle::Modified, true) => updates.push(id),
                (EntityLifecycle::Removed, true) => deletes.push(id),
                _ => {}
            }
        }

        let mut plan = FlushPlan::default();
        let (link_deletes, link_inserts) = self.link_changes(&deletes)?;
        plan.summary.links_removed = link_deletes.len();
        plan.summary.links_added = link_inserts.len();
        let batch_size = self.config.batch_size;

        plan.push_rows(link_deletes.into_iter().map(|r| vec![r]).collect(), RowKind::Delete, batch_size);
        self.plan_inserts(&mut plan, &inserts)?;
        self.plan_updates(&mut plan, &updates)?;
        plan.push_rows(link_inserts.into_iter().map(|r| vec![r]).collect(), RowKind::Insert, batch_size);
        self.plan_deletes(&mut plan, &deletes)?;
        Ok(plan)
    }

    /// Junction rows to delete and to insert.
    #[allow(clippy::result_large_err)]
    fn link_changes(&self, removed: &[EntityId]) -> Result<(Vec<RowOp>, Vec<RowOp>)> {
        let model = &*self.model;
        let gone = |key: &Key| {
            self.states
                .lookup(key)
                .and_then(|id| self.states.get(id))
                .is_some_and(EntityState::is_removed)
        };
        let mut deletes = Vec::new();
        let mut inserts = Vec::new();

        for &id in removed {
            let state = self.state(id)?;
            for a in model.associations().iter().filter(|a| a.is_master) {
                let Some(junction) = &a.junction else {
                    continue;
                };
                if model.is_subtype(state.ty, a.owner_type) {
                    deletes.push(RowOp::link(&junction.table, junction.owner_columns.clone(), state.key.values().to_vec()));
                }
                if model.is_subtype(state.ty, a.target_type) {
                    deletes.push(RowOp::link(&junction.table, junction.target_columns.clone(), state.key.values().to_vec()));
                }
            }
        }

        for (_, state) in self.states.iter().filter(|(_, s)| s.is_live()) {
            let def = model.entity(state.ty);
            let mut fields: Vec<_> = state.sets.iter().filter(|(_, s)| s.has_changes()).collect();
            fields.sort_by_key(|(field, _)| **field);
            for (field, set) in fields {
                let Some(assoc) = def.field_at(*field).association else {
                    continue;
                };
                let a = model.association(assoc);
                let Some(junction) = a.junction.as_ref().filter(|_| a.is_master) else {
                    continue;
                };
                let owner = state.key.values();
                let pair_columns: Vec<String> = junction
                    .owner_columns
                    .iter()
                    .chain(&junction.target_columns)
                    .cloned()
                    .collect();
                let pair = |target: &Key| {
                    let values = owner.iter().chain(target.values()).cloned().collect();
                    RowOp::link(&junction.table, pair_columns.clone(), values)
                };

                if set.cleared && state.persisted.is_some() {
                    deletes.push(RowOp::link(&junction.table, junction.owner_columns.clone(), owner.to_vec()));
                }
                for target in set.removed.iter().filter(|k| !gone(k)) {
                    deletes.push(pair(target));
                }
                for target in set.added.iter().filter(|k| !gone(k)) {
                    if !set.cleared {
                        match &set.baseline {
                            Some(baseline) if baseline.contains(target) => continue,
                            None if state.persisted.is_some() => deletes.push(pair(target)),
                            _ => {}
                        }
                    }
                    inserts.push(pair(target));
                }
            }
        }

        deletes.sort_by(|a, b| (&a.table, &a.columns).cmp(&(&b.table, &b.columns)));
        inserts.sort_by(|a, b| a.table.cmp(&b.table));
        Ok((deletes, inserts))
    }

    #[allow(clippy::result_large_err)]
    fn plan_inserts(&self, plan: &mut FlushPlan, ids: &[EntityId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let model = &*self.model;
        let states: Vec<&EntityState> = ids.iter().map(|id| self.state(*id)).collect::<Result<_>>()?;
        let (graph, references) = reference_graph(model, &states, |s| &s.current)?;
        let order = schedule(&graph).map_err(|cycle| {
            let rows: Vec<String> = cycle
                .nodes
                .iter()
                .map(|n| model.describe_key(&states[*n].key))
                .collect();
            Error::invalid_operation(format!(
                "cannot order inserts: non-nullable references form a cycle ({})",
                rows.join(", ")
            ))
        })?;
        let deferred: HashSet<(usize, usize)> = order.deferred.iter().copied().collect();

        let mut rows: Vec<Option<RowOp>> = Vec::with_capacity(states.len());
        let mut patches = Vec::new();
        for (n, state) in states.iter().enumerate() {
            let def = model.entity(state.ty);
            let table = table_of(def)?;
            let mut values = state.current.values().to_vec();
            let mut patch = Vec::new();
            for (to, field) in &references[n] {
                if !field.nullable || !deferred.contains(&(n, *to)) {
                    continue;
                }
                for slot in field.columns.clone() {
                    patch.push((def.columns[slot].name.clone(), values[slot].clone()));
                    values[slot] = Value::Null;
                }
            }

            let mut columns = Vec::with_capacity(values.len() + 1);
            if let Some(discriminator) = model.catalog().table(&table).and_then(|t| t.discriminator.clone()) {
                columns.push(discriminator);
                values.insert(0, model.type_id_value(state.ty));
            }
            columns.extend(def.columns.iter().map(|c| c.name.clone()));
            if !patch.is_empty() {
                patches.push((
                    ids[n],
                    Statement::Update {
                        table: table.clone(),
                        assignments: patch,
                        filter: key_filter(def, &state.key),
                        expected_rows: None,
                    },
                ));
            }
            rows.push(Some(RowOp {
                id: Some(ids[n]),
                table,
                columns,
                values,
                versioned: false,
            }));
        }

        let units: Vec<Vec<RowOp>> = order
            .steps
            .iter()
            .map(|step| step_nodes(step).iter().filter_map(|n| rows[*n].take()).collect())
            .collect();
        plan.summary.inserted += ids.len();
        plan.push_rows(units, RowKind::Insert, self.config.batch_size);
        if !patches.is_empty() {
            tracing::debug!(count = patches.len(), "deferred references patched after insert");
        }
        for (id, statement) in patches {
            plan.push(
                statement,
                Origin {
                    entities: vec![id],
                    versioned: false,
                },
            );
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn plan_updates(&self, plan: &mut FlushPlan, ids: &[EntityId]) -> Result<()> {
        let model = &*self.model;
        for &id in ids {
            let state = self.state(id)?;
            let Some(persisted) = &state.persisted else {
                continue;
            };
            let def = model.entity(state.ty);
            let changed = changed_columns(def, &state.current, persisted);
            if changed.is_empty() {
                continue;
            }
            let mut assignments: Vec<(String, Value)> = changed
                .iter()
                .map(|slot| (def.columns[*slot].name.clone(), state.current.values()[*slot].clone()))
                .collect();
            let mut filter = key_filter(def, &state.key);

            let version = def.version_column();
            if let Some(slot) = version {
                let name = def.columns[slot].name.clone();
                let expected = self.expected_version(state, slot);
                if !state.version_written {
                    let next = next_version(&expected);
                    assignments.retain(|(column, _)| *column != name);
                    assignments.push((name.clone(), next.clone()));
                    plan.versions.insert(id, (slot, next));
                }
                filter.push((name, expected));
            }

            plan.summary.updated += 1;
            plan.push(
                Statement::Update {
                    table: table_of(def)?,
                    assignments,
                    filter,
                    expected_rows: version.map(|_| 1),
                },
                Origin {
                    entities: vec![id],
                    versioned: version.is_some(),
                },
            );
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn plan_deletes(&self, plan: &mut FlushPlan, ids: &[EntityId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let model = &*self.model;
        let states: Vec<&EntityState> = ids.iter().map(|id| self.state(*id)).collect::<Result<_>>()?;
        let (graph, references) = reference_graph(model, &states, |s| s.persisted.as_ref().unwrap_or(&s.current))?;
        let order = schedule(&graph).map_err(|cycle| {
            let rows: Vec<String> = cycle
                .nodes
                .iter()
                .map(|n| model.describe_key(&states[*n].key))
                .collect();
            Error::invalid_operation(format!(
                "cannot order deletes: non-nullable references form a cycle ({})",
                rows.join(", ")
            ))
        })?;

        let mut nulled: HashSet<(usize, usize)> = HashSet::new();
        for &(from, to) in &order.deferred {
            if !nulled.insert((from, to)) {
                continue;
            }
            let state = states[from];
            let def = model.entity(state.ty);
            let assignments: Vec<(String, Value)> = references[from]
                .iter()
                .filter(|(target, field)| *target == to && field.nullable)
                .flat_map(|(_, field)| field.columns.clone())
                .map(|slot| (def.columns[slot].name.clone(), Value::Null))
                .collect();
            if assignments.is_empty() {
                continue;
            }
            plan.push(
                Statement::Update {
                    table: table_of(def)?,
                    assignments,
                    filter: key_filter(def, &state.key),
                    expected_rows: None,
                },
                Origin {
                    entities: vec![ids[from]],
                    versioned: false,
                },
            );
        }

        let mut rows: Vec<Option<RowOp>> = Vec::with_capacity(states.len());
        for (n, state) in states.iter().enumerate() {
            let def = model.entity(state.ty);
            let mut columns: Vec<String> = def.columns[def.key_columns()].iter().map(|c| c.name.clone()).collect();
            let mut values = state.key.values().to_vec();
            let version = def.version_column();
            if let Some(slot) = version {
                columns.push(def.columns[slot].name.clone());
                values.push(self.expected_version(state, slot));
            }
            rows.push(Some(RowOp {
                id: Some(ids[n]),
                table: table_of(def)?,
                columns,
                values,
                versioned: version.is_some(),
            }));
        }
        let units: Vec<Vec<RowOp>> = order
            .steps
            .iter()
            .rev()
            .map(|step| step_nodes(step).iter().filter_map(|n| rows[*n].take()).collect())
            .collect();
        plan.summary.deleted += ids.len();
        plan.push_rows(units, RowKind::Delete, self.config.batch_size);
        Ok(())
    }

    /// Version storage must still hold for `state`.
    fn expected_version(&self, state: &EntityState, slot: usize) -> Value {
        if let Some(expected) = self.expected_versions.get(&state.key) {
            return expected.clone();
        }
        state
            .persisted
            .as_ref()
            .and_then(|p| p.get(slot))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Attribute a storage failure to the statement and entities behind it.
    fn flush_error(&self, err: Error, plan: &FlushPlan) -> Error {
        let Error::Query(query) = err else {
            return err;
        };
        let origin = query.statement_index.and_then(|i| plan.origins.get(i));
        if query.kind == QueryErrorKind::RowCountMismatch {
            let conflicting = origin
                .filter(|o| o.versioned)
                .and_then(|o| o.entities.first())
                .and_then(|id| self.states.get(*id));
            if let Some(state) = conflicting {
                return Error::VersionConflict(VersionConflictError {
                    entity_type: self.model.entity(state.ty).name.clone(),
                    key: state.key.to_string(),
                    message: format!(
                        "{} was changed or deleted by another transaction",
                        self.model.describe_key(&state.key)
                    ),
                });
            }
        }
        if let Some(kind) = query.constraint {
            return Error::ConstraintViolation(ConstraintViolationError {
                kind,
                table: query.table.clone(),
                message: query.message.clone(),
                source: Box::new(Error::Query(query)),
            });
        }
        Error::Query(query)
    }

    /// Fold a successful flush into the tracked states.
    fn promote(&mut self, plan: &FlushPlan, pending: &[EntityId]) {
        for &id in pending {
            let Some(state) = self.states.get_mut(id) else {
                continue;
            };
            if let Some((slot, version)) = plan.versions.get(&id) {
                state.current.set(*slot, version.clone());
            }
            match state.lifecycle {
                EntityLifecycle::New | EntityLifecycle::Modified => {
                    state.persisted = Some(state.current.clone());
                    state.lifecycle = EntityLifecycle::Loaded;
                }
                EntityLifecycle::Removed => state.persisted = None,
                EntityLifecycle::Loaded | EntityLifecycle::NotAvailable => {}
            }
            for set in state.sets.values_mut() {
                if set.has_changes() {
                    set.promote();
                }
            }
            state.version_written = false;
            let key = state.key.clone();
            self.expected_versions.remove(&key);
        }
    }
}

/// Dependency graph over `states` from the stored references in `image`.
///
/// Nodes are grouped by table; edge `a -> b` means `a` references `b`.
#[allow(clippy::result_large_err, clippy::type_complexity)]
fn reference_graph<'m>(
    model: &'m DomainModel,
    states: &[&EntityState],
    image: impl Fn(&EntityState) -> &tessera_core::Tuple,
) -> Result<(DependencyGraph, Vec<Vec<(usize, &'m FieldDef)>>)> {
    let node_of: HashMap<&Key, usize> = states.iter().enumerate().map(|(n, s)| (&s.key, n)).collect();
    let mut tables: Vec<String> = Vec::new();
    let mut graph = DependencyGraph::new();
    for state in states {
        let table = table_of(model.entity(state.ty))?;
        let group = match tables.iter().position(|t| *t == table) {
            Some(group) => group,
            None => {
                tables.push(table);
                tables.len() - 1
            }
        };
        graph.add_node(group);
    }

    let mut references = Vec::with_capacity(states.len());
    for (n, state) in states.iter().enumerate() {
        let def = model.entity(state.ty);
        let mut refs = Vec::new();
        for field in &def.fields {
            if !matches!(field.kind, FieldKind::Reference(_)) || !field.is_stored() {
                continue;
            }
            let Some(target) = reference_key(model, field, image(state)) else {
                continue;
            };
            if let Some(&to) = node_of.get(&target) {
                graph.add_edge(n, to, field.nullable);
                refs.push((to, field));
            }
        }
        references.push(refs);
    }
    Ok((graph, references))
}

fn step_nodes(step: &Step) -> Vec<usize> {
    match step {
        Step::Single(n) => vec![*n],
        Step::Group(nodes) => nodes.clone(),
    }
}

#[allow(clippy::result_large_err)]
fn table_of(def: &EntityTypeDef) -> Result<String> {
    def.table
        .clone()
        .ok_or_else(|| Error::invalid_operation(format!("{} has no table", def.name)))
}

fn key_filter(def: &EntityTypeDef, key: &Key) -> Vec<(String, Value)> {
    def.columns[def.key_columns()]
        .iter()
        .map(|c| c.name.clone())
        .zip(key.values().iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(table: &str, columns: &[&str], id: i32) -> RowOp {
        RowOp::link(
            table,
            columns.iter().map(|c| (*c).to_string()).collect(),
            vec![Value::Int(id); columns.len()],
        )
    }

    #[test]
    fn consecutive_rows_of_one_shape_share_a_statement() {
        let mut plan = FlushPlan::default();
        let units = vec![
            vec![row("A", &["Id"], 1)],
            vec![row("A", &["Id"], 2)],
            vec![row("B", &["Id"], 3)],
            vec![row("A", &["Id"], 4)],
        ];
        plan.push_rows(units, RowKind::Insert, 100);
        assert_eq!(plan.statements.len(), 3);
        match &plan.statements[0] {
            Statement::Insert { table, rows, .. } => {
                assert_eq!(table, "A");
                assert_eq!(rows.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn batch_size_splits_but_never_inside_a_unit() {
        let mut plan = FlushPlan::default();
        let units = vec![
            vec![row("A", &["Id"], 1)],
            vec![row("A", &["Id"], 2), row("A", &["Id"], 3)],
        ];
        plan.push_rows(units, RowKind::Insert, 2);
        let sizes: Vec<usize> = plan
            .statements
            .iter()
            .map(|s| match s {
                Statement::Insert { rows, .. } => rows.len(),
                _ => 0,
            })
            .collect();
        assert_eq!(sizes, vec![1, 2]);
    }

    #[test]
    fn mixed_shapes_in_one_unit_are_padded_with_null() {
        let mut plan = FlushPlan::default();
        plan.push_rows(
            vec![vec![row("A", &["Id"], 1), row("A", &["Id", "Extra"], 2)]],
            RowKind::Insert,
            10,
        );
        let Statement::Insert { columns, rows, .. } = &plan.statements[0] else {
            panic!("expected insert");
        };
        assert_eq!(columns, &vec!["Id".to_string(), "Extra".to_string()]);
        assert_eq!(rows[0], vec![Value::Int(1), Value::Null]);
    }

    #[test]
    fn versioned_deletes_expect_every_row() {
        let mut plan = FlushPlan::default();
        let mut a = row("A", &["Id", "Version"], 1);
        a.versioned = true;
        let mut b = row("A", &["Id", "Version"], 2);
        b.versioned = true;
        plan.push_rows(vec![vec![a], vec![b]], RowKind::Delete, 10);
        assert_eq!(plan.statements[0].expected_rows(), Some(2));
        assert!(plan.origins[0].versioned);
    }
}
