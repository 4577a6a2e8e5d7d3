//! Session and unit of work for Tessera.
//!
//! `tessera-session` is the **stateful layer** between application code and a
//! storage [`Connection`]. A [`Session`] keeps one in-memory state per entity
//! key, tracks writes against the persisted image, keeps both sides of paired
//! associations in step, and writes everything back in dependency order when
//! flushed.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: loading the same row twice yields the same [`EntityId`].
//! - **Change tracking**: only columns that differ from the persisted image
//!   are written; restoring a value cancels the write.
//! - **Association sync**: setting one side of a paired association updates
//!   the other side, including the inverse of one-to-one pairs.
//! - **Removal**: cascade, clear and deny actions are applied transitively
//!   before anything is marked removed.
//! - **Flush**: inserts, updates and deletes are ordered over foreign keys,
//!   batched, and mapped back to typed errors.
//! - **Scopes**: nested transaction scopes map to savepoints, and rolling a
//!   scope back restores the in-memory states it touched.
//!
//! All I/O goes through `Cx` + `Outcome` for cancel-correct operation.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(model, db.connect(), SessionConfig::default());
//!
//! let owner = session.create("Owner", vec![Value::Int(1)])?;
//! session.set_value(owner, "Name", "Ada")?;
//!
//! let pets = session
//!     .query(&cx, &Query::all("Pet").filter(|p| p.member("Owner").eq(Expr::entity("Owner", [1]))), &Args::new())
//!     .await?;
//!
//! session.commit(&cx).await?;
//! ```

pub mod association;
mod change_tracker;
pub mod config;
pub mod entity_set;
pub mod flush;
pub mod future;
pub mod identity_map;
pub mod materialize;
pub mod removal;
pub mod scope;
mod unit_of_work;
pub mod version;

pub use config::{SessionConfig, SessionProfile};
pub use flush::FlushSummary;
pub use future::FutureQuery;
pub use identity_map::{EntityId, EntityLifecycle};
pub use materialize::QueryValue;
pub use scope::{ScopeToken, TransactionMode};
pub use version::{VersionInfo, VersionSet};

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tessera_core::{
    Connection, Cx, DomainModel, DuplicateKeyError, EntityTypeDef, Error, FieldDef, FieldIdx,
    FieldKind, Key, Outcome, QueryError, Result, Statement, StructureValue, Tuple, TypeIdx, Value,
    try_outcome, try_result,
};
use tessera_query::{CacheStats, QueryCache};

use crate::future::FutureBatch;
use crate::identity_map::{EntityState, IdentityMap, SetState};
use crate::scope::ScopeStack;

/// A unit of work over one storage connection.
///
/// The session owns its connection. Sessions are not shared between tasks;
/// run one session per logical unit of work.
pub struct Session<C: Connection> {
    model: Arc<DomainModel>,
    conn: C,
    config: SessionConfig,
    states: IdentityMap,
    cache: QueryCache,
    scopes: ScopeStack,
    futures: FutureBatch,
    /// Versions a flush must find in storage, overriding the persisted image
    expected_versions: HashMap<Key, Value>,
    auto_flush_suppressed: bool,
}

impl<C: Connection> Session<C> {
    /// Create a session over `conn`.
    pub fn new(model: Arc<DomainModel>, conn: C, config: SessionConfig) -> Self {
        let cache = QueryCache::new(config.query_cache_capacity);
        let mut states = IdentityMap::new();
        states.push_frame();
        Self {
            model,
            conn,
            config,
            states,
            cache,
            scopes: ScopeStack::new(),
            futures: FutureBatch::default(),
            expected_versions: HashMap::new(),
            auto_flush_suppressed: false,
        }
    }

    pub fn model(&self) -> &Arc<DomainModel> {
        &self.model
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Hit and miss counters of the compiled-query cache.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Number of tracked entity states, removed ones included.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Whether any tracked state has changes the next flush would write.
    pub fn has_pending_changes(&self) -> bool {
        self.states.iter().any(|(_, s)| match s.lifecycle {
            EntityLifecycle::Modified => {
                change_tracker::is_dirty(self.model.entity(s.ty), s) || s.sets.values().any(SetState::has_changes)
            }
            _ => s.is_pending(),
        })
    }

    /// A view of this session that does not flush before reads.
    ///
    /// ```ignore
    /// let mut quiet = session.without_auto_flush();
    /// let rows = quiet.query(&cx, &query, &Args::new()).await?;
    /// ```
    pub fn without_auto_flush(&mut self) -> NoAutoFlush<'_, C> {
        let previous = std::mem::replace(&mut self.auto_flush_suppressed, true);
        NoAutoFlush {
            session: self,
            previous,
        }
    }

    // ==================== Identity ====================

    /// Lifecycle of a tracked entity.
    #[allow(clippy::result_large_err)]
    pub fn lifecycle(&self, id: EntityId) -> Result<EntityLifecycle> {
        Ok(self.state(id)?.lifecycle)
    }

    /// Name of the entity's runtime type.
    #[allow(clippy::result_large_err)]
    pub fn type_name(&self, id: EntityId) -> Result<&str> {
        let ty = self.state(id)?.ty;
        Ok(&self.model.entity(ty).name)
    }

    #[allow(clippy::result_large_err)]
    pub fn key_values(&self, id: EntityId) -> Result<Vec<Value>> {
        Ok(self.state(id)?.key.values().to_vec())
    }

    /// The tracked, live entity with this key, without touching storage.
    #[allow(clippy::result_large_err)]
    pub fn find(&self, type_name: &str, key: Vec<Value>) -> Result<Option<EntityId>> {
        let def = self.model.entity_by_name(type_name)?;
        let key = self.model.make_key(def.idx, key)?;
        Ok(self.states.lookup(&key).filter(|id| {
            self.states
                .get(*id)
                .is_some_and(|s| s.is_live() && self.model.is_subtype(s.ty, def.idx))
        }))
    }

    /// Load an entity by key: the identity map first, then storage.
    ///
    /// Returns `None` when no live entity of `type_name` (or a subtype) has
    /// the key, including entities removed in this session.
    #[tracing::instrument(level = "debug", skip(self, cx, key))]
    pub async fn get(
        &mut self,
        cx: &Cx,
        type_name: &str,
        key: Vec<Value>,
    ) -> Outcome<Option<EntityId>, Error> {
        try_outcome!(self.settle(cx).await);
        let model = Arc::clone(&self.model);
        let def = try_result!(model.entity_by_name(type_name));
        let key = try_result!(model.make_key(def.idx, key));
        if let Some(id) = self.states.lookup(&key) {
            if let Some(state) = self.states.get(id) {
                if state.is_removed() || !model.is_subtype(state.ty, def.idx) {
                    return Outcome::Ok(None);
                }
                if state.is_live() {
                    tracing::trace!("identity map hit");
                    return Outcome::Ok(Some(id));
                }
            }
        }
        try_outcome!(self.auto_flush(cx).await);
        self.load_by_key(cx, def.idx, &key).await
    }

    // ==================== Creation ====================

    /// Start tracking a new entity; it is inserted at the next flush.
    ///
    /// Creating over an entity removed in this session supersedes it: the
    /// stored row is rewritten by an update instead of deleted and inserted.
    #[allow(clippy::result_large_err)]
    pub fn create(&mut self, type_name: &str, key: Vec<Value>) -> Result<EntityId> {
        self.settle_local();
        let model = Arc::clone(&self.model);
        let def = model.entity_by_name(type_name)?;
        let key = model.make_key(def.idx, key)?;
        self.register_new(&model, def, key)
    }

    /// Create an entity whose key is drawn from its type's sequence.
    pub async fn create_with_generated_key(
        &mut self,
        cx: &Cx,
        type_name: &str,
    ) -> Outcome<EntityId, Error> {
        try_outcome!(self.settle(cx).await);
        let model = Arc::clone(&self.model);
        let def = try_result!(model.entity_by_name(type_name));
        let tessera_core::KeyGenerator::Sequence(sequence) = &def.key_generator else {
            return Outcome::Err(Error::invalid_operation(format!(
                "{} has no key generator",
                def.name
            )));
        };
        let next = try_outcome!(self.conn.next_sequence_value(cx, sequence).await);
        tracing::debug!(entity = %def.name, sequence = %sequence, value = next, "generated key");
        let key = try_result!(model.make_key(def.idx, vec![Value::BigInt(next)]));
        Outcome::Ok(try_result!(self.register_new(&model, def, key)))
    }

    #[allow(clippy::result_large_err)]
    fn register_new(&mut self, model: &DomainModel, def: &EntityTypeDef, key: Key) -> Result<EntityId> {
        if def.is_abstract {
            return Err(Error::invalid_operation(format!(
                "cannot create an instance of abstract type {}",
                def.name
            )));
        }

        let mut persisted = None;
        if let Some(existing) = self.states.lookup(&key) {
            let state = self.state(existing)?;
            if state.is_live() {
                return Err(Error::DuplicateKey(DuplicateKeyError {
                    entity_type: def.name.clone(),
                    key: model.describe_key(&key),
                }));
            }
            if state.is_removed() && state.persisted.is_some() {
                if state.ty != def.idx {
                    return Err(Error::invalid_operation(format!(
                        "{} was removed as {} and cannot be re-created as {} before a flush",
                        model.describe_key(&key),
                        model.entity(state.ty).name,
                        def.name
                    )));
                }
                persisted = self.state_mut(existing)?.persisted.take();
            }
        }

        let superseding = persisted.is_some();
        let mut sets = HashMap::new();
        let mut inverse = HashMap::new();
        for (i, field) in def.fields.iter().enumerate() {
            let idx = FieldIdx(u32::try_from(i).unwrap_or(u32::MAX));
            match field.kind {
                FieldKind::EntitySet(_) if is_junction_field(model, field) => {
                    let set = if superseding {
                        let mut set = SetState::default();
                        set.clear();
                        set
                    } else {
                        SetState::empty()
                    };
                    sets.insert(idx, set);
                }
                FieldKind::Reference(_) if !field.is_stored() && !superseding => {
                    inverse.insert(idx, None);
                }
                _ => {}
            }
        }

        let state = EntityState {
            ty: def.idx,
            current: initial_tuple(def, &key),
            key,
            lifecycle: if superseding {
                EntityLifecycle::Modified
            } else {
                EntityLifecycle::New
            },
            persisted,
            sets,
            inverse,
            version_written: false,
        };
        tracing::debug!(entity = %def.name, key = %state.key, superseding, "tracking new entity");
        Ok(self.states.insert(state))
    }

    // ==================== Field access ====================

    /// Assign a scalar field.
    #[allow(clippy::result_large_err)]
    pub fn set_value(&mut self, id: EntityId, field: &str, value: impl Into<Value>) -> Result<()> {
        self.settle_local();
        let model = Arc::clone(&self.model);
        let ty = self.writable(id)?.ty;
        let (_, def) = field_of(&model, ty, field)?;
        let FieldKind::Scalar(scalar) = def.kind else {
            return Err(Error::invalid_operation(format!(
                "{field} is not a scalar field; use set_structure or set_reference"
            )));
        };
        if def.is_key {
            return Err(Error::invalid_operation(format!(
                "key field {field} cannot be changed"
            )));
        }
        let value = value.into();
        let value = if value.is_null() {
            if !def.nullable {
                return Err(Error::invalid_operation(format!(
                    "{}.{field} is not nullable",
                    model.entity(ty).name
                )));
            }
            Value::Null
        } else {
            scalar.coerce(value)?
        };

        let state = self.state_mut(id)?;
        state.current.set(def.columns.start, value);
        state.touch();
        if def.is_version {
            state.version_written = true;
        }
        Ok(())
    }

    /// Assign a structure field.
    ///
    /// The value's runtime type must equal the declared structure type;
    /// subtype instances fail with `TypeMismatch`.
    #[allow(clippy::result_large_err)]
    pub fn set_structure(&mut self, id: EntityId, field: &str, value: &StructureValue) -> Result<()> {
        self.settle_local();
        let model = Arc::clone(&self.model);
        let ty = self.writable(id)?.ty;
        let (_, def) = field_of(&model, ty, field)?;
        let FieldKind::Structure(declared) = def.kind else {
            return Err(Error::invalid_operation(format!("{field} is not a structure field")));
        };
        let leaves = value.flatten(&model, declared, field)?;
        let state = self.state_mut(id)?;
        for (slot, leaf) in def.columns.clone().zip(leaves) {
            state.current.set(slot, leaf);
        }
        state.touch();
        Ok(())
    }

    /// Current value of a scalar field, `None` while it is not loaded.
    #[allow(clippy::result_large_err)]
    pub fn peek(&self, id: EntityId, field: &str) -> Result<Option<Value>> {
        let state = self.state(id)?;
        let (_, def) = field_of(&self.model, state.ty, field)?;
        if !matches!(def.kind, FieldKind::Scalar(_)) {
            return Err(Error::invalid_operation(format!("{field} is not a scalar field")));
        }
        Ok(state.current.get(def.columns.start).cloned())
    }

    /// Value of a scalar field, fetching the row's missing columns first if
    /// the field was not loaded.
    pub async fn get_value(&mut self, cx: &Cx, id: EntityId, field: &str) -> Outcome<Value, Error> {
        let model = Arc::clone(&self.model);
        let ty = try_result!(self.state(id)).ty;
        let (_, def) = try_result!(field_of(&model, ty, field));
        if !matches!(def.kind, FieldKind::Scalar(_)) {
            return Outcome::Err(Error::invalid_operation(format!(
                "{field} is not a scalar field"
            )));
        }
        let slots = def.columns.clone();
        try_outcome!(self.ensure_available(cx, id, slots.clone()).await);
        let state = try_result!(self.state(id));
        Outcome::Ok(state.current.values()[slots.start].clone())
    }

    /// Value of a structure field, fetching missing columns first.
    pub async fn get_structure(
        &mut self,
        cx: &Cx,
        id: EntityId,
        field: &str,
    ) -> Outcome<StructureValue, Error> {
        let model = Arc::clone(&self.model);
        let ty = try_result!(self.state(id)).ty;
        let (_, def) = try_result!(field_of(&model, ty, field));
        let FieldKind::Structure(declared) = def.kind else {
            return Outcome::Err(Error::invalid_operation(format!(
                "{field} is not a structure field"
            )));
        };
        let slots = def.columns.clone();
        try_outcome!(self.ensure_available(cx, id, slots.clone()).await);
        let state = try_result!(self.state(id));
        let leaves = &state.current.values()[slots];
        Outcome::Ok(StructureValue::from_leaves(&model, declared, leaves))
    }

    /// Make `slots` of `id` available, with one secondary fetch if needed.
    pub(crate) async fn ensure_available(
        &mut self,
        cx: &Cx,
        id: EntityId,
        slots: std::ops::Range<usize>,
    ) -> Outcome<(), Error> {
        let state = try_result!(self.state(id));
        if slots.clone().all(|s| state.current.is_available(s)) {
            return Outcome::Ok(());
        }
        try_outcome!(self.fetch_missing(cx, id).await);
        let state = try_result!(self.state(id));
        if state.lifecycle == EntityLifecycle::NotAvailable {
            return Outcome::Err(Error::invalid_operation(format!(
                "{} is no longer available in storage",
                self.model.describe_key(&state.key)
            )));
        }
        Outcome::Ok(())
    }

    // ==================== Internals ====================

    #[allow(clippy::result_large_err)]
    pub(crate) fn state(&self, id: EntityId) -> Result<&EntityState> {
        self.states
            .get(id)
            .ok_or_else(|| Error::invalid_operation(format!("entity {id} is not tracked by this session")))
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn state_mut(&mut self, id: EntityId) -> Result<&mut EntityState> {
        self.states
            .get_mut(id)
            .ok_or_else(|| Error::invalid_operation(format!("entity {id} is not tracked by this session")))
    }

    /// A state that accepts writes.
    #[allow(clippy::result_large_err)]
    pub(crate) fn writable(&self, id: EntityId) -> Result<&EntityState> {
        let state = self.state(id)?;
        match state.lifecycle {
            EntityLifecycle::Removed => Err(Error::invalid_operation(format!(
                "{} has been removed",
                self.model.describe_key(&state.key)
            ))),
            EntityLifecycle::NotAvailable => Err(Error::invalid_operation(format!(
                "{} is no longer available in storage",
                self.model.describe_key(&state.key)
            ))),
            _ => Ok(state),
        }
    }

    /// Run temp-table teardown after a bound read, whatever the read's outcome.
    ///
    /// A teardown failure is only reported when the read itself succeeded.
    pub(crate) async fn finish_read<T>(
        &self,
        cx: &Cx,
        teardown: &[Statement],
        read: Outcome<T, Error>,
    ) -> Outcome<T, Error> {
        let cleanup = self.execute_statements(cx, teardown).await;
        match read {
            Outcome::Ok(value) => {
                try_outcome!(cleanup);
                Outcome::Ok(value)
            }
            failed => {
                if let Outcome::Err(err) = cleanup {
                    tracing::warn!(error = %err, "temp table teardown failed after a failed read");
                }
                failed
            }
        }
    }

    /// Run statements in one round trip when the driver batches, one by one
    /// otherwise. Failures carry the index of the failing statement.
    pub(crate) async fn execute_statements(
        &self,
        cx: &Cx,
        statements: &[Statement],
    ) -> Outcome<Vec<u64>, Error> {
        if statements.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        if self.conn.capabilities().batching {
            return self.conn.execute_batch(cx, statements).await;
        }
        let mut counts = Vec::with_capacity(statements.len());
        for (index, statement) in statements.iter().enumerate() {
            match self.conn.execute(cx, statement).await {
                Outcome::Ok(count) => {
                    if let Some(expected) = statement.expected_rows() {
                        if expected != count {
                            return Outcome::Err(Error::Query(
                                QueryError::new(
                                    tessera_core::QueryErrorKind::RowCountMismatch,
                                    format!(
                                        "{} on {} affected {count} row(s), expected {expected}",
                                        statement.kind(),
                                        statement.table()
                                    ),
                                )
                                .with_statement_index(index),
                            ));
                        }
                    }
                    counts.push(count);
                }
                Outcome::Err(Error::Query(err)) if err.statement_index.is_none() => {
                    return Outcome::Err(Error::Query(err.with_statement_index(index)));
                }
                Outcome::Err(err) => return Outcome::Err(err),
                Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                Outcome::Panicked(payload) => return Outcome::Panicked(payload),
            }
        }
        Outcome::Ok(counts)
    }
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("tracked", &self.states.len())
            .field("scopes", &self.scopes.depth())
            .field("in_transaction", &self.conn.in_transaction())
            .finish_non_exhaustive()
    }
}

/// A session borrowed with auto-flush suppressed; see
/// [`Session::without_auto_flush`].
pub struct NoAutoFlush<'a, C: Connection> {
    session: &'a mut Session<C>,
    previous: bool,
}

impl<C: Connection> Deref for NoAutoFlush<'_, C> {
    type Target = Session<C>;

    fn deref(&self) -> &Session<C> {
        self.session
    }
}

impl<C: Connection> DerefMut for NoAutoFlush<'_, C> {
    fn deref_mut(&mut self) -> &mut Session<C> {
        self.session
    }
}

impl<C: Connection> Drop for NoAutoFlush<'_, C> {
    fn drop(&mut self) {
        self.session.auto_flush_suppressed = self.previous;
    }
}

/// Look up a field of `ty` by name.
#[allow(clippy::result_large_err)]
pub(crate) fn field_of<'m>(
    model: &'m DomainModel,
    ty: TypeIdx,
    name: &str,
) -> Result<(FieldIdx, &'m FieldDef)> {
    let def = model.entity(ty);
    def.field(name)
        .ok_or_else(|| Error::invalid_operation(format!("{} has no field '{name}'", def.name)))
}

/// Whether an entity-set field is backed by junction rows.
pub(crate) fn is_junction_field(model: &DomainModel, field: &FieldDef) -> bool {
    field
        .association
        .is_some_and(|a| model.master_of(a).junction.is_some())
}

/// Column values of a freshly created entity.
///
/// References start out NULL; other non-nullable columns take their type's
/// default.
fn initial_tuple(def: &EntityTypeDef, key: &Key) -> Tuple {
    let mut values = Vec::with_capacity(def.columns.len());
    for (slot, column) in def.columns.iter().enumerate() {
        if let Some(k) = key.values().get(slot).filter(|_| slot < def.key_width) {
            values.push(k.clone());
            continue;
        }
        let field = def.field_at(column.field);
        let value = if matches!(field.kind, FieldKind::Reference(_)) || column.nullable {
            Value::Null
        } else {
            column.ty.default_value()
        };
        values.push(value);
    }
    Tuple::from_values(values)
}

#[cfg(test)]
mod tests;
