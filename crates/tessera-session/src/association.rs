//! Reference fields and the synchronization of paired associations.
//!
//! A stored reference is the master side of its association: its columns
//! hold the target's key. The inverse side of a one-to-one pair stores
//! nothing; its partner is found by looking for the entity whose master
//! reference points back, merged with unflushed in-memory writes, and cached
//! per state once known.

use std::sync::Arc;

use tessera_core::{
    AssocIdx, Connection, Cx, DomainModel, Error, FieldDef, FieldIdx, FieldKind, Key, Outcome,
    Result, Tuple, TypeIdx, TypeMismatchError, Value, try_outcome, try_result,
};
use tessera_query::{Expr, Query};

use crate::identity_map::EntityState;
use crate::{EntityId, Session, field_of};

impl<C: Connection> Session<C> {
    /// Assign a reference field; `None` clears it.
    ///
    /// When the field is one side of a one-to-one pair the other side is kept
    /// consistent: a previous partner of the new target is detached, and the
    /// inverse side of the old and new targets is updated.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn set_reference(
        &mut self,
        cx: &Cx,
        id: EntityId,
        field: &str,
        target: Option<EntityId>,
    ) -> Outcome<(), Error> {
        try_outcome!(self.settle(cx).await);
        let model = Arc::clone(&self.model);
        let ty = try_result!(self.writable(id)).ty;
        let (field_idx, def) = try_result!(field_of(&model, ty, field));
        let FieldKind::Reference(target_type) = def.kind else {
            return Outcome::Err(Error::invalid_operation(format!("{field} is not a reference field")));
        };
        let Some(assoc) = def.association else {
            return Outcome::Err(Error::model(format!("reference {field} has no association")));
        };
        let new_key = match target {
            Some(t) => {
                let state = try_result!(self.writable(t));
                if !model.is_subtype(state.ty, target_type) {
                    return Outcome::Err(Error::TypeMismatch(TypeMismatchError {
                        field: field.to_string(),
                        expected: model.entity(target_type).name.clone(),
                        actual: model.entity(state.ty).name.clone(),
                    }));
                }
                Some(state.key.clone())
            }
            None => None,
        };

        if def.is_stored() {
            if new_key.is_none() && !def.nullable {
                return Outcome::Err(Error::invalid_operation(format!(
                    "{}.{field} is not nullable",
                    model.entity(ty).name
                )));
            }
            let slave = one_to_one_partner(&model, assoc);
            if let Some(slave_field) = slave {
                try_outcome!(self.ensure_available(cx, id, def.columns.clone()).await);
                let old_key = try_result!(self.state(id)).stored_key(&model, def);
                if let Some(t) = target {
                    let prior = try_outcome!(self.inverse_partner(cx, t, slave_field).await);
                    if let Some(prior) = prior.filter(|p| *p != id) {
                        if !def.nullable {
                            return Outcome::Err(Error::invalid_operation(format!(
                                "{} is already referenced through non-nullable {}.{field}",
                                model.describe_key(&try_result!(self.state(t)).key),
                                model.entity(ty).name
                            )));
                        }
                        try_result!(self.write_reference(prior, def, None));
                    }
                }
                if let Some(old) = old_key.filter(|k| Some(k) != new_key.as_ref()) {
                    if let Some(old_id) = self.live_id(&old) {
                        try_result!(self.state_mut(old_id)).inverse.insert(slave_field, None);
                    }
                }
                if let Some(t) = target {
                    let own_key = try_result!(self.state(id)).key.clone();
                    try_result!(self.state_mut(t)).inverse.insert(slave_field, Some(own_key));
                }
            }
            try_result!(self.write_reference(id, def, new_key.as_ref()));
            return Outcome::Ok(());
        }

        // Inverse side of a one-to-one pair: write the master reference.
        let master = model.master_of(assoc);
        let master_def = model.entity(master.owner_type).field_at(master.owner_field);
        let current = try_outcome!(self.inverse_partner(cx, id, field_idx).await);
        if current == target {
            return Outcome::Ok(());
        }
        if let Some(old) = current {
            if !master_def.nullable {
                return Outcome::Err(Error::invalid_operation(format!(
                    "cannot detach {} from non-nullable {}",
                    model.describe_key(&try_result!(self.state(old)).key),
                    master.name
                )));
            }
            try_result!(self.write_reference(old, master_def, None));
        }
        let own_key = try_result!(self.state(id)).key.clone();
        if let Some(t) = target {
            try_outcome!(self.ensure_available(cx, t, master_def.columns.clone()).await);
            let previous = try_result!(self.state(t)).stored_key(&model, master_def);
            if let Some(previous) = previous.filter(|k| *k != own_key) {
                if let Some(previous_id) = self.live_id(&previous) {
                    try_result!(self.state_mut(previous_id)).inverse.insert(field_idx, None);
                }
            }
            try_result!(self.write_reference(t, master_def, Some(&own_key)));
        }
        try_result!(self.state_mut(id)).inverse.insert(field_idx, new_key);
        Outcome::Ok(())
    }

    /// Target of a reference field, loading it if needed.
    pub async fn get_reference(
        &mut self,
        cx: &Cx,
        id: EntityId,
        field: &str,
    ) -> Outcome<Option<EntityId>, Error> {
        let model = Arc::clone(&self.model);
        let ty = try_result!(self.state(id)).ty;
        let (field_idx, def) = try_result!(field_of(&model, ty, field));
        let FieldKind::Reference(target_type) = def.kind else {
            return Outcome::Err(Error::invalid_operation(format!("{field} is not a reference field")));
        };
        if !def.is_stored() {
            return self.inverse_partner(cx, id, field_idx).await;
        }
        try_outcome!(self.ensure_available(cx, id, def.columns.clone()).await);
        let Some(key) = try_result!(self.state(id)).stored_key(&model, def) else {
            return Outcome::Ok(None);
        };
        self.resolve_key(cx, target_type, &key).await
    }

    /// Entities of `type_name` whose reference `field` points at `target`.
    ///
    /// Unflushed writes win over stored values: an entity re-pointed in this
    /// session is reported by its current reference only.
    pub async fn find_referencing(
        &mut self,
        cx: &Cx,
        target: EntityId,
        type_name: &str,
        field: &str,
    ) -> Outcome<Vec<EntityId>, Error> {
        try_outcome!(self.settle(cx).await);
        let model = Arc::clone(&self.model);
        let owner = try_result!(model.entity_by_name(type_name));
        let (_, def) = try_result!(field_of(&model, owner.idx, field));
        let (FieldKind::Reference(_), true, Some(assoc)) = (def.kind, def.is_stored(), def.association) else {
            return Outcome::Err(Error::invalid_operation(format!(
                "{type_name}.{field} is not a stored reference"
            )));
        };
        self.referencing(cx, target, assoc).await
    }

    /// Live entities whose stored reference of `assoc` points at `target`.
    pub(crate) async fn referencing(
        &mut self,
        cx: &Cx,
        target: EntityId,
        assoc: AssocIdx,
    ) -> Outcome<Vec<EntityId>, Error> {
        let model = Arc::clone(&self.model);
        let a = model.association(assoc);
        let owner = model.entity(a.owner_type);
        let def = owner.field_at(a.owner_field);
        let state = try_result!(self.state(target));
        let target_key = state.key.clone();
        let target_name = model.entity(state.ty).name.clone();

        let mut found = Vec::new();
        if state.persisted.is_some() {
            let query = Query::all(owner.name.clone()).filter(|o| {
                o.member(def.name.clone())
                    .eq(Expr::entity(target_name, target_key.values().to_vec()))
            });
            let stored = try_outcome!(self.query_entities_quiet(cx, &query).await);
            for id in stored {
                let Some(state) = self.states.get(id) else {
                    continue;
                };
                if !state.is_live() {
                    continue;
                }
                let loaded = def.columns.clone().all(|s| state.current.is_available(s));
                if !loaded || state.stored_key(&model, def).as_ref() == Some(&target_key) {
                    found.push(id);
                }
            }
        }

        for (id, state) in self.states.iter() {
            if found.contains(&id) || !state.is_live() || !model.is_subtype(state.ty, a.owner_type) {
                continue;
            }
            if state.stored_key(&model, def).as_ref() == Some(&target_key) {
                found.push(id);
            }
        }
        Outcome::Ok(found)
    }

    /// Partner on the inverse side `field` of a one-to-one pair.
    pub(crate) async fn inverse_partner(
        &mut self,
        cx: &Cx,
        id: EntityId,
        field: FieldIdx,
    ) -> Outcome<Option<EntityId>, Error> {
        let model = Arc::clone(&self.model);
        let state = try_result!(self.state(id));
        let own_key = state.key.clone();
        let def = model.entity(state.ty).field_at(field);
        let Some(assoc) = def.association else {
            return Outcome::Err(Error::model(format!("field {} has no association", def.name)));
        };
        let master = model.master_of(assoc);
        let master_def = model.entity(master.owner_type).field_at(master.owner_field);

        if let Some(cached) = state.inverse.get(&field).cloned() {
            let Some(partner_key) = cached else {
                return Outcome::Ok(None);
            };
            if let Some(partner) = self.live_id(&partner_key) {
                let points_back = self
                    .states
                    .get(partner)
                    .and_then(|p| p.stored_key(&model, master_def))
                    .is_some_and(|k| k == own_key);
                if points_back {
                    return Outcome::Ok(Some(partner));
                }
            }
        }

        let found = try_outcome!(self.referencing(cx, id, master.idx).await);
        let partner = found.first().copied();
        let partner_key = match partner {
            Some(p) => Some(try_result!(self.state(p)).key.clone()),
            None => None,
        };
        try_result!(self.state_mut(id)).inverse.insert(field, partner_key);
        Outcome::Ok(partner)
    }

    /// Tracked live entity for `key`, loading it as an instance of `ty` otherwise.
    pub(crate) async fn resolve_key(
        &mut self,
        cx: &Cx,
        ty: TypeIdx,
        key: &Key,
    ) -> Outcome<Option<EntityId>, Error> {
        if let Some(id) = self.states.lookup(key) {
            if let Some(state) = self.states.get(id) {
                if state.is_removed() {
                    return Outcome::Ok(None);
                }
                if state.is_live() {
                    return Outcome::Ok(Some(id));
                }
            }
        }
        self.load_by_key(cx, ty, key).await
    }

    /// Tracked, live entity with this key.
    pub(crate) fn live_id(&self, key: &Key) -> Option<EntityId> {
        self.states
            .lookup(key)
            .filter(|id| self.states.get(*id).is_some_and(EntityState::is_live))
    }

    /// Write a reference's columns.
    #[allow(clippy::result_large_err)]
    pub(crate) fn write_reference(&mut self, id: EntityId, def: &FieldDef, key: Option<&Key>) -> Result<()> {
        self.writable(id)?;
        let values = match key {
            Some(key) => key.values().to_vec(),
            None => vec![Value::Null; def.columns.len()],
        };
        let state = self.state_mut(id)?;
        for (slot, value) in def.columns.clone().zip(values) {
            state.current.set(slot, value);
        }
        state.touch();
        Ok(())
    }
}

impl EntityState {
    /// Key held by a stored reference, `None` when NULL or not loaded.
    pub(crate) fn stored_key(&self, model: &DomainModel, def: &FieldDef) -> Option<Key> {
        reference_key(model, def, &self.current)
    }
}

/// Key a stored reference holds in `tuple`.
pub(crate) fn reference_key(model: &DomainModel, def: &FieldDef, tuple: &Tuple) -> Option<Key> {
    let FieldKind::Reference(target) = def.kind else {
        return None;
    };
    let mut values = Vec::with_capacity(def.columns.len());
    for slot in def.columns.clone() {
        match tuple.get(slot) {
            Some(Value::Null) | None => return None,
            Some(value) => values.push(value.clone()),
        }
    }
    Some(Key::new(model.root_of(target), values))
}

/// Inverse field of a stored reference's one-to-one partner.
fn one_to_one_partner(model: &DomainModel, assoc: AssocIdx) -> Option<FieldIdx> {
    let partner = model.association(model.association(assoc).paired?);
    let field = model.entity(partner.owner_type).field_at(partner.owner_field);
    matches!(field.kind, FieldKind::Reference(_)).then_some(partner.owner_field)
}
