//! Entity-set fields.
//!
//! A many-to-many set records membership changes against its persisted
//! baseline, which is only loaded when members are actually read. Both sides
//! of a paired many-to-many association record every change; only the master
//! side's changes are written at flush. A one-to-many set is the inverse of a
//! reference on the item type, so adding an item just points that reference
//! at the owner.

use std::sync::Arc;

use tessera_core::{
    Connection, Cx, DomainModel, Error, FieldDef, FieldIdx, FieldKind, Key, Outcome, TypeIdx, TypeMismatchError,
    try_outcome, try_result,
};
use tessera_query::{Expr, Query};

use crate::{EntityId, Session, field_of, is_junction_field};

/// A resolved entity-set field.
struct SetField<'m> {
    idx: FieldIdx,
    def: &'m FieldDef,
    item_type: TypeIdx,
}

impl<C: Connection> Session<C> {
    /// Add `item` to the set `field` of `owner`.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn set_add(&mut self, cx: &Cx, owner: EntityId, field: &str, item: EntityId) -> Outcome<(), Error> {
        try_outcome!(self.settle(cx).await);
        let model = Arc::clone(&self.model);
        let set = try_result!(self.set_field(&model, owner, field));
        let (owner_key, item_key) = try_result!(self.set_operands(&model, owner, &set, item, field));

        if is_junction_field(&model, set.def) {
            let state = try_result!(self.state_mut(owner));
            state.sets.entry(set.idx).or_default().add(&item_key);
            state.touch();
            if let Some(mirror) = self.mirror_field(set.def) {
                let state = try_result!(self.state_mut(item));
                state.sets.entry(mirror).or_default().add(&owner_key);
                state.touch();
            }
            return Outcome::Ok(());
        }

        let reference = try_result!(inverse_reference(&model, set.def));
        try_result!(self.write_reference(item, reference, Some(&owner_key)));
        Outcome::Ok(())
    }

    /// Remove `item` from the set `field` of `owner`.
    ///
    /// For a one-to-many set the item's reference is cleared, which requires
    /// it to be nullable.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn set_remove(&mut self, cx: &Cx, owner: EntityId, field: &str, item: EntityId) -> Outcome<(), Error> {
        try_outcome!(self.settle(cx).await);
        let model = Arc::clone(&self.model);
        let set = try_result!(self.set_field(&model, owner, field));
        let (owner_key, item_key) = try_result!(self.set_operands(&model, owner, &set, item, field));

        if is_junction_field(&model, set.def) {
            let state = try_result!(self.state_mut(owner));
            state.sets.entry(set.idx).or_default().remove(&item_key);
            state.touch();
            if let Some(mirror) = self.mirror_field(set.def) {
                let state = try_result!(self.state_mut(item));
                state.sets.entry(mirror).or_default().remove(&owner_key);
                state.touch();
            }
            return Outcome::Ok(());
        }

        let reference = try_result!(inverse_reference(&model, set.def));
        try_outcome!(self.ensure_available(cx, item, reference.columns.clone()).await);
        let points_here = try_result!(self.state(item)).stored_key(&model, reference) == Some(owner_key);
        if !points_here {
            return Outcome::Ok(());
        }
        if !reference.nullable {
            return Outcome::Err(Error::invalid_operation(format!(
                "cannot remove {} from {field}: its {} reference is not nullable",
                model.describe_key(&item_key),
                reference.name
            )));
        }
        try_result!(self.write_reference(item, reference, None));
        Outcome::Ok(())
    }

    /// Remove every member of the set `field` of `owner`.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn set_clear(&mut self, cx: &Cx, owner: EntityId, field: &str) -> Outcome<(), Error> {
        try_outcome!(self.settle(cx).await);
        let model = Arc::clone(&self.model);
        let set = try_result!(self.set_field(&model, owner, field));
        try_result!(self.writable(owner));
        let owner_key = try_result!(self.state(owner)).key.clone();

        if is_junction_field(&model, set.def) {
            let state = try_result!(self.state_mut(owner));
            state.sets.entry(set.idx).or_default().clear();
            state.touch();
            if let Some(mirror) = self.mirror_field(set.def) {
                self.forget_member(mirror, &owner_key);
            }
            return Outcome::Ok(());
        }

        let reference = try_result!(inverse_reference(&model, set.def));
        let master = model.master_of(try_result!(association_of(set.def)));
        let members = try_outcome!(self.referencing(cx, owner, master.idx).await);
        if !members.is_empty() && !reference.nullable {
            return Outcome::Err(Error::invalid_operation(format!(
                "cannot clear {field}: {} is not nullable",
                master.name
            )));
        }
        for member in members {
            try_result!(self.write_reference(member, reference, None));
        }
        Outcome::Ok(())
    }

    /// Current members of the set `field` of `owner`, unflushed changes included.
    pub async fn set_members(&mut self, cx: &Cx, owner: EntityId, field: &str) -> Outcome<Vec<EntityId>, Error> {
        try_outcome!(self.settle(cx).await);
        let model = Arc::clone(&self.model);
        let set = try_result!(self.set_field(&model, owner, field));

        if !is_junction_field(&model, set.def) {
            let master = model.master_of(try_result!(association_of(set.def)));
            return self.referencing(cx, owner, master.idx).await;
        }

        let known = try_result!(self.state(owner))
            .sets
            .get(&set.idx)
            .and_then(|s| s.members());
        let keys = match known {
            Some(keys) => keys,
            None => {
                let baseline = try_outcome!(self.load_baseline(cx, owner, set.def).await);
                let state = try_result!(self.state_mut(owner));
                let entry = state.sets.entry(set.idx).or_default();
                entry.baseline = Some(baseline);
                entry.members().unwrap_or_default()
            }
        };

        let mut members = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(id) = try_outcome!(self.resolve_key(cx, set.item_type, &key).await) {
                members.push(id);
            }
        }
        Outcome::Ok(members)
    }

    /// Whether `item` is a current member of the set `field` of `owner`.
    pub async fn set_contains(&mut self, cx: &Cx, owner: EntityId, field: &str, item: EntityId) -> Outcome<bool, Error> {
        let members = try_outcome!(self.set_members(cx, owner, field).await);
        Outcome::Ok(members.contains(&item))
    }

    /// Persisted members of a junction-backed set.
    async fn load_baseline(&mut self, cx: &Cx, owner: EntityId, def: &FieldDef) -> Outcome<Vec<Key>, Error> {
        let model = Arc::clone(&self.model);
        let state = try_result!(self.state(owner));
        if state.persisted.is_none() {
            return Outcome::Ok(Vec::new());
        }
        let owner_name = model.entity(state.ty).name.clone();
        let owner_key = state.key.values().to_vec();
        let query = Query::navigate(Expr::entity(owner_name, owner_key).member(def.name.clone()));
        let ids = try_outcome!(self.query_entities_quiet(cx, &query).await);
        let mut keys = Vec::with_capacity(ids.len());
        for id in ids {
            keys.push(try_result!(self.state(id)).key.clone());
        }
        tracing::debug!(field = %def.name, members = keys.len(), "loaded set baseline");
        Outcome::Ok(keys)
    }

    #[allow(clippy::result_large_err)]
    fn set_field<'m>(
        &self,
        model: &'m DomainModel,
        owner: EntityId,
        field: &str,
    ) -> tessera_core::Result<SetField<'m>> {
        let ty = self.state(owner)?.ty;
        let (idx, def) = field_of(model, ty, field)?;
        let FieldKind::EntitySet(item_type) = def.kind else {
            return Err(Error::invalid_operation(format!("{field} is not an entity set")));
        };
        Ok(SetField { idx, def, item_type })
    }

    /// Keys of a live owner and a type-checked live item.
    #[allow(clippy::result_large_err)]
    fn set_operands(
        &self,
        model: &DomainModel,
        owner: EntityId,
        set: &SetField<'_>,
        item: EntityId,
        field: &str,
    ) -> tessera_core::Result<(Key, Key)> {
        let owner_key = self.writable(owner)?.key.clone();
        let item_state = self.writable(item)?;
        if !model.is_subtype(item_state.ty, set.item_type) {
            return Err(Error::TypeMismatch(TypeMismatchError {
                field: field.to_string(),
                expected: model.entity(set.item_type).name.clone(),
                actual: model.entity(item_state.ty).name.clone(),
            }));
        }
        Ok((owner_key, item_state.key.clone()))
    }

    /// The paired set on the item side of a many-to-many association.
    fn mirror_field(&self, def: &FieldDef) -> Option<FieldIdx> {
        let paired = self.model.association(def.association?).paired?;
        Some(self.model.association(paired).owner_field)
    }

    /// Drop `key` from the set `field` of every tracked state that has one.
    pub(crate) fn forget_member(&mut self, field: FieldIdx, key: &Key) {
        for id in self.states.ids() {
            let holds = self
                .states
                .get(id)
                .is_some_and(|s| s.sets.contains_key(&field) && s.is_live());
            if holds {
                if let Some(state) = self.states.get_mut(id) {
                    if let Some(set) = state.sets.get_mut(&field) {
                        set.remove(key);
                    }
                }
            }
        }
    }
}

#[allow(clippy::result_large_err)]
fn association_of(def: &FieldDef) -> tessera_core::Result<tessera_core::AssocIdx> {
    def.association
        .ok_or_else(|| Error::model(format!("field {} has no association", def.name)))
}

/// The reference on the item type backing a one-to-many set.
#[allow(clippy::result_large_err)]
fn inverse_reference<'m>(model: &'m DomainModel, def: &FieldDef) -> tessera_core::Result<&'m FieldDef> {
    let master = model.master_of(association_of(def)?);
    let reference = model.entity(master.owner_type).field_at(master.owner_field);
    if !reference.is_stored() {
        return Err(Error::model(format!("{} has no stored reference", def.name)));
    }
    Ok(reference)
}
