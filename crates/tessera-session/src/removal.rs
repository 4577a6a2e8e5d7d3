//! Entity removal with association actions.
//!
//! Removing an entity walks its associations with a worklist: `Cascade`
//! pulls the counterpart into the removal set, `Clear` detaches it, `Deny`
//! vetoes the removal and `None` leaves it alone. Every action is decided
//! against the fully expanded removal set before any state is touched, so a
//! denied removal changes nothing.

use std::collections::HashSet;
use std::sync::Arc;

use tessera_core::{
    AssocIdx, Connection, Cx, Error, FieldIdx, FieldKind, Key, OnRemoveAction, Outcome,
    ReferentialIntegrityError, try_outcome, try_result,
};

use crate::materialize::lookup_plan;
use crate::{EntityId, Session, is_junction_field};

/// What detaching a counterpart writes on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Detach {
    /// Null this stored reference of the counterpart
    Reference(FieldIdx),
    /// Drop the removed key from this set of the counterpart
    Membership(FieldIdx),
    Nothing,
}

/// One association edge from an entity being removed to a counterpart.
#[derive(Debug, Clone, Copy)]
struct Link {
    removed: EntityId,
    counterpart: EntityId,
    association: AssocIdx,
    action: OnRemoveAction,
    detach: Detach,
}

impl<C: Connection> Session<C> {
    /// Mark an entity removed, applying the remove actions of its associations.
    ///
    /// Fails with `ReferentialIntegrity` when a `Deny` association still has a
    /// live counterpart outside the removal set; nothing is changed then.
    /// Removing an already removed entity is a no-op.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn remove(&mut self, cx: &Cx, id: EntityId) -> Outcome<(), Error> {
        try_outcome!(self.settle(cx).await);
        if try_result!(self.state(id)).is_removed() {
            return Outcome::Ok(());
        }
        try_result!(self.writable(id));

        let mut order = vec![id];
        let mut visited: HashSet<EntityId> = HashSet::from([id]);
        let mut links = Vec::new();
        let mut next = 0;
        while next < order.len() {
            let current = order[next];
            next += 1;
            for link in try_outcome!(self.links_of(cx, current).await) {
                if link.action == OnRemoveAction::Cascade && self.is_live_id(link.counterpart) && visited.insert(link.counterpart) {
                    order.push(link.counterpart);
                }
                links.push(link);
            }
        }

        let outside: Vec<Link> = links
            .into_iter()
            .filter(|l| !visited.contains(&l.counterpart) && self.is_live_id(l.counterpart))
            .collect();
        try_result!(self.check_links(&outside));

        for link in &outside {
            if link.action == OnRemoveAction::Clear {
                try_result!(self.detach(link));
            }
        }
        for removed in &order {
            let state = try_result!(self.state_mut(*removed));
            state.lifecycle = crate::EntityLifecycle::Removed;
        }
        tracing::debug!(removed = order.len(), detached = outside.len(), "removal applied");
        Outcome::Ok(())
    }

    fn is_live_id(&self, id: EntityId) -> bool {
        self.states.get(id).is_some_and(|s| s.is_live())
    }

    /// Deny vetoes and non-nullable clears, before anything is written.
    #[allow(clippy::result_large_err)]
    fn check_links(&self, links: &[Link]) -> tessera_core::Result<()> {
        for link in links {
            match (link.action, link.detach) {
                (OnRemoveAction::Deny, _) => {
                    let removed = self.state(link.removed)?;
                    let counterpart = self.state(link.counterpart)?;
                    return Err(Error::ReferentialIntegrity(ReferentialIntegrityError {
                        entity_type: self.model.entity(removed.ty).name.clone(),
                        key: removed.key.to_string(),
                        association: self.model.association(link.association).name.clone(),
                        referencing_type: self.model.entity(counterpart.ty).name.clone(),
                        referencing_key: counterpart.key.to_string(),
                    }));
                }
                (OnRemoveAction::Clear, Detach::Reference(field)) => {
                    let counterpart = self.state(link.counterpart)?;
                    let def = self.model.entity(counterpart.ty).field_at(field);
                    if !def.nullable {
                        return Err(Error::invalid_operation(format!(
                            "cannot clear non-nullable {}.{} of {}",
                            self.model.entity(counterpart.ty).name,
                            def.name,
                            self.model.describe_key(&counterpart.key)
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn detach(&mut self, link: &Link) -> tessera_core::Result<()> {
        let removed_key = self.state(link.removed)?.key.clone();
        match link.detach {
            Detach::Reference(field) => {
                let model = Arc::clone(&self.model);
                let counterpart = self.state(link.counterpart)?;
                let def = model.entity(counterpart.ty).field_at(field);
                if counterpart.stored_key(&model, def) == Some(removed_key) {
                    self.write_reference(link.counterpart, def, None)?;
                }
            }
            Detach::Membership(field) => {
                let state = self.state_mut(link.counterpart)?;
                state.sets.entry(field).or_default().remove(&removed_key);
            }
            Detach::Nothing => {}
        }
        Ok(())
    }

    /// Association edges from `id` to its live counterparts.
    async fn links_of(&mut self, cx: &Cx, id: EntityId) -> Outcome<Vec<Link>, Error> {
        let model = Arc::clone(&self.model);
        let ty = try_result!(self.state(id)).ty;
        let def = model.entity(ty);
        let mut links = Vec::new();

        for (i, field) in def.fields.iter().enumerate() {
            let Some(assoc) = field.association else {
                continue;
            };
            let action = model.association(assoc).on_owner_remove;
            if action == OnRemoveAction::None {
                continue;
            }
            let field_idx = FieldIdx(u32::try_from(i).unwrap_or(u32::MAX));
            let master = model.master_of(assoc);
            let (counterparts, detach) = match field.kind {
                FieldKind::Reference(_) if field.is_stored() => {
                    let target = try_outcome!(self.get_reference(cx, id, &field.name).await);
                    (target.into_iter().collect(), Detach::Nothing)
                }
                FieldKind::Reference(_) => {
                    let partner = try_outcome!(self.inverse_partner(cx, id, field_idx).await);
                    (partner.into_iter().collect(), Detach::Reference(master.owner_field))
                }
                FieldKind::EntitySet(_) if is_junction_field(&model, field) => {
                    let members = try_outcome!(self.set_members(cx, id, &field.name).await);
                    let mirror = model
                        .association(assoc)
                        .paired
                        .map(|p| model.association(p).owner_field);
                    (members, mirror.map_or(Detach::Nothing, Detach::Membership))
                }
                FieldKind::EntitySet(_) => {
                    let members = try_outcome!(self.set_members(cx, id, &field.name).await);
                    (members, Detach::Reference(master.owner_field))
                }
                _ => continue,
            };
            links.extend(counterparts.into_iter().map(|counterpart| Link {
                removed: id,
                counterpart,
                association: assoc,
                action,
                detach,
            }));
        }

        let unpaired: Vec<AssocIdx> = model
            .associations_targeting(ty)
            .filter(|a| a.paired.is_none() && a.on_target_remove != OnRemoveAction::None)
            .map(|a| a.idx)
            .collect();
        for assoc in unpaired {
            let a = model.association(assoc);
            let owner_field = model.entity(a.owner_type).field_at(a.owner_field);
            let (counterparts, detach) = if owner_field.is_stored() {
                let holders = try_outcome!(self.referencing(cx, id, assoc).await);
                (holders, Detach::Reference(a.owner_field))
            } else if a.junction.is_some() {
                let owners = try_outcome!(self.junction_owners(cx, id, assoc).await);
                (owners, Detach::Membership(a.owner_field))
            } else {
                continue;
            };
            links.extend(counterparts.into_iter().map(|counterpart| Link {
                removed: id,
                counterpart,
                association: assoc,
                action: a.on_target_remove,
                detach,
            }));
        }
        Outcome::Ok(links)
    }

    /// Live owners whose unpaired junction set `assoc` currently holds `target`.
    async fn junction_owners(&mut self, cx: &Cx, target: EntityId, assoc: AssocIdx) -> Outcome<Vec<EntityId>, Error> {
        let model = Arc::clone(&self.model);
        let a = model.association(assoc);
        let Some(junction) = &a.junction else {
            return Outcome::Ok(Vec::new());
        };
        let state = try_result!(self.state(target));
        let target_key = state.key.clone();
        let persisted = state.persisted.is_some();

        let mut owners = Vec::new();
        if persisted {
            let plan = lookup_plan(&junction.table, &junction.owner_columns, &junction.target_columns);
            let reader = try_outcome!(self.conn.query(cx, &plan, target_key.values()).await);
            let owner_root = model.root_of(a.owner_type);
            for row in reader.collect_rows() {
                let key = Key::new(owner_root, row.into_values());
                if let Some(id) = try_outcome!(self.resolve_key(cx, a.owner_type, &key).await) {
                    owners.push(id);
                }
            }
        }
        for (id, state) in self.states.iter() {
            let holds = state
                .sets
                .get(&a.owner_field)
                .is_some_and(|set| set.added.contains(&target_key));
            if holds && state.is_live() && !owners.contains(&id) {
                owners.push(id);
            }
        }
        owners.retain(|id| {
            self.states
                .get(*id)
                .and_then(|s| s.sets.get(&a.owner_field))
                .is_none_or(|set| match set.members() {
                    Some(members) => members.contains(&target_key),
                    None => !set.removed.contains(&target_key),
                })
        });
        Outcome::Ok(owners)
    }
}
