//! Change tracking: undo frames for transaction scopes and dirty-column
//! detection for flush.

use std::collections::HashMap;

use tessera_core::{EntityTypeDef, Tuple};

use crate::identity_map::{EntityId, EntityState};

/// Prior images of the states touched inside one scope.
///
/// `None` marks a state created inside the scope.
pub(crate) type UndoFrame = HashMap<EntityId, Option<EntityState>>;

/// Stack of undo frames, one per open transaction scope.
#[derive(Debug, Default)]
pub(crate) struct UndoLog {
    frames: Vec<UndoFrame>,
}

impl UndoLog {
    /// Record the prior image of `id` unless the innermost frame already has one.
    ///
    /// Nothing is recorded while no scope is open.
    pub(crate) fn record(&mut self, id: EntityId, image: impl FnOnce() -> Option<EntityState>) {
        if let Some(frame) = self.frames.last_mut() {
            frame.entry(id).or_insert_with(image);
        }
    }

    pub(crate) fn push(&mut self) {
        self.frames.push(UndoFrame::new());
    }

    pub(crate) fn pop(&mut self) -> Option<UndoFrame> {
        self.frames.pop()
    }

    /// Fold the innermost frame into its parent; the oldest image wins.
    pub(crate) fn merge(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        if let Some(parent) = self.frames.last_mut() {
            for (id, image) in frame {
                parent.entry(id).or_insert(image);
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.frames.clear();
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// Non-key slots whose current value must be written back.
///
/// A slot is dirty when it is available and either unknown in the persisted
/// image or different from it. Restoring a field to its persisted value
/// therefore clears it.
pub(crate) fn changed_columns(def: &EntityTypeDef, current: &Tuple, persisted: &Tuple) -> Vec<usize> {
    (def.key_width..def.columns.len())
        .filter(|slot| match (current.get(*slot), persisted.get(*slot)) {
            (Some(now), Some(before)) => !now.same_value(before),
            (Some(_), None) => true,
            (None, _) => false,
        })
        .collect()
}

/// Whether any non-key column differs from the persisted image.
pub(crate) fn is_dirty(def: &EntityTypeDef, state: &EntityState) -> bool {
    state
        .persisted
        .as_ref()
        .is_some_and(|p| !changed_columns(def, &state.current, p).is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_core::{DomainModel, EntityDecl, FieldDecl, ScalarType, Value};

    fn model() -> Arc<DomainModel> {
        DomainModel::builder()
            .entity(
                EntityDecl::new("Item")
                    .key("Id", ScalarType::Int)
                    .field(FieldDecl::scalar("Name", ScalarType::Text))
                    .field(FieldDecl::scalar("Notes", ScalarType::Text).nullable().lazy()),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn restored_values_are_not_dirty() {
        let model = model();
        let def = model.entity_by_name("Item").unwrap();
        let persisted = Tuple::from_values(vec![Value::Int(1), Value::Text("a".into()), Value::Null]);
        let mut current = persisted.clone();
        current.set(1, Value::Text("b".into()));
        assert_eq!(changed_columns(def, &current, &persisted), vec![1]);
        current.set(1, Value::Text("a".into()));
        assert!(changed_columns(def, &current, &persisted).is_empty());
    }

    #[test]
    fn writes_to_unfetched_slots_are_dirty() {
        let model = model();
        let def = model.entity_by_name("Item").unwrap();
        let mut persisted = Tuple::new(3);
        persisted.set(0, Value::Int(1));
        persisted.set(1, Value::Text("a".into()));
        let mut current = persisted.clone();
        assert!(changed_columns(def, &current, &persisted).is_empty());
        current.set(2, Value::Text("note".into()));
        assert_eq!(changed_columns(def, &current, &persisted), vec![2]);
    }
}
