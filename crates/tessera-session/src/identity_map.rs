//! Identity map: one in-memory state per entity key.
//!
//! States live in a generational arena addressed by [`EntityId`]. A key index
//! maps each identity to its state, so loading the same row twice yields the
//! same id. Every mutable access goes through [`IdentityMap::get_mut`], which
//! snapshots the state into the innermost undo frame first; rolling a frame
//! back restores those snapshots and rebuilds the key index.

use std::collections::HashMap;
use std::fmt;

use tessera_core::{FieldIdx, Key, Tuple, TypeIdx};

use crate::change_tracker::UndoLog;

/// Handle to an entity state tracked by a session.
///
/// Ids stay valid for the lifetime of the session unless the state is
/// discarded by a rollback, after which lookups through the stale id fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    index: u32,
    generation: u32,
}

impl EntityId {
    pub(crate) fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Where an entity state stands relative to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum EntityLifecycle {
    /// Created in this session; inserted at the next flush
    New,
    /// Matches its persisted image
    Loaded,
    /// Has writes not yet flushed
    Modified,
    /// Marked for removal (or removed and flushed)
    Removed,
    /// The row vanished from storage during a secondary fetch
    NotAvailable,
}

/// Pending membership changes of one junction-backed entity set.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SetState {
    /// Persisted members, once loaded
    pub(crate) baseline: Option<Vec<Key>>,
    pub(crate) added: Vec<Key>,
    pub(crate) removed: Vec<Key>,
    /// Every persisted membership is dropped at the next flush
    pub(crate) cleared: bool,
}

impl SetState {
    /// A set known to be empty in storage.
    pub(crate) fn empty() -> Self {
        Self {
            baseline: Some(Vec::new()),
            ..Self::default()
        }
    }

    pub(crate) fn add(&mut self, item: &Key) {
        self.removed.retain(|k| k != item);
        if !self.added.contains(item) {
            self.added.push(item.clone());
        }
    }

    pub(crate) fn remove(&mut self, item: &Key) {
        self.added.retain(|k| k != item);
        if !self.cleared && !self.removed.contains(item) {
            self.removed.push(item.clone());
        }
    }

    pub(crate) fn clear(&mut self) {
        self.added.clear();
        self.removed.clear();
        self.cleared = true;
    }

    pub(crate) fn has_changes(&self) -> bool {
        self.cleared || !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Current members, or `None` while the persisted baseline is unknown.
    pub(crate) fn members(&self) -> Option<Vec<Key>> {
        let mut members = if self.cleared {
            Vec::new()
        } else {
            let mut base = self.baseline.clone()?;
            base.retain(|k| !self.removed.contains(k));
            base
        };
        for key in &self.added {
            if !members.contains(key) {
                members.push(key.clone());
            }
        }
        Some(members)
    }

    /// Fold flushed changes into the baseline.
    pub(crate) fn promote(&mut self) {
        let members = self.members();
        *self = Self {
            baseline: members,
            ..Self::default()
        };
    }
}

/// The in-memory image of one entity.
#[derive(Debug, Clone)]
pub(crate) struct EntityState {
    /// Runtime type
    pub(crate) ty: TypeIdx,
    pub(crate) key: Key,
    pub(crate) lifecycle: EntityLifecycle,
    pub(crate) current: Tuple,
    /// Image of the stored row; `None` until inserted, and after a flushed delete
    pub(crate) persisted: Option<Tuple>,
    /// Junction-backed sets by field
    pub(crate) sets: HashMap<FieldIdx, SetState>,
    /// Known partner of each inverse one-to-one reference
    pub(crate) inverse: HashMap<FieldIdx, Option<Key>>,
    /// The version field was assigned explicitly since the last flush
    pub(crate) version_written: bool,
}

impl EntityState {
    pub(crate) fn is_removed(&self) -> bool {
        self.lifecycle == EntityLifecycle::Removed
    }

    /// Visible to lookups and queries.
    pub(crate) fn is_live(&self) -> bool {
        !matches!(
            self.lifecycle,
            EntityLifecycle::Removed | EntityLifecycle::NotAvailable
        )
    }

    /// Whether the next flush has anything to write for this state.
    pub(crate) fn is_pending(&self) -> bool {
        match self.lifecycle {
            EntityLifecycle::New | EntityLifecycle::Modified => true,
            EntityLifecycle::Removed => self.persisted.is_some(),
            EntityLifecycle::Loaded => self.sets.values().any(SetState::has_changes),
            EntityLifecycle::NotAvailable => false,
        }
    }

    /// Mark a write; loaded states become modified.
    pub(crate) fn touch(&mut self) {
        if self.lifecycle == EntityLifecycle::Loaded {
            self.lifecycle = EntityLifecycle::Modified;
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    state: Option<EntityState>,
}

/// Arena of entity states with a key index and undo frames.
#[derive(Debug, Default)]
pub(crate) struct IdentityMap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_key: HashMap<Key, EntityId>,
    undo: UndoLog,
}

impl IdentityMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, id: EntityId) -> Option<&EntityState> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.state.as_ref()
    }

    /// Mutable access, recording the prior image in the innermost undo frame.
    pub(crate) fn get_mut(&mut self, id: EntityId) -> Option<&mut EntityState> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        let state = slot.state.as_mut()?;
        self.undo.record(id, || Some(state.clone()));
        Some(state)
    }

    /// Track a new state and index it under its key.
    ///
    /// A state already indexed under the key stays in the arena but is no
    /// longer reachable by key.
    pub(crate) fn insert(&mut self, state: EntityState) -> EntityId {
        let key = state.key.clone();
        let id = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.state = Some(state);
            EntityId {
                index,
                generation: slot.generation,
            }
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                state: Some(state),
            });
            EntityId {
                index,
                generation: 0,
            }
        };
        self.undo.record(id, || None);
        self.by_key.insert(key, id);
        id
    }

    pub(crate) fn lookup(&self, key: &Key) -> Option<EntityId> {
        self.by_key.get(key).copied()
    }

    /// Ids of every tracked state, in arena order.
    pub(crate) fn ids(&self) -> Vec<EntityId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (EntityId, &EntityState)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            #[allow(clippy::cast_possible_truncation)]
            let id = EntityId {
                index: index as u32,
                generation: slot.generation,
            };
            slot.state.as_ref().map(|s| (id, s))
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.state.is_some()).count()
    }

    /// Open an undo frame for a new transaction scope.
    pub(crate) fn push_frame(&mut self) {
        self.undo.push();
    }

    /// Close the innermost frame, keeping its changes in the enclosing one.
    pub(crate) fn merge_frame(&mut self) {
        self.undo.merge();
    }

    /// Discard every change recorded since the innermost frame was opened.
    pub(crate) fn rollback_frame(&mut self) {
        let Some(frame) = self.undo.pop() else {
            return;
        };
        let restored = frame.len();
        for (id, image) in frame {
            let Some(slot) = self.slots.get_mut(id.index()) else {
                continue;
            };
            match image {
                Some(state) => {
                    slot.generation = id.generation;
                    slot.state = Some(state);
                }
                None => {
                    if slot.generation == id.generation && slot.state.take().is_some() {
                        self.free.push(id.index);
                    }
                }
            }
        }
        self.free.retain(|index| {
            self.slots
                .get(*index as usize)
                .is_some_and(|slot| slot.state.is_none())
        });
        self.rebuild_index();
        tracing::trace!(restored, "rolled back undo frame");
    }

    /// Drop every undo frame; the current states become the baseline.
    pub(crate) fn clear_frames(&mut self) {
        self.undo.clear();
    }

    pub(crate) fn frame_depth(&self) -> usize {
        self.undo.depth()
    }

    fn rebuild_index(&mut self) {
        let mut by_key: HashMap<Key, EntityId> = HashMap::with_capacity(self.by_key.len());
        for (id, state) in self.iter() {
            let replace = match by_key.get(&state.key) {
                None => true,
                Some(existing) => self
                    .get(*existing)
                    .is_some_and(|e| e.is_removed() && !state.is_removed()),
            };
            if replace {
                by_key.insert(state.key.clone(), id);
            }
        }
        self.by_key = by_key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Value;

    fn state(key: i32) -> EntityState {
        EntityState {
            ty: TypeIdx(0),
            key: Key::new(TypeIdx(0), vec![Value::Int(key)]),
            lifecycle: EntityLifecycle::New,
            current: Tuple::from_values(vec![Value::Int(key), Value::Null]),
            persisted: None,
            sets: HashMap::new(),
            inverse: HashMap::new(),
            version_written: false,
        }
    }

    fn key(k: i32) -> Key {
        Key::new(TypeIdx(0), vec![Value::Int(k)])
    }

    #[test]
    fn insert_indexes_by_key() {
        let mut map = IdentityMap::new();
        let id = map.insert(state(1));
        assert_eq!(map.lookup(&key(1)), Some(id));
        assert_eq!(map.get(id).unwrap().key, key(1));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn rollback_discards_created_states_and_restores_writes() {
        let mut map = IdentityMap::new();
        let kept = map.insert(state(1));
        map.push_frame();
        map.get_mut(kept).unwrap().current.set(1, Value::Text("changed".into()));
        let created = map.insert(state(2));
        map.rollback_frame();

        assert!(map.get(created).is_none());
        assert_eq!(map.lookup(&key(2)), None);
        assert_eq!(map.get(kept).unwrap().current.get(1), Some(&Value::Null));
    }

    #[test]
    fn merged_frame_rolls_back_with_its_parent() {
        let mut map = IdentityMap::new();
        map.push_frame();
        map.push_frame();
        let id = map.insert(state(7));
        map.merge_frame();
        assert_eq!(map.frame_depth(), 1);
        map.rollback_frame();
        assert!(map.get(id).is_none());
    }

    #[test]
    fn stale_ids_do_not_reach_reused_slots() {
        let mut map = IdentityMap::new();
        map.push_frame();
        let stale = map.insert(state(1));
        map.rollback_frame();
        let fresh = map.insert(state(2));
        assert_eq!(stale.index(), fresh.index());
        assert!(map.get(stale).is_none());
        assert!(map.get(fresh).is_some());
    }

    #[test]
    fn set_state_tracks_membership_deltas() {
        let mut set = SetState::empty();
        set.add(&key(1));
        set.add(&key(2));
        set.remove(&key(1));
        assert_eq!(set.members(), Some(vec![key(2)]));
        assert_eq!(set.added, vec![key(2)]);

        let mut unknown = SetState::default();
        unknown.remove(&key(3));
        assert_eq!(unknown.members(), None);
        unknown.clear();
        unknown.add(&key(4));
        assert_eq!(unknown.members(), Some(vec![key(4)]));
        unknown.promote();
        assert!(!unknown.has_changes());
        assert_eq!(unknown.baseline, Some(vec![key(4)]));
    }
}
