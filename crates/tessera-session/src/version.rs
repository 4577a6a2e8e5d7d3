//! Optimistic versioning and validation hooks.
//!
//! A versioned entity type carries one version field. Every flushed
//! modification increments it, and updates and deletes only match the row
//! while storage still holds the version the session expects. Clients that
//! edit entities across sessions capture [`VersionInfo`] when loading and hand
//! it back through [`Session::expect_versions`] before saving.

use serde::{Deserialize, Serialize};
use tessera_core::{
    Connection, DomainModel, EntityView, Error, FieldKind, Result, ValidationError, Value,
    validate_entity,
};

use crate::identity_map::EntityState;
use crate::{EntityId, Session};

/// The version of one entity as the session saw it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub entity_type: String,
    pub key: Vec<Value>,
    pub version: Value,
}

/// Versions collected for a later flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionSet {
    entries: Vec<VersionInfo>,
}

impl VersionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, replacing an earlier one for the same entity.
    pub fn add(&mut self, info: VersionInfo) {
        self.entries
            .retain(|e| !(e.entity_type == info.entity_type && e.key == info.key));
        self.entries.push(info);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionInfo> {
        self.entries.iter()
    }

    #[allow(clippy::result_large_err)]
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serde(e.to_string()))
    }

    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serde(e.to_string()))
    }
}

impl<C: Connection> Session<C> {
    /// Capture the version an entity was loaded with.
    ///
    /// New entities report their current version value.
    #[allow(clippy::result_large_err)]
    pub fn version_info(&self, id: EntityId) -> Result<VersionInfo> {
        let state = self.state(id)?;
        let def = self.model.entity(state.ty);
        let Some(slot) = def.version_column() else {
            return Err(Error::invalid_operation(format!("{} is not versioned", def.name)));
        };
        let image = state.persisted.as_ref().unwrap_or(&state.current);
        Ok(VersionInfo {
            entity_type: def.name.clone(),
            key: state.key.values().to_vec(),
            version: image.get(slot).cloned().unwrap_or(Value::Null),
        })
    }

    /// Make subsequent flushes require these versions in storage.
    ///
    /// An expectation holds until the entity's next successful flush.
    #[allow(clippy::result_large_err)]
    pub fn expect_versions(&mut self, versions: &VersionSet) -> Result<()> {
        for info in versions.iter() {
            let def = self.model.entity_by_name(&info.entity_type)?;
            let Some(slot) = def.version_column() else {
                return Err(Error::invalid_operation(format!("{} is not versioned", def.name)));
            };
            let version = def.columns[slot].ty.coerce(info.version.clone())?;
            let key = self.model.make_key(def.idx, info.key.clone())?;
            self.expected_versions.insert(key, version);
        }
        tracing::debug!(count = versions.len(), "expected versions registered");
        Ok(())
    }

    /// Run the entity type's validators against the current values.
    ///
    /// Works for removed entities too; flush only validates live ones.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self, id: EntityId) -> Result<()> {
        let state = self.state(id)?;
        validate_state(&self.model, state).map_err(Error::Validation)
    }
}

/// Read-only view of an entity state for validators.
///
/// Fields resolve by name; flattened structure leaves and reference key
/// columns resolve by column name (`Home.City`).
pub(crate) struct StateView<'a> {
    model: &'a DomainModel,
    state: &'a EntityState,
}

impl EntityView for StateView<'_> {
    fn entity_type(&self) -> &str {
        &self.model.entity(self.state.ty).name
    }

    fn value(&self, field: &str) -> Option<Value> {
        let def = self.model.entity(self.state.ty);
        if let Some((_, f)) = def.field(field) {
            if let FieldKind::Scalar(_) = f.kind {
                return self.state.current.get(f.columns.start).cloned();
            }
        }
        let slot = def.column_index(field)?;
        self.state.current.get(slot).cloned()
    }
}

pub(crate) fn validate_state(
    model: &DomainModel,
    state: &EntityState,
) -> std::result::Result<(), ValidationError> {
    let def = model.entity(state.ty);
    if def.validators.is_empty() {
        return Ok(());
    }
    validate_entity(&def.validators, &StateView { model, state })
}

/// The version a flushed modification writes.
pub(crate) fn next_version(current: &Value) -> Value {
    match current {
        Value::Int(v) => Value::Int(v.wrapping_add(1)),
        Value::BigInt(v) => Value::BigInt(v.wrapping_add(1)),
        Value::Null => Value::Int(1),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_version_increments_integers() {
        assert_eq!(next_version(&Value::Int(4)), Value::Int(5));
        assert_eq!(next_version(&Value::BigInt(9)), Value::BigInt(10));
        assert_eq!(next_version(&Value::Text("a".into())), Value::Text("a".into()));
    }

    #[test]
    fn version_set_replaces_entries_and_round_trips_json() {
        let mut set = VersionSet::new();
        set.add(VersionInfo {
            entity_type: "Order".into(),
            key: vec![Value::Int(1)],
            version: Value::Int(1),
        });
        set.add(VersionInfo {
            entity_type: "Order".into(),
            key: vec![Value::Int(1)],
            version: Value::Int(3),
        });
        assert_eq!(set.len(), 1);

        let json = set.to_json().unwrap();
        let back = VersionSet::from_json(&json).unwrap();
        assert_eq!(back, set);
        assert_eq!(back.iter().next().unwrap().version, Value::Int(3));
    }
}
