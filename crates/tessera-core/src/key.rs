//! Entity identity.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::model::TypeIdx;
use crate::value::Value;

/// Identity of an entity: its hierarchy root plus key values in declared order.
///
/// Keys are cheap to clone. Two keys are equal iff they share the hierarchy
/// root and their values are pairwise equal, so a `Derived` entity and a
/// `Base` lookup with the same values resolve to the same identity.
#[derive(Debug, Clone)]
pub struct Key {
    root: TypeIdx,
    values: Arc<[Value]>,
}

impl Key {
    /// Build a key without coercion; see [`crate::DomainModel::make_key`].
    pub fn new(root: TypeIdx, values: Vec<Value>) -> Self {
        Self {
            root,
            values: values.into(),
        }
    }

    pub fn root(&self) -> TypeIdx {
        self.root
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|(a, b)| a.same_value(b))
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.root.hash(state);
        for value in self.values.iter() {
            value.hash_into(state);
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equal_keys_hash_equal() {
        let a = Key::new(TypeIdx(0), vec![Value::Int(1), Value::Text("x".into())]);
        let b = Key::new(TypeIdx(0), vec![Value::Int(1), Value::Text("x".into())]);
        let c = Key::new(TypeIdx(1), vec![Value::Int(1), Value::Text("x".into())]);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<Key> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn display_lists_values() {
        let key = Key::new(TypeIdx(0), vec![Value::Int(7), Value::Text("a".into())]);
        assert_eq!(key.to_string(), "(7, 'a')");
    }
}
