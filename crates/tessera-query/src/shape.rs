//! How result rows of a compiled query map back to values.

use tessera_core::{Row, StructIdx, TypeRef, Value};

/// Shape of one result element, by result column index.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultShape {
    Scalar {
        column: usize,
    },
    /// An entity of static type `ty`.
    ///
    /// `columns` follows [`tessera_core::DomainModel::projected_columns`] of
    /// `ty`; `None` marks a column left out of the projection (lazy fields).
    /// A row whose key columns are all NULL holds no entity.
    Entity {
        ty: TypeRef,
        type_id: usize,
        key: Vec<usize>,
        columns: Vec<Option<usize>>,
    },
    Structure {
        ty: StructIdx,
        columns: Vec<usize>,
    },
    Record(Vec<(String, ResultShape)>),
}

impl ResultShape {
    /// `true` when the row holds no entity for this shape (outer-join miss).
    pub fn is_absent(&self, row: &Row) -> bool {
        match self {
            ResultShape::Entity { key, .. } => key
                .iter()
                .all(|i| row.get(*i).is_none_or(Value::is_null)),
            _ => false,
        }
    }

    /// Read a scalar shape's value.
    pub fn scalar(&self, row: &Row) -> Option<Value> {
        match self {
            ResultShape::Scalar { column } => row.get(*column).cloned(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::TypeIdx;

    #[test]
    fn entity_with_null_key_is_absent() {
        let shape = ResultShape::Entity {
            ty: TypeRef::Entity(TypeIdx(0)),
            type_id: 1,
            key: vec![0],
            columns: vec![Some(0), Some(2)],
        };
        let missing = Row::new(
            vec!["c0".into(), "c1".into(), "c2".into()],
            vec![Value::Null, Value::Null, Value::Null],
        );
        let present = Row::new(
            vec!["c0".into(), "c1".into(), "c2".into()],
            vec![Value::BigInt(4), Value::Int(0), Value::Text("x".into())],
        );
        assert!(shape.is_absent(&missing));
        assert!(!shape.is_absent(&present));
    }

    #[test]
    fn scalar_reads_its_column() {
        let shape = ResultShape::Scalar { column: 1 };
        let row = Row::new(vec!["c0".into(), "c1".into()], vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(shape.scalar(&row), Some(Value::Int(2)));
    }
}
