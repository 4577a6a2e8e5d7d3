//! Structure (embedded value object) instances.
//!
//! A [`StructureValue`] carries its runtime type name alongside field values.
//! Viewing an instance through a base structure type never changes that name,
//! which is what makes assignment of a subtype instance to a base-typed field
//! detectable: structures are stored column-for-column, so a field only
//! accepts instances of exactly its declared type.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, TypeMismatchError};
use crate::model::{DomainModel, StructFieldKind, StructIdx};
use crate::value::Value;

/// Value of one structure field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StructureField {
    Value(Value),
    Structure(StructureValue),
}

/// A structure instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureValue {
    runtime_type: String,
    fields: Vec<(String, StructureField)>,
}

impl StructureValue {
    /// An instance of `runtime_type` with no fields assigned yet.
    pub fn new(runtime_type: impl Into<String>) -> Self {
        Self {
            runtime_type: runtime_type.into(),
            fields: Vec::new(),
        }
    }

    /// Assign a scalar field.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.put(name.into(), StructureField::Value(value.into()));
        self
    }

    /// Assign a nested structure field.
    #[must_use]
    pub fn with_structure(mut self, name: impl Into<String>, value: StructureValue) -> Self {
        self.put(name.into(), StructureField::Structure(value));
        self
    }

    fn put(&mut self, name: String, field: StructureField) {
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = field;
        } else {
            self.fields.push((name, field));
        }
    }

    pub fn runtime_type(&self) -> &str {
        &self.runtime_type
    }

    pub fn get(&self, name: &str) -> Option<&StructureField> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    /// Scalar field value, if `name` holds a scalar.
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.get(name)? {
            StructureField::Value(v) => Some(v),
            StructureField::Structure(_) => None,
        }
    }

    pub fn fields(&self) -> &[(String, StructureField)] {
        &self.fields
    }

    /// Flatten into leaf column values of `declared`, in declaration order.
    ///
    /// Fails with `TypeMismatch` unless the runtime type (and the runtime type
    /// of every nested structure) equals the declared type exactly.
    #[allow(clippy::result_large_err)]
    pub fn flatten(&self, model: &DomainModel, declared: StructIdx, field: &str) -> Result<Vec<Value>> {
        let def = model.structure(declared);
        if self.runtime_type != def.name {
            return Err(Error::TypeMismatch(TypeMismatchError {
                field: field.to_string(),
                expected: def.name.clone(),
                actual: self.runtime_type.clone(),
            }));
        }
        for (name, _) in &self.fields {
            if def.field(name).is_none() {
                return Err(Error::invalid_operation(format!(
                    "structure {} has no field '{name}'",
                    def.name
                )));
            }
        }

        let mut leaves = Vec::with_capacity(def.leaves.len());
        for sf in &def.fields {
            let path = format!("{field}.{}", sf.name);
            match (sf.kind, self.get(&sf.name)) {
                (StructFieldKind::Scalar(ty), Some(StructureField::Value(v))) => {
                    if v.is_null() && !sf.nullable {
                        return Err(Error::invalid_operation(format!("{path} cannot be NULL")));
                    }
                    leaves.push(ty.coerce(v.clone())?);
                }
                (StructFieldKind::Scalar(ty), None) => leaves.push(if sf.nullable {
                    Value::Null
                } else {
                    ty.default_value()
                }),
                (StructFieldKind::Structure(nested), Some(StructureField::Structure(inner))) => {
                    leaves.extend(inner.flatten(model, nested, &path)?);
                }
                (StructFieldKind::Structure(nested), None) => {
                    leaves.extend(StructureValue::new(model.structure(nested).name.clone()).flatten(
                        model, nested, &path,
                    )?);
                }
                (StructFieldKind::Scalar(_), Some(StructureField::Structure(inner))) => {
                    return Err(Error::TypeMismatch(TypeMismatchError {
                        field: path,
                        expected: "scalar".to_string(),
                        actual: inner.runtime_type.clone(),
                    }));
                }
                (StructFieldKind::Structure(nested), Some(StructureField::Value(v))) => {
                    return Err(Error::TypeMismatch(TypeMismatchError {
                        field: path,
                        expected: model.structure(nested).name.clone(),
                        actual: v.type_name().to_string(),
                    }));
                }
            }
        }
        Ok(leaves)
    }

    /// Rebuild an instance of `ty` from its leaf column values.
    pub fn from_leaves(model: &DomainModel, ty: StructIdx, leaves: &[Value]) -> Self {
        let def = model.structure(ty);
        let mut value = StructureValue::new(def.name.clone());
        for sf in &def.fields {
            let slice = leaves.get(sf.leaves.clone()).unwrap_or(&[]);
            let field = match sf.kind {
                StructFieldKind::Scalar(_) => {
                    StructureField::Value(slice.first().cloned().unwrap_or(Value::Null))
                }
                StructFieldKind::Structure(nested) => {
                    StructureField::Structure(StructureValue::from_leaves(model, nested, slice))
                }
            };
            value.fields.push((sf.name.clone(), field));
        }
        value
    }
}
