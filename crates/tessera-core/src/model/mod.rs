//! Resolved domain model.
//!
//! A [`DomainModel`] is built once by [`DomainModelBuilder`] and shared as an
//! `Arc`. It answers every question the session, the translator and drivers
//! ask about entity types: field and column layout, key shape, hierarchy
//! mapping, association pairing and removal actions, and the relational
//! catalog the types map to.
//!
//! # Column layout
//!
//! Every entity type flattens its fields into an ordered column list:
//!
//! - key columns come first (`0..key_width`);
//! - a structure field contributes one column per leaf (`Address.City`);
//! - a stored reference contributes the target's key columns (`Owner.Id`);
//! - entity sets and inverse (paired, non-master) references contribute none.
//!
//! A subtype's columns always extend its base's columns, so a slot index of a
//! base type is valid for every descendant.
//!
//! # Example
//!
//! ```ignore
//! let model = DomainModel::builder()
//!     .entity(
//!         EntityDecl::new("Author")
//!             .key("Id", ScalarType::Int)
//!             .field(FieldDecl::scalar("Name", ScalarType::Text))
//!             .field(FieldDecl::entity_set("Books", "Book").paired_with("Author")),
//!     )
//!     .entity(
//!         EntityDecl::new("Book")
//!             .key("Id", ScalarType::Int)
//!             .field(FieldDecl::reference("Author", "Author").nullable()),
//!     )
//!     .build()?;
//! ```

mod builder;
mod catalog;

pub use builder::{DomainModelBuilder, EntityDecl, FieldDecl, InterfaceDecl, StructureDecl};
pub use catalog::{Catalog, ColumnSchema, ForeignKeySchema, TableSchema};

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, TypeError};
use crate::key::Key;
use crate::validate::Validator;
use crate::value::Value;

/// Name of the discriminator column of single-table hierarchies.
pub const TYPE_ID_COLUMN: &str = "TypeId";

macro_rules! index_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            /// Position in the owning model vector.
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            pub(crate) fn from_usize(i: usize) -> Self {
                #[allow(clippy::cast_possible_truncation)]
                Self(i as u32)
            }
        }
    };
}

index_type!(
    /// Index of an entity type.
    TypeIdx
);
index_type!(
    /// Index of a structure (value object) type.
    StructIdx
);
index_type!(
    /// Index of an interface.
    InterfaceIdx
);
index_type!(
    /// Index of a field within its entity type (inherited fields keep their index).
    FieldIdx
);
index_type!(
    /// Index of a resolved association.
    AssocIdx
);
index_type!(
    /// Index of an inheritance hierarchy.
    HierarchyIdx
);

/// Scalar column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Bool,
    Int,
    BigInt,
    Double,
    Decimal,
    Text,
    Bytes,
    Date,
    Timestamp,
    Uuid,
    Json,
}

impl ScalarType {
    pub const fn name(self) -> &'static str {
        match self {
            ScalarType::Bool => "BOOLEAN",
            ScalarType::Int => "INTEGER",
            ScalarType::BigInt => "BIGINT",
            ScalarType::Double => "DOUBLE",
            ScalarType::Decimal => "DECIMAL",
            ScalarType::Text => "TEXT",
            ScalarType::Bytes => "BLOB",
            ScalarType::Date => "DATE",
            ScalarType::Timestamp => "TIMESTAMP",
            ScalarType::Uuid => "UUID",
            ScalarType::Json => "JSON",
        }
    }

    /// Whether this is a numeric type that `SUM` can aggregate.
    pub const fn is_numeric(self) -> bool {
        matches!(
            self,
            ScalarType::Int | ScalarType::BigInt | ScalarType::Double | ScalarType::Decimal
        )
    }

    /// Value a non-nullable field of this type holds before it is assigned.
    pub fn default_value(self) -> Value {
        match self {
            ScalarType::Bool => Value::Bool(false),
            ScalarType::Int => Value::Int(0),
            ScalarType::BigInt => Value::BigInt(0),
            ScalarType::Double => Value::Double(0.0),
            ScalarType::Decimal => Value::Decimal("0".to_string()),
            ScalarType::Text => Value::Text(String::new()),
            ScalarType::Bytes => Value::Bytes(Vec::new()),
            ScalarType::Date => Value::Date(0),
            ScalarType::Timestamp => Value::Timestamp(0),
            ScalarType::Uuid => Value::Uuid([0; 16]),
            ScalarType::Json => Value::Json(serde_json::Value::Null),
        }
    }

    /// Coerce a value into this column type.
    ///
    /// NULL passes through; nullability is checked by the caller.
    #[allow(clippy::result_large_err)]
    pub fn coerce(self, value: Value) -> Result<Value> {
        let coerced = match (self, value) {
            (_, Value::Null) => Value::Null,
            (ScalarType::Bool, Value::Bool(b)) => Value::Bool(b),
            (ScalarType::Int, Value::Int(i)) => Value::Int(i),
            (ScalarType::Int, Value::BigInt(i)) => match i32::try_from(i) {
                Ok(i) => Value::Int(i),
                Err(_) => return Err(coerce_error(self, &Value::BigInt(i))),
            },
            (ScalarType::BigInt, Value::Int(i)) => Value::BigInt(i64::from(i)),
            (ScalarType::BigInt, Value::BigInt(i)) => Value::BigInt(i),
            (ScalarType::Double, Value::Double(d)) => Value::Double(d),
            (ScalarType::Double, Value::Int(i)) => Value::Double(f64::from(i)),
            (ScalarType::Double, Value::BigInt(i)) => Value::Double(i as f64),
            (ScalarType::Decimal, Value::Decimal(d)) => Value::Decimal(d),
            (ScalarType::Decimal, Value::Int(i)) => Value::Decimal(i.to_string()),
            (ScalarType::Decimal, Value::BigInt(i)) => Value::Decimal(i.to_string()),
            (ScalarType::Text, Value::Text(s)) => Value::Text(s),
            (ScalarType::Bytes, Value::Bytes(b)) => Value::Bytes(b),
            (ScalarType::Date, Value::Date(d)) => Value::Date(d),
            (ScalarType::Timestamp, Value::Timestamp(t)) => Value::Timestamp(t),
            (ScalarType::Uuid, Value::Uuid(u)) => Value::Uuid(u),
            (ScalarType::Json, Value::Json(j)) => Value::Json(j),
            (_, other) => return Err(coerce_error(self, &other)),
        };
        Ok(coerced)
    }
}

fn coerce_error(ty: ScalarType, value: &Value) -> Error {
    Error::Type(TypeError {
        expected: ty.name(),
        actual: value.type_name().to_string(),
        column: None,
    })
}

/// What a field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(ScalarType),
    Structure(StructIdx),
    Reference(TypeIdx),
    EntitySet(TypeIdx),
}

/// Action applied to the other side of an association when one side is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OnRemoveAction {
    /// Remove the other side too.
    Cascade,
    /// Null out the reference / drop the membership.
    Clear,
    /// Refuse the removal while a live counterpart exists.
    Deny,
    /// Do nothing.
    None,
}

/// How a hierarchy's types map onto tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InheritanceMapping {
    /// One table for the whole hierarchy with a `TypeId` discriminator.
    #[default]
    SingleTable,
    /// One table per concrete type holding all inherited columns.
    ConcreteTable,
}

/// How keys of new entities are produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyGenerator {
    /// Callers supply key values.
    #[default]
    None,
    /// Single integer key drawn from a named driver sequence.
    Sequence(String),
}

/// Multiplicity seen from the association's owner field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

/// A field of an entity type.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
    pub lazy: bool,
    pub is_key: bool,
    pub is_version: bool,
    /// Type that declared the field (differs from the owner for inherited fields)
    pub declared_in: TypeIdx,
    /// Tuple slots of this field; empty for entity sets and inverse references
    pub columns: Range<usize>,
    pub association: Option<AssocIdx>,
}

impl FieldDef {
    /// Whether the field maps onto columns of its owner's row.
    pub fn is_stored(&self) -> bool {
        !self.columns.is_empty()
    }
}

/// A mapped column of an entity type.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ScalarType,
    pub nullable: bool,
    pub field: FieldIdx,
    pub lazy: bool,
}

/// A resolved entity type.
#[derive(Debug, Clone)]
pub struct EntityTypeDef {
    pub idx: TypeIdx,
    pub name: String,
    pub base: Option<TypeIdx>,
    pub is_abstract: bool,
    /// Interfaces implemented directly or through bases, transitively
    pub interfaces: Vec<InterfaceIdx>,
    pub fields: Vec<FieldDef>,
    pub columns: Vec<ColumnDef>,
    pub key_width: usize,
    pub version_field: Option<FieldIdx>,
    pub hierarchy: HierarchyIdx,
    /// Table holding rows of this type; `None` for abstract concrete-table types
    pub table: Option<String>,
    pub validators: Vec<Validator>,
    pub key_generator: KeyGenerator,
    /// This type and every type deriving from it, in model order
    pub descendants: Vec<TypeIdx>,
    field_by_name: HashMap<String, FieldIdx>,
}

impl EntityTypeDef {
    /// Look up a field (own or inherited) by name.
    pub fn field(&self, name: &str) -> Option<(FieldIdx, &FieldDef)> {
        let idx = *self.field_by_name.get(name)?;
        Some((idx, &self.fields[idx.index()]))
    }

    pub fn field_at(&self, idx: FieldIdx) -> &FieldDef {
        &self.fields[idx.index()]
    }

    /// Key column slots.
    pub fn key_columns(&self) -> Range<usize> {
        0..self.key_width
    }

    /// Slot of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Slot of the version column, if the type is versioned.
    pub fn version_column(&self) -> Option<usize> {
        self.version_field
            .map(|f| self.fields[f.index()].columns.start)
    }
}

/// A resolved structure (value object) type.
#[derive(Debug, Clone)]
pub struct StructureDef {
    pub idx: StructIdx,
    pub name: String,
    pub base: Option<StructIdx>,
    pub fields: Vec<StructFieldDef>,
    /// Flattened leaves in declaration order: (dotted path, type, nullable)
    pub leaves: Vec<StructLeaf>,
}

#[derive(Debug, Clone)]
pub struct StructFieldDef {
    pub name: String,
    pub kind: StructFieldKind,
    pub nullable: bool,
    /// Range of this field's leaves within the owning structure
    pub leaves: Range<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructFieldKind {
    Scalar(ScalarType),
    Structure(StructIdx),
}

#[derive(Debug, Clone)]
pub struct StructLeaf {
    pub path: String,
    pub ty: ScalarType,
    pub nullable: bool,
}

impl StructureDef {
    pub fn field(&self, name: &str) -> Option<&StructFieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A resolved interface.
#[derive(Debug, Clone)]
pub struct InterfaceDef {
    pub idx: InterfaceIdx,
    pub name: String,
    pub bases: Vec<InterfaceIdx>,
    pub fields: Vec<InterfaceFieldDef>,
    /// Key columns shared by every implementor: (name, type)
    pub key_columns: Vec<(String, ScalarType)>,
    /// Non-key projected columns (flattened interface fields)
    pub columns: Vec<(String, ScalarType, bool)>,
    /// Concrete implementors, transitively through interface and type inheritance
    pub implementors: Vec<TypeIdx>,
    /// Implementor tuple slots for each interface column (after the key)
    column_slots: HashMap<TypeIdx, Vec<usize>>,
}

#[derive(Debug, Clone)]
pub struct InterfaceFieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
    /// Range within [`InterfaceDef::columns`]
    pub columns: Range<usize>,
}

impl InterfaceDef {
    pub fn field(&self, name: &str) -> Option<&InterfaceFieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A resolved inheritance hierarchy.
#[derive(Debug, Clone)]
pub struct HierarchyDef {
    pub idx: HierarchyIdx,
    pub root: TypeIdx,
    pub mapping: InheritanceMapping,
    pub types: Vec<TypeIdx>,
    /// Shared table of a single-table hierarchy
    pub table: Option<String>,
}

/// Junction table backing a many-to-many association.
#[derive(Debug, Clone)]
pub struct JunctionDef {
    pub table: String,
    pub owner_columns: Vec<String>,
    pub target_columns: Vec<String>,
}

/// A resolved association, one per reference or entity-set field declaration.
#[derive(Debug, Clone)]
pub struct AssociationDef {
    pub idx: AssocIdx,
    /// `Owner.Field`
    pub name: String,
    pub owner_type: TypeIdx,
    pub owner_field: FieldIdx,
    pub target_type: TypeIdx,
    pub multiplicity: Multiplicity,
    pub paired: Option<AssocIdx>,
    /// Master side owns the foreign key columns or the junction rows
    pub is_master: bool,
    pub on_owner_remove: OnRemoveAction,
    pub on_target_remove: OnRemoveAction,
    /// Junction of a many-to-many association (set on the master side)
    pub junction: Option<JunctionDef>,
}

/// Static type of an entity-valued sequence or expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Entity(TypeIdx),
    Interface(InterfaceIdx),
}

/// A projected column of a [`TypeRef`].
#[derive(Debug, Clone)]
pub struct ProjectedColumn {
    pub name: String,
    pub ty: ScalarType,
    pub nullable: bool,
    pub lazy: bool,
}

/// The immutable, resolved domain model.
#[derive(Debug, Clone)]
pub struct DomainModel {
    entities: Vec<EntityTypeDef>,
    structures: Vec<StructureDef>,
    interfaces: Vec<InterfaceDef>,
    hierarchies: Vec<HierarchyDef>,
    associations: Vec<AssociationDef>,
    names: HashMap<String, NamedType>,
    catalog: Catalog,
}

#[derive(Debug, Clone, Copy)]
enum NamedType {
    Entity(TypeIdx),
    Structure(StructIdx),
    Interface(InterfaceIdx),
}

impl DomainModel {
    /// Start building a model.
    pub fn builder() -> DomainModelBuilder {
        DomainModelBuilder::new()
    }

    pub fn entity(&self, idx: TypeIdx) -> &EntityTypeDef {
        &self.entities[idx.index()]
    }

    pub fn entities(&self) -> &[EntityTypeDef] {
        &self.entities
    }

    /// Look up an entity type by name.
    #[allow(clippy::result_large_err)]
    pub fn entity_by_name(&self, name: &str) -> Result<&EntityTypeDef> {
        match self.names.get(name) {
            Some(NamedType::Entity(idx)) => Ok(self.entity(*idx)),
            _ => Err(Error::model(format!("unknown entity type '{name}'"))),
        }
    }

    pub fn structure(&self, idx: StructIdx) -> &StructureDef {
        &self.structures[idx.index()]
    }

    /// Look up a structure type by name.
    pub fn structure_by_name(&self, name: &str) -> Option<&StructureDef> {
        match self.names.get(name) {
            Some(NamedType::Structure(idx)) => Some(self.structure(*idx)),
            _ => None,
        }
    }

    pub fn interface(&self, idx: InterfaceIdx) -> &InterfaceDef {
        &self.interfaces[idx.index()]
    }

    pub fn hierarchy(&self, idx: HierarchyIdx) -> &HierarchyDef {
        &self.hierarchies[idx.index()]
    }

    pub fn association(&self, idx: AssocIdx) -> &AssociationDef {
        &self.associations[idx.index()]
    }

    pub fn associations(&self) -> &[AssociationDef] {
        &self.associations
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Resolve an entity or interface name to a [`TypeRef`].
    pub fn resolve_type(&self, name: &str) -> Option<TypeRef> {
        match self.names.get(name)? {
            NamedType::Entity(idx) => Some(TypeRef::Entity(*idx)),
            NamedType::Interface(idx) => Some(TypeRef::Interface(*idx)),
            NamedType::Structure(_) => None,
        }
    }

    pub fn type_ref_name(&self, ty: TypeRef) -> &str {
        match ty {
            TypeRef::Entity(t) => &self.entity(t).name,
            TypeRef::Interface(i) => &self.interface(i).name,
        }
    }

    /// Root of the hierarchy a type belongs to.
    pub fn root_of(&self, ty: TypeIdx) -> TypeIdx {
        self.hierarchy(self.entity(ty).hierarchy).root
    }

    /// `true` when `ty` is `ancestor` or derives from it.
    pub fn is_subtype(&self, ty: TypeIdx, ancestor: TypeIdx) -> bool {
        let mut current = Some(ty);
        while let Some(t) = current {
            if t == ancestor {
                return true;
            }
            current = self.entity(t).base;
        }
        false
    }

    /// `true` when an entity of runtime type `ty` is an instance of `target`.
    pub fn is_instance_of(&self, ty: TypeIdx, target: TypeRef) -> bool {
        match target {
            TypeRef::Entity(t) => self.is_subtype(ty, t),
            TypeRef::Interface(i) => self.entity(ty).interfaces.contains(&i),
        }
    }

    /// Every concrete type whose instances satisfy `target`, transitively.
    pub fn concrete_types(&self, target: TypeRef) -> Vec<TypeIdx> {
        match target {
            TypeRef::Entity(t) => self
                .entity(t)
                .descendants
                .iter()
                .copied()
                .filter(|d| !self.entity(*d).is_abstract)
                .collect(),
            TypeRef::Interface(i) => self.interface(i).implementors.clone(),
        }
    }

    /// Discriminator value identifying a runtime type.
    pub fn type_id_value(&self, ty: TypeIdx) -> Value {
        #[allow(clippy::cast_possible_wrap)]
        Value::Int(ty.0 as i32)
    }

    /// Inverse of [`DomainModel::type_id_value`].
    pub fn type_from_id(&self, value: &Value) -> Option<TypeIdx> {
        let id = usize::try_from(value.as_i64()?).ok()?;
        (id < self.entities.len()).then(|| TypeIdx::from_usize(id))
    }

    /// Associations whose target is `ty` or one of its ancestors.
    pub fn associations_targeting(&self, ty: TypeIdx) -> impl Iterator<Item = &AssociationDef> {
        self.associations
            .iter()
            .filter(move |a| self.is_subtype(ty, a.target_type))
    }

    /// The master side of an association (itself when unpaired).
    pub fn master_of(&self, assoc: AssocIdx) -> &AssociationDef {
        let def = self.association(assoc);
        if def.is_master {
            def
        } else {
            def.paired.map_or(def, |p| self.association(p))
        }
    }

    /// Columns projected when materializing entities of static type `ty`.
    pub fn projected_columns(&self, ty: TypeRef) -> Vec<ProjectedColumn> {
        match ty {
            TypeRef::Entity(t) => self
                .entity(t)
                .columns
                .iter()
                .map(|c| ProjectedColumn {
                    name: c.name.clone(),
                    ty: c.ty,
                    nullable: c.nullable,
                    lazy: c.lazy,
                })
                .collect(),
            TypeRef::Interface(i) => {
                let def = self.interface(i);
                def.key_columns
                    .iter()
                    .map(|(name, ty)| ProjectedColumn {
                        name: name.clone(),
                        ty: *ty,
                        nullable: false,
                        lazy: false,
                    })
                    .chain(def.columns.iter().map(|(name, ty, nullable)| ProjectedColumn {
                        name: name.clone(),
                        ty: *ty,
                        nullable: *nullable,
                        lazy: false,
                    }))
                    .collect()
            }
        }
    }

    /// Tuple slots of `runtime` receiving each column of [`Self::projected_columns`].
    pub fn slot_map(&self, ty: TypeRef, runtime: TypeIdx) -> Option<Vec<usize>> {
        match ty {
            TypeRef::Entity(t) => {
                if !self.is_subtype(runtime, t) {
                    return None;
                }
                Some((0..self.entity(t).columns.len()).collect())
            }
            TypeRef::Interface(i) => {
                let def = self.interface(i);
                let slots = def.column_slots.get(&runtime)?;
                Some((0..def.key_columns.len()).chain(slots.iter().copied()).collect())
            }
        }
    }

    /// Build a key for `ty`, coercing values to the declared key column types.
    #[allow(clippy::result_large_err)]
    pub fn make_key(&self, ty: TypeIdx, values: Vec<Value>) -> Result<Key> {
        let def = self.entity(ty);
        if values.len() != def.key_width {
            return Err(Error::invalid_operation(format!(
                "{} expects {} key value(s), got {}",
                def.name,
                def.key_width,
                values.len()
            )));
        }
        let mut coerced = Vec::with_capacity(values.len());
        for (column, value) in def.columns.iter().zip(values) {
            if value.is_null() {
                return Err(Error::invalid_operation(format!(
                    "key column {}.{} cannot be NULL",
                    def.name, column.name
                )));
            }
            coerced.push(column.ty.coerce(value)?);
        }
        Ok(Key::new(self.root_of(ty), coerced))
    }

    /// Render a key for messages.
    pub fn describe_key(&self, key: &Key) -> String {
        format!("{}{}", self.entity(key.root()).name, key)
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Entity(t) => write!(f, "entity#{}", t.0),
            TypeRef::Interface(i) => write!(f, "interface#{}", i.0),
        }
    }
}
