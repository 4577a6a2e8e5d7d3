//! Declarations and resolution of the domain model.

use std::collections::HashMap;
use std::sync::Arc;

use super::catalog;
use super::{
    AssocIdx, AssociationDef, ColumnDef, DomainModel, EntityTypeDef, FieldDef, FieldIdx,
    FieldKind, HierarchyDef, HierarchyIdx, InheritanceMapping, InterfaceDef, InterfaceFieldDef,
    InterfaceIdx, JunctionDef, KeyGenerator, Multiplicity, NamedType, OnRemoveAction, ScalarType,
    StructFieldDef, StructFieldKind, StructIdx, StructLeaf, StructureDef, TypeIdx,
};
use crate::error::{Error, Result};
use crate::validate::{Validator, validate_pattern};

#[derive(Debug, Clone)]
enum DeclKind {
    Scalar(ScalarType),
    Structure(String),
    Reference(String),
    EntitySet(String),
}

/// Declaration of a field on an entity, structure or interface.
#[derive(Debug, Clone)]
pub struct FieldDecl {
    name: String,
    kind: DeclKind,
    nullable: bool,
    lazy: bool,
    version: bool,
    paired_with: Option<String>,
    on_owner_remove: Option<OnRemoveAction>,
    on_target_remove: Option<OnRemoveAction>,
}

impl FieldDecl {
    fn new(name: impl Into<String>, kind: DeclKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            lazy: false,
            version: false,
            paired_with: None,
            on_owner_remove: None,
            on_target_remove: None,
        }
    }

    pub fn scalar(name: impl Into<String>, ty: ScalarType) -> Self {
        Self::new(name, DeclKind::Scalar(ty))
    }

    pub fn structure(name: impl Into<String>, structure: impl Into<String>) -> Self {
        Self::new(name, DeclKind::Structure(structure.into()))
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, DeclKind::Reference(target.into()))
    }

    pub fn entity_set(name: impl Into<String>, item: impl Into<String>) -> Self {
        Self::new(name, DeclKind::EntitySet(item.into()))
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Exclude the field from default projections; it is fetched on first access.
    #[must_use]
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Mark an integer field as the optimistic version counter.
    #[must_use]
    pub fn version(mut self) -> Self {
        self.version = true;
        self
    }

    /// Pair with a field of the target type. Only one side of a pair declares it.
    #[must_use]
    pub fn paired_with(mut self, field: impl Into<String>) -> Self {
        self.paired_with = Some(field.into());
        self
    }

    /// Action on the target(s) when the owner of this field is removed.
    #[must_use]
    pub fn on_owner_remove(mut self, action: OnRemoveAction) -> Self {
        self.on_owner_remove = Some(action);
        self
    }

    /// Action on the owner when a target of this field is removed.
    #[must_use]
    pub fn on_target_remove(mut self, action: OnRemoveAction) -> Self {
        self.on_target_remove = Some(action);
        self
    }
}

/// Declaration of an entity type.
#[derive(Debug, Clone)]
pub struct EntityDecl {
    name: String,
    base: Option<String>,
    is_abstract: bool,
    interfaces: Vec<String>,
    keys: Vec<(String, ScalarType)>,
    fields: Vec<FieldDecl>,
    mapping: Option<InheritanceMapping>,
    table: Option<String>,
    validators: Vec<Validator>,
    key_generator: KeyGenerator,
    unique: Vec<Vec<String>>,
}

impl EntityDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            is_abstract: false,
            interfaces: Vec::new(),
            keys: Vec::new(),
            fields: Vec::new(),
            mapping: None,
            table: None,
            validators: Vec::new(),
            key_generator: KeyGenerator::None,
            unique: Vec::new(),
        }
    }

    #[must_use]
    pub fn extends(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    #[must_use]
    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    #[must_use]
    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    /// Add a key field. Only hierarchy roots declare keys.
    #[must_use]
    pub fn key(mut self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.keys.push((name.into(), ty));
        self
    }

    #[must_use]
    pub fn field(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }

    /// Inheritance mapping of the hierarchy rooted at this type.
    #[must_use]
    pub fn mapping(mut self, mapping: InheritanceMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    /// Override the table name (defaults to the type name).
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    #[must_use]
    pub fn key_generator(mut self, generator: KeyGenerator) -> Self {
        self.key_generator = generator;
        self
    }

    /// Declare a unique index over scalar or reference fields.
    #[must_use]
    pub fn unique(mut self, fields: &[&str]) -> Self {
        self.unique
            .push(fields.iter().map(|f| (*f).to_string()).collect());
        self
    }
}

/// Declaration of a structure (value object) type.
#[derive(Debug, Clone)]
pub struct StructureDecl {
    name: String,
    base: Option<String>,
    fields: Vec<FieldDecl>,
}

impl StructureDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn extends(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    #[must_use]
    pub fn field(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }
}

/// Declaration of an interface.
#[derive(Debug, Clone)]
pub struct InterfaceDecl {
    name: String,
    bases: Vec<String>,
    fields: Vec<FieldDecl>,
}

impl InterfaceDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bases: Vec::new(),
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn extends(mut self, base: impl Into<String>) -> Self {
        self.bases.push(base.into());
        self
    }

    #[must_use]
    pub fn field(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }
}

/// Collects declarations and resolves them into a [`DomainModel`].
#[derive(Debug, Default)]
pub struct DomainModelBuilder {
    structures: Vec<StructureDecl>,
    interfaces: Vec<InterfaceDecl>,
    entities: Vec<EntityDecl>,
}

impl DomainModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn structure(mut self, decl: StructureDecl) -> Self {
        self.structures.push(decl);
        self
    }

    #[must_use]
    pub fn interface(mut self, decl: InterfaceDecl) -> Self {
        self.interfaces.push(decl);
        self
    }

    #[must_use]
    pub fn entity(mut self, decl: EntityDecl) -> Self {
        self.entities.push(decl);
        self
    }

    /// Resolve every declaration; any inconsistency is an [`Error::Model`].
    #[tracing::instrument(level = "debug", skip(self))]
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<Arc<DomainModel>> {
        let names = collect_names(&self)?;
        let structures = StructResolver::new(&self.structures, &names).resolve_all()?;

        let mut resolver = EntityResolver::new(&self.entities, &names, &structures)?;
        resolver.build_types()?;
        resolver.pair_associations()?;
        let interfaces = resolver.resolve_interfaces(&self.interfaces)?;
        resolver.finish_descendants();
        resolver.check_validators()?;

        let EntityResolver {
            entities,
            hierarchies,
            associations,
            ..
        } = resolver;

        let mut model = DomainModel {
            entities,
            structures,
            interfaces,
            hierarchies,
            associations,
            names,
            catalog: catalog::Catalog::default(),
        };
        let requested: Vec<Option<String>> =
            self.entities.iter().map(|d| d.table.clone()).collect();
        let unique: Vec<Vec<Vec<String>>> =
            self.entities.iter().map(|d| d.unique.clone()).collect();
        catalog::build(&mut model, &requested, &unique)?;

        tracing::debug!(
            entities = model.entities.len(),
            associations = model.associations.len(),
            tables = model.catalog.tables().len(),
            "domain model built"
        );
        Ok(Arc::new(model))
    }
}

fn collect_names(builder: &DomainModelBuilder) -> Result<HashMap<String, NamedType>> {
    let mut names = HashMap::new();
    let entries = builder
        .structures
        .iter()
        .enumerate()
        .map(|(i, d)| (&d.name, NamedType::Structure(StructIdx::from_usize(i))))
        .chain(
            builder
                .interfaces
                .iter()
                .enumerate()
                .map(|(i, d)| (&d.name, NamedType::Interface(InterfaceIdx::from_usize(i)))),
        )
        .chain(
            builder
                .entities
                .iter()
                .enumerate()
                .map(|(i, d)| (&d.name, NamedType::Entity(TypeIdx::from_usize(i)))),
        );
    for (name, named) in entries {
        if names.insert(name.clone(), named).is_some() {
            return Err(Error::model(format!(
                "type name '{name}' is declared more than once"
            )));
        }
    }
    Ok(names)
}

fn lookup_entity(names: &HashMap<String, NamedType>, name: &str) -> Result<TypeIdx> {
    match names.get(name) {
        Some(NamedType::Entity(idx)) => Ok(*idx),
        _ => Err(Error::model(format!("unknown entity type '{name}'"))),
    }
}

fn lookup_structure(names: &HashMap<String, NamedType>, name: &str) -> Result<StructIdx> {
    match names.get(name) {
        Some(NamedType::Structure(idx)) => Ok(*idx),
        _ => Err(Error::model(format!("unknown structure type '{name}'"))),
    }
}

fn lookup_interface(names: &HashMap<String, NamedType>, name: &str) -> Result<InterfaceIdx> {
    match names.get(name) {
        Some(NamedType::Interface(idx)) => Ok(*idx),
        _ => Err(Error::model(format!("unknown interface '{name}'"))),
    }
}

// ============================================================================
// Structures
// ============================================================================

struct StructResolver<'a> {
    decls: &'a [StructureDecl],
    names: &'a HashMap<String, NamedType>,
    done: Vec<Option<StructureDef>>,
    visiting: Vec<bool>,
}

impl<'a> StructResolver<'a> {
    fn new(decls: &'a [StructureDecl], names: &'a HashMap<String, NamedType>) -> Self {
        Self {
            decls,
            names,
            done: vec![None; decls.len()],
            visiting: vec![false; decls.len()],
        }
    }

    fn resolve_all(mut self) -> Result<Vec<StructureDef>> {
        for i in 0..self.decls.len() {
            self.resolve(i)?;
        }
        self.done
            .into_iter()
            .map(|d| d.ok_or_else(|| Error::model("unresolved structure")))
            .collect()
    }

    fn resolved(&self, idx: StructIdx) -> Result<&StructureDef> {
        self.done[idx.index()]
            .as_ref()
            .ok_or_else(|| Error::model("unresolved structure"))
    }

    fn resolve(&mut self, i: usize) -> Result<()> {
        if self.done[i].is_some() {
            return Ok(());
        }
        let decls = self.decls;
        let decl = &decls[i];
        if self.visiting[i] {
            return Err(Error::model(format!(
                "structure '{}' contains or derives from itself",
                decl.name
            )));
        }
        self.visiting[i] = true;

        let mut fields: Vec<StructFieldDef> = Vec::new();
        let mut leaves: Vec<StructLeaf> = Vec::new();
        let base = match &decl.base {
            Some(name) => {
                let idx = lookup_structure(self.names, name)?;
                self.resolve(idx.index())?;
                let base = self.resolved(idx)?;
                fields.clone_from(&base.fields);
                leaves.clone_from(&base.leaves);
                Some(idx)
            }
            None => None,
        };

        for f in &decl.fields {
            if fields.iter().any(|x| x.name == f.name) {
                return Err(Error::model(format!(
                    "structure '{}' declares field '{}' twice",
                    decl.name, f.name
                )));
            }
            let start = leaves.len();
            let kind = match &f.kind {
                DeclKind::Scalar(ty) => {
                    leaves.push(StructLeaf {
                        path: f.name.clone(),
                        ty: *ty,
                        nullable: f.nullable,
                    });
                    StructFieldKind::Scalar(*ty)
                }
                DeclKind::Structure(name) => {
                    let nested = lookup_structure(self.names, name)?;
                    self.resolve(nested.index())?;
                    for leaf in &self.resolved(nested)?.leaves {
                        leaves.push(StructLeaf {
                            path: format!("{}.{}", f.name, leaf.path),
                            ty: leaf.ty,
                            nullable: leaf.nullable,
                        });
                    }
                    StructFieldKind::Structure(nested)
                }
                DeclKind::Reference(_) | DeclKind::EntitySet(_) => {
                    return Err(Error::model(format!(
                        "structure field '{}.{}' must be a scalar or a structure",
                        decl.name, f.name
                    )));
                }
            };
            fields.push(StructFieldDef {
                name: f.name.clone(),
                kind,
                nullable: f.nullable,
                leaves: start..leaves.len(),
            });
        }

        self.visiting[i] = false;
        self.done[i] = Some(StructureDef {
            idx: StructIdx::from_usize(i),
            name: decl.name.clone(),
            base,
            fields,
            leaves,
        });
        Ok(())
    }
}

// ============================================================================
// Entities, hierarchies and associations
// ============================================================================

struct AssocDraft {
    paired_with: Option<String>,
    explicit_owner: Option<OnRemoveAction>,
    explicit_target: Option<OnRemoveAction>,
    is_set: bool,
}

struct EntityResolver<'a> {
    decls: &'a [EntityDecl],
    names: &'a HashMap<String, NamedType>,
    structures: &'a [StructureDef],
    base_of: Vec<Option<usize>>,
    root_of: Vec<usize>,
    /// Declaration indices, bases before derived types
    order: Vec<usize>,
    hierarchy_of: Vec<HierarchyIdx>,
    hierarchies: Vec<HierarchyDef>,
    entities: Vec<EntityTypeDef>,
    associations: Vec<AssociationDef>,
    drafts: Vec<AssocDraft>,
}

impl<'a> EntityResolver<'a> {
    fn new(
        decls: &'a [EntityDecl],
        names: &'a HashMap<String, NamedType>,
        structures: &'a [StructureDef],
    ) -> Result<Self> {
        let n = decls.len();
        let mut base_of = vec![None; n];
        for (i, decl) in decls.iter().enumerate() {
            if let Some(base) = &decl.base {
                base_of[i] = Some(lookup_entity(names, base)?.index());
            }
        }

        let mut depth = vec![0usize; n];
        let mut root_of = vec![0usize; n];
        for i in 0..n {
            let mut current = i;
            let mut d = 0;
            while let Some(b) = base_of[current] {
                d += 1;
                if d > n {
                    return Err(Error::model(format!(
                        "entity type '{}' derives from itself",
                        decls[i].name
                    )));
                }
                current = b;
            }
            depth[i] = d;
            root_of[i] = current;
        }
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|i| depth[*i]);

        let mut hierarchy_of = vec![HierarchyIdx(0); n];
        let mut hierarchies = Vec::new();
        for root in (0..n).filter(|i| base_of[*i].is_none()) {
            let idx = HierarchyIdx::from_usize(hierarchies.len());
            let mut members: Vec<usize> = (0..n).filter(|t| root_of[*t] == root).collect();
            members.sort_by_key(|t| (depth[*t], *t));
            for t in &members {
                hierarchy_of[*t] = idx;
            }
            hierarchies.push(HierarchyDef {
                idx,
                root: TypeIdx::from_usize(root),
                mapping: decls[root].mapping.unwrap_or_default(),
                types: members.into_iter().map(TypeIdx::from_usize).collect(),
                table: None,
            });
        }

        for (i, decl) in decls.iter().enumerate() {
            if base_of[i].is_some() {
                if !decl.keys.is_empty() {
                    return Err(Error::model(format!(
                        "'{}' derives from another type and cannot declare keys",
                        decl.name
                    )));
                }
                if decl.mapping.is_some() {
                    return Err(Error::model(format!(
                        "inheritance mapping may only be declared on a hierarchy root, not '{}'",
                        decl.name
                    )));
                }
                if decl.key_generator != KeyGenerator::None {
                    return Err(Error::model(format!(
                        "key generator may only be declared on a hierarchy root, not '{}'",
                        decl.name
                    )));
                }
            } else if decl.keys.is_empty() {
                return Err(Error::model(format!(
                    "hierarchy root '{}' declares no key",
                    decl.name
                )));
            }
            if let KeyGenerator::Sequence(_) = decl.key_generator {
                let integer_key = decl.keys.len() == 1
                    && matches!(decl.keys[0].1, ScalarType::Int | ScalarType::BigInt);
                if !integer_key {
                    return Err(Error::model(format!(
                        "sequence key generator on '{}' requires a single integer key",
                        decl.name
                    )));
                }
            }
        }

        Ok(Self {
            decls,
            names,
            structures,
            base_of,
            root_of,
            order,
            hierarchy_of,
            hierarchies,
            entities: Vec::new(),
            associations: Vec::new(),
            drafts: Vec::new(),
        })
    }

    fn is_subtype(&self, ty: usize, ancestor: usize) -> bool {
        let mut current = Some(ty);
        while let Some(t) = current {
            if t == ancestor {
                return true;
            }
            current = self.base_of[t];
        }
        false
    }

    fn root_keys(&self, ty: usize) -> &'a [(String, ScalarType)] {
        let decls = self.decls;
        &decls[self.root_of[ty]].keys
    }

    /// Field declaration on `ty` or one of its bases.
    fn find_field_decl(&self, ty: usize, name: &str) -> Option<&'a FieldDecl> {
        let decls = self.decls;
        let mut current = Some(ty);
        while let Some(t) = current {
            if let Some(f) = decls[t].fields.iter().find(|f| f.name == name) {
                return Some(f);
            }
            current = self.base_of[t];
        }
        None
    }

    /// Whether a reference field owns foreign-key columns.
    ///
    /// A reference paired with another reference is the inverse side; a
    /// reference paired with an entity set is always the stored side.
    fn reference_is_stored(&self, owner: &EntityDecl, field: &FieldDecl, target: usize) -> Result<bool> {
        let Some(partner_name) = &field.paired_with else {
            return Ok(true);
        };
        let Some(partner) = self.find_field_decl(target, partner_name) else {
            return Err(Error::model(format!(
                "'{}.{}' is paired with unknown field '{}.{partner_name}'",
                owner.name, field.name, self.decls[target].name
            )));
        };
        if partner.paired_with.is_some() {
            return Err(Error::model(format!(
                "only one side of the pair '{}.{}' / '{}.{}' may declare the pairing",
                owner.name, field.name, self.decls[target].name, partner.name
            )));
        }
        match partner.kind {
            DeclKind::EntitySet(_) => Ok(true),
            DeclKind::Reference(_) => Ok(false),
            _ => Err(Error::model(format!(
                "'{}.{}' must pair with a reference or entity set field",
                owner.name, field.name
            ))),
        }
    }

    fn build_types(&mut self) -> Result<()> {
        let n = self.decls.len();
        let mut built: Vec<Option<EntityTypeDef>> = vec![None; n];
        let order = self.order.clone();
        let decls = self.decls;

        for i in order {
            let decl = &decls[i];
            let idx = TypeIdx::from_usize(i);
            let (mut fields, mut columns, key_width, mut version_field) = match self.base_of[i] {
                Some(b) => {
                    let base = built[b]
                        .as_ref()
                        .ok_or_else(|| Error::model("base type resolved out of order"))?;
                    (
                        base.fields.clone(),
                        base.columns.clone(),
                        base.key_width,
                        base.version_field,
                    )
                }
                None => {
                    let mut fields = Vec::new();
                    let mut columns = Vec::new();
                    for (name, ty) in &decl.keys {
                        let field = FieldIdx::from_usize(fields.len());
                        let slot = columns.len();
                        columns.push(ColumnDef {
                            name: name.clone(),
                            ty: *ty,
                            nullable: false,
                            field,
                            lazy: false,
                        });
                        fields.push(FieldDef {
                            name: name.clone(),
                            kind: FieldKind::Scalar(*ty),
                            nullable: false,
                            lazy: false,
                            is_key: true,
                            is_version: false,
                            declared_in: idx,
                            columns: slot..slot + 1,
                            association: None,
                        });
                    }
                    let width = columns.len();
                    (fields, columns, width, None)
                }
            };

            for f in &decl.fields {
                if fields.iter().any(|x: &FieldDef| x.name == f.name) {
                    return Err(Error::model(format!(
                        "'{}' declares field '{}' that it already has",
                        decl.name, f.name
                    )));
                }
                let field_idx = FieldIdx::from_usize(fields.len());
                let start = columns.len();
                let mut association = None;
                let kind = match &f.kind {
                    DeclKind::Scalar(ty) => {
                        columns.push(ColumnDef {
                            name: f.name.clone(),
                            ty: *ty,
                            nullable: f.nullable,
                            field: field_idx,
                            lazy: f.lazy,
                        });
                        FieldKind::Scalar(*ty)
                    }
                    DeclKind::Structure(name) => {
                        if f.nullable {
                            return Err(Error::model(format!(
                                "structure field '{}.{}' cannot be nullable",
                                decl.name, f.name
                            )));
                        }
                        let s = lookup_structure(self.names, name)?;
                        for leaf in &self.structures[s.index()].leaves {
                            columns.push(ColumnDef {
                                name: format!("{}.{}", f.name, leaf.path),
                                ty: leaf.ty,
                                nullable: leaf.nullable,
                                field: field_idx,
                                lazy: f.lazy,
                            });
                        }
                        FieldKind::Structure(s)
                    }
                    DeclKind::Reference(target) => {
                        let target = lookup_entity(self.names, target)?;
                        if self.reference_is_stored(decl, f, target.index())? {
                            for (key, ty) in self.root_keys(target.index()) {
                                columns.push(ColumnDef {
                                    name: format!("{}.{key}", f.name),
                                    ty: *ty,
                                    nullable: f.nullable,
                                    field: field_idx,
                                    lazy: f.lazy,
                                });
                            }
                        }
                        association = Some(self.push_association(idx, field_idx, target, f, false));
                        FieldKind::Reference(target)
                    }
                    DeclKind::EntitySet(item) => {
                        let target = lookup_entity(self.names, item)?;
                        association = Some(self.push_association(idx, field_idx, target, f, true));
                        FieldKind::EntitySet(target)
                    }
                };

                if f.version {
                    let integer = matches!(kind, FieldKind::Scalar(ScalarType::Int | ScalarType::BigInt));
                    if !integer || f.nullable {
                        return Err(Error::model(format!(
                            "version field '{}.{}' must be a non-nullable integer",
                            decl.name, f.name
                        )));
                    }
                    if version_field.is_some() {
                        return Err(Error::model(format!(
                            "'{}' declares more than one version field",
                            decl.name
                        )));
                    }
                    version_field = Some(field_idx);
                }

                fields.push(FieldDef {
                    name: f.name.clone(),
                    kind,
                    nullable: f.nullable,
                    lazy: f.lazy,
                    is_key: false,
                    is_version: f.version,
                    declared_in: idx,
                    columns: start..columns.len(),
                    association,
                });
            }

            let field_by_name = fields
                .iter()
                .enumerate()
                .map(|(i, f)| (f.name.clone(), FieldIdx::from_usize(i)))
                .collect();
            built[i] = Some(EntityTypeDef {
                idx,
                name: decl.name.clone(),
                base: self.base_of[i].map(TypeIdx::from_usize),
                is_abstract: decl.is_abstract,
                interfaces: Vec::new(),
                fields,
                columns,
                key_width,
                version_field,
                hierarchy: self.hierarchy_of[i],
                table: None,
                validators: decl.validators.clone(),
                key_generator: decl.key_generator.clone(),
                descendants: Vec::new(),
                field_by_name,
            });
        }

        self.entities = built
            .into_iter()
            .map(|e| e.ok_or_else(|| Error::model("unresolved entity type")))
            .collect::<Result<_>>()?;
        Ok(())
    }

    fn push_association(
        &mut self,
        owner: TypeIdx,
        field: FieldIdx,
        target: TypeIdx,
        decl: &FieldDecl,
        is_set: bool,
    ) -> AssocIdx {
        let idx = AssocIdx::from_usize(self.associations.len());
        self.associations.push(AssociationDef {
            idx,
            name: format!("{}.{}", self.decls[owner.index()].name, decl.name),
            owner_type: owner,
            owner_field: field,
            target_type: target,
            multiplicity: if is_set {
                Multiplicity::ManyToMany
            } else {
                Multiplicity::ManyToOne
            },
            paired: None,
            is_master: true,
            on_owner_remove: OnRemoveAction::Clear,
            on_target_remove: OnRemoveAction::Clear,
            junction: None,
        });
        self.drafts.push(AssocDraft {
            paired_with: decl.paired_with.clone(),
            explicit_owner: decl.on_owner_remove,
            explicit_target: decl.on_target_remove,
            is_set,
        });
        idx
    }

    fn junction_for(&self, assoc: usize) -> JunctionDef {
        let def = &self.associations[assoc];
        let owner = &self.entities[def.owner_type.index()];
        let field = &owner.fields[def.owner_field.index()];
        let owner_columns = self
            .root_keys(def.owner_type.index())
            .iter()
            .map(|(k, _)| format!("Owner.{k}"))
            .collect();
        let target_columns = self
            .root_keys(def.target_type.index())
            .iter()
            .map(|(k, _)| format!("Target.{k}"))
            .collect();
        JunctionDef {
            table: format!("{}_{}", owner.name, field.name),
            owner_columns,
            target_columns,
        }
    }

    fn pair_associations(&mut self) -> Result<()> {
        for a in 0..self.associations.len() {
            let Some(partner_name) = self.drafts[a].paired_with.clone() else {
                continue;
            };
            let owner = self.associations[a].owner_type;
            let target = self.associations[a].target_type;
            let target_def = &self.entities[target.index()];
            let Some((_, partner)) = target_def.field(&partner_name) else {
                return Err(Error::model(format!(
                    "'{}' is paired with unknown field '{}.{partner_name}'",
                    self.associations[a].name, target_def.name
                )));
            };
            let Some(b) = partner.association.map(AssocIdx::index) else {
                return Err(Error::model(format!(
                    "'{}.{partner_name}' is not an association field",
                    target_def.name
                )));
            };
            if a == b {
                return Err(Error::model(format!(
                    "'{}' cannot be paired with itself",
                    self.associations[a].name
                )));
            }
            if self.associations[b].paired.is_some() {
                return Err(Error::model(format!(
                    "'{}' is already paired",
                    self.associations[b].name
                )));
            }
            if !self.is_subtype(owner.index(), self.associations[b].target_type.index()) {
                return Err(Error::model(format!(
                    "'{}' and '{}' do not point at each other",
                    self.associations[a].name, self.associations[b].name
                )));
            }

            let (master, slave) = if !self.drafts[a].is_set && self.drafts[b].is_set {
                (a, b)
            } else {
                (b, a)
            };
            let (master_mult, slave_mult) = match (self.drafts[master].is_set, self.drafts[slave].is_set) {
                (false, false) => (Multiplicity::OneToOne, Multiplicity::OneToOne),
                (false, true) => (Multiplicity::ManyToOne, Multiplicity::OneToMany),
                (true, false) => (Multiplicity::OneToMany, Multiplicity::ManyToOne),
                (true, true) => (Multiplicity::ManyToMany, Multiplicity::ManyToMany),
            };
            let default_target = if self.drafts[master].is_set {
                OnRemoveAction::Clear
            } else {
                OnRemoveAction::Deny
            };
            let on_owner = self.drafts[master]
                .explicit_owner
                .or(self.drafts[slave].explicit_target)
                .unwrap_or(OnRemoveAction::Clear);
            let on_target = self.drafts[master]
                .explicit_target
                .or(self.drafts[slave].explicit_owner)
                .unwrap_or(default_target);

            let junction = self.drafts[master].is_set.then(|| self.junction_for(master));
            let m = &mut self.associations[master];
            m.paired = Some(AssocIdx::from_usize(slave));
            m.is_master = true;
            m.multiplicity = master_mult;
            m.on_owner_remove = on_owner;
            m.on_target_remove = on_target;
            m.junction = junction;

            let s = &mut self.associations[slave];
            s.paired = Some(AssocIdx::from_usize(master));
            s.is_master = false;
            s.multiplicity = slave_mult;
            s.on_owner_remove = on_target;
            s.on_target_remove = on_owner;
        }

        for a in 0..self.associations.len() {
            if self.associations[a].paired.is_some() {
                continue;
            }
            let is_set = self.drafts[a].is_set;
            let default_target = if is_set {
                OnRemoveAction::Clear
            } else {
                OnRemoveAction::Deny
            };
            let junction = is_set.then(|| self.junction_for(a));
            let def = &mut self.associations[a];
            def.on_owner_remove = self.drafts[a].explicit_owner.unwrap_or(OnRemoveAction::Clear);
            def.on_target_remove = self.drafts[a].explicit_target.unwrap_or(default_target);
            def.junction = junction;
        }
        Ok(())
    }

    fn interface_field_columns(
        &self,
        iface: &str,
        f: &FieldDecl,
        columns: &mut Vec<(String, ScalarType, bool)>,
    ) -> Result<FieldKind> {
        let kind = match &f.kind {
            DeclKind::Scalar(ty) => {
                columns.push((f.name.clone(), *ty, f.nullable));
                FieldKind::Scalar(*ty)
            }
            DeclKind::Structure(name) => {
                let s = lookup_structure(self.names, name)?;
                for leaf in &self.structures[s.index()].leaves {
                    columns.push((format!("{}.{}", f.name, leaf.path), leaf.ty, leaf.nullable));
                }
                FieldKind::Structure(s)
            }
            DeclKind::Reference(target) => {
                let target = lookup_entity(self.names, target)?;
                for (key, ty) in self.root_keys(target.index()) {
                    columns.push((format!("{}.{key}", f.name), *ty, f.nullable));
                }
                FieldKind::Reference(target)
            }
            DeclKind::EntitySet(_) => {
                return Err(Error::model(format!(
                    "interface field '{iface}.{}' cannot be an entity set",
                    f.name
                )));
            }
        };
        Ok(kind)
    }

    fn resolve_interfaces(&mut self, decls: &[InterfaceDecl]) -> Result<Vec<InterfaceDef>> {
        let n = decls.len();
        let mut bases = Vec::with_capacity(n);
        for decl in decls {
            let resolved = decl
                .bases
                .iter()
                .map(|b| lookup_interface(self.names, b))
                .collect::<Result<Vec<_>>>()?;
            bases.push(resolved);
        }

        let mut done: Vec<Option<InterfaceDef>> = vec![None; n];
        let mut ancestors: Vec<Vec<InterfaceIdx>> = vec![Vec::new(); n];
        let mut remaining = n;
        while remaining > 0 {
            let mut progressed = false;
            for i in 0..n {
                if done[i].is_some() || bases[i].iter().any(|b| done[b.index()].is_none()) {
                    continue;
                }
                let decl = &decls[i];
                let mut fields: Vec<InterfaceFieldDef> = Vec::new();
                let mut columns = Vec::new();
                let mut own_ancestors = vec![InterfaceIdx::from_usize(i)];
                for b in &bases[i] {
                    own_ancestors.extend(ancestors[b.index()].iter().copied());
                    let Some(base) = done[b.index()].as_ref() else {
                        continue;
                    };
                    for bf in &base.fields {
                        if fields.iter().any(|f| f.name == bf.name) {
                            continue;
                        }
                        let start = columns.len();
                        columns.extend(base.columns[bf.columns.clone()].iter().cloned());
                        fields.push(InterfaceFieldDef {
                            columns: start..columns.len(),
                            ..bf.clone()
                        });
                    }
                }
                for f in &decl.fields {
                    if fields.iter().any(|x| x.name == f.name) {
                        return Err(Error::model(format!(
                            "interface '{}' declares field '{}' twice",
                            decl.name, f.name
                        )));
                    }
                    let start = columns.len();
                    let kind = self.interface_field_columns(&decl.name, f, &mut columns)?;
                    fields.push(InterfaceFieldDef {
                        name: f.name.clone(),
                        kind,
                        nullable: f.nullable,
                        columns: start..columns.len(),
                    });
                }
                own_ancestors.sort();
                own_ancestors.dedup();
                ancestors[i] = own_ancestors;
                done[i] = Some(InterfaceDef {
                    idx: InterfaceIdx::from_usize(i),
                    name: decl.name.clone(),
                    bases: bases[i].clone(),
                    fields,
                    key_columns: Vec::new(),
                    columns,
                    implementors: Vec::new(),
                    column_slots: HashMap::new(),
                });
                remaining -= 1;
                progressed = true;
            }
            if !progressed {
                return Err(Error::model("interface inheritance contains a cycle"));
            }
        }
        let mut interfaces: Vec<InterfaceDef> = done
            .into_iter()
            .map(|d| d.ok_or_else(|| Error::model("unresolved interface")))
            .collect::<Result<_>>()?;

        // Transitive interface sets, bases first so inherited sets are ready.
        let decls_e = self.decls;
        for i in self.order.clone() {
            let mut set: Vec<InterfaceIdx> = match self.base_of[i] {
                Some(b) => self.entities[b].interfaces.clone(),
                None => Vec::new(),
            };
            for name in &decls_e[i].interfaces {
                let iface = lookup_interface(self.names, name)?;
                set.extend(ancestors[iface.index()].iter().copied());
            }
            set.sort();
            set.dedup();
            self.entities[i].interfaces = set;
        }

        for iface in &mut interfaces {
            for entity in &self.entities {
                if !entity.interfaces.contains(&iface.idx) {
                    continue;
                }
                let key: Vec<(String, ScalarType)> = entity.columns[entity.key_columns()]
                    .iter()
                    .map(|c| (c.name.clone(), c.ty))
                    .collect();
                if iface.key_columns.is_empty() {
                    iface.key_columns = key;
                } else if iface.key_columns.iter().map(|k| k.1).ne(key.iter().map(|k| k.1)) {
                    return Err(Error::model(format!(
                        "implementors of '{}' have incompatible keys",
                        iface.name
                    )));
                }

                let mut slots = Vec::with_capacity(iface.columns.len());
                for f in &iface.fields {
                    let compatible = entity.field(&f.name).and_then(|(_, ef)| {
                        let same_kind = match (f.kind, ef.kind) {
                            (FieldKind::Scalar(a), FieldKind::Scalar(b)) => a == b,
                            (FieldKind::Structure(a), FieldKind::Structure(b)) => a == b,
                            (FieldKind::Reference(a), FieldKind::Reference(b)) => {
                                self.is_subtype(b.index(), a.index())
                            }
                            _ => false,
                        };
                        (same_kind && ef.columns.len() == f.columns.len()).then(|| ef.columns.clone())
                    });
                    match compatible {
                        Some(range) => slots.extend(range),
                        None => {
                            return Err(Error::model(format!(
                                "'{}' does not provide interface field '{}.{}'",
                                entity.name, iface.name, f.name
                            )));
                        }
                    }
                }
                iface.column_slots.insert(entity.idx, slots);
                if !entity.is_abstract {
                    iface.implementors.push(entity.idx);
                }
            }
        }
        Ok(interfaces)
    }

    fn finish_descendants(&mut self) {
        let n = self.entities.len();
        for t in 0..n {
            let descendants = (0..n)
                .filter(|u| self.is_subtype(*u, t))
                .map(TypeIdx::from_usize)
                .collect();
            self.entities[t].descendants = descendants;
        }
    }

    fn check_validators(&self) -> Result<()> {
        for entity in &self.entities {
            for validator in &entity.validators {
                if let Some(field) = validator.field() {
                    let scalar = entity
                        .field(field)
                        .is_some_and(|(_, f)| matches!(f.kind, FieldKind::Scalar(_)));
                    if !scalar {
                        return Err(Error::model(format!(
                            "validator on '{}' names unknown scalar field '{field}'",
                            entity.name
                        )));
                    }
                }
                if let Validator::Pattern { pattern, .. } = validator {
                    if let Some(message) = validate_pattern(pattern) {
                        return Err(Error::model(format!("'{}': {message}", entity.name)));
                    }
                }
            }
        }
        Ok(())
    }
}
