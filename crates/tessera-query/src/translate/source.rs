//! Entity sources, navigation joins and projection layouts.

use std::collections::HashMap;
use std::rc::Rc;

use tessera_core::{
    BinaryOp, DomainModel, Error, FieldDef, FieldKind, InheritanceMapping, JoinKind, JoinPlan,
    ProjectedColumn, ProjectionItem, QueryPlan, Result, ScalarExpr, ScalarType, SelectPlan, SetOpKind,
    Source, TYPE_ID_COLUMN, TypeIdx, TypeRef, Value,
};

use crate::compiled::SlotKind;

use super::shape::{Body, EntityShape, Layout, PendingNav, Resolved, ScalarShape, SetShape, Shape, StructShape};
use super::{Frame, Translator};

impl Resolved {
    /// Expression of the named column.
    fn column(&self, model: &DomainModel, name: &str) -> Option<ScalarExpr> {
        if let Some(expr) = self.columns.get(name) {
            return Some(expr.clone());
        }
        let (alias, table) = self.direct.as_ref()?;
        model
            .catalog()
            .table(table)?
            .column(name)
            .map(|_| ScalarExpr::column(alias, name))
    }
}

/// `expr IN (type ids of types)`.
fn type_in(model: &DomainModel, expr: ScalarExpr, types: &[TypeIdx]) -> ScalarExpr {
    ScalarExpr::InList {
        expr: Box::new(expr),
        list: types
            .iter()
            .map(|t| ScalarExpr::Literal(model.type_id_value(*t)))
            .collect(),
        negated: false,
    }
}

#[allow(clippy::result_large_err)]
impl Translator<'_> {
    pub(super) fn key_names(&self, ty: TypeRef) -> Vec<String> {
        match ty {
            TypeRef::Entity(t) => {
                let def = self.model.entity(t);
                def.columns[def.key_columns()]
                    .iter()
                    .map(|c| c.name.clone())
                    .collect()
            }
            TypeRef::Interface(i) => self
                .model
                .interface(i)
                .key_columns
                .iter()
                .map(|(n, _)| n.clone())
                .collect(),
        }
    }

    /// Entity shape over a source exposing every projected column by name.
    pub(super) fn entity_over(&self, ty: TypeRef, home: u32, alias: &str, names: &[String]) -> EntityShape {
        let key_width = self.key_names(ty).len();
        let columns: HashMap<String, ScalarExpr> = names
            .iter()
            .map(|n| (n.clone(), ScalarExpr::column(alias, n)))
            .collect();
        EntityShape {
            ty,
            home: Some(home),
            key: names
                .iter()
                .take(key_width)
                .map(|n| ScalarExpr::column(alias, n))
                .collect(),
            body: Body::Resolved(Rc::new(Resolved {
                type_id: ScalarExpr::column(alias, TYPE_ID_COLUMN),
                columns,
                direct: None,
            })),
            optional: false,
        }
    }

    /// Names `runtime` stores each projected column of `ty` under.
    fn branch_names(&self, ty: TypeRef, runtime: TypeIdx, projected: &[ProjectedColumn]) -> Result<Vec<String>> {
        match ty {
            TypeRef::Entity(_) => Ok(projected.iter().map(|c| c.name.clone()).collect()),
            TypeRef::Interface(_) => {
                let slots = self.model.slot_map(ty, runtime).ok_or_else(|| {
                    Error::model(format!(
                        "{} does not implement {}",
                        self.model.entity(runtime).name,
                        self.model.type_ref_name(ty)
                    ))
                })?;
                let def = self.model.entity(runtime);
                Ok(slots.iter().map(|s| def.columns[*s].name.clone()).collect())
            }
        }
    }

    fn covers_table(&self, types: &[TypeIdx]) -> bool {
        let Some(first) = types.first() else {
            return false;
        };
        let hierarchy = self.model.hierarchy(self.model.entity(*first).hierarchy);
        hierarchy
            .types
            .iter()
            .filter(|t| !self.model.entity(**t).is_abstract)
            .all(|t| types.contains(t))
    }

    fn table_of(&self, ty: TypeIdx) -> Result<String> {
        let def = self.model.entity(ty);
        def.table
            .clone()
            .ok_or_else(|| Error::model(format!("{} is not mapped to a table", def.name)))
    }

    /// Row source of every instance of `ty`, plus a filter the source needs.
    pub(super) fn entity_source(&mut self, ty: TypeRef, home: u32) -> Result<(Source, EntityShape, Option<ScalarExpr>)> {
        let model = self.model;
        let projected = model.projected_columns(ty);
        let mut groups: Vec<(String, Vec<TypeIdx>)> = Vec::new();
        for concrete in model.concrete_types(ty) {
            let table = self.table_of(concrete)?;
            match groups.iter_mut().find(|(t, _)| *t == table) {
                Some((_, types)) => types.push(concrete),
                None => groups.push((table, vec![concrete])),
            }
        }
        let alias = self.alias();

        if groups.is_empty() {
            let slot = self.push_slot(SlotKind::Constant(Value::Array(Vec::new())));
            let mut names: Vec<String> = projected.iter().map(|c| c.name.clone()).collect();
            let shape = self.entity_over(ty, home, &alias, &names);
            names.push(TYPE_ID_COLUMN.to_string());
            return Ok((
                Source::Values {
                    columns: names,
                    slot,
                    alias,
                },
                shape,
                None,
            ));
        }

        if let [(table, types)] = groups.as_slice() {
            let first = types[0];
            let single = model.hierarchy(model.entity(first).hierarchy).mapping
                == InheritanceMapping::SingleTable;
            let names = self.branch_names(ty, first, &projected)?;
            let columns: HashMap<String, ScalarExpr> = projected
                .iter()
                .zip(&names)
                .map(|(p, n)| (p.name.clone(), ScalarExpr::column(&alias, n)))
                .collect();
            let type_id = if single {
                ScalarExpr::column(&alias, TYPE_ID_COLUMN)
            } else {
                ScalarExpr::Literal(model.type_id_value(first))
            };
            let filter = (single && !self.covers_table(types))
                .then(|| type_in(model, type_id.clone(), types));
            let key = names
                .iter()
                .take(self.key_names(ty).len())
                .map(|n| ScalarExpr::column(&alias, n))
                .collect();
            let direct = (single && matches!(ty, TypeRef::Entity(_)))
                .then(|| (alias.clone(), table.clone()));
            let shape = EntityShape {
                ty,
                home: Some(home),
                key,
                body: Body::Resolved(Rc::new(Resolved {
                    type_id,
                    columns,
                    direct,
                })),
                optional: false,
            };
            return Ok((
                Source::Table {
                    name: table.clone(),
                    alias,
                },
                shape,
                filter,
            ));
        }

        let mut plan: Option<QueryPlan> = None;
        for (table, types) in &groups {
            let branch_alias = self.alias();
            let first = types[0];
            let single = model.hierarchy(model.entity(first).hierarchy).mapping
                == InheritanceMapping::SingleTable;
            let names = self.branch_names(ty, first, &projected)?;
            let mut select = SelectPlan::from_source(Source::Table {
                name: table.clone(),
                alias: branch_alias.clone(),
            });
            let type_id = if single {
                ScalarExpr::column(&branch_alias, TYPE_ID_COLUMN)
            } else {
                ScalarExpr::Literal(model.type_id_value(first))
            };
            if single && !self.covers_table(types) {
                select.and_filter(type_in(model, type_id.clone(), types));
            }
            select.projection = projected
                .iter()
                .zip(&names)
                .map(|(p, n)| ProjectionItem {
                    expr: ScalarExpr::column(&branch_alias, n),
                    alias: p.name.clone(),
                })
                .chain(std::iter::once(ProjectionItem {
                    expr: type_id,
                    alias: TYPE_ID_COLUMN.to_string(),
                }))
                .collect();
            let branch = QueryPlan::Select(Box::new(select));
            plan = Some(match plan {
                None => branch,
                Some(left) => QueryPlan::SetOp {
                    op: SetOpKind::UnionAll,
                    left: Box::new(left),
                    right: Box::new(branch),
                },
            });
        }
        let plan = plan.ok_or_else(|| Error::translation("entity source without tables"))?;
        let names: Vec<String> = projected.iter().map(|c| c.name.clone()).collect();
        let shape = self.entity_over(ty, home, &alias, &names);
        Ok((
            Source::Subquery {
                plan: Box::new(plan),
                alias,
            },
            shape,
            None,
        ))
    }

    /// Columns of `shape`, emitting its navigation join when needed.
    pub(super) fn resolve(&mut self, shape: &EntityShape) -> Result<Rc<Resolved>> {
        match &shape.body {
            Body::Resolved(resolved) => Ok(Rc::clone(resolved)),
            Body::KeyOnly => Err(Error::translation(format!(
                "only the key of a {} constant is available in queries",
                self.model.type_ref_name(shape.ty)
            ))),
            Body::Pending(nav) => {
                let target = self.resolve_nav(nav)?;
                match target.body {
                    Body::Resolved(resolved) => Ok(resolved),
                    _ => Err(Error::translation("navigation did not resolve")),
                }
            }
        }
    }

    fn resolve_nav(&mut self, nav: &PendingNav) -> Result<EntityShape> {
        if let Some(existing) = self.frame_mut(nav.frame)?.navs.get(&nav.path) {
            return Ok(existing.clone());
        }
        // Foreign keys guarantee the target's type, so the source filter is not needed.
        let (source, target, _) = self.entity_source(TypeRef::Entity(nav.target), nav.frame)?;
        let on = ScalarExpr::conjunction(
            target
                .key
                .iter()
                .zip(&nav.fk)
                .map(|(k, f)| ScalarExpr::binary(BinaryOp::Eq, k.clone(), f.clone())),
        );
        let kind = if nav.optional {
            JoinKind::Left
        } else {
            JoinKind::Inner
        };
        let target = EntityShape {
            optional: nav.optional,
            ..target
        };
        tracing::debug!(path = %nav.path, ?kind, "navigation join");
        let frame = self.frame_mut(nav.frame)?;
        frame.select.joins.push(JoinPlan { kind, source, on });
        frame.navs.insert(nav.path.clone(), target.clone());
        Ok(target)
    }

    /// The named column of an entity; key columns need no join.
    fn entity_column(&mut self, shape: &EntityShape, name: &str) -> Result<ScalarExpr> {
        if let Some(pos) = self.key_names(shape.ty).iter().position(|k| k == name) {
            if let Some(expr) = shape.key.get(pos) {
                return Ok(expr.clone());
            }
        }
        let resolved = self.resolve(shape)?;
        resolved.column(self.model, name).ok_or_else(|| {
            Error::translation(format!(
                "column '{name}' of {} is not available here",
                self.model.type_ref_name(shape.ty)
            ))
        })
    }

    fn navigation(&self, from: &EntityShape, field: &str, target: TypeIdx, fk: Vec<ScalarExpr>, nullable: bool) -> Result<Shape> {
        let home = from
            .home
            .ok_or_else(|| Error::translation("cannot navigate from an entity constant"))?;
        let optional = nullable || from.optional;
        let nav = PendingNav {
            frame: home,
            path: format!("{:?}->{field}", from.key),
            target,
            fk: fk.clone(),
            optional,
        };
        Ok(Shape::Entity(EntityShape {
            ty: TypeRef::Entity(target),
            home: Some(home),
            key: fk,
            body: Body::Pending(Rc::new(nav)),
            optional,
        }))
    }

    /// Reference whose foreign key lives on the other side (slave one-to-one).
    fn inverse_reference(&mut self, from: &EntityShape, field: &FieldDef) -> Result<Shape> {
        let model = self.model;
        let assoc = field
            .association
            .ok_or_else(|| Error::model(format!("reference '{}' has no association", field.name)))?;
        let master = model.master_of(assoc);
        let home = from
            .home
            .ok_or_else(|| Error::translation("cannot navigate from an entity constant"))?;
        let path = format!("{:?}<-{}", from.key, field.name);
        if let Some(existing) = self.frame_mut(home)?.navs.get(&path) {
            return Ok(Shape::Entity(existing.clone()));
        }
        let owner = model.entity(master.owner_type);
        let fk_field = owner.field_at(master.owner_field);
        let fk_names: Vec<String> = owner.columns[fk_field.columns.clone()]
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let (source, target, _) = self.entity_source(TypeRef::Entity(master.owner_type), home)?;
        let mut on = Vec::with_capacity(fk_names.len());
        for (name, key) in fk_names.iter().zip(&from.key) {
            let column = self.entity_column(&target, name)?;
            on.push(ScalarExpr::binary(BinaryOp::Eq, column, key.clone()));
        }
        let target = EntityShape {
            optional: true,
            ..target
        };
        let frame = self.frame_mut(home)?;
        frame.select.joins.push(JoinPlan {
            kind: JoinKind::Left,
            source,
            on: ScalarExpr::conjunction(on),
        });
        frame.navs.insert(path, target.clone());
        Ok(Shape::Entity(target))
    }

    fn column_shape(&mut self, shape: &EntityShape, name: &str, ty: ScalarType, nullable: bool) -> Result<ScalarShape> {
        let expr = self.entity_column(shape, name)?;
        Ok(ScalarShape::new(expr, Some(ty), nullable || shape.optional))
    }

    /// Member `name` of an entity.
    pub(super) fn entity_member(&mut self, shape: &EntityShape, name: &str) -> Result<Shape> {
        let model = self.model;
        match shape.ty {
            TypeRef::Entity(t) => {
                let def = model.entity(t);
                let (_, field) = def.field(name).ok_or_else(|| {
                    Error::translation(format!("{} has no field '{name}'", def.name))
                })?;
                match field.kind {
                    FieldKind::Scalar(ty) => {
                        let column = &def.columns[field.columns.start];
                        Ok(Shape::Scalar(self.column_shape(shape, &column.name, ty, field.nullable)?))
                    }
                    FieldKind::Structure(s) => {
                        let mut leaves = Vec::with_capacity(field.columns.len());
                        for column in &def.columns[field.columns.clone()] {
                            leaves.push(self.column_shape(shape, &column.name, column.ty, column.nullable)?);
                        }
                        Ok(Shape::Structure(StructShape { ty: s, leaves }))
                    }
                    FieldKind::Reference(target) if field.is_stored() => {
                        let mut fk = Vec::with_capacity(field.columns.len());
                        for column in &def.columns[field.columns.clone()] {
                            fk.push(self.entity_column(shape, &column.name)?);
                        }
                        self.navigation(shape, name, target, fk, field.nullable)
                    }
                    FieldKind::Reference(_) => self.inverse_reference(shape, field),
                    FieldKind::EntitySet(_) => {
                        let assoc = field.association.ok_or_else(|| {
                            Error::model(format!("entity set '{name}' has no association"))
                        })?;
                        Ok(Shape::Set(SetShape {
                            owner: shape.clone(),
                            assoc,
                        }))
                    }
                }
            }
            TypeRef::Interface(i) => {
                let def = model.interface(i);
                let field = def.field(name).ok_or_else(|| {
                    Error::translation(format!("{} has no field '{name}'", def.name))
                })?;
                let columns = &def.columns[field.columns.clone()];
                match field.kind {
                    FieldKind::Scalar(ty) => {
                        let (column, _, _) = columns.first().ok_or_else(|| {
                            Error::model(format!("{}.{name} has no column", def.name))
                        })?;
                        Ok(Shape::Scalar(self.column_shape(shape, column, ty, field.nullable)?))
                    }
                    FieldKind::Structure(s) => {
                        let mut leaves = Vec::with_capacity(columns.len());
                        for (column, ty, nullable) in columns {
                            leaves.push(self.column_shape(shape, column, *ty, *nullable)?);
                        }
                        Ok(Shape::Structure(StructShape { ty: s, leaves }))
                    }
                    FieldKind::Reference(target) => {
                        let mut fk = Vec::with_capacity(columns.len());
                        for (column, _, _) in columns {
                            fk.push(self.entity_column(shape, column)?);
                        }
                        self.navigation(shape, name, target, fk, field.nullable)
                    }
                    FieldKind::EntitySet(_) => Err(Error::translation(format!(
                        "entity sets of interface {} cannot be queried; use an implementor",
                        def.name
                    ))),
                }
            }
        }
    }

    /// Source of the members of an entity set.
    pub(super) fn set_source(&mut self, set: &SetShape) -> Result<Frame> {
        let model = self.model;
        let assoc = model.association(set.assoc);
        let item = assoc.target_type;
        let id = self.frame_id();
        let (source, entity, filter) = self.entity_source(TypeRef::Entity(item), id)?;
        let mut frame = Frame::new(id, source, Shape::Entity(entity.clone()));
        if let Some(filter) = filter {
            frame.select.and_filter(filter);
        }
        let master = model.master_of(set.assoc);
        let master_field = model.entity(master.owner_type).field_at(master.owner_field);
        let owner_key = set.owner.key.clone();

        if !assoc.is_master && matches!(master_field.kind, FieldKind::Reference(_)) {
            // Members point at the owner through their foreign key.
            let owner_def = model.entity(master.owner_type);
            let names: Vec<String> = owner_def.columns[master_field.columns.clone()]
                .iter()
                .map(|c| c.name.clone())
                .collect();
            let (mut frame, fk) = self.within(frame, |t| {
                names
                    .iter()
                    .map(|n| t.entity_column(&entity, n))
                    .collect::<Result<Vec<_>>>()
            })?;
            frame.select.and_filter(ScalarExpr::conjunction(
                fk.into_iter()
                    .zip(owner_key)
                    .map(|(f, k)| ScalarExpr::binary(BinaryOp::Eq, f, k)),
            ));
            return Ok(frame);
        }

        let junction = master.junction.as_ref().ok_or_else(|| {
            Error::model(format!("association '{}' has no junction table", master.name))
        })?;
        let (owner_columns, item_columns) = if assoc.is_master {
            (&junction.owner_columns, &junction.target_columns)
        } else {
            (&junction.target_columns, &junction.owner_columns)
        };
        let j = self.alias();
        frame.select.joins.push(JoinPlan {
            kind: JoinKind::Inner,
            source: Source::Table {
                name: junction.table.clone(),
                alias: j.clone(),
            },
            on: ScalarExpr::conjunction(item_columns.iter().zip(&entity.key).map(|(c, k)| {
                ScalarExpr::binary(BinaryOp::Eq, ScalarExpr::column(&j, c), k.clone())
            })),
        });
        frame.select.and_filter(ScalarExpr::conjunction(
            owner_columns.iter().zip(owner_key).map(|(c, k)| {
                ScalarExpr::binary(BinaryOp::Eq, ScalarExpr::column(&j, c), k)
            }),
        ));
        Ok(frame)
    }

    /// Type test of `entity` against `target`; `None` when statically true.
    pub(super) fn type_test(&mut self, entity: &EntityShape, target: TypeRef) -> Result<Option<ScalarExpr>> {
        if let (TypeRef::Entity(s), TypeRef::Entity(t)) = (entity.ty, target) {
            if self.model.is_subtype(s, t) {
                return Ok(None);
            }
        }
        let resolved = self.resolve(entity)?;
        let concrete = self.model.concrete_types(target);
        Ok(Some(type_in(self.model, resolved.type_id.clone(), &concrete)))
    }

    /// Narrow `entity` to `target`: the type filter and the narrowed shape.
    pub(super) fn narrow(&mut self, entity: &EntityShape, target: TypeRef) -> Result<(Option<ScalarExpr>, EntityShape)> {
        let model = self.model;
        let Some(test) = self.type_test(entity, target)? else {
            return Ok((None, entity.clone()));
        };
        let resolved = self.resolve(entity)?;
        if let (Some((alias, table)), TypeRef::Entity(t)) = (&resolved.direct, target) {
            if model.entity(t).table.as_deref() == Some(table.as_str()) {
                let columns = model
                    .projected_columns(target)
                    .into_iter()
                    .map(|c| (c.name.clone(), ScalarExpr::column(alias, &c.name)))
                    .collect();
                let narrowed = EntityShape {
                    ty: target,
                    body: Body::Resolved(Rc::new(Resolved {
                        type_id: resolved.type_id.clone(),
                        columns,
                        direct: resolved.direct.clone(),
                    })),
                    ..entity.clone()
                };
                return Ok((Some(test), narrowed));
            }
        }

        let home = entity
            .home
            .ok_or_else(|| Error::translation("cannot narrow an entity constant"))?;
        let (source, joined, _) = self.entity_source(target, home)?;
        let Body::Resolved(joined_columns) = &joined.body else {
            return Err(Error::translation("entity source did not resolve"));
        };
        let on = ScalarExpr::conjunction(
            joined
                .key
                .iter()
                .zip(&entity.key)
                .map(|(a, b)| ScalarExpr::binary(BinaryOp::Eq, a.clone(), b.clone()))
                .chain(std::iter::once(ScalarExpr::binary(
                    BinaryOp::Eq,
                    joined_columns.type_id.clone(),
                    resolved.type_id.clone(),
                ))),
        );
        self.frame_mut(home)?.select.joins.push(JoinPlan {
            kind: JoinKind::Left,
            source,
            on,
        });
        let narrowed = EntityShape {
            ty: target,
            home: Some(home),
            key: entity.key.clone(),
            body: Body::Resolved(Rc::new(Resolved {
                type_id: resolved.type_id.clone(),
                columns: joined_columns.columns.clone(),
                direct: joined_columns.direct.clone(),
            })),
            optional: entity.optional,
        };
        Ok((Some(test), narrowed))
    }

    /// Append the columns of `shape` to `out` and describe where they went.
    ///
    /// With `materialize`, lazy entity columns are left out.
    pub(super) fn flatten(&mut self, shape: &Shape, materialize: bool, out: &mut Vec<ScalarExpr>) -> Result<Layout> {
        match shape {
            Shape::Scalar(s) => {
                out.push(s.expr.clone());
                Ok(Layout::Scalar {
                    column: out.len() - 1,
                    ty: s.ty,
                    nullable: s.nullable,
                })
            }
            Shape::Entity(e) => {
                let resolved = self.resolve(e)?;
                let projected = self.model.projected_columns(e.ty);
                let key_width = e.key.len();
                let mut columns = Vec::with_capacity(projected.len());
                for (i, column) in projected.iter().enumerate() {
                    if materialize && column.lazy {
                        columns.push((column.name.clone(), None));
                        continue;
                    }
                    let expr = match e.key.get(i) {
                        Some(key) => key.clone(),
                        None => resolved.column(self.model, &column.name).ok_or_else(|| {
                            Error::translation(format!(
                                "column '{}' of {} is not available here",
                                column.name,
                                self.model.type_ref_name(e.ty)
                            ))
                        })?,
                    };
                    out.push(expr);
                    columns.push((column.name.clone(), Some(out.len() - 1)));
                }
                out.push(resolved.type_id.clone());
                Ok(Layout::Entity {
                    ty: e.ty,
                    key_width,
                    columns,
                    type_id: out.len() - 1,
                    optional: e.optional,
                })
            }
            Shape::Structure(s) => {
                let mut leaves = Vec::with_capacity(s.leaves.len());
                for leaf in &s.leaves {
                    out.push(leaf.expr.clone());
                    leaves.push((out.len() - 1, leaf.ty, leaf.nullable));
                }
                Ok(Layout::Structure { ty: s.ty, leaves })
            }
            Shape::Record(fields) => {
                let mut layouts = Vec::with_capacity(fields.len());
                for (name, field) in fields {
                    layouts.push((name.clone(), self.flatten(field, materialize, out)?));
                }
                Ok(Layout::Record(layouts))
            }
            Shape::Group(_) | Shape::Set(_) => Err(Error::translation(format!(
                "a {} cannot be part of a result",
                shape.kind_name()
            ))),
        }
    }
}
