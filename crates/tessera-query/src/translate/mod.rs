//! Lowering of query trees into relational plans.
//!
//! Translation walks the (simplified) query tree bottom-up. Each sequence
//! operator works on a [`Frame`]: a `SELECT` under construction plus the shape
//! of its elements. Operators that cannot extend the current select without
//! changing its meaning (a filter after `take`, a projection after
//! `distinct`, ...) first wrap it into a derived table.
//!
//! Lambdas are bound through a scope chain, so subqueries may refer to the
//! variables of every enclosing query. Navigation joins go into the frame that
//! owns the navigated entity's columns, even from inside a subquery.

mod expr;
mod shape;
mod source;

use std::collections::HashMap;

use tessera_core::{
    AggregateFunc, BinaryOp, DomainModel, Error, JoinKind, JoinPlan, OrderItem, ProjectionItem,
    QueryPlan, Result, ScalarExpr, ScalarType, SelectPlan, SetOpKind, Source, TYPE_ID_COLUMN,
    Value,
};

use crate::compiled::SlotKind;
use crate::expr::{AggregateKind, Expr, Lambda, Var};
use crate::query::{ElementType, JoinType, Query, QueryNode, SetOperation};
use crate::shape::ResultShape;
use crate::simplify::simplify;

use shape::{EntityShape, GroupShape, Layout, ScalarShape, Shape, column_name};

/// Output of [`translate`].
pub(crate) struct Translation {
    pub plan: QueryPlan,
    pub shape: ResultShape,
    pub slots: Vec<SlotKind>,
}

/// Translate `query`. `sites` numbers the local-collection sites by node
/// identity.
#[allow(clippy::result_large_err)]
pub(crate) fn translate(
    model: &DomainModel,
    query: &Query,
    sites: &HashMap<usize, usize>,
) -> Result<Translation> {
    let simplified = simplify(query);
    let mut translator = Translator::new(model, sites);
    let frame = translator.query(&simplified.query)?;
    let (plan, layout) = translator.finish(frame, true)?;
    let plan = if simplified.is_empty {
        tracing::debug!("query is statically empty");
        QueryPlan::Empty {
            columns: plan.output_columns(),
        }
    } else {
        plan
    };
    Ok(Translation {
        plan,
        shape: layout.result_shape(),
        slots: translator.slots,
    })
}

/// A `SELECT` under construction.
struct Frame {
    id: u32,
    select: SelectPlan,
    element: Shape,
    /// Navigation joins already emitted, by path
    navs: HashMap<String, EntityShape>,
    /// The select groups or aggregates; further operators wrap it
    grouped: bool,
}

impl Frame {
    fn new(id: u32, from: Source, element: Shape) -> Self {
        Self {
            id,
            select: SelectPlan::from_source(from),
            element,
            navs: HashMap::new(),
            grouped: false,
        }
    }

    fn limited(&self) -> bool {
        self.select.limit.is_some() || self.select.offset.is_some()
    }

    fn has_groups(&self) -> bool {
        self.grouped && matches!(self.element, Shape::Group(_))
    }

    /// Whether new filters or sources would change what earlier operators
    /// produced.
    fn sealed(&self) -> bool {
        self.limited() || self.select.distinct || self.grouped
    }
}

struct Translator<'a> {
    model: &'a DomainModel,
    sites: &'a HashMap<usize, usize>,
    next_alias: usize,
    next_frame: u32,
    frames: Vec<Frame>,
    scopes: Vec<(u64, Shape)>,
    slots: Vec<SlotKind>,
    site_slots: HashMap<usize, usize>,
    named_slots: HashMap<String, usize>,
    list_slots: HashMap<String, usize>,
}

#[allow(clippy::result_large_err)]
impl<'a> Translator<'a> {
    fn new(model: &'a DomainModel, sites: &'a HashMap<usize, usize>) -> Self {
        Self {
            model,
            sites,
            next_alias: 0,
            next_frame: 0,
            frames: Vec::new(),
            scopes: Vec::new(),
            slots: Vec::new(),
            site_slots: HashMap::new(),
            named_slots: HashMap::new(),
            list_slots: HashMap::new(),
        }
    }

    fn alias(&mut self) -> String {
        let alias = format!("t{}", self.next_alias);
        self.next_alias += 1;
        alias
    }

    fn frame_id(&mut self) -> u32 {
        let id = self.next_frame;
        self.next_frame += 1;
        id
    }

    /// Run `f` with `frame` on top of the frame stack.
    fn within<T>(
        &mut self,
        frame: Frame,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<(Frame, T)> {
        self.frames.push(frame);
        let result = f(self);
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| Error::translation("frame stack underflow"))?;
        Ok((frame, result?))
    }

    /// Translate a lambda body with its parameters bound to `shapes`.
    fn bind<T>(
        &mut self,
        lambda: &Lambda,
        shapes: Vec<Shape>,
        f: impl FnOnce(&mut Self, &Expr) -> Result<T>,
    ) -> Result<T> {
        if lambda.params.len() != shapes.len() {
            return Err(Error::translation(format!(
                "lambda takes {} parameter(s), {} supplied",
                lambda.params.len(),
                shapes.len()
            )));
        }
        let depth = self.scopes.len();
        for (param, shape) in lambda.params.iter().zip(shapes) {
            self.scopes.push((param.id(), shape));
        }
        let result = f(self, &lambda.body);
        self.scopes.truncate(depth);
        result
    }

    fn lookup(&self, var: &Var) -> Result<Shape> {
        self.scopes
            .iter()
            .rev()
            .find(|(id, _)| *id == var.id())
            .map(|(_, shape)| shape.clone())
            .ok_or_else(|| {
                Error::translation(format!(
                    "variable '{}' is not bound in this query",
                    var.name()
                ))
            })
    }

    fn frame_mut(&mut self, id: u32) -> Result<&mut Frame> {
        self.frames
            .iter_mut()
            .rev()
            .find(|f| f.id == id)
            .ok_or_else(|| Error::translation("navigation escapes the query it belongs to"))
    }

    fn push_slot(&mut self, kind: SlotKind) -> usize {
        self.slots.push(kind);
        self.slots.len() - 1
    }

    fn site_slot(&mut self, site_id: usize) -> Result<usize> {
        let site = *self
            .sites
            .get(&site_id)
            .ok_or_else(|| Error::translation("local collection site was not analyzed"))?;
        if let Some(slot) = self.site_slots.get(&site) {
            return Ok(*slot);
        }
        let slot = self.push_slot(SlotKind::Site(site));
        self.site_slots.insert(site, slot);
        Ok(slot)
    }

    fn named_slot(&mut self, name: &str) -> usize {
        if let Some(slot) = self.named_slots.get(name) {
            return *slot;
        }
        let slot = self.push_slot(SlotKind::Named(name.to_string()));
        self.named_slots.insert(name.to_string(), slot);
        slot
    }

    fn list_slot(&mut self, name: &str) -> usize {
        if let Some(slot) = self.list_slots.get(name) {
            return *slot;
        }
        let slot = self.push_slot(SlotKind::NamedList(name.to_string()));
        self.list_slots.insert(name.to_string(), slot);
        slot
    }

    fn query(&mut self, q: &Query) -> Result<Frame> {
        match q.node() {
            QueryNode::All(name) => self.all(name),
            QueryNode::Local {
                columns, scalar, ..
            } => self.local(q, columns, *scalar),
            QueryNode::Empty(element) => self.empty(element),
            QueryNode::Navigate(expr) => {
                let Shape::Set(set) = self.expr(expr)? else {
                    return Err(Error::translation(
                        "navigate() needs an entity-set member such as owner.member(\"Items\")",
                    ));
                };
                self.set_source(&set)
            }
            QueryNode::Filter { source, predicate } => {
                let frame = self.query(source)?;
                self.filter(frame, predicate)
            }
            QueryNode::Select { source, selector } => {
                let frame = self.query(source)?;
                self.select(frame, selector)
            }
            QueryNode::OfType { source, type_name } => {
                let frame = self.query(source)?;
                self.of_type(frame, type_name)
            }
            QueryNode::Join {
                kind,
                left,
                right,
                left_key,
                right_key,
                result,
            } => self.join(*kind, left, right, [left_key, right_key, result]),
            QueryNode::GroupBy { source, key } => {
                let frame = self.query(source)?;
                self.group_by(frame, key)
            }
            QueryNode::SetOp { op, left, right } => self.set_op(*op, left, right),
            QueryNode::OrderBy {
                source,
                key,
                descending,
                then,
            } => {
                let frame = self.query(source)?;
                self.order_by(frame, key, *descending, *then)
            }
            QueryNode::Take { source, count } => {
                let frame = self.query(source)?;
                self.take(frame, *count)
            }
            QueryNode::Skip { source, count } => {
                let mut frame = self.query(source)?;
                if frame.limited() {
                    frame = self.wrap(frame)?;
                }
                frame.select.offset = Some(*count);
                Ok(frame)
            }
            QueryNode::Distinct(source) => {
                let mut frame = self.query(source)?;
                if frame.limited() {
                    frame = self.wrap(frame)?;
                }
                frame.select.distinct = true;
                Ok(frame)
            }
            QueryNode::Aggregate {
                source,
                kind,
                selector,
            } => {
                let frame = self.query(source)?;
                self.aggregate(frame, *kind, selector.as_ref())
            }
            QueryNode::Any { source, predicate } => {
                let frame = self.query(source)?;
                self.any(frame, predicate.as_ref())
            }
        }
    }

    fn all(&mut self, name: &str) -> Result<Frame> {
        let ty = self.model.resolve_type(name).ok_or_else(|| {
            Error::translation(format!("unknown entity type or interface '{name}'"))
        })?;
        let id = self.frame_id();
        let (source, entity, filter) = self.entity_source(ty, id)?;
        let mut frame = Frame::new(id, source, Shape::Entity(entity));
        if let Some(filter) = filter {
            frame.select.and_filter(filter);
        }
        Ok(frame)
    }

    fn local(&mut self, q: &Query, columns: &[(String, ScalarType)], scalar: bool) -> Result<Frame> {
        let slot = self.site_slot(q.site_id())?;
        let alias = self.alias();
        let id = self.frame_id();
        let fields: Vec<(String, Shape)> = columns
            .iter()
            .map(|(name, ty)| {
                let expr = ScalarExpr::column(&alias, name);
                (name.clone(), Shape::Scalar(ScalarShape::new(expr, Some(*ty), true)))
            })
            .collect();
        let element = match fields.as_slice() {
            [(_, only)] if scalar => only.clone(),
            _ => Shape::Record(fields),
        };
        let source = Source::Values {
            columns: columns.iter().map(|(n, _)| n.clone()).collect(),
            slot,
            alias,
        };
        Ok(Frame::new(id, source, element))
    }

    fn empty(&mut self, element: &ElementType) -> Result<Frame> {
        let slot = self.push_slot(SlotKind::Constant(Value::Array(Vec::new())));
        let alias = self.alias();
        let id = self.frame_id();
        let (columns, element) = match element {
            ElementType::Entity(name) => {
                let ty = self.model.resolve_type(name).ok_or_else(|| {
                    Error::translation(format!("unknown entity type or interface '{name}'"))
                })?;
                let projected = self.model.projected_columns(ty);
                let mut names: Vec<String> = projected.iter().map(|c| c.name.clone()).collect();
                let entity = self.entity_over(ty, id, &alias, &names);
                names.push(TYPE_ID_COLUMN.to_string());
                (names, Shape::Entity(entity))
            }
            ElementType::Scalar(ty) => (
                vec!["Value".to_string()],
                Shape::Scalar(ScalarShape::new(
                    ScalarExpr::column(&alias, "Value"),
                    Some(*ty),
                    true,
                )),
            ),
            ElementType::Record(cols) => (
                cols.iter().map(|(n, _)| n.clone()).collect(),
                Shape::Record(
                    cols.iter()
                        .map(|(n, ty)| {
                            let expr = ScalarExpr::column(&alias, n);
                            (n.clone(), Shape::Scalar(ScalarShape::new(expr, Some(*ty), true)))
                        })
                        .collect(),
                ),
            ),
        };
        Ok(Frame::new(
            id,
            Source::Values {
                columns,
                slot,
                alias,
            },
            element,
        ))
    }

    fn filter(&mut self, frame: Frame, predicate: &Lambda) -> Result<Frame> {
        let having = frame.has_groups();
        let frame = if !having && frame.sealed() {
            self.wrap(frame)?
        } else {
            frame
        };
        let element = frame.element.clone();
        let (mut frame, condition) = self.within(frame, |t| {
            t.bind(predicate, vec![element], |t, body| t.predicate(body))
        })?;
        if having {
            frame.select.having = Some(match frame.select.having.take() {
                Some(existing) => ScalarExpr::binary(BinaryOp::And, existing, condition),
                None => condition,
            });
        } else {
            frame.select.and_filter(condition);
        }
        Ok(frame)
    }

    fn select(&mut self, frame: Frame, selector: &Lambda) -> Result<Frame> {
        let frame = if frame.select.distinct || (frame.grouped && !frame.has_groups()) {
            self.wrap(frame)?
        } else {
            frame
        };
        let element = frame.element.clone();
        let (mut frame, shape) =
            self.within(frame, |t| t.bind(selector, vec![element], |t, body| t.expr(body)))?;
        if matches!(shape, Shape::Set(_)) {
            return Err(Error::translation(
                "entity sets cannot be projected; query them with Query::navigate",
            ));
        }
        frame.element = shape;
        Ok(frame)
    }

    fn of_type(&mut self, frame: Frame, type_name: &str) -> Result<Frame> {
        let target = self.model.resolve_type(type_name).ok_or_else(|| {
            Error::translation(format!("unknown entity type or interface '{type_name}'"))
        })?;
        let frame = if frame.sealed() { self.wrap(frame)? } else { frame };
        let Shape::Entity(entity) = frame.element.clone() else {
            return Err(Error::translation(format!(
                "of_type applies to entity sequences, not to a {}",
                frame.element.kind_name()
            )));
        };
        let (mut frame, (test, narrowed)) = self.within(frame, |t| t.narrow(&entity, target))?;
        if let Some(test) = test {
            frame.select.and_filter(test);
        }
        frame.element = Shape::Entity(narrowed);
        Ok(frame)
    }

    fn join(
        &mut self,
        kind: JoinType,
        left: &Query,
        right: &Query,
        [left_key, right_key, result]: [&Lambda; 3],
    ) -> Result<Frame> {
        let left = self.query(left)?;
        let mut left = if left.sealed() { self.wrap(left)? } else { left };
        let right = self.query(right)?;
        let right = self.strip_order(right);
        let (right_plan, right_layout) = self.finish(right, false)?;

        let alias = self.alias();
        let right_shape = right_layout.rebase(&alias, left.id);
        let (join_kind, right_shape) = match kind {
            JoinType::Inner => (JoinKind::Inner, right_shape),
            JoinType::Left => (JoinKind::Left, right_shape.into_optional()),
        };
        // The ON clause is filled in once the keys are translated; navigation
        // joins from the right side must come after this join.
        left.select.joins.push(JoinPlan {
            kind: join_kind,
            source: Source::Subquery {
                plan: Box::new(right_plan),
                alias,
            },
            on: ScalarExpr::literal(true),
        });
        let join_index = left.select.joins.len() - 1;

        let left_shape = left.element.clone();
        let (mut frame, (on, element)) = self.within(left, |t| {
            let lk = t.bind(left_key, vec![left_shape.clone()], |t, b| t.expr(b))?;
            let rk = t.bind(right_key, vec![right_shape.clone()], |t, b| t.expr(b))?;
            let on = t.equality(&lk, &rk, false)?;
            let element = t.bind(result, vec![left_shape, right_shape], |t, b| t.expr(b))?;
            Ok((on, element))
        })?;
        frame.select.joins[join_index].on = on;
        frame.element = element;
        Ok(frame)
    }

    fn group_by(&mut self, frame: Frame, key: &Lambda) -> Result<Frame> {
        let frame = if frame.sealed() { self.wrap(frame)? } else { frame };
        let element = frame.element.clone();
        let (frame, key_shape) =
            self.within(frame, |t| t.bind(key, vec![element.clone()], |t, body| t.expr(body)))?;
        let key_shape = group_key(key_shape);

        let (mut inner, (element_layout, key_layout, exprs)) = self.within(frame, |t| {
            let mut out = Vec::new();
            let element_layout = t.flatten(&element, false, &mut out)?;
            let key_layout = t.flatten(&key_shape, false, &mut out)?;
            Ok((element_layout, key_layout, out))
        })?;
        inner.select.order_by.clear();
        inner.select.projection = projection(exprs);

        let alias = self.alias();
        let id = self.frame_id();
        let key = key_layout.rebase(&alias, id);
        let group_columns = layout_columns(&key_layout)
            .into_iter()
            .map(|i| ScalarExpr::column(&alias, column_name(i)))
            .collect();
        let grouped_element = Shape::Group(GroupShape {
            key: Box::new(key),
            element: Box::new(element_layout.rebase(&alias, id)),
        });
        let mut outer = Frame::new(
            id,
            Source::Subquery {
                plan: Box::new(QueryPlan::Select(Box::new(inner.select))),
                alias,
            },
            grouped_element,
        );
        outer.select.group_by = group_columns;
        outer.grouped = true;
        Ok(outer)
    }

    fn set_op(&mut self, op: SetOperation, left: &Query, right: &Query) -> Result<Frame> {
        let left = self.query(left)?;
        let left = self.strip_order(left);
        let (left_plan, left_layout) = self.finish(left, false)?;
        let right = self.query(right)?;
        let right = self.strip_order(right);
        let (right_plan, right_layout) = self.finish(right, false)?;
        if left_layout.signature() != right_layout.signature() {
            return Err(Error::translation(format!(
                "operands of {op:?} have different element shapes"
            )));
        }
        let kind = match op {
            SetOperation::Union => SetOpKind::Union,
            SetOperation::Concat => SetOpKind::UnionAll,
            SetOperation::Except => SetOpKind::Except,
            SetOperation::Intersect => SetOpKind::Intersect,
        };
        let alias = self.alias();
        let id = self.frame_id();
        let element = left_layout.rebase(&alias, id);
        Ok(Frame::new(
            id,
            Source::Subquery {
                plan: Box::new(QueryPlan::SetOp {
                    op: kind,
                    left: Box::new(left_plan),
                    right: Box::new(right_plan),
                }),
                alias,
            },
            element,
        ))
    }

    fn order_by(&mut self, frame: Frame, key: &Lambda, descending: bool, then: bool) -> Result<Frame> {
        let frame = if frame.sealed() { self.wrap(frame)? } else { frame };
        let element = frame.element.clone();
        let (mut frame, exprs) = self.within(frame, |t| {
            let shape = t.bind(key, vec![element], |t, body| t.expr(body))?;
            t.order_exprs(&shape)
        })?;
        if !then {
            frame.select.order_by.clear();
        }
        frame
            .select
            .order_by
            .extend(exprs.into_iter().map(|expr| OrderItem { expr, descending }));
        Ok(frame)
    }

    fn take(&mut self, frame: Frame, count: u64) -> Result<Frame> {
        let mut frame = if frame.select.limit.is_some() {
            self.wrap(frame)?
        } else {
            frame
        };
        frame.select.limit = Some(count);
        Ok(frame)
    }

    fn aggregate(&mut self, frame: Frame, kind: AggregateKind, selector: Option<&Lambda>) -> Result<Frame> {
        let mut frame = if frame.sealed() { self.wrap(frame)? } else { frame };
        frame.select.order_by.clear();
        let element = frame.element.clone();
        let (mut frame, value) = self.within(frame, |t| {
            let arg = match selector {
                Some(selector) => Some(t.bind(selector, vec![element], |t, b| t.scalar(b))?),
                None => match element {
                    Shape::Scalar(s) if kind != AggregateKind::Count => Some(s),
                    _ => None,
                },
            };
            t.aggregate_expr(kind, arg)
        })?;
        frame.element = Shape::Scalar(value);
        frame.grouped = true;
        Ok(frame)
    }

    fn any(&mut self, frame: Frame, predicate: Option<&Lambda>) -> Result<Frame> {
        let mut frame = if frame.sealed() { self.wrap(frame)? } else { frame };
        frame.select.order_by.clear();
        if let Some(predicate) = predicate {
            frame = self.filter(frame, predicate)?;
        }
        let count = ScalarExpr::Aggregate {
            func: AggregateFunc::CountStar,
            arg: None,
            distinct: false,
        };
        frame.element = Shape::Scalar(ScalarShape::new(
            ScalarExpr::binary(BinaryOp::Gt, count, ScalarExpr::literal(0i64)),
            Some(ScalarType::Bool),
            false,
        ));
        frame.grouped = true;
        Ok(frame)
    }

    /// Drop an ordering that no longer matters (no limit depends on it).
    fn strip_order(&self, mut frame: Frame) -> Frame {
        if !frame.limited() {
            frame.select.order_by.clear();
        }
        frame
    }

    /// Set the projection of `frame` from its element shape.
    fn project(&mut self, frame: Frame, materialize: bool) -> Result<(Frame, Layout)> {
        if let Shape::Group(_) = frame.element {
            return Err(Error::translation(
                "groups must be projected with select() using key() and group aggregates",
            ));
        }
        let element = frame.element.clone();
        let (mut frame, (layout, exprs)) = self.within(frame, |t| {
            let mut out = Vec::new();
            let layout = t.flatten(&element, materialize, &mut out)?;
            Ok((layout, out))
        })?;
        frame.select.projection = projection(exprs);
        Ok((frame, layout))
    }

    fn finish(&mut self, frame: Frame, materialize: bool) -> Result<(QueryPlan, Layout)> {
        let (frame, layout) = self.project(frame, materialize)?;
        Ok((QueryPlan::Select(Box::new(frame.select)), layout))
    }

    /// Turn `frame` into a derived table and start a new select over it.
    ///
    /// An ordering the inner select needs for its limit is carried out as
    /// extra columns and re-applied outside.
    fn wrap(&mut self, frame: Frame) -> Result<Frame> {
        let (mut frame, layout) = self.project(frame, false)?;
        let mut carried = Vec::new();
        if frame.limited() && !frame.select.distinct && !frame.grouped {
            for (i, item) in frame.select.order_by.iter().enumerate() {
                let name = format!("o{i}");
                frame.select.projection.push(ProjectionItem {
                    expr: item.expr.clone(),
                    alias: name.clone(),
                });
                carried.push((name, item.descending));
            }
        } else if !frame.limited() {
            frame.select.order_by.clear();
        }
        let alias = self.alias();
        let id = self.frame_id();
        let element = layout.rebase(&alias, id);
        let mut outer = Frame::new(
            id,
            Source::Subquery {
                plan: Box::new(QueryPlan::Select(Box::new(frame.select))),
                alias: alias.clone(),
            },
            element,
        );
        outer.select.order_by = carried
            .into_iter()
            .map(|(name, descending)| OrderItem {
                expr: ScalarExpr::column(&alias, name),
                descending,
            })
            .collect();
        Ok(outer)
    }

    /// Sort keys for an ordering shape.
    fn order_exprs(&mut self, shape: &Shape) -> Result<Vec<ScalarExpr>> {
        match shape {
            Shape::Scalar(s) => Ok(vec![s.expr.clone()]),
            Shape::Entity(e) => Ok(e.key.clone()),
            Shape::Structure(s) => Ok(s.leaves.iter().map(|l| l.expr.clone()).collect()),
            Shape::Record(fields) => {
                let mut out = Vec::new();
                for (_, field) in fields {
                    out.extend(self.order_exprs(field)?);
                }
                Ok(out)
            }
            Shape::Group(_) | Shape::Set(_) => Err(Error::translation(format!(
                "cannot order by a {}",
                shape.kind_name()
            ))),
        }
    }

    fn aggregate_expr(&mut self, kind: AggregateKind, arg: Option<ScalarShape>) -> Result<ScalarShape> {
        let aggregate = |func, arg: &ScalarShape| ScalarExpr::Aggregate {
            func,
            arg: Some(Box::new(arg.expr.clone())),
            distinct: false,
        };
        let required = |arg: Option<ScalarShape>| {
            arg.ok_or_else(|| Error::translation(format!("{kind:?} needs a selector")))
        };
        Ok(match kind {
            AggregateKind::Count => ScalarShape::new(
                ScalarExpr::Aggregate {
                    func: AggregateFunc::CountStar,
                    arg: None,
                    distinct: false,
                },
                Some(ScalarType::BigInt),
                false,
            ),
            AggregateKind::Sum => {
                let arg = required(arg)?;
                if arg.ty.is_some_and(|t| !t.is_numeric()) {
                    return Err(Error::translation("Sum needs a numeric selector"));
                }
                let zero = arg.ty.map_or(Value::BigInt(0), ScalarType::default_value);
                ScalarShape::new(
                    ScalarExpr::Coalesce(vec![
                        aggregate(AggregateFunc::Sum, &arg),
                        ScalarExpr::Literal(zero),
                    ]),
                    arg.ty,
                    false,
                )
            }
            AggregateKind::Min | AggregateKind::Max => {
                let arg = required(arg)?;
                let func = if kind == AggregateKind::Min {
                    AggregateFunc::Min
                } else {
                    AggregateFunc::Max
                };
                ScalarShape::new(aggregate(func, &arg), arg.ty, true)
            }
            AggregateKind::Avg => {
                let arg = required(arg)?;
                ScalarShape::new(
                    aggregate(AggregateFunc::Avg, &arg),
                    Some(ScalarType::Double),
                    true,
                )
            }
        })
    }
}

fn projection(exprs: Vec<ScalarExpr>) -> Vec<ProjectionItem> {
    exprs
        .into_iter()
        .enumerate()
        .map(|(i, expr)| ProjectionItem {
            expr,
            alias: column_name(i),
        })
        .collect()
}

fn layout_columns(layout: &Layout) -> Vec<usize> {
    match layout {
        Layout::Scalar { column, .. } => vec![*column],
        Layout::Entity {
            columns, type_id, ..
        } => columns
            .iter()
            .filter_map(|(_, i)| *i)
            .chain(std::iter::once(*type_id))
            .collect(),
        Layout::Structure { leaves, .. } => leaves.iter().map(|(i, _, _)| *i).collect(),
        Layout::Record(fields) => fields.iter().flat_map(|(_, l)| layout_columns(l)).collect(),
    }
}

/// Boolean group keys are computed predicates; materialize them as values.
fn group_key(shape: Shape) -> Shape {
    match shape {
        Shape::Scalar(s)
            if s.ty == Some(ScalarType::Bool) && !matches!(s.expr, ScalarExpr::Column { .. }) =>
        {
            Shape::Scalar(ScalarShape::new(
                ScalarExpr::Case {
                    branches: vec![(s.expr, ScalarExpr::literal(true))],
                    otherwise: Box::new(ScalarExpr::literal(false)),
                },
                Some(ScalarType::Bool),
                false,
            ))
        }
        Shape::Record(fields) => {
            Shape::Record(fields.into_iter().map(|(n, s)| (n, group_key(s))).collect())
        }
        other => other,
    }
}

#[cfg(test)]
pub(crate) mod tests;
