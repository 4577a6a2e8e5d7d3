//! Expression lowering.

use tessera_core::{
    BinaryOp as PlanOp, Error, QueryPlan, QueryTranslationError, Result, ScalarExpr, ScalarType,
    StructFieldKind, StructureValue, TypeRef, Value,
};

use crate::expr::{AggregateKind, BinaryOp, Expr, ExprNode, Lambda, LocalList, SubqueryKind};
use crate::query::Query;
use crate::simplify::simplify;

use super::shape::{Body, EntityShape, ScalarShape, Shape, StructShape};
use super::{Frame, Translator};

fn value_type(value: &Value) -> Option<ScalarType> {
    Some(match value {
        Value::Bool(_) => ScalarType::Bool,
        Value::Int(_) => ScalarType::Int,
        Value::BigInt(_) => ScalarType::BigInt,
        Value::Double(_) => ScalarType::Double,
        Value::Decimal(_) => ScalarType::Decimal,
        Value::Text(_) => ScalarType::Text,
        Value::Bytes(_) => ScalarType::Bytes,
        Value::Date(_) => ScalarType::Date,
        Value::Timestamp(_) => ScalarType::Timestamp,
        Value::Uuid(_) => ScalarType::Uuid,
        Value::Json(_) => ScalarType::Json,
        Value::Null | Value::Array(_) => return None,
    })
}

fn is_null_literal(expr: &ScalarExpr) -> bool {
    matches!(expr, ScalarExpr::Literal(Value::Null))
}

fn boolean(expr: ScalarExpr) -> Shape {
    Shape::Scalar(ScalarShape::new(expr, Some(ScalarType::Bool), false))
}

/// Equality of two scalars. With `null_safe`, NULL equals NULL.
fn scalar_eq(a: &ScalarShape, b: &ScalarShape, null_safe: bool) -> ScalarExpr {
    if is_null_literal(&a.expr) {
        return ScalarExpr::IsNull(Box::new(b.expr.clone()));
    }
    if is_null_literal(&b.expr) {
        return ScalarExpr::IsNull(Box::new(a.expr.clone()));
    }
    let op = if null_safe && (a.nullable || b.nullable) {
        PlanOp::NullSafeEq
    } else {
        PlanOp::Eq
    };
    ScalarExpr::binary(op, a.expr.clone(), b.expr.clone())
}

fn entity_is_null(entity: &EntityShape) -> ScalarExpr {
    match (&entity.body, entity.key.first()) {
        (Body::KeyOnly, _) | (_, None) => ScalarExpr::literal(false),
        (_, Some(key)) => ScalarExpr::IsNull(Box::new(key.clone())),
    }
}

#[allow(clippy::result_large_err)]
impl Translator<'_> {
    pub(super) fn expr(&mut self, e: &Expr) -> Result<Shape> {
        match e.node() {
            ExprNode::Var(var) => self.lookup(var),
            ExprNode::Member { target, name } => {
                let target = self.expr(target)?;
                self.member(target, name)
            }
            ExprNode::Constant(value) => Ok(Shape::Scalar(ScalarShape::new(
                ScalarExpr::Literal(value.clone()),
                value_type(value),
                value.is_null(),
            ))),
            ExprNode::Param(name) => {
                let slot = self.named_slot(name);
                Ok(Shape::Scalar(ScalarShape::new(ScalarExpr::Param(slot), None, true)))
            }
            ExprNode::Binary { op, left, right } => self.binary(*op, left, right),
            ExprNode::Not(inner) => {
                let inner = self.predicate(inner)?;
                Ok(boolean(inner.negate()))
            }
            ExprNode::IsNull(inner) => {
                let shape = self.expr(inner)?;
                self.is_null(&shape).map(boolean)
            }
            ExprNode::IsType { expr, type_name } => self.is_type(expr, type_name).map(boolean),
            ExprNode::Conditional {
                test,
                if_true,
                if_false,
            } => {
                let test = self.predicate(test)?;
                let a = self.scalar(if_true)?;
                let b = self.scalar(if_false)?;
                Ok(Shape::Scalar(ScalarShape::new(
                    ScalarExpr::Case {
                        branches: vec![(test, a.expr)],
                        otherwise: Box::new(b.expr),
                    },
                    a.ty.or(b.ty),
                    a.nullable || b.nullable,
                )))
            }
            ExprNode::Coalesce(value, fallback) => {
                let a = self.scalar(value)?;
                let b = self.scalar(fallback)?;
                Ok(Shape::Scalar(ScalarShape::new(
                    ScalarExpr::Coalesce(vec![a.expr, b.expr]),
                    a.ty.or(b.ty),
                    a.nullable && b.nullable,
                )))
            }
            ExprNode::Contains { list, item } => {
                let item = self.in_operand(item)?;
                let slot = match list {
                    LocalList::Values(_) => self.site_slot(e.site_id())?,
                    LocalList::Param(name) => self.list_slot(name),
                };
                Ok(boolean(ScalarExpr::InParam {
                    expr: Box::new(item),
                    slot,
                }))
            }
            ExprNode::Subquery {
                kind,
                source,
                lambda,
                item,
            } => self.subquery(*kind, source, lambda.as_ref(), item.as_ref()),
            ExprNode::GroupAggregate {
                group,
                kind,
                selector,
            } => self.group_aggregate(group, *kind, selector.as_ref()),
            ExprNode::Record(fields) => {
                let mut shapes = Vec::with_capacity(fields.len());
                for (name, value) in fields {
                    let shape = self.expr(value)?;
                    if matches!(shape, Shape::Set(_) | Shape::Group(_)) {
                        return Err(Error::translation(format!(
                            "record field '{name}' cannot hold a {}",
                            shape.kind_name()
                        )));
                    }
                    shapes.push((name.clone(), shape));
                }
                Ok(Shape::Record(shapes))
            }
            ExprNode::StructureLiteral(value) => self.structure_literal(value, None),
            ExprNode::EntityConstant { type_name, key } => {
                let def = self.model.entity_by_name(type_name)?;
                let key = self.model.make_key(def.idx, key.clone())?;
                Ok(Shape::Entity(EntityShape {
                    ty: TypeRef::Entity(def.idx),
                    home: None,
                    key: key.values().iter().cloned().map(ScalarExpr::Literal).collect(),
                    body: Body::KeyOnly,
                    optional: false,
                }))
            }
            ExprNode::Call { method, .. } => Err(Error::QueryTranslation(QueryTranslationError::at(
                format!("method '{method}' has no relational translation"),
                method.clone(),
            ))),
        }
    }

    pub(super) fn scalar(&mut self, e: &Expr) -> Result<ScalarShape> {
        match self.expr(e)? {
            Shape::Scalar(s) => Ok(s),
            Shape::Entity(entity) if entity.key.len() == 1 => {
                let key = entity.key[0].clone();
                Ok(ScalarShape::new(key, None, entity.optional))
            }
            other => Err(Error::translation(format!(
                "expected a scalar value, found a {}",
                other.kind_name()
            ))),
        }
    }

    pub(super) fn predicate(&mut self, e: &Expr) -> Result<ScalarExpr> {
        let shape = self.scalar(e)?;
        match shape.ty {
            None | Some(ScalarType::Bool) => Ok(shape.expr),
            Some(other) => Err(Error::translation(format!(
                "expected a boolean condition, found {}",
                other.name()
            ))),
        }
    }

    /// Left operand of an `IN` test; single-column entity keys compare by key.
    fn in_operand(&mut self, item: &Expr) -> Result<ScalarExpr> {
        self.scalar(item).map(|s| s.expr)
    }

    fn member(&mut self, target: Shape, name: &str) -> Result<Shape> {
        match target {
            Shape::Entity(entity) => self.entity_member(&entity, name),
            Shape::Structure(s) => {
                let def = self.model.structure(s.ty);
                let field = def.field(name).ok_or_else(|| {
                    Error::translation(format!("structure {} has no field '{name}'", def.name))
                })?;
                let leaves = s.leaves.get(field.leaves.clone()).ok_or_else(|| {
                    Error::translation(format!("structure field '{name}' is out of range"))
                })?;
                match field.kind {
                    StructFieldKind::Scalar(_) => leaves
                        .first()
                        .cloned()
                        .map(Shape::Scalar)
                        .ok_or_else(|| Error::translation(format!("structure field '{name}' has no column"))),
                    StructFieldKind::Structure(inner) => Ok(Shape::Structure(StructShape {
                        ty: inner,
                        leaves: leaves.to_vec(),
                    })),
                }
            }
            Shape::Record(fields) => fields
                .into_iter()
                .find(|(n, _)| n == name)
                .map(|(_, shape)| shape)
                .ok_or_else(|| Error::translation(format!("record has no field '{name}'"))),
            Shape::Group(group) if name == "Key" => Ok(*group.key),
            other => Err(Error::translation(format!(
                "cannot read member '{name}' of a {}",
                other.kind_name()
            ))),
        }
    }

    /// Structure literal, flattened against `declared` when compared with a
    /// structure of known type.
    fn structure_literal(&mut self, value: &StructureValue, declared: Option<&Shape>) -> Result<Shape> {
        let model = self.model;
        let ty = match declared {
            Some(Shape::Structure(s)) => s.ty,
            _ => {
                model
                    .structure_by_name(value.runtime_type())
                    .ok_or_else(|| {
                        Error::translation(format!(
                            "unknown structure type '{}'",
                            value.runtime_type()
                        ))
                    })?
                    .idx
            }
        };
        let def = model.structure(ty);
        let values = value.flatten(model, ty, &def.name)?;
        let leaves = values
            .into_iter()
            .zip(&def.leaves)
            .map(|(v, leaf)| {
                let nullable = v.is_null();
                ScalarShape::new(ScalarExpr::Literal(v), Some(leaf.ty), nullable)
            })
            .collect();
        Ok(Shape::Structure(StructShape { ty, leaves }))
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Shape> {
        match op {
            BinaryOp::And | BinaryOp::Or => {
                let a = self.predicate(left)?;
                let b = self.predicate(right)?;
                let op = if op == BinaryOp::And {
                    PlanOp::And
                } else {
                    PlanOp::Or
                };
                Ok(boolean(ScalarExpr::binary(op, a, b)))
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let (a, b) = match (left.node(), right.node()) {
                    (ExprNode::StructureLiteral(v), _) => {
                        let b = self.expr(right)?;
                        (self.structure_literal(v, Some(&b))?, b)
                    }
                    (_, ExprNode::StructureLiteral(v)) => {
                        let a = self.expr(left)?;
                        let b = self.structure_literal(v, Some(&a))?;
                        (a, b)
                    }
                    _ => (self.expr(left)?, self.expr(right)?),
                };
                let eq = self.equality(&a, &b, true)?;
                Ok(boolean(if op == BinaryOp::Eq { eq } else { eq.negate() }))
            }
            _ => {
                let a = self.scalar(left)?;
                let b = self.scalar(right)?;
                let plan_op = match op {
                    BinaryOp::Lt => PlanOp::Lt,
                    BinaryOp::Le => PlanOp::Le,
                    BinaryOp::Gt => PlanOp::Gt,
                    BinaryOp::Ge => PlanOp::Ge,
                    BinaryOp::Add => PlanOp::Add,
                    BinaryOp::Sub => PlanOp::Sub,
                    BinaryOp::Mul => PlanOp::Mul,
                    BinaryOp::Div => PlanOp::Div,
                    _ => PlanOp::Mod,
                };
                let ty = if op.is_comparison() {
                    Some(ScalarType::Bool)
                } else {
                    a.ty.or(b.ty)
                };
                Ok(Shape::Scalar(ScalarShape::new(
                    ScalarExpr::binary(plan_op, a.expr, b.expr),
                    ty,
                    a.nullable || b.nullable,
                )))
            }
        }
    }

    /// Equality of two shapes. Entities compare by identity, structures and
    /// records by their leaves.
    pub(super) fn equality(&mut self, a: &Shape, b: &Shape, null_safe: bool) -> Result<ScalarExpr> {
        match (a, b) {
            (Shape::Scalar(x), Shape::Scalar(y)) => Ok(scalar_eq(x, y, null_safe)),
            (Shape::Entity(x), Shape::Entity(y)) => self.entity_eq(x, y, null_safe),
            (Shape::Entity(e), Shape::Scalar(s)) | (Shape::Scalar(s), Shape::Entity(e))
                if is_null_literal(&s.expr) =>
            {
                Ok(entity_is_null(e))
            }
            (Shape::Structure(x), Shape::Structure(y)) => {
                if x.ty != y.ty {
                    return Err(Error::translation(format!(
                        "cannot compare structure {} with structure {}",
                        self.model.structure(x.ty).name,
                        self.model.structure(y.ty).name
                    )));
                }
                Ok(ScalarExpr::conjunction(
                    x.leaves
                        .iter()
                        .zip(&y.leaves)
                        .map(|(l, r)| scalar_eq(l, r, null_safe)),
                ))
            }
            (Shape::Record(x), Shape::Record(y))
                if x.len() == y.len() && x.iter().zip(y).all(|((a, _), (b, _))| a == b) =>
            {
                let mut parts = Vec::with_capacity(x.len());
                for ((_, l), (_, r)) in x.iter().zip(y) {
                    parts.push(self.equality(l, r, null_safe)?);
                }
                Ok(ScalarExpr::conjunction(parts))
            }
            _ => Err(Error::translation(format!(
                "cannot compare a {} with a {}",
                a.kind_name(),
                b.kind_name()
            ))),
        }
    }

    fn entity_eq(&mut self, x: &EntityShape, y: &EntityShape, null_safe: bool) -> Result<ScalarExpr> {
        let model = self.model;
        if let (TypeRef::Entity(a), TypeRef::Entity(b)) = (x.ty, y.ty) {
            if model.root_of(a) != model.root_of(b) {
                return Ok(ScalarExpr::literal(false));
            }
        }
        if x.key.len() != y.key.len() {
            return Ok(ScalarExpr::literal(false));
        }
        let mut parts: Vec<ScalarExpr> = x
            .key
            .iter()
            .zip(&y.key)
            .map(|(a, b)| {
                scalar_eq(
                    &ScalarShape::new(a.clone(), None, x.optional),
                    &ScalarShape::new(b.clone(), None, y.optional),
                    null_safe,
                )
            })
            .collect();
        match (x.ty, y.ty) {
            (TypeRef::Interface(_), TypeRef::Entity(t)) => parts.push(self.hierarchy_test(x, t)?),
            (TypeRef::Entity(t), TypeRef::Interface(_)) => parts.push(self.hierarchy_test(y, t)?),
            (TypeRef::Interface(_), TypeRef::Interface(_)) => {
                let rx = self.resolve(x)?;
                let ry = self.resolve(y)?;
                parts.push(ScalarExpr::binary(
                    PlanOp::Eq,
                    rx.type_id.clone(),
                    ry.type_id.clone(),
                ));
            }
            (TypeRef::Entity(_), TypeRef::Entity(_)) => {}
        }
        Ok(ScalarExpr::conjunction(parts))
    }

    /// The runtime type of `entity` belongs to the hierarchy of `ty`.
    fn hierarchy_test(&mut self, entity: &EntityShape, ty: tessera_core::TypeIdx) -> Result<ScalarExpr> {
        let resolved = self.resolve(entity)?;
        let root = self.model.root_of(ty);
        Ok(ScalarExpr::InList {
            expr: Box::new(resolved.type_id.clone()),
            list: self
                .model
                .concrete_types(TypeRef::Entity(root))
                .into_iter()
                .map(|t| ScalarExpr::Literal(self.model.type_id_value(t)))
                .collect(),
            negated: false,
        })
    }

    fn is_null(&mut self, shape: &Shape) -> Result<ScalarExpr> {
        match shape {
            Shape::Scalar(s) => Ok(ScalarExpr::IsNull(Box::new(s.expr.clone()))),
            Shape::Entity(e) => Ok(entity_is_null(e)),
            Shape::Structure(_) | Shape::Record(_) => Ok(ScalarExpr::literal(false)),
            Shape::Group(_) | Shape::Set(_) => Err(Error::translation(format!(
                "a {} is never null",
                shape.kind_name()
            ))),
        }
    }

    fn is_type(&mut self, expr: &Expr, type_name: &str) -> Result<ScalarExpr> {
        let target = self.model.resolve_type(type_name).ok_or_else(|| {
            Error::translation(format!("unknown entity type or interface '{type_name}'"))
        })?;
        let Shape::Entity(entity) = self.expr(expr)? else {
            return Err(Error::translation("type tests apply to entities"));
        };
        if let (Body::KeyOnly, TypeRef::Entity(t)) = (&entity.body, entity.ty) {
            return Ok(ScalarExpr::literal(self.model.is_instance_of(t, target)));
        }
        Ok(match self.type_test(&entity, target)? {
            Some(test) => test,
            None if entity.optional => entity_is_null(&entity).negate(),
            None => ScalarExpr::literal(true),
        })
    }

    fn group_aggregate(&mut self, group: &Expr, kind: AggregateKind, selector: Option<&Lambda>) -> Result<Shape> {
        let Shape::Group(group) = self.expr(group)? else {
            return Err(Error::translation("group aggregates apply to grouping elements"));
        };
        let element = *group.element;
        let arg = match selector {
            Some(selector) => Some(self.bind(selector, vec![element], |t, b| t.scalar(b))?),
            None => match element {
                Shape::Scalar(s) if kind != AggregateKind::Count => Some(s),
                _ => None,
            },
        };
        self.aggregate_expr(kind, arg).map(Shape::Scalar)
    }

    /// Value of an empty subquery source.
    fn empty_subquery(kind: SubqueryKind) -> Shape {
        let (value, ty) = match kind {
            SubqueryKind::Any | SubqueryKind::Contains => (Value::Bool(false), Some(ScalarType::Bool)),
            SubqueryKind::All => (Value::Bool(true), Some(ScalarType::Bool)),
            SubqueryKind::Count | SubqueryKind::Sum => (Value::BigInt(0), Some(ScalarType::BigInt)),
            SubqueryKind::Min | SubqueryKind::Max | SubqueryKind::Avg | SubqueryKind::First => {
                (Value::Null, None)
            }
        };
        let nullable = value.is_null();
        Shape::Scalar(ScalarShape::new(ScalarExpr::Literal(value), ty, nullable))
    }

    /// `EXISTS` over a frame.
    fn exists(&mut self, mut frame: Frame) -> ScalarExpr {
        if !frame.limited() {
            frame.select.order_by.clear();
        }
        frame.select.projection = vec![tessera_core::ProjectionItem {
            expr: ScalarExpr::literal(1),
            alias: "c0".to_string(),
        }];
        ScalarExpr::Exists(Box::new(QueryPlan::Select(Box::new(frame.select))))
    }

    fn subquery(
        &mut self,
        kind: SubqueryKind,
        source: &Query,
        lambda: Option<&Lambda>,
        item: Option<&Expr>,
    ) -> Result<Shape> {
        let simplified = simplify(source);
        if simplified.is_empty {
            return Ok(Self::empty_subquery(kind));
        }
        let frame = self.query(&simplified.query)?;
        match kind {
            SubqueryKind::Any => {
                let frame = match lambda {
                    Some(predicate) => self.filter(frame, predicate)?,
                    None => frame,
                };
                Ok(boolean(self.exists(frame)))
            }
            SubqueryKind::All => {
                let predicate = lambda.ok_or_else(|| Error::translation("All needs a predicate"))?;
                let frame = if frame.sealed() { self.wrap(frame)? } else { frame };
                let element = frame.element.clone();
                let (mut frame, condition) = self.within(frame, |t| {
                    t.bind(predicate, vec![element], |t, body| t.predicate(body))
                })?;
                let failing = ScalarExpr::Coalesce(vec![condition, ScalarExpr::literal(false)]).negate();
                frame.select.and_filter(failing);
                Ok(boolean(self.exists(frame).negate()))
            }
            SubqueryKind::Count => {
                let frame = match lambda {
                    Some(predicate) => self.filter(frame, predicate)?,
                    None => frame,
                };
                let frame = self.aggregate(frame, AggregateKind::Count, None)?;
                let (plan, _) = self.finish(frame, false)?;
                Ok(Shape::Scalar(ScalarShape::new(
                    ScalarExpr::Subquery(Box::new(plan)),
                    Some(ScalarType::BigInt),
                    false,
                )))
            }
            SubqueryKind::Sum | SubqueryKind::Min | SubqueryKind::Max | SubqueryKind::Avg => {
                let aggregate = match kind {
                    SubqueryKind::Sum => AggregateKind::Sum,
                    SubqueryKind::Min => AggregateKind::Min,
                    SubqueryKind::Max => AggregateKind::Max,
                    _ => AggregateKind::Avg,
                };
                let frame = self.aggregate(frame, aggregate, lambda)?;
                let Shape::Scalar(value) = frame.element.clone() else {
                    return Err(Error::translation("aggregate did not produce a scalar"));
                };
                let (plan, _) = self.finish(frame, false)?;
                Ok(Shape::Scalar(ScalarShape::new(
                    ScalarExpr::Subquery(Box::new(plan)),
                    value.ty,
                    value.nullable,
                )))
            }
            SubqueryKind::First => {
                let frame = self.take(frame, 1)?;
                let frame = match lambda {
                    Some(selector) => self.select(frame, selector)?,
                    None => frame,
                };
                let Shape::Scalar(value) = frame.element.clone() else {
                    return Err(Error::translation("First needs a scalar selector"));
                };
                let (plan, _) = self.finish(frame, false)?;
                Ok(Shape::Scalar(ScalarShape::new(
                    ScalarExpr::Subquery(Box::new(plan)),
                    value.ty,
                    true,
                )))
            }
            SubqueryKind::Contains => {
                let item = item.ok_or_else(|| Error::translation("Contains needs an item"))?;
                let item = self.expr(item)?;
                let frame = if frame.sealed() { self.wrap(frame)? } else { frame };
                let element = frame.element.clone();
                let (mut frame, condition) = self.within(frame, |t| t.equality(&element, &item, true))?;
                frame.select.and_filter(condition);
                Ok(boolean(self.exists(frame)))
            }
        }
    }
}
