//! Expression nodes of the query tree.
//!
//! Expressions are immutable and shared through `Arc`; cloning an [`Expr`] is
//! cheap and keeps node identity, which the compiler uses to tell apart
//! local-collection sites. Lambdas are built from closures:
//!
//! ```ignore
//! let adults = Query::all("Person").filter(|p| p.member("Age").ge(18));
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tessera_core::{StructureValue, Value};

use crate::query::Query;

static NEXT_VAR: AtomicU64 = AtomicU64::new(0);

/// A lambda parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Var {
    id: u64,
    name: Arc<str>,
}

impl Var {
    /// A fresh variable, distinct from every other variable.
    pub fn fresh(name: &str) -> Self {
        Self {
            id: NEXT_VAR.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A lambda: parameters and a body expression.
#[derive(Debug, Clone)]
pub struct Lambda {
    pub params: Vec<Var>,
    pub body: Expr,
}

impl Lambda {
    /// Build a one-parameter lambda from a closure.
    pub fn new(f: impl FnOnce(Expr) -> Expr) -> Self {
        let var = Var::fresh("x");
        let body = f(Expr::var(&var));
        Self {
            params: vec![var],
            body,
        }
    }

    /// Build a two-parameter lambda from a closure.
    pub fn new2(f: impl FnOnce(Expr, Expr) -> Expr) -> Self {
        let left = Var::fresh("l");
        let right = Var::fresh("r");
        let body = f(Expr::var(&left), Expr::var(&right));
        Self {
            params: vec![left, right],
            body,
        }
    }
}

/// Binary operators of the query language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub const fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

/// Aggregate functions over a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

/// What a subquery expression computes over its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubqueryKind {
    /// Some element satisfies the (optional) predicate
    Any,
    /// Every element satisfies the predicate
    All,
    Count,
    Sum,
    Min,
    Max,
    Avg,
    /// First element's selected value, NULL when empty
    First,
    /// The source contains the item
    Contains,
}

/// Items of a `Contains` over a local collection.
#[derive(Debug, Clone)]
pub enum LocalList {
    /// Values captured in the query tree.
    Values(Vec<Value>),
    /// A named argument bound to an array at execution.
    Param(String),
}

/// An expression node. Construct through [`Expr`].
#[derive(Debug)]
pub enum ExprNode {
    Var(Var),
    Member {
        target: Expr,
        name: String,
    },
    Constant(Value),
    /// Named argument supplied at execution.
    Param(String),
    Binary {
        op: BinaryOp,
        left: Expr,
        right: Expr,
    },
    Not(Expr),
    IsNull(Expr),
    IsType {
        expr: Expr,
        type_name: String,
    },
    Conditional {
        test: Expr,
        if_true: Expr,
        if_false: Expr,
    },
    Coalesce(Expr, Expr),
    Contains {
        list: LocalList,
        item: Expr,
    },
    Subquery {
        kind: SubqueryKind,
        source: Query,
        lambda: Option<Lambda>,
        item: Option<Expr>,
    },
    /// Aggregate over the elements of a group produced by `group_by`.
    GroupAggregate {
        group: Expr,
        kind: AggregateKind,
        selector: Option<Lambda>,
    },
    Record(Vec<(String, Expr)>),
    StructureLiteral(StructureValue),
    EntityConstant {
        type_name: String,
        key: Vec<Value>,
    },
    /// Opaque method call; never translatable.
    Call {
        method: String,
        args: Vec<Expr>,
    },
}

/// A shared, immutable expression.
#[derive(Clone)]
pub struct Expr(Arc<ExprNode>);

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Expr {
    pub fn from_node(node: ExprNode) -> Self {
        Self(Arc::new(node))
    }

    pub fn node(&self) -> &ExprNode {
        &self.0
    }

    /// Identity of this node instance.
    pub fn site_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn var(var: &Var) -> Self {
        Self::from_node(ExprNode::Var(var.clone()))
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Self::from_node(ExprNode::Constant(value.into()))
    }

    pub fn null() -> Self {
        Self::constant(Value::Null)
    }

    /// A named argument bound at execution time.
    pub fn param(name: impl Into<String>) -> Self {
        Self::from_node(ExprNode::Param(name.into()))
    }

    /// Field access: scalar, structure, reference, entity set, record field or
    /// group key (`"Key"`).
    #[must_use]
    pub fn member(&self, name: impl Into<String>) -> Self {
        Self::from_node(ExprNode::Member {
            target: self.clone(),
            name: name.into(),
        })
    }

    /// Follow a dotted member path.
    #[must_use]
    pub fn path(&self, path: &str) -> Self {
        path.split('.').fold(self.clone(), |e, name| e.member(name))
    }

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Self::from_node(ExprNode::Binary {
            op,
            left: self,
            right: other.into(),
        })
    }

    #[must_use]
    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    #[must_use]
    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    #[must_use]
    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    #[must_use]
    pub fn le(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, other)
    }

    #[must_use]
    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    #[must_use]
    pub fn ge(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, other)
    }

    #[must_use]
    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    #[must_use]
    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    #[must_use]
    pub fn add(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Add, other)
    }

    #[must_use]
    pub fn sub(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Sub, other)
    }

    #[must_use]
    pub fn mul(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Mul, other)
    }

    #[must_use]
    pub fn div(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Div, other)
    }

    #[must_use]
    pub fn modulo(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Mod, other)
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::from_node(ExprNode::Not(self))
    }

    #[must_use]
    pub fn is_null(self) -> Self {
        Self::from_node(ExprNode::IsNull(self))
    }

    #[must_use]
    pub fn is_not_null(self) -> Self {
        self.is_null().not()
    }

    /// Runtime type test (`x is T`), for entity or interface types.
    #[must_use]
    pub fn is_type(self, type_name: impl Into<String>) -> Self {
        Self::from_node(ExprNode::IsType {
            expr: self,
            type_name: type_name.into(),
        })
    }

    pub fn conditional(
        test: impl Into<Expr>,
        if_true: impl Into<Expr>,
        if_false: impl Into<Expr>,
    ) -> Self {
        Self::from_node(ExprNode::Conditional {
            test: test.into(),
            if_true: if_true.into(),
            if_false: if_false.into(),
        })
    }

    #[must_use]
    pub fn coalesce(self, fallback: impl Into<Expr>) -> Self {
        Self::from_node(ExprNode::Coalesce(self, fallback.into()))
    }

    /// `self IN (values...)` over a local collection.
    #[must_use]
    pub fn is_in<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Self {
        Self::from_node(ExprNode::Contains {
            list: LocalList::Values(values.into_iter().map(Into::into).collect()),
            item: self,
        })
    }

    /// `self IN (...)` over a named array argument.
    #[must_use]
    pub fn is_in_param(self, name: impl Into<String>) -> Self {
        Self::from_node(ExprNode::Contains {
            list: LocalList::Param(name.into()),
            item: self,
        })
    }

    fn subquery(
        kind: SubqueryKind,
        source: Query,
        lambda: Option<Lambda>,
        item: Option<Expr>,
    ) -> Self {
        Self::from_node(ExprNode::Subquery {
            kind,
            source,
            lambda,
            item,
        })
    }

    /// `EXISTS` over a subquery.
    pub fn exists(source: Query) -> Self {
        Self::subquery(SubqueryKind::Any, source, None, None)
    }

    pub fn any(source: Query, predicate: impl FnOnce(Expr) -> Expr) -> Self {
        Self::subquery(SubqueryKind::Any, source, Some(Lambda::new(predicate)), None)
    }

    pub fn all(source: Query, predicate: impl FnOnce(Expr) -> Expr) -> Self {
        Self::subquery(SubqueryKind::All, source, Some(Lambda::new(predicate)), None)
    }

    pub fn count(source: Query) -> Self {
        Self::subquery(SubqueryKind::Count, source, None, None)
    }

    pub fn count_where(source: Query, predicate: impl FnOnce(Expr) -> Expr) -> Self {
        Self::subquery(SubqueryKind::Count, source, Some(Lambda::new(predicate)), None)
    }

    pub fn sum(source: Query, selector: impl FnOnce(Expr) -> Expr) -> Self {
        Self::subquery(SubqueryKind::Sum, source, Some(Lambda::new(selector)), None)
    }

    pub fn min(source: Query, selector: impl FnOnce(Expr) -> Expr) -> Self {
        Self::subquery(SubqueryKind::Min, source, Some(Lambda::new(selector)), None)
    }

    pub fn max(source: Query, selector: impl FnOnce(Expr) -> Expr) -> Self {
        Self::subquery(SubqueryKind::Max, source, Some(Lambda::new(selector)), None)
    }

    pub fn avg(source: Query, selector: impl FnOnce(Expr) -> Expr) -> Self {
        Self::subquery(SubqueryKind::Avg, source, Some(Lambda::new(selector)), None)
    }

    /// Selected value of the first element, NULL when the source is empty.
    pub fn first(source: Query, selector: impl FnOnce(Expr) -> Expr) -> Self {
        Self::subquery(SubqueryKind::First, source, Some(Lambda::new(selector)), None)
    }

    /// `item` is an element of `source`.
    pub fn contains(source: Query, item: impl Into<Expr>) -> Self {
        Self::subquery(SubqueryKind::Contains, source, None, Some(item.into()))
    }

    /// Group key of a grouping element.
    #[must_use]
    pub fn key(&self) -> Self {
        self.member("Key")
    }

    fn group_aggregate(&self, kind: AggregateKind, selector: Option<Lambda>) -> Self {
        Self::from_node(ExprNode::GroupAggregate {
            group: self.clone(),
            kind,
            selector,
        })
    }

    /// Number of elements in a group.
    #[must_use]
    pub fn group_count(&self) -> Self {
        self.group_aggregate(AggregateKind::Count, None)
    }

    #[must_use]
    pub fn group_sum(&self, selector: impl FnOnce(Expr) -> Expr) -> Self {
        self.group_aggregate(AggregateKind::Sum, Some(Lambda::new(selector)))
    }

    #[must_use]
    pub fn group_min(&self, selector: impl FnOnce(Expr) -> Expr) -> Self {
        self.group_aggregate(AggregateKind::Min, Some(Lambda::new(selector)))
    }

    #[must_use]
    pub fn group_max(&self, selector: impl FnOnce(Expr) -> Expr) -> Self {
        self.group_aggregate(AggregateKind::Max, Some(Lambda::new(selector)))
    }

    #[must_use]
    pub fn group_avg(&self, selector: impl FnOnce(Expr) -> Expr) -> Self {
        self.group_aggregate(AggregateKind::Avg, Some(Lambda::new(selector)))
    }

    /// An anonymous record of named values.
    pub fn record<N: Into<String>>(fields: impl IntoIterator<Item = (N, Expr)>) -> Self {
        Self::from_node(ExprNode::Record(
            fields.into_iter().map(|(n, e)| (n.into(), e)).collect(),
        ))
    }

    pub fn structure(value: StructureValue) -> Self {
        Self::from_node(ExprNode::StructureLiteral(value))
    }

    /// A reference to a stored entity by key.
    pub fn entity<V: Into<Value>>(
        type_name: impl Into<String>,
        key: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::from_node(ExprNode::EntityConstant {
            type_name: type_name.into(),
            key: key.into_iter().map(Into::into).collect(),
        })
    }

    /// An opaque method call.
    pub fn call(method: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::from_node(ExprNode::Call {
            method: method.into(),
            args,
        })
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::constant(value)
    }
}

impl From<&Expr> for Expr {
    fn from(expr: &Expr) -> Self {
        expr.clone()
    }
}

macro_rules! expr_from_value {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Expr {
            fn from(value: $ty) -> Self {
                Expr::constant(Value::from(value))
            }
        })*
    };
}

expr_from_value!(bool, i32, i64, f64, &str, String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_vars_are_distinct() {
        let a = Var::fresh("x");
        let b = Var::fresh("x");
        assert_ne!(a, b);
        assert_eq!(a.name(), "x");
    }

    #[test]
    fn lambda_binds_its_parameter() {
        let lambda = Lambda::new(|x| x.member("Age").ge(18));
        let ExprNode::Binary { op, left, .. } = lambda.body.node() else {
            panic!("expected comparison");
        };
        assert_eq!(*op, BinaryOp::Ge);
        let ExprNode::Member { target, name } = left.node() else {
            panic!("expected member");
        };
        assert_eq!(name, "Age");
        assert!(matches!(target.node(), ExprNode::Var(v) if *v == lambda.params[0]));
    }

    #[test]
    fn path_builds_nested_members() {
        let v = Var::fresh("b");
        let e = Expr::var(&v).path("Author.Address.City");
        let ExprNode::Member { name, target } = e.node() else {
            panic!("expected member");
        };
        assert_eq!(name, "City");
        assert!(matches!(target.node(), ExprNode::Member { name, .. } if name == "Address"));
    }

    #[test]
    fn clones_share_site_identity() {
        let list = Expr::constant(1).is_in([1, 2, 3]);
        let same = list.clone();
        let other = Expr::constant(1).is_in([1, 2, 3]);
        assert_eq!(list.site_id(), same.site_id());
        assert_ne!(list.site_id(), other.site_id());
    }
}
