//! Query nodes.
//!
//! A [`Query`] is an immutable tree describing a sequence. Builder methods
//! return new trees and never modify the receiver:
//!
//! ```ignore
//! let q = Query::all("Book")
//!     .filter(|b| b.path("Author.Name").eq("Le Guin"))
//!     .order_by(|b| b.member("Title"))
//!     .take(10);
//! ```

use std::fmt;
use std::sync::Arc;

use tessera_core::{ScalarType, Value};

use crate::expr::{AggregateKind, Expr, Lambda};

/// Element type of a statically empty sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementType {
    /// Entities of the named type or interface
    Entity(String),
    Scalar(ScalarType),
    /// Records with the given columns
    Record(Vec<(String, ScalarType)>),
}

/// Set operations between two sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetOperation {
    /// Distinct union
    Union,
    /// Concatenation, duplicates kept
    Concat,
    Except,
    Intersect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    Left,
}

/// A query node. Construct through [`Query`].
#[derive(Debug)]
pub enum QueryNode {
    /// Every stored instance of an entity type or interface, polymorphically.
    All(String),
    /// Rows supplied by the caller.
    Local {
        columns: Vec<(String, ScalarType)>,
        rows: Vec<Vec<Value>>,
        /// Single-column sequences yield scalars instead of records
        scalar: bool,
    },
    Empty(ElementType),
    /// Members of an entity-set navigation such as `owner.member("Items")`.
    Navigate(Expr),
    Filter {
        source: Query,
        predicate: Lambda,
    },
    Select {
        source: Query,
        selector: Lambda,
    },
    OfType {
        source: Query,
        type_name: String,
    },
    Join {
        kind: JoinType,
        left: Query,
        right: Query,
        left_key: Lambda,
        right_key: Lambda,
        result: Lambda,
    },
    GroupBy {
        source: Query,
        key: Lambda,
    },
    SetOp {
        op: SetOperation,
        left: Query,
        right: Query,
    },
    OrderBy {
        source: Query,
        key: Lambda,
        descending: bool,
        /// Appends to the existing ordering instead of replacing it
        then: bool,
    },
    Take {
        source: Query,
        count: u64,
    },
    Skip {
        source: Query,
        count: u64,
    },
    Distinct(Query),
    /// Scalar aggregate of the whole sequence.
    Aggregate {
        source: Query,
        kind: AggregateKind,
        selector: Option<Lambda>,
    },
    /// `true` when some element satisfies the predicate.
    Any {
        source: Query,
        predicate: Option<Lambda>,
    },
}

/// A shared, immutable query tree.
#[derive(Clone)]
pub struct Query(Arc<QueryNode>);

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Query {
    pub fn from_node(node: QueryNode) -> Self {
        Self(Arc::new(node))
    }

    pub fn node(&self) -> &QueryNode {
        &self.0
    }

    /// Identity of this node instance.
    pub fn site_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// All stored instances of an entity type or interface.
    pub fn all(type_name: impl Into<String>) -> Self {
        Self::from_node(QueryNode::All(type_name.into()))
    }

    /// A local sequence of records.
    pub fn local<N: Into<String>>(
        columns: impl IntoIterator<Item = (N, ScalarType)>,
        rows: Vec<Vec<Value>>,
    ) -> Self {
        Self::from_node(QueryNode::Local {
            columns: columns.into_iter().map(|(n, t)| (n.into(), t)).collect(),
            rows,
            scalar: false,
        })
    }

    /// A local sequence of scalars.
    pub fn local_values<V: Into<Value>>(ty: ScalarType, values: impl IntoIterator<Item = V>) -> Self {
        Self::from_node(QueryNode::Local {
            columns: vec![("Value".to_string(), ty)],
            rows: values.into_iter().map(|v| vec![v.into()]).collect(),
            scalar: true,
        })
    }

    pub fn empty(element: ElementType) -> Self {
        Self::from_node(QueryNode::Empty(element))
    }

    /// Members of an entity set reached through `expr`.
    pub fn navigate(expr: Expr) -> Self {
        Self::from_node(QueryNode::Navigate(expr))
    }

    #[must_use]
    pub fn filter(&self, predicate: impl FnOnce(Expr) -> Expr) -> Self {
        Self::from_node(QueryNode::Filter {
            source: self.clone(),
            predicate: Lambda::new(predicate),
        })
    }

    #[must_use]
    pub fn select(&self, selector: impl FnOnce(Expr) -> Expr) -> Self {
        Self::from_node(QueryNode::Select {
            source: self.clone(),
            selector: Lambda::new(selector),
        })
    }

    /// Elements whose runtime type is, or derives from, or implements `type_name`.
    #[must_use]
    pub fn of_type(&self, type_name: impl Into<String>) -> Self {
        Self::from_node(QueryNode::OfType {
            source: self.clone(),
            type_name: type_name.into(),
        })
    }

    fn join_with(
        &self,
        kind: JoinType,
        right: &Query,
        left_key: impl FnOnce(Expr) -> Expr,
        right_key: impl FnOnce(Expr) -> Expr,
        result: impl FnOnce(Expr, Expr) -> Expr,
    ) -> Self {
        Self::from_node(QueryNode::Join {
            kind,
            left: self.clone(),
            right: right.clone(),
            left_key: Lambda::new(left_key),
            right_key: Lambda::new(right_key),
            result: Lambda::new2(result),
        })
    }

    /// Inner equi-join.
    #[must_use]
    pub fn join(
        &self,
        right: &Query,
        left_key: impl FnOnce(Expr) -> Expr,
        right_key: impl FnOnce(Expr) -> Expr,
        result: impl FnOnce(Expr, Expr) -> Expr,
    ) -> Self {
        self.join_with(JoinType::Inner, right, left_key, right_key, result)
    }

    /// Left outer equi-join; unmatched right elements read as NULL.
    #[must_use]
    pub fn left_join(
        &self,
        right: &Query,
        left_key: impl FnOnce(Expr) -> Expr,
        right_key: impl FnOnce(Expr) -> Expr,
        result: impl FnOnce(Expr, Expr) -> Expr,
    ) -> Self {
        self.join_with(JoinType::Left, right, left_key, right_key, result)
    }

    /// Group elements by key. Follow with [`Query::select`] over the groups.
    #[must_use]
    pub fn group_by(&self, key: impl FnOnce(Expr) -> Expr) -> Self {
        Self::from_node(QueryNode::GroupBy {
            source: self.clone(),
            key: Lambda::new(key),
        })
    }

    fn set_op(&self, op: SetOperation, right: &Query) -> Self {
        Self::from_node(QueryNode::SetOp {
            op,
            left: self.clone(),
            right: right.clone(),
        })
    }

    #[must_use]
    pub fn union(&self, right: &Query) -> Self {
        self.set_op(SetOperation::Union, right)
    }

    #[must_use]
    pub fn concat(&self, right: &Query) -> Self {
        self.set_op(SetOperation::Concat, right)
    }

    #[must_use]
    pub fn except(&self, right: &Query) -> Self {
        self.set_op(SetOperation::Except, right)
    }

    #[must_use]
    pub fn intersect(&self, right: &Query) -> Self {
        self.set_op(SetOperation::Intersect, right)
    }

    fn ordered(&self, key: impl FnOnce(Expr) -> Expr, descending: bool, then: bool) -> Self {
        Self::from_node(QueryNode::OrderBy {
            source: self.clone(),
            key: Lambda::new(key),
            descending,
            then,
        })
    }

    #[must_use]
    pub fn order_by(&self, key: impl FnOnce(Expr) -> Expr) -> Self {
        self.ordered(key, false, false)
    }

    #[must_use]
    pub fn order_by_desc(&self, key: impl FnOnce(Expr) -> Expr) -> Self {
        self.ordered(key, true, false)
    }

    #[must_use]
    pub fn then_by(&self, key: impl FnOnce(Expr) -> Expr) -> Self {
        self.ordered(key, false, true)
    }

    #[must_use]
    pub fn then_by_desc(&self, key: impl FnOnce(Expr) -> Expr) -> Self {
        self.ordered(key, true, true)
    }

    #[must_use]
    pub fn take(&self, count: u64) -> Self {
        Self::from_node(QueryNode::Take {
            source: self.clone(),
            count,
        })
    }

    #[must_use]
    pub fn skip(&self, count: u64) -> Self {
        Self::from_node(QueryNode::Skip {
            source: self.clone(),
            count,
        })
    }

    #[must_use]
    pub fn distinct(&self) -> Self {
        Self::from_node(QueryNode::Distinct(self.clone()))
    }

    fn aggregate(&self, kind: AggregateKind, selector: Option<Lambda>) -> Self {
        Self::from_node(QueryNode::Aggregate {
            source: self.clone(),
            kind,
            selector,
        })
    }

    /// Number of elements.
    #[must_use]
    pub fn count(&self) -> Self {
        self.aggregate(AggregateKind::Count, None)
    }

    /// Sum of the selected values; zero over an empty sequence.
    #[must_use]
    pub fn sum(&self, selector: impl FnOnce(Expr) -> Expr) -> Self {
        self.aggregate(AggregateKind::Sum, Some(Lambda::new(selector)))
    }

    #[must_use]
    pub fn min(&self, selector: impl FnOnce(Expr) -> Expr) -> Self {
        self.aggregate(AggregateKind::Min, Some(Lambda::new(selector)))
    }

    #[must_use]
    pub fn max(&self, selector: impl FnOnce(Expr) -> Expr) -> Self {
        self.aggregate(AggregateKind::Max, Some(Lambda::new(selector)))
    }

    #[must_use]
    pub fn avg(&self, selector: impl FnOnce(Expr) -> Expr) -> Self {
        self.aggregate(AggregateKind::Avg, Some(Lambda::new(selector)))
    }

    #[must_use]
    pub fn any(&self) -> Self {
        Self::from_node(QueryNode::Any {
            source: self.clone(),
            predicate: None,
        })
    }

    #[must_use]
    pub fn any_where(&self, predicate: impl FnOnce(Expr) -> Expr) -> Self {
        Self::from_node(QueryNode::Any {
            source: self.clone(),
            predicate: Some(Lambda::new(predicate)),
        })
    }

    /// Whether the query yields a single scalar (`count`, `sum`, `any`, ...).
    pub fn is_scalar(&self) -> bool {
        matches!(
            self.node(),
            QueryNode::Aggregate { .. } | QueryNode::Any { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_leave_receiver_untouched() {
        let base = Query::all("Book");
        let filtered = base.filter(|b| b.member("Pages").gt(100));
        assert!(matches!(base.node(), QueryNode::All(name) if name == "Book"));
        let QueryNode::Filter { source, .. } = filtered.node() else {
            panic!("expected filter");
        };
        assert_eq!(source.site_id(), base.site_id());
    }

    #[test]
    fn local_values_are_single_column() {
        let q = Query::local_values(ScalarType::BigInt, [1i64, 2, 3]);
        let QueryNode::Local { columns, rows, scalar } = q.node() else {
            panic!("expected local");
        };
        assert!(*scalar);
        assert_eq!(columns.len(), 1);
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn aggregates_are_scalar() {
        let q = Query::all("Book");
        assert!(q.count().is_scalar());
        assert!(q.any_where(|b| b.member("Pages").gt(1)).is_scalar());
        assert!(!q.take(3).is_scalar());
    }
}
