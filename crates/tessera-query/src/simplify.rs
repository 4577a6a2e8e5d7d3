//! Static simplification of query trees.
//!
//! The simplifier removes operands that are empty by construction (empty
//! local sequences, `take(0)`, constant-false filters) and reports whether the
//! whole tree is statically empty. Untouched subtrees keep their node
//! identity, so local-collection sites survive simplification.

use tessera_core::Value;

use crate::expr::ExprNode;
use crate::query::{JoinType, Query, QueryNode, SetOperation};

/// Result of [`simplify`].
#[derive(Debug, Clone)]
pub struct Simplified {
    pub query: Query,
    /// The tree yields no rows regardless of storage contents
    pub is_empty: bool,
}

/// Simplify `query`.
pub fn simplify(query: &Query) -> Simplified {
    let (query, is_empty) = go(query);
    Simplified { query, is_empty }
}

fn constant_predicate(body: &crate::expr::Expr) -> Option<bool> {
    match body.node() {
        ExprNode::Constant(Value::Bool(b)) => Some(*b),
        ExprNode::Constant(Value::Null) => Some(false),
        _ => None,
    }
}

fn same(a: &Query, b: &Query) -> bool {
    a.site_id() == b.site_id()
}

#[allow(clippy::too_many_lines)]
fn go(q: &Query) -> (Query, bool) {
    match q.node() {
        QueryNode::All(_) | QueryNode::Navigate(_) => (q.clone(), false),
        QueryNode::Local { rows, .. } => (q.clone(), rows.is_empty()),
        QueryNode::Empty(_) => (q.clone(), true),
        QueryNode::Filter { source, predicate } => {
            let (s, empty) = go(source);
            match constant_predicate(&predicate.body) {
                Some(true) => (s, empty),
                constant => {
                    let rebuilt = if same(&s, source) {
                        q.clone()
                    } else {
                        Query::from_node(QueryNode::Filter {
                            source: s,
                            predicate: predicate.clone(),
                        })
                    };
                    (rebuilt, empty || constant == Some(false))
                }
            }
        }
        QueryNode::Select { source, selector } => {
            let (s, empty) = go(source);
            let rebuilt = if same(&s, source) {
                q.clone()
            } else {
                Query::from_node(QueryNode::Select {
                    source: s,
                    selector: selector.clone(),
                })
            };
            (rebuilt, empty)
        }
        QueryNode::OfType { source, type_name } => {
            let (s, empty) = go(source);
            let rebuilt = if same(&s, source) {
                q.clone()
            } else {
                Query::from_node(QueryNode::OfType {
                    source: s,
                    type_name: type_name.clone(),
                })
            };
            (rebuilt, empty)
        }
        QueryNode::Join {
            kind,
            left,
            right,
            left_key,
            right_key,
            result,
        } => {
            let (l, l_empty) = go(left);
            let (r, r_empty) = go(right);
            let empty = match kind {
                JoinType::Inner => l_empty || r_empty,
                JoinType::Left => l_empty,
            };
            let rebuilt = if same(&l, left) && same(&r, right) {
                q.clone()
            } else {
                Query::from_node(QueryNode::Join {
                    kind: *kind,
                    left: l,
                    right: r,
                    left_key: left_key.clone(),
                    right_key: right_key.clone(),
                    result: result.clone(),
                })
            };
            (rebuilt, empty)
        }
        QueryNode::GroupBy { source, key } => {
            let (s, empty) = go(source);
            let rebuilt = if same(&s, source) {
                q.clone()
            } else {
                Query::from_node(QueryNode::GroupBy {
                    source: s,
                    key: key.clone(),
                })
            };
            (rebuilt, empty)
        }
        QueryNode::SetOp { op, left, right } => {
            let (l, l_empty) = go(left);
            let (r, r_empty) = go(right);
            match (op, l_empty, r_empty) {
                (_, true, true) => (l, true),
                (SetOperation::Concat, true, false) => (r, false),
                (SetOperation::Concat, false, true) => (l, false),
                (SetOperation::Union, true, false) => (r.distinct(), false),
                (SetOperation::Union | SetOperation::Except, false, true) => (l.distinct(), false),
                (SetOperation::Except | SetOperation::Intersect, true, false) => (l, true),
                (SetOperation::Intersect, false, true) => (r, true),
                (_, false, false) => {
                    let rebuilt = if same(&l, left) && same(&r, right) {
                        q.clone()
                    } else {
                        Query::from_node(QueryNode::SetOp {
                            op: *op,
                            left: l,
                            right: r,
                        })
                    };
                    (rebuilt, false)
                }
            }
        }
        QueryNode::OrderBy {
            source,
            key,
            descending,
            then,
        } => {
            let (s, empty) = go(source);
            let rebuilt = if same(&s, source) {
                q.clone()
            } else {
                Query::from_node(QueryNode::OrderBy {
                    source: s,
                    key: key.clone(),
                    descending: *descending,
                    then: *then,
                })
            };
            (rebuilt, empty)
        }
        QueryNode::Take { source, count } => {
            let (s, empty) = go(source);
            let rebuilt = if same(&s, source) { q.clone() } else { s.take(*count) };
            (rebuilt, empty || *count == 0)
        }
        QueryNode::Skip { source, count } => {
            let (s, empty) = go(source);
            let rebuilt = if same(&s, source) { q.clone() } else { s.skip(*count) };
            (rebuilt, empty)
        }
        QueryNode::Distinct(source) => {
            let (s, empty) = go(source);
            let rebuilt = if same(&s, source) { q.clone() } else { s.distinct() };
            (rebuilt, empty)
        }
        QueryNode::Aggregate {
            source,
            kind,
            selector,
        } => {
            let (s, _) = go(source);
            let rebuilt = if same(&s, source) {
                q.clone()
            } else {
                Query::from_node(QueryNode::Aggregate {
                    source: s,
                    kind: *kind,
                    selector: selector.clone(),
                })
            };
            (rebuilt, false)
        }
        QueryNode::Any { source, predicate } => {
            let (s, _) = go(source);
            let rebuilt = if same(&s, source) {
                q.clone()
            } else {
                Query::from_node(QueryNode::Any {
                    source: s,
                    predicate: predicate.clone(),
                })
            };
            (rebuilt, false)
        }
    }
}
