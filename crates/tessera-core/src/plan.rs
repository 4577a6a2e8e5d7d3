//! Relational query plans.
//!
//! The translator lowers query trees into a [`QueryPlan`]; drivers execute
//! plans directly or render them to SQL with [`crate::sql`]. Parameters are
//! referenced by slot; a slot bound to [`Value::Array`] expands into a list
//! (`IN` lists and `VALUES` sources).

use crate::value::Value;

/// Kind of set operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetOpKind {
    /// Distinct union
    Union,
    /// Concatenation, duplicates kept
    UnionAll,
    /// Distinct difference
    Except,
    /// Distinct intersection
    Intersect,
}

impl SetOpKind {
    pub const fn as_sql(self) -> &'static str {
        match self {
            SetOpKind::Union => "UNION",
            SetOpKind::UnionAll => "UNION ALL",
            SetOpKind::Except => "EXCEPT",
            SetOpKind::Intersect => "INTERSECT",
        }
    }
}

/// A relational plan producing rows with named columns.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    Select(Box<SelectPlan>),
    SetOp {
        op: SetOpKind,
        left: Box<QueryPlan>,
        right: Box<QueryPlan>,
    },
    /// Statically empty result; never sent to storage.
    Empty { columns: Vec<String> },
}

impl QueryPlan {
    /// Names of the output columns.
    pub fn output_columns(&self) -> Vec<String> {
        match self {
            QueryPlan::Select(select) => select.projection.iter().map(|p| p.alias.clone()).collect(),
            QueryPlan::SetOp { left, .. } => left.output_columns(),
            QueryPlan::Empty { columns } => columns.clone(),
        }
    }

    /// `true` when the whole plan is statically empty.
    pub fn is_empty_plan(&self) -> bool {
        matches!(self, QueryPlan::Empty { .. })
    }

    /// Highest parameter slot referenced, plus one.
    pub fn param_count(&self) -> usize {
        let mut max = 0;
        self.visit_params(&mut |slot| max = max.max(slot + 1));
        max
    }

    /// Call `f` for every parameter slot referenced by the plan.
    pub fn visit_params(&self, f: &mut dyn FnMut(usize)) {
        match self {
            QueryPlan::Select(select) => select.visit_params(f),
            QueryPlan::SetOp { left, right, .. } => {
                left.visit_params(f);
                right.visit_params(f);
            }
            QueryPlan::Empty { .. } => {}
        }
    }
}

/// `SELECT ... FROM ... [JOIN ...] WHERE ... GROUP BY ... HAVING ... ORDER BY ...`
#[derive(Debug, Clone, PartialEq)]
pub struct SelectPlan {
    pub from: Source,
    pub joins: Vec<JoinPlan>,
    pub filter: Option<ScalarExpr>,
    pub group_by: Vec<ScalarExpr>,
    pub having: Option<ScalarExpr>,
    pub projection: Vec<ProjectionItem>,
    pub distinct: bool,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectPlan {
    /// A plain `SELECT` over one source with no projection yet.
    pub fn from_source(from: Source) -> Self {
        Self {
            from,
            joins: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            having: None,
            projection: Vec::new(),
            distinct: false,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// AND a predicate into the `WHERE` clause.
    pub fn and_filter(&mut self, predicate: ScalarExpr) {
        self.filter = Some(match self.filter.take() {
            Some(existing) => ScalarExpr::binary(BinaryOp::And, existing, predicate),
            None => predicate,
        });
    }

    /// `true` when the select carries grouping or aggregates.
    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty() || self.projection.iter().any(|p| p.expr.contains_aggregate())
    }

    fn visit_params(&self, f: &mut dyn FnMut(usize)) {
        self.from.visit_params(f);
        for join in &self.joins {
            join.source.visit_params(f);
            join.on.visit_params(f);
        }
        let exprs = self
            .filter
            .iter()
            .chain(&self.group_by)
            .chain(&self.having)
            .chain(self.projection.iter().map(|p| &p.expr))
            .chain(self.order_by.iter().map(|o| &o.expr));
        for expr in exprs {
            expr.visit_params(f);
        }
    }
}

/// Row source of a `SELECT`.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Table {
        name: String,
        alias: String,
    },
    Subquery {
        plan: Box<QueryPlan>,
        alias: String,
    },
    /// Inline rows bound through a parameter slot holding an array of row arrays.
    Values {
        columns: Vec<String>,
        slot: usize,
        alias: String,
    },
    /// A per-connection temporary table created before the query runs.
    TempTable {
        name: String,
        columns: Vec<String>,
        alias: String,
    },
}

impl Source {
    pub fn alias(&self) -> &str {
        match self {
            Source::Table { alias, .. }
            | Source::Subquery { alias, .. }
            | Source::Values { alias, .. }
            | Source::TempTable { alias, .. } => alias,
        }
    }

    fn visit_params(&self, f: &mut dyn FnMut(usize)) {
        match self {
            Source::Subquery { plan, .. } => plan.visit_params(f),
            Source::Values { slot, .. } => f(*slot),
            Source::Table { .. } | Source::TempTable { .. } => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinPlan {
    pub kind: JoinKind,
    pub source: Source,
    pub on: ScalarExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionItem {
    pub expr: ScalarExpr,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: ScalarExpr,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Null-safe equality (`IS NOT DISTINCT FROM`)
    NullSafeEq,
    /// Null-safe inequality (`IS DISTINCT FROM`)
    NullSafeNe,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    pub const fn as_sql(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::NullSafeEq => "IS NOT DISTINCT FROM",
            BinaryOp::NullSafeNe => "IS DISTINCT FROM",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }

    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::NullSafeEq
                | BinaryOp::NullSafeNe
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunc {
    Count,
    CountStar,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub const fn as_sql(self) -> &'static str {
        match self {
            AggregateFunc::Count | AggregateFunc::CountStar => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }
}

/// Scalar expression over the columns in scope.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    /// Column of a source in scope; the alias may belong to an enclosing select.
    Column { alias: String, column: String },
    Param(usize),
    Literal(Value),
    Binary {
        op: BinaryOp,
        left: Box<ScalarExpr>,
        right: Box<ScalarExpr>,
    },
    Not(Box<ScalarExpr>),
    IsNull(Box<ScalarExpr>),
    /// `expr IN (a, b, ...)` over inline expressions
    InList {
        expr: Box<ScalarExpr>,
        list: Vec<ScalarExpr>,
        negated: bool,
    },
    /// `expr IN (...)` over a list parameter
    InParam {
        expr: Box<ScalarExpr>,
        slot: usize,
    },
    InSubquery {
        expr: Box<ScalarExpr>,
        plan: Box<QueryPlan>,
    },
    Exists(Box<QueryPlan>),
    /// First column of the first row, NULL when there is none
    Subquery(Box<QueryPlan>),
    Aggregate {
        func: AggregateFunc,
        arg: Option<Box<ScalarExpr>>,
        distinct: bool,
    },
    Coalesce(Vec<ScalarExpr>),
    Case {
        branches: Vec<(ScalarExpr, ScalarExpr)>,
        otherwise: Box<ScalarExpr>,
    },
}

impl ScalarExpr {
    pub fn column(alias: impl Into<String>, column: impl Into<String>) -> Self {
        ScalarExpr::Column {
            alias: alias.into(),
            column: column.into(),
        }
    }

    pub fn binary(op: BinaryOp, left: ScalarExpr, right: ScalarExpr) -> Self {
        ScalarExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Boolean negation that folds double negation.
    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            ScalarExpr::Not(inner) => *inner,
            other => ScalarExpr::Not(Box::new(other)),
        }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        ScalarExpr::Literal(value.into())
    }

    /// AND all predicates together; `TRUE` when empty.
    pub fn conjunction(predicates: impl IntoIterator<Item = ScalarExpr>) -> Self {
        predicates
            .into_iter()
            .reduce(|acc, p| ScalarExpr::binary(BinaryOp::And, acc, p))
            .unwrap_or(ScalarExpr::Literal(Value::Bool(true)))
    }

    /// OR all predicates together; `FALSE` when empty.
    pub fn disjunction(predicates: impl IntoIterator<Item = ScalarExpr>) -> Self {
        predicates
            .into_iter()
            .reduce(|acc, p| ScalarExpr::binary(BinaryOp::Or, acc, p))
            .unwrap_or(ScalarExpr::Literal(Value::Bool(false)))
    }

    /// Whether the expression contains an aggregate outside nested subqueries.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            ScalarExpr::Aggregate { .. } => true,
            ScalarExpr::Binary { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            ScalarExpr::Not(e) | ScalarExpr::IsNull(e) | ScalarExpr::InParam { expr: e, .. } => {
                e.contains_aggregate()
            }
            ScalarExpr::InList { expr, list, .. } => {
                expr.contains_aggregate() || list.iter().any(ScalarExpr::contains_aggregate)
            }
            ScalarExpr::InSubquery { expr, .. } => expr.contains_aggregate(),
            ScalarExpr::Coalesce(items) => items.iter().any(ScalarExpr::contains_aggregate),
            ScalarExpr::Case {
                branches,
                otherwise,
            } => {
                otherwise.contains_aggregate()
                    || branches
                        .iter()
                        .any(|(w, t)| w.contains_aggregate() || t.contains_aggregate())
            }
            ScalarExpr::Column { .. }
            | ScalarExpr::Param(_)
            | ScalarExpr::Literal(_)
            | ScalarExpr::Exists(_)
            | ScalarExpr::Subquery(_) => false,
        }
    }

    fn visit_params(&self, f: &mut dyn FnMut(usize)) {
        match self {
            ScalarExpr::Param(slot) => f(*slot),
            ScalarExpr::InParam { expr, slot } => {
                expr.visit_params(f);
                f(*slot);
            }
            ScalarExpr::Binary { left, right, .. } => {
                left.visit_params(f);
                right.visit_params(f);
            }
            ScalarExpr::Not(e) | ScalarExpr::IsNull(e) => e.visit_params(f),
            ScalarExpr::InList { expr, list, .. } => {
                expr.visit_params(f);
                for item in list {
                    item.visit_params(f);
                }
            }
            ScalarExpr::InSubquery { expr, plan } => {
                expr.visit_params(f);
                plan.visit_params(f);
            }
            ScalarExpr::Exists(plan) | ScalarExpr::Subquery(plan) => plan.visit_params(f),
            ScalarExpr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.visit_params(f);
                }
            }
            ScalarExpr::Coalesce(items) => {
                for item in items {
                    item.visit_params(f);
                }
            }
            ScalarExpr::Case {
                branches,
                otherwise,
            } => {
                for (when, then) in branches {
                    when.visit_params(f);
                    then.visit_params(f);
                }
                otherwise.visit_params(f);
            }
            ScalarExpr::Column { .. } | ScalarExpr::Literal(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conjunction_folds_left() {
        let p = ScalarExpr::conjunction([
            ScalarExpr::literal(true),
            ScalarExpr::literal(false),
        ]);
        assert!(matches!(p, ScalarExpr::Binary { op: BinaryOp::And, .. }));
        assert_eq!(
            ScalarExpr::conjunction(Vec::new()),
            ScalarExpr::Literal(Value::Bool(true))
        );
    }

    #[test]
    fn negate_folds_double_not() {
        let e = ScalarExpr::column("t0", "A");
        assert_eq!(e.clone().negate().negate(), e);
    }

    #[test]
    fn param_count_walks_subqueries() {
        let inner = SelectPlan {
            filter: Some(ScalarExpr::InParam {
                expr: Box::new(ScalarExpr::column("t1", "Id")),
                slot: 3,
            }),
            ..SelectPlan::from_source(Source::Table {
                name: "B".into(),
                alias: "t1".into(),
            })
        };
        let mut outer = SelectPlan::from_source(Source::Table {
            name: "A".into(),
            alias: "t0".into(),
        });
        outer.and_filter(ScalarExpr::Exists(Box::new(QueryPlan::Select(Box::new(inner)))));
        outer.and_filter(ScalarExpr::binary(
            BinaryOp::Eq,
            ScalarExpr::column("t0", "X"),
            ScalarExpr::Param(0),
        ));
        assert_eq!(QueryPlan::Select(Box::new(outer)).param_count(), 4);
    }
}
