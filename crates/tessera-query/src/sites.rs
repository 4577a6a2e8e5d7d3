//! Structural fingerprints and local-collection sites.
//!
//! A site is one node instance holding caller data: a `Contains` over captured
//! values or a local source. Sites are numbered in pre-order of first
//! occurrence; a node instance shared at several positions is one site. The
//! fingerprint captures everything that shapes the plan (and the sharing of
//! sites) but none of the site values, so two queries with equal fingerprints
//! compile to the same plan and differ only in what they bind.

use std::collections::HashMap;
use std::fmt::Write;

use tessera_core::Value;

use crate::expr::{Expr, ExprNode, Lambda, LocalList};
use crate::query::{Query, QueryNode};

/// Values captured at one site.
#[derive(Debug, Clone, PartialEq)]
pub enum SiteValues {
    List(Vec<Value>),
    Rows(Vec<Vec<Value>>),
}

impl SiteValues {
    /// Number of parameters the values occupy when bound inline.
    pub fn param_len(&self) -> usize {
        match self {
            SiteValues::List(values) => values.len(),
            SiteValues::Rows(rows) => rows.iter().map(Vec::len).sum(),
        }
    }

    /// The values as one array parameter.
    pub fn to_param(&self) -> Value {
        match self {
            SiteValues::List(values) => Value::Array(values.clone()),
            SiteValues::Rows(rows) => {
                Value::Array(rows.iter().map(|r| Value::Array(r.clone())).collect())
            }
        }
    }
}

/// Fingerprint and sites of a query tree.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub fingerprint: String,
    /// Site number by node identity
    pub index: HashMap<usize, usize>,
    /// Values per site number
    pub values: Vec<SiteValues>,
}

/// Walk `query` once, computing its fingerprint and sites.
pub fn analyze(query: &Query) -> Analysis {
    let mut walker = Walker::default();
    walker.query(query);
    Analysis {
        fingerprint: walker.out,
        index: walker.index,
        values: walker.values,
    }
}

#[derive(Default)]
struct Walker {
    out: String,
    index: HashMap<usize, usize>,
    values: Vec<SiteValues>,
    vars: HashMap<u64, usize>,
}

impl Walker {
    /// Register a site; returns `false` when the node was already seen.
    fn site(&mut self, id: usize, values: impl FnOnce() -> SiteValues) -> bool {
        if let Some(n) = self.index.get(&id) {
            let _ = write!(self.out, "@{n}");
            return false;
        }
        let n = self.values.len();
        self.index.insert(id, n);
        self.values.push(values());
        let _ = write!(self.out, "#{n}");
        true
    }

    fn lambda(&mut self, lambda: &Lambda) {
        self.out.push_str("(\\");
        for param in &lambda.params {
            let n = self.vars.len();
            self.vars.insert(param.id(), n);
            let _ = write!(self.out, "v{n} ");
        }
        self.expr(&lambda.body);
        self.out.push(')');
    }

    fn opt_lambda(&mut self, lambda: Option<&Lambda>) {
        match lambda {
            Some(l) => self.lambda(l),
            None => self.out.push('_'),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn query(&mut self, q: &Query) {
        match q.node() {
            QueryNode::All(name) => {
                let _ = write!(self.out, "All({name})");
            }
            QueryNode::Local {
                columns,
                rows,
                scalar,
            } => {
                let _ = write!(self.out, "Local[{scalar}");
                for (name, ty) in columns {
                    let _ = write!(self.out, " {name}:{}", ty.name());
                }
                let _ = write!(self.out, " empty={}]", rows.is_empty());
                self.site(q.site_id(), || SiteValues::Rows(rows.clone()));
            }
            QueryNode::Empty(element) => {
                let _ = write!(self.out, "Empty({element:?})");
            }
            QueryNode::Navigate(expr) => {
                self.out.push_str("Nav(");
                self.expr(expr);
                self.out.push(')');
            }
            QueryNode::Filter { source, predicate } => {
                self.out.push_str("Where(");
                self.query(source);
                self.lambda(predicate);
                self.out.push(')');
            }
            QueryNode::Select { source, selector } => {
                self.out.push_str("Select(");
                self.query(source);
                self.lambda(selector);
                self.out.push(')');
            }
            QueryNode::OfType { source, type_name } => {
                self.out.push_str("OfType(");
                self.query(source);
                let _ = write!(self.out, ",{type_name})");
            }
            QueryNode::Join {
                kind,
                left,
                right,
                left_key,
                right_key,
                result,
            } => {
                let _ = write!(self.out, "Join{kind:?}(");
                self.query(left);
                self.query(right);
                self.lambda(left_key);
                self.lambda(right_key);
                self.lambda(result);
                self.out.push(')');
            }
            QueryNode::GroupBy { source, key } => {
                self.out.push_str("GroupBy(");
                self.query(source);
                self.lambda(key);
                self.out.push(')');
            }
            QueryNode::SetOp { op, left, right } => {
                let _ = write!(self.out, "{op:?}(");
                self.query(left);
                self.out.push(',');
                self.query(right);
                self.out.push(')');
            }
            QueryNode::OrderBy {
                source,
                key,
                descending,
                then,
            } => {
                let _ = write!(self.out, "Order[{descending},{then}](");
                self.query(source);
                self.lambda(key);
                self.out.push(')');
            }
            QueryNode::Take { source, count } => {
                let _ = write!(self.out, "Take[{count}](");
                self.query(source);
                self.out.push(')');
            }
            QueryNode::Skip { source, count } => {
                let _ = write!(self.out, "Skip[{count}](");
                self.query(source);
                self.out.push(')');
            }
            QueryNode::Distinct(source) => {
                self.out.push_str("Distinct(");
                self.query(source);
                self.out.push(')');
            }
            QueryNode::Aggregate {
                source,
                kind,
                selector,
            } => {
                let _ = write!(self.out, "{kind:?}(");
                self.query(source);
                self.opt_lambda(selector.as_ref());
                self.out.push(')');
            }
            QueryNode::Any { source, predicate } => {
                self.out.push_str("Any(");
                self.query(source);
                self.opt_lambda(predicate.as_ref());
                self.out.push(')');
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn expr(&mut self, e: &Expr) {
        match e.node() {
            ExprNode::Var(var) => match self.vars.get(&var.id()) {
                Some(n) => {
                    let _ = write!(self.out, "v{n}");
                }
                None => {
                    let _ = write!(self.out, "free:{}", var.name());
                }
            },
            ExprNode::Member { target, name } => {
                self.expr(target);
                let _ = write!(self.out, ".{name}");
            }
            ExprNode::Constant(value) => {
                let _ = write!(self.out, "c{value:?}");
            }
            ExprNode::Param(name) => {
                let _ = write!(self.out, "p:{name}");
            }
            ExprNode::Binary { op, left, right } => {
                let _ = write!(self.out, "{op:?}(");
                self.expr(left);
                self.out.push(',');
                self.expr(right);
                self.out.push(')');
            }
            ExprNode::Not(inner) => {
                self.out.push('!');
                self.expr(inner);
            }
            ExprNode::IsNull(inner) => {
                self.out.push_str("IsNull(");
                self.expr(inner);
                self.out.push(')');
            }
            ExprNode::IsType { expr, type_name } => {
                self.out.push_str("Is(");
                self.expr(expr);
                let _ = write!(self.out, ",{type_name})");
            }
            ExprNode::Conditional {
                test,
                if_true,
                if_false,
            } => {
                self.out.push_str("If(");
                self.expr(test);
                self.out.push(',');
                self.expr(if_true);
                self.out.push(',');
                self.expr(if_false);
                self.out.push(')');
            }
            ExprNode::Coalesce(a, b) => {
                self.out.push_str("Coalesce(");
                self.expr(a);
                self.out.push(',');
                self.expr(b);
                self.out.push(')');
            }
            ExprNode::Contains { list, item } => {
                self.out.push_str("In(");
                match list {
                    LocalList::Values(values) => {
                        if self.site(e.site_id(), || SiteValues::List(values.clone())) {
                            self.expr(item);
                        }
                    }
                    LocalList::Param(name) => {
                        let _ = write!(self.out, "p:{name},");
                        self.expr(item);
                    }
                }
                self.out.push(')');
            }
            ExprNode::Subquery {
                kind,
                source,
                lambda,
                item,
            } => {
                let _ = write!(self.out, "Sub{kind:?}(");
                self.query(source);
                self.opt_lambda(lambda.as_ref());
                if let Some(item) = item {
                    self.expr(item);
                }
                self.out.push(')');
            }
            ExprNode::GroupAggregate {
                group,
                kind,
                selector,
            } => {
                let _ = write!(self.out, "G{kind:?}(");
                self.expr(group);
                self.opt_lambda(selector.as_ref());
                self.out.push(')');
            }
            ExprNode::Record(fields) => {
                self.out.push('{');
                for (name, value) in fields {
                    let _ = write!(self.out, "{name}:");
                    self.expr(value);
                    self.out.push(',');
                }
                self.out.push('}');
            }
            ExprNode::StructureLiteral(value) => {
                let _ = write!(self.out, "s{value:?}");
            }
            ExprNode::EntityConstant { type_name, key } => {
                let _ = write!(self.out, "e:{type_name}{key:?}");
            }
            ExprNode::Call { method, args } => {
                let _ = write!(self.out, "call:{method}(");
                for arg in args {
                    self.expr(arg);
                    self.out.push(',');
                }
                self.out.push(')');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_lists(a: &[i64], b: &[i64]) -> Query {
        let a = a.to_vec();
        let b = b.to_vec();
        Query::all("Book").filter(move |x| {
            x.member("Pages")
                .is_in(a)
                .and(x.member("Year").is_in(b))
        })
    }

    #[test]
    fn fingerprint_ignores_site_values() {
        let one = analyze(&two_lists(&[1, 2], &[3]));
        let two = analyze(&two_lists(&[9], &[8, 7, 6]));
        assert_eq!(one.fingerprint, two.fingerprint);
        assert_eq!(two.values[0], SiteValues::List(vec![Value::BigInt(9)]));
        assert_eq!(two.values[1].param_len(), 3);
    }

    #[test]
    fn distinct_sites_get_distinct_numbers() {
        let analysis = analyze(&two_lists(&[1], &[1]));
        assert_eq!(analysis.values.len(), 2);
        let mut numbers: Vec<_> = analysis.index.values().copied().collect();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![0, 1]);
    }

    #[test]
    fn shared_site_is_numbered_once() {
        let shared = Expr::param("n").is_in([1i64, 2]);
        let q = Query::all("Book")
            .filter(|_| shared.clone())
            .concat(&Query::all("Book").filter(|_| shared.clone()));
        let analysis = analyze(&q);
        assert_eq!(analysis.values.len(), 1);

        let unshared = Query::all("Book")
            .filter(|_| Expr::param("n").is_in([1i64, 2]))
            .concat(&Query::all("Book").filter(|_| Expr::param("n").is_in([1i64, 2])));
        let other = analyze(&unshared);
        assert_eq!(other.values.len(), 2);
        assert_ne!(analysis.fingerprint, other.fingerprint);
    }

    #[test]
    fn variables_are_normalized() {
        let a = analyze(&Query::all("Book").filter(|b| b.member("Pages").gt(1)));
        let b = analyze(&Query::all("Book").filter(|b| b.member("Pages").gt(1)));
        assert_eq!(a.fingerprint, b.fingerprint);
        let c = analyze(&Query::all("Book").filter(|b| b.member("Pages").gt(2)));
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn local_rows_are_a_site() {
        let q = Query::local_values(tessera_core::ScalarType::BigInt, [1i64, 2]);
        let analysis = analyze(&q);
        assert_eq!(
            analysis.values,
            vec![SiteValues::Rows(vec![vec![Value::BigInt(1)], vec![Value::BigInt(2)]])]
        );
    }
}
