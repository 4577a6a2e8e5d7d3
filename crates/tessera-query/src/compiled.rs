//! Compiled queries and parameter binding.
//!
//! A [`CompiledQuery`] depends only on the structural fingerprint of the query
//! it came from. Binding re-reads the caller data (local lists, local rows)
//! from the query being executed, so one cached plan serves every query of
//! the same shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tessera_core::{
    DomainModel, DriverCapabilities, Error, ProjectionItem, QueryPlan, Result, ScalarExpr,
    SelectPlan, Source, Statement, Value,
};

use crate::query::Query;
use crate::shape::ResultShape;
use crate::sites::{Analysis, SiteValues, analyze};
use crate::translate::translate;

/// What fills a parameter slot at bind time.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotKind {
    /// A named scalar argument
    Named(String),
    /// A named list argument (`Value::Array`)
    NamedList(String),
    /// The values captured at a local-collection site
    Site(usize),
    Constant(Value),
}

/// Named arguments of a query execution.
#[derive(Debug, Clone, Default)]
pub struct Args {
    values: HashMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

/// A translated query, independent of the values it binds.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    plan: QueryPlan,
    shape: ResultShape,
    slots: Vec<SlotKind>,
    fingerprint: String,
}

/// A compiled query bound to concrete parameters.
#[derive(Debug, Clone)]
pub struct BoundQuery {
    pub plan: QueryPlan,
    pub params: Vec<Value>,
    pub shape: ResultShape,
    /// Statements to run before the query (temp tables)
    pub setup: Vec<Statement>,
    /// Statements to run after the query has been read
    pub teardown: Vec<Statement>,
}

/// Translate `query` against `model`.
///
/// Fails with `QueryTranslation` when the query has no relational form; no
/// I/O happens before this point.
#[tracing::instrument(level = "debug", skip_all)]
#[allow(clippy::result_large_err)]
pub fn compile(model: &DomainModel, query: &Query) -> Result<CompiledQuery> {
    let analysis = analyze(query);
    compile_analyzed(model, query, &analysis)
}

#[allow(clippy::result_large_err)]
pub(crate) fn compile_analyzed(model: &DomainModel, query: &Query, analysis: &Analysis) -> Result<CompiledQuery> {
    let translation = translate(model, query, &analysis.index)?;
    tracing::debug!(
        slots = translation.slots.len(),
        empty = translation.plan.is_empty_plan(),
        "compiled query"
    );
    Ok(CompiledQuery {
        plan: translation.plan,
        shape: translation.shape,
        slots: translation.slots,
        fingerprint: analysis.fingerprint.clone(),
    })
}

impl CompiledQuery {
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    pub fn shape(&self) -> &ResultShape {
        &self.shape
    }

    pub fn slots(&self) -> &[SlotKind] {
        &self.slots
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// `true` when the query is statically empty and needs no round trip.
    pub fn is_empty(&self) -> bool {
        self.plan.is_empty_plan()
    }

    /// Bind the plan to the data of `query`, which must have this plan's shape.
    #[allow(clippy::result_large_err)]
    pub fn bind(&self, query: &Query, args: &Args, caps: &DriverCapabilities) -> Result<BoundQuery> {
        let analysis = analyze(query);
        self.bind_analysis(&analysis, args, caps)
    }

    /// Like [`CompiledQuery::bind`] for an already analyzed query.
    #[allow(clippy::result_large_err)]
    pub fn bind_analysis(&self, analysis: &Analysis, args: &Args, caps: &DriverCapabilities) -> Result<BoundQuery> {
        if analysis.fingerprint != self.fingerprint {
            return Err(Error::invalid_operation(
                "query does not have the shape of the compiled query",
            ));
        }
        let mut plan = self.plan.clone();
        let mut params = Vec::with_capacity(self.slots.len());
        let mut setup = Vec::new();
        let mut teardown = Vec::new();
        let mut bind_id = None;

        for (slot, kind) in self.slots.iter().enumerate() {
            let values = match kind {
                SlotKind::Named(name) => {
                    params.push(argument(args, name)?.clone());
                    continue;
                }
                SlotKind::Constant(value) => {
                    params.push(value.clone());
                    continue;
                }
                SlotKind::NamedList(name) => match argument(args, name)? {
                    Value::Array(items) => SiteValues::List(items.clone()),
                    other => {
                        return Err(Error::invalid_operation(format!(
                            "argument '{name}' must be a list, got {}",
                            other.type_name()
                        )));
                    }
                },
                SlotKind::Site(site) => analysis.values.get(*site).cloned().ok_or_else(|| {
                    Error::invalid_operation(format!("query has no local collection #{site}"))
                })?,
            };

            let len = values.param_len();
            if len <= caps.max_query_params {
                params.push(values.to_param());
                continue;
            }
            if !caps.temp_tables {
                tracing::warn!(
                    slot,
                    len,
                    max = caps.max_query_params,
                    "parameter list exceeds the driver limit and temp tables are unavailable"
                );
                params.push(values.to_param());
                continue;
            }
            // Bound queries may run side by side on one connection.
            let id = *bind_id.get_or_insert_with(|| NEXT_BIND.fetch_add(1, Ordering::Relaxed));
            let name = format!("tessera_tmp_{id}_{slot}");
            let columns = rewrite_plan(&mut plan, slot, &name)
                .unwrap_or_else(|| vec![TEMP_VALUE_COLUMN.to_string()]);
            let rows = match values {
                SiteValues::List(items) => items.into_iter().map(|v| vec![v]).collect(),
                SiteValues::Rows(rows) => rows,
            };
            tracing::debug!(slot, len, table = %name, "binding oversized list through a temp table");
            setup.push(Statement::CreateTempTable {
                name: name.clone(),
                columns,
                rows,
            });
            teardown.push(Statement::DropTempTable { name });
            params.push(Value::Null);
        }

        Ok(BoundQuery {
            plan,
            params,
            shape: self.shape.clone(),
            setup,
            teardown,
        })
    }
}

const TEMP_VALUE_COLUMN: &str = "Value";

static NEXT_BIND: AtomicU64 = AtomicU64::new(0);

#[allow(clippy::result_large_err)]
fn argument<'a>(args: &'a Args, name: &str) -> Result<&'a Value> {
    args.get(name)
        .ok_or_else(|| Error::invalid_operation(format!("missing query argument '{name}'")))
}

/// Redirect every use of `slot` to the temp table `table`; returns the
/// table's columns.
fn rewrite_plan(plan: &mut QueryPlan, slot: usize, table: &str) -> Option<Vec<String>> {
    match plan {
        QueryPlan::Select(select) => rewrite_select(select, slot, table),
        QueryPlan::SetOp { left, right, .. } => {
            let l = rewrite_plan(left, slot, table);
            let r = rewrite_plan(right, slot, table);
            l.or(r)
        }
        QueryPlan::Empty { .. } => None,
    }
}

fn rewrite_select(select: &mut SelectPlan, slot: usize, table: &str) -> Option<Vec<String>> {
    let mut columns = rewrite_source(&mut select.from, slot, table);
    for join in &mut select.joins {
        columns = columns.or(rewrite_source(&mut join.source, slot, table));
        columns = columns.or(rewrite_expr(&mut join.on, slot, table));
    }
    let exprs = select
        .filter
        .iter_mut()
        .chain(select.having.iter_mut())
        .chain(select.group_by.iter_mut())
        .chain(select.projection.iter_mut().map(|p| &mut p.expr))
        .chain(select.order_by.iter_mut().map(|o| &mut o.expr));
    for expr in exprs {
        columns = columns.or(rewrite_expr(expr, slot, table));
    }
    columns
}

fn rewrite_source(source: &mut Source, slot: usize, table: &str) -> Option<Vec<String>> {
    match source {
        Source::Values {
            columns,
            slot: s,
            alias,
        } if *s == slot => {
            let columns = std::mem::take(columns);
            let alias = std::mem::take(alias);
            *source = Source::TempTable {
                name: table.to_string(),
                columns: columns.clone(),
                alias,
            };
            Some(columns)
        }
        Source::Subquery { plan, .. } => rewrite_plan(plan, slot, table),
        _ => None,
    }
}

fn rewrite_expr(expr: &mut ScalarExpr, slot: usize, table: &str) -> Option<Vec<String>> {
    match expr {
        ScalarExpr::InParam { expr: item, slot: s } if *s == slot => {
            rewrite_expr(item, slot, table);
            let item = std::mem::replace(item.as_mut(), ScalarExpr::Literal(Value::Null));
            let alias = format!("{table}_v");
            let mut select = SelectPlan::from_source(Source::TempTable {
                name: table.to_string(),
                columns: vec![TEMP_VALUE_COLUMN.to_string()],
                alias: alias.clone(),
            });
            select.projection = vec![ProjectionItem {
                expr: ScalarExpr::column(alias, TEMP_VALUE_COLUMN),
                alias: "c0".to_string(),
            }];
            *expr = ScalarExpr::InSubquery {
                expr: Box::new(item),
                plan: Box::new(QueryPlan::Select(Box::new(select))),
            };
            Some(vec![TEMP_VALUE_COLUMN.to_string()])
        }
        ScalarExpr::Binary { left, right, .. } => {
            let l = rewrite_expr(left, slot, table);
            let r = rewrite_expr(right, slot, table);
            l.or(r)
        }
        ScalarExpr::Not(inner) | ScalarExpr::IsNull(inner) | ScalarExpr::InParam { expr: inner, .. } => {
            rewrite_expr(inner, slot, table)
        }
        ScalarExpr::InList { expr, list, .. } => {
            let mut columns = rewrite_expr(expr, slot, table);
            for item in list {
                columns = columns.or(rewrite_expr(item, slot, table));
            }
            columns
        }
        ScalarExpr::InSubquery { expr, plan } => {
            let e = rewrite_expr(expr, slot, table);
            let p = rewrite_plan(plan, slot, table);
            e.or(p)
        }
        ScalarExpr::Exists(plan) | ScalarExpr::Subquery(plan) => rewrite_plan(plan, slot, table),
        ScalarExpr::Aggregate { arg, .. } => arg
            .as_mut()
            .and_then(|a| rewrite_expr(a, slot, table)),
        ScalarExpr::Coalesce(items) => {
            let mut columns = None;
            for item in items {
                columns = columns.or(rewrite_expr(item, slot, table));
            }
            columns
        }
        ScalarExpr::Case {
            branches,
            otherwise,
        } => {
            let mut columns = None;
            for (when, then) in branches {
                columns = columns.or(rewrite_expr(when, slot, table));
                columns = columns.or(rewrite_expr(then, slot, table));
            }
            columns.or(rewrite_expr(otherwise, slot, table))
        }
        ScalarExpr::Column { .. } | ScalarExpr::Param(_) | ScalarExpr::Literal(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::translate::tests::library;

    fn caps(max: usize, temp_tables: bool) -> DriverCapabilities {
        DriverCapabilities {
            max_query_params: max,
            temp_tables,
            ..DriverCapabilities::default()
        }
    }

    fn by_pages(pages: Vec<i32>) -> Query {
        Query::all("Book").filter(move |b| b.member("Pages").is_in(pages))
    }

    #[test]
    fn bind_reads_lists_from_the_executed_query() {
        let model = library();
        let compiled = compile(&model, &by_pages(vec![1, 2])).unwrap();
        let bound = compiled
            .bind(&by_pages(vec![7, 8, 9]), &Args::new(), &caps(100, true))
            .unwrap();
        assert!(bound.params.contains(&Value::Array(vec![
            Value::Int(7),
            Value::Int(8),
            Value::Int(9)
        ])));
        assert!(bound.setup.is_empty());
    }

    #[test]
    fn bind_rejects_a_differently_shaped_query() {
        let model = library();
        let compiled = compile(&model, &by_pages(vec![1])).unwrap();
        let other = Query::all("Book").filter(|b| b.member("Pages").gt(3));
        let err = compiled.bind(&other, &Args::new(), &caps(100, true)).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn named_arguments_are_bound() {
        let model = library();
        let q = Query::all("Book").filter(|b| b.member("Pages").gt(Expr::param("min")));
        let compiled = compile(&model, &q).unwrap();
        let err = compiled.bind(&q, &Args::new(), &caps(100, true)).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        let bound = compiled
            .bind(&q, &Args::new().with("min", 10), &caps(100, true))
            .unwrap();
        assert!(bound.params.contains(&Value::Int(10)));
    }

    #[test]
    fn oversized_list_moves_to_a_temp_table() {
        let model = library();
        let q = by_pages((0..50).collect());
        let compiled = compile(&model, &q).unwrap();
        let bound = compiled.bind(&q, &Args::new(), &caps(10, true)).unwrap();
        assert_eq!(bound.setup.len(), 1);
        assert!(matches!(
            &bound.setup[0],
            Statement::CreateTempTable { rows, columns, .. } if rows.len() == 50 && columns == &["Value"]
        ));
        assert!(matches!(bound.teardown[0], Statement::DropTempTable { .. }));
        let QueryPlan::Select(select) = &bound.plan else {
            panic!("expected a select");
        };
        assert!(matches!(select.filter, Some(ScalarExpr::InSubquery { .. })));
    }

    #[test]
    fn each_bind_gets_its_own_temp_tables() {
        let model = library();
        let q = by_pages((0..20).chain(100..120).collect());
        let compiled = compile(&model, &q).unwrap();
        let first = compiled.bind(&q, &Args::new(), &caps(10, true)).unwrap();
        let second = compiled.bind(&q, &Args::new(), &caps(10, true)).unwrap();
        let name = |bound: &BoundQuery| match &bound.setup[0] {
            Statement::CreateTempTable { name, .. } => name.clone(),
            other => panic!("expected a temp table, got {other:?}"),
        };
        assert_ne!(name(&first), name(&second));
    }

    #[test]
    fn oversized_list_stays_inline_without_temp_tables() {
        let model = library();
        let q = by_pages((0..50).collect());
        let compiled = compile(&model, &q).unwrap();
        let bound = compiled.bind(&q, &Args::new(), &caps(10, false)).unwrap();
        assert!(bound.setup.is_empty());
    }
}
