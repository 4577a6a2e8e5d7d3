//! SQL rendering of plans and statements.
//!
//! Drivers backed by a SQL engine send the rendered text; the in-memory
//! driver only renders for `tracing` output. List parameters expand into one
//! placeholder per element, so the returned parameter vector is flat.

use serde::{Deserialize, Serialize};

use crate::plan::{JoinKind, QueryPlan, ScalarExpr, SelectPlan, Source};
use crate::statement::Statement;
use crate::value::Value;

/// SQL dialect for placeholder and identifier syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier, doubling embedded quote characters.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{escaped}\"")
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{escaped}`")
            }
        }
    }

    /// Null-safe equality operator.
    const fn null_safe_eq(self) -> &'static str {
        match self {
            Dialect::Postgres => "IS NOT DISTINCT FROM",
            Dialect::Sqlite => "IS",
            Dialect::Mysql => "<=>",
        }
    }
}

/// Rendered SQL text with its flattened parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSql {
    pub sql: String,
    pub params: Vec<Value>,
}

struct Renderer<'a> {
    dialect: Dialect,
    bound: &'a [Value],
    params: Vec<Value>,
}

impl Renderer<'_> {
    fn push_param(&mut self, value: Value) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }

    fn slot(&self, slot: usize) -> Value {
        self.bound.get(slot).cloned().unwrap_or(Value::Null)
    }

    fn ident(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    fn plan(&mut self, plan: &QueryPlan) -> String {
        match plan {
            QueryPlan::Select(select) => self.select(select),
            QueryPlan::SetOp { op, left, right } => {
                format!("({}) {} ({})", self.plan(left), op.as_sql(), self.plan(right))
            }
            QueryPlan::Empty { columns } => {
                let cols: Vec<String> = columns
                    .iter()
                    .map(|c| format!("NULL AS {}", self.ident(c)))
                    .collect();
                format!("SELECT {} WHERE 1 = 0", cols.join(", "))
            }
        }
    }

    fn select(&mut self, select: &SelectPlan) -> String {
        let mut sql = String::from("SELECT ");
        if select.distinct {
            sql.push_str("DISTINCT ");
        }
        let projection: Vec<String> = select
            .projection
            .iter()
            .map(|p| format!("{} AS {}", self.expr(&p.expr), self.ident(&p.alias)))
            .collect();
        sql.push_str(&projection.join(", "));
        sql.push_str(" FROM ");
        let from = self.source(&select.from);
        sql.push_str(&from);
        for join in &select.joins {
            let kind = match join.kind {
                JoinKind::Inner => "INNER JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            let source = self.source(&join.source);
            let on = self.expr(&join.on);
            sql.push_str(&format!(" {kind} {source} ON {on}"));
        }
        if let Some(filter) = &select.filter {
            let filter = self.expr(filter);
            sql.push_str(&format!(" WHERE {filter}"));
        }
        if !select.group_by.is_empty() {
            let keys: Vec<String> = select.group_by.iter().map(|e| self.expr(e)).collect();
            sql.push_str(&format!(" GROUP BY {}", keys.join(", ")));
        }
        if let Some(having) = &select.having {
            let having = self.expr(having);
            sql.push_str(&format!(" HAVING {having}"));
        }
        if !select.order_by.is_empty() {
            let items: Vec<String> = select
                .order_by
                .iter()
                .map(|o| {
                    let e = self.expr(&o.expr);
                    if o.descending { format!("{e} DESC") } else { format!("{e} ASC") }
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", items.join(", ")));
        }
        if let Some(limit) = select.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = select.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }

    fn source(&mut self, source: &Source) -> String {
        match source {
            Source::Table { name, alias } | Source::TempTable { name, alias, .. } => {
                format!("{} AS {}", self.ident(name), self.ident(alias))
            }
            Source::Subquery { plan, alias } => {
                format!("({}) AS {}", self.plan(plan), self.ident(alias))
            }
            Source::Values {
                columns,
                slot,
                alias,
            } => {
                let rows = match self.slot(*slot) {
                    Value::Array(rows) => rows,
                    _ => Vec::new(),
                };
                let mut rendered = Vec::with_capacity(rows.len());
                for row in rows {
                    let cells = match row {
                        Value::Array(cells) => cells,
                        single => vec![single],
                    };
                    let cells: Vec<String> = cells.into_iter().map(|c| self.push_param(c)).collect();
                    rendered.push(format!("({})", cells.join(", ")));
                }
                let cols: Vec<String> = columns.iter().map(|c| self.ident(c)).collect();
                format!(
                    "(VALUES {}) AS {}({})",
                    rendered.join(", "),
                    self.ident(alias),
                    cols.join(", ")
                )
            }
        }
    }

    fn expr(&mut self, expr: &ScalarExpr) -> String {
        match expr {
            ScalarExpr::Column { alias, column } => {
                format!("{}.{}", self.ident(alias), self.ident(column))
            }
            ScalarExpr::Param(slot) => {
                let value = self.slot(*slot);
                self.push_param(value)
            }
            ScalarExpr::Literal(value) => literal(value),
            ScalarExpr::Binary { op, left, right } => {
                let l = self.expr(left);
                let r = self.expr(right);
                let op = match op {
                    crate::plan::BinaryOp::NullSafeEq => self.dialect.null_safe_eq().to_string(),
                    crate::plan::BinaryOp::NullSafeNe => {
                        return format!("NOT ({l} {} {r})", self.dialect.null_safe_eq());
                    }
                    other => other.as_sql().to_string(),
                };
                format!("({l} {op} {r})")
            }
            ScalarExpr::Not(e) => format!("NOT ({})", self.expr(e)),
            ScalarExpr::IsNull(e) => format!("({} IS NULL)", self.expr(e)),
            ScalarExpr::InList {
                expr,
                list,
                negated,
            } => {
                let e = self.expr(expr);
                let items: Vec<String> = list.iter().map(|i| self.expr(i)).collect();
                let not = if *negated { "NOT " } else { "" };
                format!("({e} {not}IN ({}))", items.join(", "))
            }
            ScalarExpr::InParam { expr, slot } => {
                let e = self.expr(expr);
                let items = match self.slot(*slot) {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                if items.is_empty() {
                    return "(1 = 0)".to_string();
                }
                let placeholders: Vec<String> = items.into_iter().map(|v| self.push_param(v)).collect();
                format!("({e} IN ({}))", placeholders.join(", "))
            }
            ScalarExpr::InSubquery { expr, plan } => {
                let e = self.expr(expr);
                format!("({e} IN ({}))", self.plan(plan))
            }
            ScalarExpr::Exists(plan) => format!("EXISTS ({})", self.plan(plan)),
            ScalarExpr::Subquery(plan) => format!("({})", self.plan(plan)),
            ScalarExpr::Aggregate {
                func,
                arg,
                distinct,
            } => {
                let inner = match arg {
                    Some(arg) => self.expr(arg),
                    None => "*".to_string(),
                };
                let distinct = if *distinct { "DISTINCT " } else { "" };
                format!("{}({distinct}{inner})", func.as_sql())
            }
            ScalarExpr::Coalesce(items) => {
                let items: Vec<String> = items.iter().map(|i| self.expr(i)).collect();
                format!("COALESCE({})", items.join(", "))
            }
            ScalarExpr::Case {
                branches,
                otherwise,
            } => {
                let mut sql = String::from("CASE");
                for (when, then) in branches {
                    let w = self.expr(when);
                    let t = self.expr(then);
                    sql.push_str(&format!(" WHEN {w} THEN {t}"));
                }
                let e = self.expr(otherwise);
                sql.push_str(&format!(" ELSE {e} END"));
                sql
            }
        }
    }
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        other => other.to_string(),
    }
}

/// Render a plan with `bound` parameter values.
pub fn render_plan(plan: &QueryPlan, dialect: Dialect, bound: &[Value]) -> RenderedSql {
    let mut renderer = Renderer {
        dialect,
        bound,
        params: Vec::new(),
    };
    let sql = renderer.plan(plan);
    RenderedSql {
        sql,
        params: renderer.params,
    }
}

/// Render a persistence statement.
pub fn render_statement(statement: &Statement, dialect: Dialect) -> RenderedSql {
    let mut r = Renderer {
        dialect,
        bound: &[],
        params: Vec::new(),
    };
    let sql = match statement {
        Statement::Insert {
            table,
            columns,
            rows,
        }
        | Statement::CreateTempTable {
            name: table,
            columns,
            rows,
        } => {
            let cols: Vec<String> = columns.iter().map(|c| r.ident(c)).collect();
            let mut values = Vec::with_capacity(rows.len());
            for row in rows {
                let cells: Vec<String> = row.iter().map(|v| r.push_param(v.clone())).collect();
                values.push(format!("({})", cells.join(", ")));
            }
            let prefix = if matches!(statement, Statement::CreateTempTable { .. }) {
                let defs: Vec<String> = cols.clone();
                format!(
                    "CREATE TEMPORARY TABLE {} ({}); INSERT INTO",
                    r.ident(table),
                    defs.join(", ")
                )
            } else {
                "INSERT INTO".to_string()
            };
            format!(
                "{prefix} {} ({}) VALUES {}",
                r.ident(table),
                cols.join(", "),
                values.join(", ")
            )
        }
        Statement::Update {
            table,
            assignments,
            filter,
            ..
        } => {
            let sets: Vec<String> = assignments
                .iter()
                .map(|(c, v)| format!("{} = {}", r.ident(c), r.push_param(v.clone())))
                .collect();
            let conds: Vec<String> = filter
                .iter()
                .map(|(c, v)| format!("{} = {}", r.ident(c), r.push_param(v.clone())))
                .collect();
            format!(
                "UPDATE {} SET {} WHERE {}",
                r.ident(table),
                sets.join(", "),
                conds.join(" AND ")
            )
        }
        Statement::Delete {
            table,
            filter_columns,
            rows,
            ..
        } => {
            let mut disjuncts = Vec::with_capacity(rows.len());
            for row in rows {
                let conds: Vec<String> = filter_columns
                    .iter()
                    .zip(row)
                    .map(|(c, v)| format!("{} = {}", r.ident(c), r.push_param(v.clone())))
                    .collect();
                disjuncts.push(format!("({})", conds.join(" AND ")));
            }
            format!("DELETE FROM {} WHERE {}", r.ident(table), disjuncts.join(" OR "))
        }
        Statement::DropTempTable { name } => format!("DROP TABLE {}", r.ident(name)),
    };
    RenderedSql {
        sql,
        params: r.params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{BinaryOp, ProjectionItem};

    fn people() -> SelectPlan {
        let mut select = SelectPlan::from_source(Source::Table {
            name: "Person".into(),
            alias: "t0".into(),
        });
        select.projection.push(ProjectionItem {
            expr: ScalarExpr::column("t0", "Name"),
            alias: "c0".into(),
        });
        select
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(1), "$1");
        assert_eq!(Dialect::Sqlite.placeholder(2), "?2");
        assert_eq!(Dialect::Mysql.placeholder(3), "?");
        assert_eq!(Dialect::Postgres.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::Mysql.quote_identifier("a`b"), "`a``b`");
    }

    #[test]
    fn test_list_parameters_expand() {
        let mut select = people();
        select.and_filter(ScalarExpr::InParam {
            expr: Box::new(ScalarExpr::column("t0", "Id")),
            slot: 0,
        });
        select.and_filter(ScalarExpr::binary(
            BinaryOp::NullSafeEq,
            ScalarExpr::column("t0", "Name"),
            ScalarExpr::Param(1),
        ));
        let plan = QueryPlan::Select(Box::new(select));
        let rendered = render_plan(
            &plan,
            Dialect::Postgres,
            &[
                Value::Array(vec![Value::Int(1), Value::Int(2)]),
                Value::Text("Ann".into()),
            ],
        );
        assert_eq!(
            rendered.sql,
            "SELECT \"t0\".\"Name\" AS \"c0\" FROM \"Person\" AS \"t0\" WHERE ((\"t0\".\"Id\" IN ($1, $2)) AND (\"t0\".\"Name\" IS NOT DISTINCT FROM $3))"
        );
        assert_eq!(rendered.params.len(), 3);
    }

    #[test]
    fn test_empty_list_is_false() {
        let mut select = people();
        select.and_filter(ScalarExpr::InParam {
            expr: Box::new(ScalarExpr::column("t0", "Id")),
            slot: 0,
        });
        let plan = QueryPlan::Select(Box::new(select));
        let rendered = render_plan(&plan, Dialect::Sqlite, &[Value::Array(Vec::new())]);
        assert!(rendered.sql.ends_with("WHERE (1 = 0)"));
    }

    #[test]
    fn test_render_statements() {
        let update = Statement::Update {
            table: "Person".into(),
            assignments: vec![("Name".into(), Value::Text("Bo".into()))],
            filter: vec![("Id".into(), Value::Int(1)), ("Version".into(), Value::Int(3))],
            expected_rows: Some(1),
        };
        let rendered = render_statement(&update, Dialect::Sqlite);
        assert_eq!(
            rendered.sql,
            "UPDATE \"Person\" SET \"Name\" = ?1 WHERE \"Id\" = ?2 AND \"Version\" = ?3"
        );

        let delete = Statement::Delete {
            table: "Person".into(),
            filter_columns: vec!["Id".into()],
            rows: vec![vec![Value::Int(1)], vec![Value::Int(2)]],
            expected_rows: None,
        };
        assert_eq!(
            render_statement(&delete, Dialect::Postgres).sql,
            "DELETE FROM \"Person\" WHERE (\"Id\" = $1) OR (\"Id\" = $2)"
        );
    }
}
