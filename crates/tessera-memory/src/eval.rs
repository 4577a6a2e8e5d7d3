//! Relational plan evaluator.
//!
//! Plans are evaluated bottom-up into materialized [`Relation`]s. Scalar
//! expressions follow SQL three-valued logic: a predicate keeps a row only
//! when it is TRUE, and UNKNOWN is represented as `Value::Null`.
//!
//! Correlated subqueries see the rows of every enclosing select through a
//! chain of [`Env`]s; translator aliases are unique per plan, so a column
//! reference resolves to the innermost scope that binds its alias.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use tessera_core::{
    AggregateFunc, BinaryOp, Error, HashableValue, JoinKind, QueryError, QueryErrorKind,
    QueryPlan, ScalarExpr, SelectPlan, SetOpKind, Source, Value,
};

use crate::store::Store;

/// A materialized result.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Relation {
    pub(crate) columns: Vec<String>,
    pub(crate) rows: Vec<Vec<Value>>,
}

/// A connection-local temporary table.
#[derive(Debug, Clone, Default)]
pub(crate) struct TempTable {
    pub(crate) columns: Vec<String>,
    pub(crate) rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone)]
struct Binding {
    alias: String,
    columns: Vec<String>,
    offset: usize,
}

/// Column positions of the sources joined into one select row.
#[derive(Debug, Clone, Default)]
struct Layout {
    bindings: Vec<Binding>,
    width: usize,
}

impl Layout {
    fn push(&mut self, alias: &str, columns: Vec<String>) {
        let width = columns.len();
        self.bindings.push(Binding {
            alias: alias.to_string(),
            columns,
            offset: self.width,
        });
        self.width += width;
    }

    fn binding(&self, alias: &str) -> Option<&Binding> {
        self.bindings.iter().rev().find(|b| b.alias == alias)
    }
}

/// One row in scope, plus the group it represents and the enclosing scope.
struct Env<'a> {
    layout: &'a Layout,
    row: &'a [Value],
    group: Option<&'a [Vec<Value>]>,
    parent: Option<&'a Env<'a>>,
}

impl<'a> Env<'a> {
    #[allow(clippy::result_large_err)]
    fn column(&self, alias: &str, column: &str) -> Result<Value, Error> {
        let mut scope = Some(self);
        while let Some(env) = scope {
            if let Some(binding) = env.layout.binding(alias) {
                let Some(i) = binding.columns.iter().position(|c| c == column) else {
                    return Err(eval_error(
                        QueryErrorKind::NotFound,
                        format!("source '{alias}' has no column '{column}'"),
                    ));
                };
                return Ok(env.row.get(binding.offset + i).cloned().unwrap_or(Value::Null));
            }
            scope = env.parent;
        }
        Err(eval_error(
            QueryErrorKind::NotFound,
            format!("no source '{alias}' in scope for column '{column}'"),
        ))
    }
}

fn eval_error(kind: QueryErrorKind, message: impl Into<String>) -> Error {
    Error::Query(QueryError::new(kind, message))
}

fn row_key(row: &[Value]) -> Vec<HashableValue> {
    row.iter().cloned().map(HashableValue).collect()
}

fn distinct_rows(rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    let mut seen = HashSet::with_capacity(rows.len());
    rows.into_iter().filter(|r| seen.insert(row_key(r))).collect()
}

/// SQL truth value of a predicate result.
fn truth(value: &Value) -> Option<bool> {
    match value {
        Value::Null => None,
        other => other.as_bool(),
    }
}

fn tri(value: Option<bool>) -> Value {
    value.map_or(Value::Null, Value::Bool)
}

/// `value IN (items)` with SQL semantics.
fn in_values<'v>(value: &Value, items: impl IntoIterator<Item = &'v Value>) -> Option<bool> {
    let mut unknown = false;
    let mut any = false;
    for item in items {
        any = true;
        match value.sql_eq(item) {
            Some(true) => return Some(true),
            Some(false) => {}
            None => unknown = true,
        }
    }
    if !any {
        return Some(false);
    }
    if unknown { None } else { Some(false) }
}

/// Evaluates plans against one consistent store plus connection temp tables.
pub(crate) struct Evaluator<'a> {
    store: &'a Store,
    temps: &'a HashMap<String, TempTable>,
    params: &'a [Value],
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(
        store: &'a Store,
        temps: &'a HashMap<String, TempTable>,
        params: &'a [Value],
    ) -> Self {
        Self {
            store,
            temps,
            params,
        }
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn run(&self, plan: &QueryPlan) -> Result<Relation, Error> {
        self.plan(plan, None)
    }

    #[allow(clippy::result_large_err)]
    fn plan(&self, plan: &QueryPlan, outer: Option<&Env<'_>>) -> Result<Relation, Error> {
        match plan {
            QueryPlan::Select(select) => self.select(select, outer),
            QueryPlan::SetOp { op, left, right } => {
                let left = self.plan(left, outer)?;
                let right = self.plan(right, outer)?;
                if left.columns.len() != right.columns.len() {
                    return Err(eval_error(
                        QueryErrorKind::Database,
                        format!(
                            "{} operands have {} and {} columns",
                            op.as_sql(),
                            left.columns.len(),
                            right.columns.len()
                        ),
                    ));
                }
                let rows = match op {
                    SetOpKind::UnionAll => {
                        let mut rows = left.rows;
                        rows.extend(right.rows);
                        rows
                    }
                    SetOpKind::Union => {
                        let mut rows = left.rows;
                        rows.extend(right.rows);
                        distinct_rows(rows)
                    }
                    SetOpKind::Except | SetOpKind::Intersect => {
                        let other: HashSet<Vec<HashableValue>> =
                            right.rows.iter().map(|r| row_key(r)).collect();
                        let keep = *op == SetOpKind::Intersect;
                        distinct_rows(left.rows)
                            .into_iter()
                            .filter(|r| other.contains(&row_key(r)) == keep)
                            .collect()
                    }
                };
                Ok(Relation {
                    columns: left.columns,
                    rows,
                })
            }
            QueryPlan::Empty { columns } => Ok(Relation {
                columns: columns.clone(),
                rows: Vec::new(),
            }),
        }
    }

    #[allow(clippy::result_large_err)]
    fn source(&self, source: &Source, outer: Option<&Env<'_>>) -> Result<Relation, Error> {
        match source {
            Source::Table { name, .. } => {
                let table = self.store.table(name).ok_or_else(|| {
                    eval_error(QueryErrorKind::NotFound, format!("no such table '{name}'"))
                })?;
                Ok(Relation {
                    columns: table.column_names(),
                    rows: table.rows.clone(),
                })
            }
            Source::Subquery { plan, .. } => self.plan(plan, outer),
            Source::Values { columns, slot, .. } => {
                let rows = match self.param(*slot)? {
                    Value::Array(items) => items
                        .iter()
                        .map(|item| match item {
                            Value::Array(row) => row.clone(),
                            scalar => vec![scalar.clone()],
                        })
                        .collect::<Vec<_>>(),
                    Value::Null => Vec::new(),
                    other => {
                        return Err(eval_error(
                            QueryErrorKind::Database,
                            format!("VALUES slot {slot} holds {}, not rows", other.type_name()),
                        ));
                    }
                };
                if let Some(bad) = rows.iter().find(|r| r.len() != columns.len()) {
                    return Err(eval_error(
                        QueryErrorKind::Database,
                        format!(
                            "VALUES row has {} value(s) for {} column(s)",
                            bad.len(),
                            columns.len()
                        ),
                    ));
                }
                Ok(Relation {
                    columns: columns.clone(),
                    rows,
                })
            }
            Source::TempTable { name, columns, .. } => {
                let table = self.temps.get(name).ok_or_else(|| {
                    eval_error(QueryErrorKind::NotFound, format!("no temp table '{name}'"))
                })?;
                let mut indexes = Vec::with_capacity(columns.len());
                for column in columns {
                    let i = table.columns.iter().position(|c| c == column).ok_or_else(|| {
                        eval_error(
                            QueryErrorKind::NotFound,
                            format!("temp table '{name}' has no column '{column}'"),
                        )
                    })?;
                    indexes.push(i);
                }
                Ok(Relation {
                    columns: columns.clone(),
                    rows: table
                        .rows
                        .iter()
                        .map(|r| indexes.iter().map(|i| r[*i].clone()).collect())
                        .collect(),
                })
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn param(&self, slot: usize) -> Result<&Value, Error> {
        self.params.get(slot).ok_or_else(|| {
            eval_error(
                QueryErrorKind::Database,
                format!("parameter slot {slot} is not bound ({} bound)", self.params.len()),
            )
        })
    }

    #[allow(clippy::result_large_err)]
    fn select(&self, select: &SelectPlan, outer: Option<&Env<'_>>) -> Result<Relation, Error> {
        let from = self.source(&select.from, outer)?;
        let mut layout = Layout::default();
        layout.push(select.from.alias(), from.columns);
        let mut rows = from.rows;

        for join in &select.joins {
            let right = self.source(&join.source, outer)?;
            let mut joined_layout = layout.clone();
            joined_layout.push(join.source.alias(), right.columns);
            let nulls = vec![Value::Null; joined_layout.width - layout.width];
            let mut next = Vec::new();
            for left in &rows {
                let mut matched = false;
                for r in &right.rows {
                    let mut combined = left.clone();
                    combined.extend(r.iter().cloned());
                    let env = Env {
                        layout: &joined_layout,
                        row: &combined,
                        group: None,
                        parent: outer,
                    };
                    if truth(&self.expr(&join.on, &env)?) == Some(true) {
                        matched = true;
                        next.push(combined);
                    }
                }
                if !matched && join.kind == JoinKind::Left {
                    let mut combined = left.clone();
                    combined.extend(nulls.iter().cloned());
                    next.push(combined);
                }
            }
            layout = joined_layout;
            rows = next;
        }

        if let Some(filter) = &select.filter {
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                let env = Env {
                    layout: &layout,
                    row: &row,
                    group: None,
                    parent: outer,
                };
                if truth(&self.expr(filter, &env)?) == Some(true) {
                    kept.push(row);
                }
            }
            rows = kept;
        }

        // (projected values, order keys)
        let mut output: Vec<(Vec<Value>, Vec<Value>)> = Vec::new();
        if select.is_aggregate() || select.having.is_some() {
            for group in self.groups(select, &layout, rows, outer)? {
                let blank = vec![Value::Null; layout.width];
                let representative = group.first().unwrap_or(&blank);
                let env = Env {
                    layout: &layout,
                    row: representative,
                    group: Some(group.as_slice()),
                    parent: outer,
                };
                if let Some(having) = &select.having {
                    if truth(&self.expr(having, &env)?) != Some(true) {
                        continue;
                    }
                }
                output.push(self.project(select, &env)?);
            }
        } else {
            for row in &rows {
                let env = Env {
                    layout: &layout,
                    row,
                    group: None,
                    parent: outer,
                };
                output.push(self.project(select, &env)?);
            }
        }

        if select.distinct {
            let mut seen = HashSet::with_capacity(output.len());
            output.retain(|(values, _)| seen.insert(row_key(values)));
        }
        if !select.order_by.is_empty() {
            output.sort_by(|(_, a), (_, b)| {
                for ((x, y), item) in a.iter().zip(b).zip(&select.order_by) {
                    let ord = x.sort_cmp(y);
                    let ord = if item.descending { ord.reverse() } else { ord };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let offset = select.offset.map_or(0, |o| usize::try_from(o).unwrap_or(usize::MAX));
        let limit = select.limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        Ok(Relation {
            columns: select.projection.iter().map(|p| p.alias.clone()).collect(),
            rows: output
                .into_iter()
                .skip(offset)
                .take(limit)
                .map(|(values, _)| values)
                .collect(),
        })
    }

    /// Partition rows by the GROUP BY key; one (possibly empty) group without one.
    #[allow(clippy::result_large_err)]
    fn groups(
        &self,
        select: &SelectPlan,
        layout: &Layout,
        rows: Vec<Vec<Value>>,
        outer: Option<&Env<'_>>,
    ) -> Result<Vec<Vec<Vec<Value>>>, Error> {
        if select.group_by.is_empty() {
            return Ok(vec![rows]);
        }
        let mut index: HashMap<Vec<HashableValue>, usize> = HashMap::new();
        let mut groups: Vec<Vec<Vec<Value>>> = Vec::new();
        for row in rows {
            let env = Env {
                layout,
                row: &row,
                group: None,
                parent: outer,
            };
            let mut key = Vec::with_capacity(select.group_by.len());
            for expr in &select.group_by {
                key.push(HashableValue(self.expr(expr, &env)?));
            }
            match index.get(&key) {
                Some(i) => groups[*i].push(row),
                None => {
                    index.insert(key, groups.len());
                    groups.push(vec![row]);
                }
            }
        }
        Ok(groups)
    }

    #[allow(clippy::result_large_err)]
    fn project(&self, select: &SelectPlan, env: &Env<'_>) -> Result<(Vec<Value>, Vec<Value>), Error> {
        let mut values = Vec::with_capacity(select.projection.len());
        for item in &select.projection {
            values.push(self.expr(&item.expr, env)?);
        }
        let mut keys = Vec::with_capacity(select.order_by.len());
        for item in &select.order_by {
            keys.push(self.expr(&item.expr, env)?);
        }
        Ok((values, keys))
    }

    #[allow(clippy::result_large_err)]
    fn expr(&self, expr: &ScalarExpr, env: &Env<'_>) -> Result<Value, Error> {
        match expr {
            ScalarExpr::Column { alias, column } => env.column(alias, column),
            ScalarExpr::Param(slot) => self.param(*slot).cloned(),
            ScalarExpr::Literal(value) => Ok(value.clone()),
            ScalarExpr::Binary { op, left, right } => self.binary(*op, left, right, env),
            ScalarExpr::Not(inner) => Ok(tri(truth(&self.expr(inner, env)?).map(|b| !b))),
            ScalarExpr::IsNull(inner) => Ok(Value::Bool(self.expr(inner, env)?.is_null())),
            ScalarExpr::InList {
                expr,
                list,
                negated,
            } => {
                let value = self.expr(expr, env)?;
                let mut items = Vec::with_capacity(list.len());
                for item in list {
                    items.push(self.expr(item, env)?);
                }
                let found = in_values(&value, &items);
                Ok(tri(if *negated { found.map(|b| !b) } else { found }))
            }
            ScalarExpr::InParam { expr, slot } => {
                let value = self.expr(expr, env)?;
                let found = match self.param(*slot)? {
                    Value::Array(items) => in_values(&value, items),
                    Value::Null => Some(false),
                    single => in_values(&value, std::slice::from_ref(single)),
                };
                Ok(tri(found))
            }
            ScalarExpr::InSubquery { expr, plan } => {
                let value = self.expr(expr, env)?;
                let relation = self.plan(plan, Some(env))?;
                let firsts: Vec<Value> = relation
                    .rows
                    .into_iter()
                    .filter_map(|r| r.into_iter().next())
                    .collect();
                Ok(tri(in_values(&value, &firsts)))
            }
            ScalarExpr::Exists(plan) => Ok(Value::Bool(!self.plan(plan, Some(env))?.rows.is_empty())),
            ScalarExpr::Subquery(plan) => Ok(self
                .plan(plan, Some(env))?
                .rows
                .into_iter()
                .next()
                .and_then(|r| r.into_iter().next())
                .unwrap_or(Value::Null)),
            ScalarExpr::Aggregate {
                func,
                arg,
                distinct,
            } => self.aggregate(*func, arg.as_deref(), *distinct, env),
            ScalarExpr::Coalesce(items) => {
                for item in items {
                    let value = self.expr(item, env)?;
                    if !value.is_null() {
                        return Ok(value);
                    }
                }
                Ok(Value::Null)
            }
            ScalarExpr::Case {
                branches,
                otherwise,
            } => {
                for (when, then) in branches {
                    if truth(&self.expr(when, env)?) == Some(true) {
                        return self.expr(then, env);
                    }
                }
                self.expr(otherwise, env)
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn binary(
        &self,
        op: BinaryOp,
        left: &ScalarExpr,
        right: &ScalarExpr,
        env: &Env<'_>,
    ) -> Result<Value, Error> {
        match op {
            BinaryOp::And => {
                let l = truth(&self.expr(left, env)?);
                if l == Some(false) {
                    return Ok(Value::Bool(false));
                }
                let r = truth(&self.expr(right, env)?);
                Ok(tri(match (l, r) {
                    (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                }))
            }
            BinaryOp::Or => {
                let l = truth(&self.expr(left, env)?);
                if l == Some(true) {
                    return Ok(Value::Bool(true));
                }
                let r = truth(&self.expr(right, env)?);
                Ok(tri(match (l, r) {
                    (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                }))
            }
            _ => {
                let l = self.expr(left, env)?;
                let r = self.expr(right, env)?;
                compare_or_compute(op, &l, &r)
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn aggregate(
        &self,
        func: AggregateFunc,
        arg: Option<&ScalarExpr>,
        distinct: bool,
        env: &Env<'_>,
    ) -> Result<Value, Error> {
        let Some(group) = env.group else {
            return Err(eval_error(
                QueryErrorKind::Database,
                format!("{} outside of a grouped select", func.as_sql()),
            ));
        };
        if func == AggregateFunc::CountStar || arg.is_none() {
            return Ok(Value::BigInt(group.len() as i64));
        }
        let mut values = Vec::with_capacity(group.len());
        if let Some(arg) = arg {
            for row in group {
                let row_env = Env {
                    layout: env.layout,
                    row,
                    group: None,
                    parent: env.parent,
                };
                let value = self.expr(arg, &row_env)?;
                if !value.is_null() {
                    values.push(value);
                }
            }
        }
        if distinct {
            let mut seen = HashSet::new();
            values.retain(|v| seen.insert(HashableValue(v.clone())));
        }
        Ok(match func {
            AggregateFunc::Count | AggregateFunc::CountStar => Value::BigInt(values.len() as i64),
            AggregateFunc::Sum => sum(&values)?,
            AggregateFunc::Avg => {
                if values.is_empty() {
                    Value::Null
                } else {
                    let mut total = 0.0;
                    for v in &values {
                        total += v.to_f64_lossy()?;
                    }
                    Value::Double(total / values.len() as f64)
                }
            }
            AggregateFunc::Min => values.into_iter().min_by(Value::sort_cmp).unwrap_or(Value::Null),
            AggregateFunc::Max => values.into_iter().max_by(Value::sort_cmp).unwrap_or(Value::Null),
        })
    }
}

#[allow(clippy::result_large_err)]
fn sum(values: &[Value]) -> Result<Value, Error> {
    if values.is_empty() {
        return Ok(Value::Null);
    }
    if values.iter().all(|v| matches!(v, Value::Int(_) | Value::BigInt(_))) {
        let mut total: i64 = 0;
        for v in values {
            total = total
                .checked_add(v.as_i64().unwrap_or(0))
                .ok_or_else(|| eval_error(QueryErrorKind::Database, "SUM overflowed BIGINT"))?;
        }
        return Ok(Value::BigInt(total));
    }
    let mut total = 0.0;
    for v in values {
        total += v.to_f64_lossy()?;
    }
    if values.iter().any(|v| matches!(v, Value::Double(_))) {
        Ok(Value::Double(total))
    } else {
        Ok(Value::Decimal(total.to_string()))
    }
}

#[allow(clippy::result_large_err)]
fn compare_or_compute(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, Error> {
    Ok(match op {
        BinaryOp::NullSafeEq => Value::Bool(l.same_value(r)),
        BinaryOp::NullSafeNe => Value::Bool(!l.same_value(r)),
        BinaryOp::Eq => tri(l.sql_eq(r)),
        BinaryOp::Ne => tri(l.sql_eq(r).map(|b| !b)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let Some(ord) = l.sql_cmp(r) else {
                return Ok(Value::Null);
            };
            Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            })
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, l, r)?
        }
        BinaryOp::And | BinaryOp::Or => {
            return Err(eval_error(
                QueryErrorKind::Database,
                format!("{} reached value comparison", op.as_sql()),
            ));
        }
    })
}

#[allow(clippy::result_large_err)]
fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, Error> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    if let (Value::Text(a), Value::Text(b), BinaryOp::Add) = (l, r, op) {
        return Ok(Value::Text(format!("{a}{b}")));
    }
    let integral = |v: &Value| matches!(v, Value::Int(_) | Value::BigInt(_));
    if integral(l) && integral(r) {
        let (a, b) = (l.as_i64().unwrap_or(0), r.as_i64().unwrap_or(0));
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div | BinaryOp::Mod if b == 0 => {
                return Err(eval_error(QueryErrorKind::Database, "division by zero"));
            }
            BinaryOp::Div => a.checked_div(b),
            _ => a.checked_rem(b),
        }
        .ok_or_else(|| eval_error(QueryErrorKind::Database, "integer overflow"))?;
        let both_int = matches!((l, r), (Value::Int(_), Value::Int(_)));
        return Ok(match i32::try_from(result) {
            Ok(small) if both_int => Value::Int(small),
            _ => Value::BigInt(result),
        });
    }
    let (a, b) = (l.to_f64_lossy()?, r.to_f64_lossy()?);
    Ok(Value::Double(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        _ => a % b,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{OrderItem, ProjectionItem, Statement};

    fn col(alias: &str, column: &str) -> ScalarExpr {
        ScalarExpr::column(alias, column)
    }

    fn item(expr: ScalarExpr, alias: &str) -> ProjectionItem {
        ProjectionItem {
            expr,
            alias: alias.to_string(),
        }
    }

    fn table(name: &str, alias: &str) -> Source {
        Source::Table {
            name: name.into(),
            alias: alias.into(),
        }
    }

    /// Owners 1 (Ann), 2 (Bob); pets 10 -> 1, 11 -> 1, 12 -> none.
    fn store() -> Store {
        use tessera_core::{DomainModel, EntityDecl, FieldDecl, ScalarType};
        let model = DomainModel::builder()
            .entity(
                EntityDecl::new("Owner")
                    .key("Id", ScalarType::Int)
                    .field(FieldDecl::scalar("Name", ScalarType::Text)),
            )
            .entity(
                EntityDecl::new("Pet")
                    .key("Id", ScalarType::Int)
                    .field(FieldDecl::scalar("Weight", ScalarType::Int).nullable())
                    .field(FieldDecl::reference("Owner", "Owner").nullable()),
            )
            .build()
            .unwrap();
        let mut store = Store::from_catalog(model.catalog());
        store
            .apply(&Statement::Insert {
                table: "Owner".into(),
                columns: vec!["TypeId".into(), "Id".into(), "Name".into()],
                rows: vec![
                    vec![Value::Int(0), Value::Int(1), Value::Text("Ann".into())],
                    vec![Value::Int(0), Value::Int(2), Value::Text("Bob".into())],
                ],
            })
            .unwrap();
        store
            .apply(&Statement::Insert {
                table: "Pet".into(),
                columns: vec!["TypeId".into(), "Id".into(), "Weight".into(), "Owner.Id".into()],
                rows: vec![
                    vec![Value::Int(1), Value::Int(10), Value::Int(3), Value::Int(1)],
                    vec![Value::Int(1), Value::Int(11), Value::Null, Value::Int(1)],
                    vec![Value::Int(1), Value::Int(12), Value::Int(5), Value::Null],
                ],
            })
            .unwrap();
        store
    }

    fn run(store: &Store, plan: SelectPlan, params: &[Value]) -> Relation {
        let temps = HashMap::new();
        Evaluator::new(store, &temps, params)
            .run(&QueryPlan::Select(Box::new(plan)))
            .unwrap()
    }

    #[test]
    fn left_join_keeps_unmatched_rows_with_nulls() {
        let store = store();
        let mut plan = SelectPlan::from_source(table("Pet", "t0"));
        plan.joins.push(tessera_core::JoinPlan {
            kind: JoinKind::Left,
            source: table("Owner", "t1"),
            on: ScalarExpr::binary(BinaryOp::Eq, col("t0", "Owner.Id"), col("t1", "Id")),
        });
        plan.projection = vec![item(col("t0", "Id"), "c0"), item(col("t1", "Name"), "c1")];
        plan.order_by = vec![OrderItem {
            expr: col("t0", "Id"),
            descending: false,
        }];
        let rel = run(&store, plan, &[]);
        assert_eq!(rel.rows.len(), 3);
        assert_eq!(rel.rows[2], vec![Value::Int(12), Value::Null]);
    }

    #[test]
    fn unknown_predicates_drop_rows() {
        let store = store();
        let mut plan = SelectPlan::from_source(table("Pet", "t0"));
        plan.filter = Some(ScalarExpr::binary(BinaryOp::Ne, col("t0", "Weight"), ScalarExpr::literal(3)).negate());
        plan.projection = vec![item(col("t0", "Id"), "c0")];
        // NOT (Weight <> 3) keeps only the row with Weight = 3; NULL stays unknown.
        assert_eq!(run(&store, plan, &[]).rows, vec![vec![Value::Int(10)]]);
    }

    #[test]
    fn null_safe_equality_matches_nulls() {
        let store = store();
        let mut plan = SelectPlan::from_source(table("Pet", "t0"));
        plan.filter = Some(ScalarExpr::binary(BinaryOp::NullSafeEq, col("t0", "Weight"), ScalarExpr::Param(0)));
        plan.projection = vec![item(col("t0", "Id"), "c0")];
        assert_eq!(run(&store, plan, &[Value::Null]).rows, vec![vec![Value::Int(11)]]);
    }

    #[test]
    fn grouping_sums_and_counts() {
        let store = store();
        let mut plan = SelectPlan::from_source(table("Pet", "t0"));
        plan.group_by = vec![col("t0", "Owner.Id")];
        plan.projection = vec![
            item(col("t0", "Owner.Id"), "c0"),
            item(
                ScalarExpr::Coalesce(vec![
                    ScalarExpr::Aggregate {
                        func: AggregateFunc::Sum,
                        arg: Some(Box::new(col("t0", "Weight"))),
                        distinct: false,
                    },
                    ScalarExpr::literal(0),
                ]),
                "c1",
            ),
            item(
                ScalarExpr::Aggregate {
                    func: AggregateFunc::CountStar,
                    arg: None,
                    distinct: false,
                },
                "c2",
            ),
        ];
        plan.order_by = vec![OrderItem {
            expr: col("t0", "Owner.Id"),
            descending: true,
        }];
        let rel = run(&store, plan, &[]);
        assert_eq!(
            rel.rows,
            vec![
                vec![Value::Int(1), Value::BigInt(3), Value::BigInt(2)],
                vec![Value::Null, Value::BigInt(5), Value::BigInt(1)],
            ]
        );
    }

    #[test]
    fn aggregates_over_no_rows_yield_one_row() {
        let store = store();
        let mut plan = SelectPlan::from_source(table("Pet", "t0"));
        plan.filter = Some(ScalarExpr::literal(false));
        plan.projection = vec![item(
            ScalarExpr::Aggregate {
                func: AggregateFunc::Sum,
                arg: Some(Box::new(col("t0", "Weight"))),
                distinct: false,
            },
            "c0",
        )];
        assert_eq!(run(&store, plan, &[]).rows, vec![vec![Value::Null]]);
    }

    #[test]
    fn correlated_subqueries_read_outer_rows() {
        let store = store();
        let mut inner = SelectPlan::from_source(table("Pet", "t1"));
        inner.filter = Some(ScalarExpr::binary(BinaryOp::Eq, col("t1", "Owner.Id"), col("t0", "Id")));
        inner.projection = vec![item(ScalarExpr::literal(1), "c0")];
        let mut plan = SelectPlan::from_source(table("Owner", "t0"));
        plan.filter = Some(ScalarExpr::Exists(Box::new(QueryPlan::Select(Box::new(inner)))));
        plan.projection = vec![item(col("t0", "Name"), "c0")];
        assert_eq!(run(&store, plan, &[]).rows, vec![vec![Value::Text("Ann".into())]]);
    }

    #[test]
    fn in_param_and_values_sources_bind_arrays() {
        let store = store();
        let mut plan = SelectPlan::from_source(table("Pet", "t0"));
        plan.filter = Some(ScalarExpr::InParam {
            expr: Box::new(col("t0", "Id")),
            slot: 0,
        });
        plan.projection = vec![item(col("t0", "Id"), "c0")];
        let rel = run(&store, plan, &[Value::Array(vec![Value::Int(12), Value::BigInt(10)])]);
        assert_eq!(rel.rows.len(), 2);

        let mut values = SelectPlan::from_source(Source::Values {
            columns: vec!["Value".into()],
            slot: 0,
            alias: "t0".into(),
        });
        values.projection = vec![item(
            ScalarExpr::binary(BinaryOp::Add, col("t0", "Value"), ScalarExpr::literal(1)),
            "c0",
        )];
        let rel = run(&store, values, &[Value::Array(vec![Value::Int(1), Value::Int(2)])]);
        assert_eq!(rel.rows, vec![vec![Value::Int(2)], vec![Value::Int(3)]]);
    }

    #[test]
    fn set_operations_follow_sql() {
        let store = store();
        let ids = |filter: ScalarExpr| {
            let mut s = SelectPlan::from_source(table("Pet", "t0"));
            s.filter = Some(filter);
            s.projection = vec![item(col("t0", "Owner.Id"), "c0")];
            QueryPlan::Select(Box::new(s))
        };
        let all = ids(ScalarExpr::literal(true));
        let heavy = ids(ScalarExpr::binary(BinaryOp::Gt, col("t0", "Weight"), ScalarExpr::literal(4)));
        let temps = HashMap::new();
        let eval = Evaluator::new(&store, &temps, &[]);
        let union = eval
            .run(&QueryPlan::SetOp {
                op: SetOpKind::Union,
                left: Box::new(all.clone()),
                right: Box::new(heavy.clone()),
            })
            .unwrap();
        assert_eq!(union.rows.len(), 2);
        let except = eval
            .run(&QueryPlan::SetOp {
                op: SetOpKind::Except,
                left: Box::new(all),
                right: Box::new(heavy),
            })
            .unwrap();
        assert_eq!(except.rows, vec![vec![Value::Int(1)]]);
    }

    #[test]
    fn limit_and_offset_apply_after_ordering() {
        let store = store();
        let mut plan = SelectPlan::from_source(table("Pet", "t0"));
        plan.projection = vec![item(col("t0", "Id"), "c0")];
        plan.order_by = vec![OrderItem {
            expr: col("t0", "Id"),
            descending: true,
        }];
        plan.offset = Some(1);
        plan.limit = Some(1);
        assert_eq!(run(&store, plan, &[]).rows, vec![vec![Value::Int(11)]]);
    }
}
