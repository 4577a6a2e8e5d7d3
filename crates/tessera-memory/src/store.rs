//! Table storage and statement application.
//!
//! A [`Store`] is one consistent version of every mapped table. Statements
//! apply atomically: the affected table is rebuilt aside, every constraint is
//! checked against the result, and only then swapped in.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tessera_core::{
    Catalog, ConstraintKind, Error, HashableValue, QueryError, QueryErrorKind, Statement,
    TableSchema, Value,
};

#[derive(Debug, Clone)]
pub(crate) struct TableData {
    pub(crate) schema: Arc<TableSchema>,
    pub(crate) rows: Vec<Vec<Value>>,
}

impl TableData {
    pub(crate) fn column_names(&self) -> Vec<String> {
        self.schema.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Every mapped table at one point in time.
#[derive(Debug, Clone, Default)]
pub(crate) struct Store {
    tables: BTreeMap<String, TableData>,
}

type RowKey = Vec<HashableValue>;

fn row_key(row: &[Value], columns: &[usize]) -> Option<RowKey> {
    let mut key = Vec::with_capacity(columns.len());
    for c in columns {
        let value = row.get(*c)?;
        if value.is_null() {
            return None;
        }
        key.push(HashableValue(value.clone()));
    }
    Some(key)
}

fn not_found(message: String) -> Error {
    Error::Query(QueryError::new(QueryErrorKind::NotFound, message))
}

fn violation(kind: ConstraintKind, table: &str, message: String) -> Error {
    Error::Query(QueryError::constraint(kind, table, message))
}

fn row_filter_matches(row: &[Value], columns: &[usize], values: &[Value]) -> bool {
    columns
        .iter()
        .zip(values)
        .all(|(c, v)| row.get(*c).is_some_and(|stored| stored.same_value(v)))
}

#[allow(clippy::result_large_err)]
fn column_indexes(schema: &TableSchema, names: &[String]) -> Result<Vec<usize>, Error> {
    names
        .iter()
        .map(|name| {
            schema.column_index(name).ok_or_else(|| {
                not_found(format!("table '{}' has no column '{name}'", schema.name))
            })
        })
        .collect()
}

#[allow(clippy::result_large_err)]
fn coerce(schema: &TableSchema, column: usize, value: &Value) -> Result<Value, Error> {
    let def = &schema.columns[column];
    def.ty.coerce(value.clone()).map_err(|e| match e {
        Error::Type(mut te) => {
            te.column = Some(format!("{}.{}", schema.name, def.name));
            Error::Type(te)
        }
        other => other,
    })
}

impl Store {
    pub(crate) fn from_catalog(catalog: &Catalog) -> Self {
        let tables = catalog
            .tables()
            .iter()
            .map(|schema| {
                (
                    schema.name.clone(),
                    TableData {
                        schema: Arc::new(schema.clone()),
                        rows: Vec::new(),
                    },
                )
            })
            .collect();
        Self { tables }
    }

    pub(crate) fn table(&self, name: &str) -> Option<&TableData> {
        self.tables.get(name)
    }

    #[allow(clippy::result_large_err)]
    fn table_or_err(&self, name: &str) -> Result<&TableData, Error> {
        self.tables
            .get(name)
            .ok_or_else(|| not_found(format!("no such table '{name}'")))
    }

    /// Apply one persistence statement; returns the rows affected.
    ///
    /// Temp-table statements are connection-local and rejected here.
    #[allow(clippy::result_large_err)]
    pub(crate) fn apply(&mut self, statement: &Statement) -> Result<u64, Error> {
        let (name, rows, affected, touched) = match statement {
            Statement::Insert {
                table,
                columns,
                rows,
            } => {
                let data = self.table_or_err(table)?;
                let schema = &data.schema;
                let indexes = column_indexes(schema, columns)?;
                let mut next = data.rows.clone();
                let start = next.len();
                for values in rows {
                    if values.len() != indexes.len() {
                        return Err(Error::Query(QueryError::new(
                            QueryErrorKind::Database,
                            format!(
                                "insert into '{table}' expects {} value(s) per row, got {}",
                                indexes.len(),
                                values.len()
                            ),
                        )));
                    }
                    let mut row = vec![Value::Null; schema.columns.len()];
                    for (c, value) in indexes.iter().zip(values) {
                        row[*c] = coerce(schema, *c, value)?;
                    }
                    next.push(row);
                }
                let touched: Vec<usize> = (start..next.len()).collect();
                (table, next, rows.len() as u64, touched)
            }
            Statement::Update {
                table,
                assignments,
                filter,
                expected_rows,
            } => {
                let data = self.table_or_err(table)?;
                let schema = &data.schema;
                let filter_columns: Vec<String> = filter.iter().map(|(c, _)| c.clone()).collect();
                let filter_values: Vec<Value> = filter.iter().map(|(_, v)| v.clone()).collect();
                let filter_indexes = column_indexes(schema, &filter_columns)?;
                let assigned_columns: Vec<String> =
                    assignments.iter().map(|(c, _)| c.clone()).collect();
                let assigned = column_indexes(schema, &assigned_columns)?;
                let mut coerced = Vec::with_capacity(assigned.len());
                for (c, (_, value)) in assigned.iter().zip(assignments) {
                    coerced.push(coerce(schema, *c, value)?);
                }
                let mut next = data.rows.clone();
                let mut touched = Vec::new();
                for (i, row) in next.iter_mut().enumerate() {
                    if row_filter_matches(row, &filter_indexes, &filter_values) {
                        for (c, value) in assigned.iter().zip(&coerced) {
                            row[*c] = value.clone();
                        }
                        touched.push(i);
                    }
                }
                let affected = touched.len() as u64;
                check_expected(table, *expected_rows, affected)?;
                (table, next, affected, touched)
            }
            Statement::Delete {
                table,
                filter_columns,
                rows,
                expected_rows,
            } => {
                let data = self.table_or_err(table)?;
                let indexes = column_indexes(&data.schema, filter_columns)?;
                let before = data.rows.len();
                let next: Vec<Vec<Value>> = data
                    .rows
                    .iter()
                    .filter(|row| !rows.iter().any(|f| row_filter_matches(row, &indexes, f)))
                    .cloned()
                    .collect();
                let affected = (before - next.len()) as u64;
                check_expected(table, *expected_rows, affected)?;
                (table, next, affected, Vec::new())
            }
            Statement::CreateTempTable { name, .. } | Statement::DropTempTable { name } => {
                return Err(Error::Query(QueryError::new(
                    QueryErrorKind::Unsupported,
                    format!("temp table '{name}' is connection-local"),
                )));
            }
        };

        let name = name.clone();
        let schema = Arc::clone(&self.table_or_err(&name)?.schema);
        self.check_table(&schema, &rows)?;
        self.check_outgoing(&schema, &rows, &touched)?;
        if !matches!(statement, Statement::Insert { .. }) {
            self.check_incoming(&schema, &rows)?;
        }
        if let Some(data) = self.tables.get_mut(&name) {
            data.rows = rows;
        }
        Ok(affected)
    }

    /// Primary key, NOT NULL and unique checks over a whole table.
    #[allow(clippy::result_large_err)]
    fn check_table(&self, schema: &TableSchema, rows: &[Vec<Value>]) -> Result<(), Error> {
        for (c, column) in schema.columns.iter().enumerate() {
            if column.nullable {
                continue;
            }
            if rows.iter().any(|row| row[c].is_null()) {
                return Err(violation(
                    ConstraintKind::NotNull,
                    &schema.name,
                    format!("NULL in non-nullable column {}.{}", schema.name, column.name),
                ));
            }
        }

        let pk = column_indexes(schema, &schema.primary_key)?;
        let mut seen = HashSet::with_capacity(rows.len());
        for row in rows {
            let Some(key) = row_key(row, &pk) else {
                return Err(violation(
                    ConstraintKind::NotNull,
                    &schema.name,
                    format!("NULL primary key in table '{}'", schema.name),
                ));
            };
            if !seen.insert(key) {
                return Err(violation(
                    ConstraintKind::PrimaryKey,
                    &schema.name,
                    format!("duplicate primary key in table '{}'", schema.name),
                ));
            }
        }

        for unique in &schema.unique {
            let columns = column_indexes(schema, unique)?;
            let mut seen = HashSet::new();
            for row in rows {
                if let Some(key) = row_key(row, &columns) {
                    if !seen.insert(key) {
                        return Err(violation(
                            ConstraintKind::Unique,
                            &schema.name,
                            format!(
                                "duplicate value in unique index ({}) of table '{}'",
                                unique.join(", "),
                                schema.name
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Foreign keys held by `touched` rows must point at existing rows.
    #[allow(clippy::result_large_err)]
    fn check_outgoing(
        &self,
        schema: &TableSchema,
        rows: &[Vec<Value>],
        touched: &[usize],
    ) -> Result<(), Error> {
        if touched.is_empty() {
            return Ok(());
        }
        for fk in &schema.foreign_keys {
            let local = column_indexes(schema, &fk.columns)?;
            let (target_schema, target_rows) = if fk.referenced_table == schema.name {
                (schema, rows)
            } else {
                let target = self.table_or_err(&fk.referenced_table)?;
                (target.schema.as_ref(), target.rows.as_slice())
            };
            let remote = column_indexes(target_schema, &fk.referenced_columns)?;
            let present: HashSet<RowKey> =
                target_rows.iter().filter_map(|r| row_key(r, &remote)).collect();
            for i in touched {
                if let Some(key) = row_key(&rows[*i], &local) {
                    if !present.contains(&key) {
                        return Err(violation(
                            ConstraintKind::ForeignKey,
                            &schema.name,
                            format!(
                                "({}) of table '{}' references a missing row of '{}'",
                                fk.columns.join(", "),
                                schema.name,
                                fk.referenced_table
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// No other row may reference a row that vanished from `schema`'s table.
    #[allow(clippy::result_large_err)]
    fn check_incoming(&self, schema: &TableSchema, rows: &[Vec<Value>]) -> Result<(), Error> {
        for data in self.tables.values() {
            for fk in &data.schema.foreign_keys {
                if fk.referenced_table != schema.name {
                    continue;
                }
                let remote = column_indexes(schema, &fk.referenced_columns)?;
                let present: HashSet<RowKey> =
                    rows.iter().filter_map(|r| row_key(r, &remote)).collect();
                let referencing: &[Vec<Value>] = if data.schema.name == schema.name {
                    rows
                } else {
                    &data.rows
                };
                let local = column_indexes(&data.schema, &fk.columns)?;
                for row in referencing {
                    if let Some(key) = row_key(row, &local) {
                        if !present.contains(&key) {
                            return Err(violation(
                                ConstraintKind::ForeignKey,
                                &schema.name,
                                format!(
                                    "row of '{}' is still referenced by ({}) of '{}'",
                                    schema.name,
                                    fk.columns.join(", "),
                                    data.schema.name
                                ),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[allow(clippy::result_large_err)]
fn check_expected(table: &str, expected: Option<u64>, affected: u64) -> Result<(), Error> {
    match expected {
        Some(expected) if expected != affected => {
            let mut err = QueryError::new(
                QueryErrorKind::RowCountMismatch,
                format!("expected {expected} row(s) of '{table}' to change, {affected} did"),
            );
            err.table = Some(table.to_string());
            Err(Error::Query(err))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{DomainModel, EntityDecl, FieldDecl, ScalarType};

    fn store() -> Store {
        let model = DomainModel::builder()
            .entity(
                EntityDecl::new("Owner")
                    .key("Id", ScalarType::Int)
                    .field(FieldDecl::scalar("Name", ScalarType::Text))
                    .unique(&["Name"]),
            )
            .entity(
                EntityDecl::new("Pet")
                    .key("Id", ScalarType::Int)
                    .field(FieldDecl::reference("Owner", "Owner").nullable()),
            )
            .build()
            .unwrap();
        Store::from_catalog(model.catalog())
    }

    fn insert(table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Statement {
        Statement::Insert {
            table: table.to_string(),
            columns: columns.iter().map(ToString::to_string).collect(),
            rows,
        }
    }

    fn owner(id: i32, name: &str) -> Vec<Value> {
        vec![Value::Int(0), Value::Int(id), Value::Text(name.into())]
    }

    const OWNER: &[&str] = &["TypeId", "Id", "Name"];

    #[test]
    fn multi_row_insert_is_atomic() {
        let mut store = store();
        let err = store
            .apply(&insert("Owner", OWNER, vec![owner(1, "a"), owner(1, "b")]))
            .unwrap_err();
        assert_eq!(err.sqlstate(), Some("23505"));
        assert!(store.table("Owner").unwrap().rows.is_empty());
    }

    #[test]
    fn inserted_values_are_coerced_to_column_types() {
        let mut store = store();
        store
            .apply(&insert(
                "Owner",
                OWNER,
                vec![vec![Value::BigInt(0), Value::BigInt(5), Value::Text("a".into())]],
            ))
            .unwrap();
        assert_eq!(store.table("Owner").unwrap().rows[0][1], Value::Int(5));
    }

    #[test]
    fn unique_index_ignores_nulls_but_rejects_duplicates() {
        let mut store = store();
        store.apply(&insert("Owner", OWNER, vec![owner(1, "a")])).unwrap();
        let err = store.apply(&insert("Owner", OWNER, vec![owner(2, "a")])).unwrap_err();
        assert!(matches!(err, Error::Query(ref q) if q.constraint == Some(ConstraintKind::Unique)));
    }

    #[test]
    fn foreign_keys_are_checked_both_ways() {
        let mut store = store();
        let pet = |owner: Value| insert("Pet", &["TypeId", "Id", "Owner.Id"], vec![vec![Value::Int(1), Value::Int(9), owner]]);
        let err = store.apply(&pet(Value::Int(1))).unwrap_err();
        assert_eq!(err.sqlstate(), Some("23503"));

        store.apply(&insert("Owner", OWNER, vec![owner(1, "a")])).unwrap();
        store.apply(&pet(Value::Int(1))).unwrap();
        let delete = Statement::Delete {
            table: "Owner".into(),
            filter_columns: vec!["Id".into()],
            rows: vec![vec![Value::Int(1)]],
            expected_rows: None,
        };
        assert_eq!(store.apply(&delete).unwrap_err().sqlstate(), Some("23503"));
        assert_eq!(store.table("Owner").unwrap().rows.len(), 1);
    }

    #[test]
    fn expected_row_counts_are_enforced() {
        let mut store = store();
        store.apply(&insert("Owner", OWNER, vec![owner(1, "a")])).unwrap();
        let update = Statement::Update {
            table: "Owner".into(),
            assignments: vec![("Name".into(), Value::Text("b".into()))],
            filter: vec![("Id".into(), Value::Int(2))],
            expected_rows: Some(1),
        };
        let err = store.apply(&update).unwrap_err();
        assert!(matches!(err, Error::Query(ref q) if q.kind == QueryErrorKind::RowCountMismatch));
        assert_eq!(store.table("Owner").unwrap().rows[0][2], Value::Text("a".into()));
    }
}
