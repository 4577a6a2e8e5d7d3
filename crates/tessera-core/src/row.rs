//! Result rows returned by drivers.
//!
//! Every row of one result set shares a single [`ColumnInfo`]. Column names
//! follow the catalog (`Name`, `Home.City`, `Next.Id`) for table reads and
//! are positional (`c0`, `c1`, ...) for translated projections.

use std::collections::HashMap;
use std::sync::Arc;

use crate::Result;
use crate::error::{Error, TypeError};
use crate::tuple::Tuple;
use crate::value::Value;

/// Column names of a result set.
#[derive(Debug, Clone, Default)]
pub struct ColumnInfo {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl ColumnInfo {
    pub fn new(names: Vec<String>) -> Self {
        let mut positions = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            // First occurrence wins for duplicated projection names.
            positions.entry(name.clone()).or_insert(i);
        }
        Self { names, positions }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// One row of a result set.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// A row with its own column list. Drivers producing many rows should
    /// share one [`ColumnInfo`] through [`Row::with_columns`].
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        Self::with_columns(Arc::new(ColumnInfo::new(column_names)), values)
    }

    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Typed read of a column, by position.
    #[allow(clippy::result_large_err)]
    pub fn get_as<T>(&self, index: usize) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        let Some(value) = self.get(index) else {
            return Err(Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("no column {index} in a row of {}", self.len()),
                column: None,
            }));
        };
        T::try_from(value.clone()).map_err(|err| match err {
            Error::Type(mut te) => {
                te.column = self.columns.names().get(index).cloned();
                Error::Type(te)
            }
            other => other,
        })
    }

    /// Spread selected columns into a tuple of `width` slots.
    ///
    /// `layout[i]` names the row column feeding slot `targets[i]`; a `None`
    /// layout entry leaves that slot unavailable, as does a missing column.
    pub fn scatter(&self, width: usize, targets: &[usize], layout: &[Option<usize>]) -> Tuple {
        let mut tuple = Tuple::new(width);
        for (slot, column) in targets.iter().zip(layout) {
            if let Some(value) = column.and_then(|c| self.values.get(c)) {
                tuple.set(*slot, value.clone());
            }
        }
        tuple
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// (column name, value) pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.names().iter().map(String::as_str).zip(&self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> Row {
        Row::new(
            vec!["Id".into(), "Title".into(), "Author.Id".into()],
            vec![Value::Int(7), Value::Text("Dune".into()), Value::Null],
        )
    }

    #[test]
    fn reads_by_position_and_catalog_name() {
        let row = book();
        assert_eq!(row.len(), 3);
        assert_eq!(row.get(0), Some(&Value::Int(7)));
        assert_eq!(row.get_by_name("Author.Id"), Some(&Value::Null));
        assert_eq!(row.get_by_name("Author"), None);
    }

    #[test]
    fn typed_reads_name_the_failing_column() {
        let row = book();
        assert_eq!(row.get_as::<i64>(0).unwrap(), 7);
        assert_eq!(row.get_as::<Option<i32>>(2).unwrap(), None);
        match row.get_as::<i32>(1).unwrap_err() {
            Error::Type(te) => assert_eq!(te.column.as_deref(), Some("Title")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(row.get_as::<i32>(9).is_err());
    }

    #[test]
    fn scatter_leaves_unselected_slots_unavailable() {
        let row = book();
        let tuple = row.scatter(4, &[0, 2, 3], &[Some(0), None, Some(1)]);
        assert_eq!(tuple.get(0), Some(&Value::Int(7)));
        assert!(!tuple.is_available(1));
        assert!(!tuple.is_available(2));
        assert_eq!(tuple.get(3), Some(&Value::Text("Dune".into())));
    }

    #[test]
    fn duplicated_names_resolve_to_the_first_column() {
        let first = Row::new(vec!["c".into(), "c".into()], vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(first.get_by_name("c"), Some(&Value::Int(1)));
        let second = Row::with_columns(first.column_info(), vec![Value::Int(3), Value::Int(4)]);
        assert_eq!(second.iter().collect::<Vec<_>>(), vec![("c", &Value::Int(3)), ("c", &Value::Int(4))]);
    }
}
