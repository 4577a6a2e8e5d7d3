//! Persistence statements produced by the flush scheduler.

use crate::value::Value;

/// A data-modifying statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Multi-row insert; all rows share the column list.
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    /// `UPDATE table SET ... WHERE c1 = v1 AND ...`
    Update {
        table: String,
        assignments: Vec<(String, Value)>,
        filter: Vec<(String, Value)>,
        /// Abort the batch unless exactly this many rows change
        expected_rows: Option<u64>,
    },
    /// Delete the rows whose `filter_columns` equal any of `rows`.
    Delete {
        table: String,
        filter_columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        expected_rows: Option<u64>,
    },
    /// Create (or replace) a connection-local temporary table.
    CreateTempTable {
        name: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    DropTempTable { name: String },
}

impl Statement {
    /// Table the statement targets.
    pub fn table(&self) -> &str {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
            Statement::CreateTempTable { name, .. } | Statement::DropTempTable { name } => name,
        }
    }

    pub fn expected_rows(&self) -> Option<u64> {
        match self {
            Statement::Update { expected_rows, .. } | Statement::Delete { expected_rows, .. } => {
                *expected_rows
            }
            _ => None,
        }
    }

    /// Short label for logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Statement::Insert { .. } => "insert",
            Statement::Update { .. } => "update",
            Statement::Delete { .. } => "delete",
            Statement::CreateTempTable { .. } => "create-temp",
            Statement::DropTempTable { .. } => "drop-temp",
        }
    }
}
