//! Core types and traits for Tessera.
//!
//! This crate provides the foundations the session, the query translator and
//! drivers share:
//!
//! - [`Value`], [`Row`], [`Tuple`] and [`Key`] for data and identity
//! - [`DomainModel`], the resolved entity model and its relational [`Catalog`]
//! - [`QueryPlan`] and [`Statement`], the relational IR handed to drivers
//! - [`Connection`], the driver boundary
//! - validation hooks and the [`Error`] taxonomy
//! - `Outcome` and `Cx` re-exports from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod key;
pub mod model;
pub mod plan;
pub mod row;
pub mod sql;
pub mod statement;
pub mod structure;
pub mod tuple;
pub mod validate;
pub mod value;

pub use connection::{BatchQuery, Connection, CursorGuard, DriverCapabilities, RowReader};
pub use error::{
    ConfigError, ConstraintKind, ConstraintViolationError, DuplicateKeyError, Error,
    FieldValidationError, ModelError, QueryError, QueryErrorKind, QueryTranslationError,
    ReferentialIntegrityError, Result, TransactionError, TransactionErrorKind, TypeError,
    TypeMismatchError, ValidationError, ValidationErrorKind, VersionConflictError,
};
pub use key::Key;
pub use model::{
    AssocIdx, AssociationDef, Catalog, ColumnDef, ColumnSchema, DomainModel, DomainModelBuilder,
    EntityDecl, EntityTypeDef, FieldDecl, FieldDef, FieldIdx, FieldKind, ForeignKeySchema,
    HierarchyDef, InheritanceMapping, InterfaceDecl, InterfaceDef, InterfaceIdx, KeyGenerator,
    Multiplicity, OnRemoveAction, ProjectedColumn, ScalarType, StructFieldKind, StructIdx,
    StructLeaf, StructureDecl, StructureDef, TYPE_ID_COLUMN, TableSchema, TypeIdx, TypeRef,
};
pub use plan::{
    AggregateFunc, BinaryOp, JoinKind, JoinPlan, OrderItem, ProjectionItem, QueryPlan,
    ScalarExpr, SelectPlan, SetOpKind, Source,
};
pub use row::{ColumnInfo, Row};
pub use sql::{Dialect, RenderedSql, render_plan, render_statement};
pub use statement::Statement;
pub use structure::{StructureField, StructureValue};
pub use tuple::{FieldMask, Tuple};
pub use validate::{EntityView, Validator, validate_entity};
pub use value::{HashableValue, Value};

/// Unwrap an [`Outcome`], returning early from the enclosing function on
/// anything but `Ok`.
///
/// # Example
///
/// ```ignore
/// async fn load(cx: &Cx, conn: &impl Connection, plan: &QueryPlan) -> Outcome<Vec<Row>, Error> {
///     let reader = try_outcome!(conn.query(cx, plan, &[]).await);
///     Outcome::Ok(reader.collect_rows())
/// }
/// ```
#[macro_export]
macro_rules! try_outcome {
    ($outcome:expr) => {
        match $outcome {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(err) => return $crate::Outcome::Err(err),
            $crate::Outcome::Cancelled(reason) => return $crate::Outcome::Cancelled(reason),
            $crate::Outcome::Panicked(payload) => return $crate::Outcome::Panicked(payload),
        }
    };
}

/// Unwrap a `Result` inside a function returning [`Outcome`].
#[macro_export]
macro_rules! try_result {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(err) => return $crate::Outcome::Err(::core::convert::From::from(err)),
        }
    };
}
