//! Query expression trees and their translation for Tessera.
//!
//! `tessera-query` is the **query layer**. Callers describe what they want as
//! an immutable [`Query`] tree (sources, filters, projections, joins,
//! grouping, set operations, ordering, paging and aggregates) whose lambdas
//! are [`Expr`] trees. [`compile`] lowers a tree into a relational
//! [`QueryPlan`](tessera_core::QueryPlan) with:
//!
//! - null-safe comparison of possibly-null operands;
//! - polymorphic sources expanded over every concrete implementor;
//! - structures compared and projected leaf by leaf;
//! - reference navigation turned into deduplicated joins;
//! - correlated subqueries resolved through the scope chain.
//!
//! Untranslatable expressions fail at compile time with
//! `Error::QueryTranslation`, before any I/O.
//!
//! A [`CompiledQuery`] depends only on the query's structural fingerprint.
//! [`QueryCache`] keeps compiled plans by fingerprint and
//! [`CompiledQuery::bind`] re-reads local lists from the query being run.
//!
//! ```ignore
//! let q = Query::all("Book")
//!     .filter(|b| b.path("Author.Name").eq("Ann"))
//!     .order_by(|b| b.member("Title"))
//!     .take(10);
//! let compiled = compile(&model, &q)?;
//! let bound = compiled.bind(&q, &Args::new(), &conn.capabilities())?;
//! ```

pub mod cache;
pub mod compiled;
pub mod expr;
pub mod query;
pub mod shape;
pub mod simplify;
pub mod sites;
mod translate;

pub use cache::{CacheStats, CachedPlan, QueryCache};
pub use compiled::{Args, BoundQuery, CompiledQuery, SlotKind, compile};
pub use expr::{AggregateKind, BinaryOp, Expr, ExprNode, Lambda, LocalList, SubqueryKind, Var};
pub use query::{ElementType, JoinType, Query, QueryNode, SetOperation};
pub use shape::ResultShape;
pub use simplify::{Simplified, simplify};
pub use sites::{Analysis, SiteValues, analyze};
