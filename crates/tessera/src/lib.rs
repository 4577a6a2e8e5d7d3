//! Tessera - identity-mapped sessions over relational storage.
//!
//! Tessera maps a declared domain model (entity types, structures,
//! interfaces, references and entity sets) onto tables, and provides:
//!
//! - A [`Session`] with an identity map, change tracking and ordered,
//!   batched flushes
//! - Paired associations kept in step on both sides, with cascade, clear and
//!   deny removal actions
//! - A [`Query`] expression tree translated into relational plans, with a
//!   compiled-query cache and deferred [`FutureQuery`] batches
//! - Optimistic versioning, validation hooks and nested transaction scopes
//! - [`MemoryDatabase`], an in-memory reference driver
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::prelude::*;
//!
//! let model = DomainModel::builder()
//!     .entity(
//!         EntityDecl::new("Author")
//!             .key("Id", ScalarType::Int)
//!             .field(FieldDecl::scalar("Name", ScalarType::Text))
//!             .field(FieldDecl::entity_set("Books", "Book").paired_with("Author")),
//!     )
//!     .entity(
//!         EntityDecl::new("Book")
//!             .key("Id", ScalarType::Int)
//!             .field(FieldDecl::scalar("Title", ScalarType::Text))
//!             .field(FieldDecl::reference("Author", "Author")),
//!     )
//!     .build()?;
//!
//! let db = MemoryDatabase::from_model(&model, MemoryConfig::default());
//! let mut session = Session::new(Arc::clone(&model), db.connect(), SessionConfig::default());
//!
//! let ann = session.create("Author", vec![Value::Int(1)])?;
//! session.set_value(ann, "Name", "Ann")?;
//! let book = session.create("Book", vec![Value::Int(7)])?;
//! session.set_value(book, "Title", "Tessellations")?;
//! session.set_reference(&cx, book, "Author", Some(ann)).await?;
//!
//! // Author.Books now contains the book.
//! let books = session
//!     .query_entities(&cx, &Query::all("Book").filter(|b| b.path("Author.Name").eq("Ann")), &Args::new())
//!     .await?;
//!
//! session.save_changes(&cx).await?;
//! ```

pub use tessera_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Data
    Key,
    Row,
    StructureField,
    StructureValue,
    Tuple,
    Value,
    // Model
    DomainModel,
    DomainModelBuilder,
    EntityDecl,
    FieldDecl,
    InheritanceMapping,
    InterfaceDecl,
    KeyGenerator,
    OnRemoveAction,
    ScalarType,
    StructureDecl,
    // Driver boundary
    Connection,
    Dialect,
    DriverCapabilities,
    // Validation
    EntityView,
    Validator,
    // Errors
    ConstraintKind,
    Error,
    QueryErrorKind,
    Result,
    TransactionErrorKind,
    try_outcome,
    try_result,
};

pub use tessera_query::{
    AggregateKind, Args, CacheStats, CompiledQuery, ElementType, Expr, JoinType, LocalList, Query,
    QueryCache, SetOperation, SubqueryKind, compile,
};

pub use tessera_session::{
    EntityId, EntityLifecycle, FlushSummary, FutureQuery, QueryValue, ScopeToken, Session,
    SessionConfig, SessionProfile, TransactionMode, VersionInfo, VersionSet,
};

pub use tessera_memory::{MemoryConfig, MemoryConnection, MemoryDatabase, MemoryStats};

// The layer crates, for items the flat re-exports leave out (plan IR, catalog).
pub use tessera_core;
pub use tessera_query;
pub use tessera_session;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tessera::prelude::*;
/// ```
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::{
        // Session
        Args,
        Cx,
        DomainModel,
        EntityDecl,
        EntityId,
        EntityLifecycle,
        Error,
        // Query building
        Expr,
        FieldDecl,
        FutureQuery,
        KeyGenerator,
        // Driver
        MemoryConfig,
        MemoryDatabase,
        OnRemoveAction,
        Outcome,
        Query,
        QueryValue,
        Result,
        ScalarType,
        Session,
        SessionConfig,
        StructureDecl,
        TransactionMode,
        Validator,
        Value,
    };
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn prelude_builds_a_model_and_database() {
        let model = DomainModel::builder()
            .entity(
                EntityDecl::new("Tag")
                    .key("Id", ScalarType::Int)
                    .field(FieldDecl::scalar("Label", ScalarType::Text)),
            )
            .build()
            .expect("model builds");
        let db = MemoryDatabase::from_model(&model, MemoryConfig::default());
        let mut session = Session::new(Arc::clone(&model), db.connect(), SessionConfig::default());
        let tag = session.create("Tag", vec![Value::Int(1)]).unwrap();
        assert_eq!(session.lifecycle(tag).unwrap(), EntityLifecycle::New);
        assert_eq!(session.type_name(tag).unwrap(), "Tag");
    }
}
