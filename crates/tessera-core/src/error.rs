//! Error types for Tessera operations.

use std::fmt;

/// The primary error type for all Tessera operations.
#[derive(Debug)]
pub enum Error {
    /// An active entity already owns the key
    DuplicateKey(DuplicateKeyError),
    /// Illegal state mutation (write to a removed entity, stale handle, ...)
    InvalidOperation(String),
    /// A storage constraint rejected a flushed statement
    ConstraintViolation(ConstraintViolationError),
    /// A `Deny` removal action found a live counterpart
    ReferentialIntegrity(ReferentialIntegrityError),
    /// Optimistic concurrency check failed
    VersionConflict(VersionConflictError),
    /// The query tree contains a construct the translator cannot lower
    QueryTranslation(QueryTranslationError),
    /// A structure of the wrong runtime type was assigned
    TypeMismatch(TypeMismatchError),
    /// Storage-level query or statement failure
    Query(QueryError),
    /// Value conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// The domain model is inconsistent
    Model(ModelError),
    /// Validation errors
    Validation(ValidationError),
    /// Configuration errors
    Config(ConfigError),
    /// Serialization/deserialization errors
    Serde(String),
}

#[derive(Debug, Clone)]
pub struct DuplicateKeyError {
    pub entity_type: String,
    pub key: String,
}

/// Which storage constraint was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Primary key collision
    PrimaryKey,
    /// Unique index collision
    Unique,
    /// Foreign key points nowhere, or a referenced row was deleted
    ForeignKey,
    /// NULL written to a non-nullable column
    NotNull,
}

impl ConstraintKind {
    /// The SQLSTATE code drivers report for this constraint class.
    pub const fn sqlstate(self) -> &'static str {
        match self {
            ConstraintKind::PrimaryKey | ConstraintKind::Unique => "23505",
            ConstraintKind::ForeignKey => "23503",
            ConstraintKind::NotNull => "23502",
        }
    }
}

#[derive(Debug)]
pub struct ConstraintViolationError {
    pub kind: ConstraintKind,
    pub table: Option<String>,
    pub message: String,
    /// The storage error that reported the violation
    pub source: Box<Error>,
}

#[derive(Debug, Clone)]
pub struct ReferentialIntegrityError {
    /// Type of the entity whose removal was denied
    pub entity_type: String,
    pub key: String,
    /// Association (`Type.Field`) carrying the `Deny` action
    pub association: String,
    /// Type of the live counterpart
    pub referencing_type: String,
    pub referencing_key: String,
}

#[derive(Debug, Clone)]
pub struct VersionConflictError {
    pub entity_type: String,
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct QueryTranslationError {
    pub message: String,
    /// Short description of the offending node, if known
    pub node: Option<String>,
}

impl QueryTranslationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            node: None,
        }
    }

    pub fn at(message: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            node: Some(node.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypeMismatchError {
    pub field: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
    pub table: Option<String>,
    /// Position of the failing statement within a batch
    pub statement_index: Option<usize>,
    pub constraint: Option<ConstraintKind>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// A statement with an expected row count affected a different number of rows
    RowCountMismatch,
    /// The plan uses something the driver cannot execute
    Unsupported,
    /// Other database error
    Database,
}

impl QueryError {
    /// Create a query error of the given kind with a message.
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            table: None,
            statement_index: None,
            constraint: None,
            source: None,
        }
    }

    /// Create a constraint error against a table.
    pub fn constraint(kind: ConstraintKind, table: &str, message: impl Into<String>) -> Self {
        Self {
            constraint: Some(kind),
            table: Some(table.to_string()),
            ..Self::new(QueryErrorKind::Constraint, message)
        }
    }

    #[must_use]
    pub fn with_statement_index(mut self, index: usize) -> Self {
        self.statement_index = Some(index);
        self
    }

    /// SQLSTATE for constraint failures.
    pub fn sqlstate(&self) -> Option<&'static str> {
        self.constraint.map(ConstraintKind::sqlstate)
    }

    /// Is this a unique or primary key violation?
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self.constraint,
            Some(ConstraintKind::PrimaryKey | ConstraintKind::Unique)
        )
    }
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// No transaction is active
    NotActive,
    /// A transaction is already active
    AlreadyActive,
    /// Savepoint not found
    SavepointNotFound,
    /// Scope tokens completed out of order
    ScopeMismatch,
    /// Commit-time validation of the transaction log failed
    CommitFailed,
}

#[derive(Debug, Clone)]
pub struct ModelError {
    pub message: String,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Validation error for field-level and entity-level validation.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Type of the entity that failed validation, if known
    pub entity_type: Option<String>,
    /// The individual failures
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for a field.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// The field name that failed validation
    pub field: String,
    /// The kind of validation that failed
    pub kind: ValidationErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// The type of validation constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Value is below minimum
    Min,
    /// Value is above maximum
    Max,
    /// String is shorter than minimum length
    MinLength,
    /// String is longer than maximum length
    MaxLength,
    /// Value doesn't match regex pattern
    Pattern,
    /// Required field is missing/null
    Required,
    /// Custom validation failed
    Custom,
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new() -> Self {
        Self {
            entity_type: None,
            errors: Vec::new(),
        }
    }

    /// Create an empty container for a specific entity type.
    pub fn for_entity(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            errors: Vec::new(),
        }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add a field validation error.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            kind,
            message: message.into(),
        });
    }

    /// Add a min value error.
    pub fn add_min(&mut self, field: impl Into<String>, min: impl fmt::Display, actual: impl fmt::Display) {
        self.add(
            field,
            ValidationErrorKind::Min,
            format!("must be at least {min}, got {actual}"),
        );
    }

    /// Add a max value error.
    pub fn add_max(&mut self, field: impl Into<String>, max: impl fmt::Display, actual: impl fmt::Display) {
        self.add(
            field,
            ValidationErrorKind::Max,
            format!("must be at most {max}, got {actual}"),
        );
    }

    /// Add a min length error.
    pub fn add_min_length(&mut self, field: impl Into<String>, min: usize, actual: usize) {
        self.add(
            field,
            ValidationErrorKind::MinLength,
            format!("must be at least {min} characters, got {actual}"),
        );
    }

    /// Add a max length error.
    pub fn add_max_length(&mut self, field: impl Into<String>, max: usize, actual: usize) {
        self.add(
            field,
            ValidationErrorKind::MaxLength,
            format!("must be at most {max} characters, got {actual}"),
        );
    }

    /// Add a pattern match error.
    pub fn add_pattern(&mut self, field: impl Into<String>, pattern: &str) {
        self.add(
            field,
            ValidationErrorKind::Pattern,
            format!("must match pattern '{pattern}'"),
        );
    }

    /// Add a required field error.
    pub fn add_required(&mut self, field: impl Into<String>) {
        self.add(field, ValidationErrorKind::Required, "is required");
    }

    /// Add a custom validation error.
    pub fn add_custom(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.add(field, ValidationErrorKind::Custom, message);
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

impl Error {
    /// Shorthand for [`Error::InvalidOperation`].
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Error::InvalidOperation(message.into())
    }

    /// Shorthand for [`Error::Model`].
    pub fn model(message: impl Into<String>) -> Self {
        Error::Model(ModelError {
            message: message.into(),
        })
    }

    /// Shorthand for [`Error::QueryTranslation`].
    pub fn translation(message: impl Into<String>) -> Self {
        Error::QueryTranslation(QueryTranslationError::new(message))
    }

    /// SQLSTATE of a constraint failure, raw or wrapped.
    pub fn sqlstate(&self) -> Option<&'static str> {
        match self {
            Error::Query(q) => q.sqlstate(),
            Error::ConstraintViolation(c) => Some(c.kind.sqlstate()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateKey(e) => write!(f, "Duplicate key: {}", e),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::ConstraintViolation(e) => write!(f, "Constraint violation: {}", e),
            Error::ReferentialIntegrity(e) => write!(f, "Referential integrity error: {}", e),
            Error::VersionConflict(e) => write!(f, "Version conflict: {}", e),
            Error::QueryTranslation(e) => write!(f, "Query translation error: {}", e),
            Error::TypeMismatch(e) => write!(f, "Type mismatch: {}", e),
            Error::Query(e) => {
                if let Some(sqlstate) = e.sqlstate() {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Model(e) => write!(f, "Model error: {}", e.message),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ConstraintViolation(e) => Some(e.source.as_ref()),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for DuplicateKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "an active {} with key {} already exists in this session",
            self.entity_type, self.key
        )
    }
}

impl fmt::Display for ConstraintViolationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{:?} on '{}': {}", self.kind, table, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl fmt::Display for ReferentialIntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot remove {} {}: {} {} still references it through {}",
            self.entity_type,
            self.key,
            self.referencing_type,
            self.referencing_key,
            self.association
        )
    }
}

impl fmt::Display for VersionConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.entity_type, self.key, self.message)
    }
}

impl fmt::Display for QueryTranslationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{} (at {})", self.message, node),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TypeMismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field '{}' expects exactly {}, got {}",
            self.field, self.expected, self.actual
        )
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = self.sqlstate() {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "validation error on '{}': {}", err.field, err.message)
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<DuplicateKeyError> for Error {
    fn from(err: DuplicateKeyError) -> Self {
        Error::DuplicateKey(err)
    }
}

impl From<ConstraintViolationError> for Error {
    fn from(err: ConstraintViolationError) -> Self {
        Error::ConstraintViolation(err)
    }
}

impl From<ReferentialIntegrityError> for Error {
    fn from(err: ReferentialIntegrityError) -> Self {
        Error::ReferentialIntegrity(err)
    }
}

impl From<VersionConflictError> for Error {
    fn from(err: VersionConflictError) -> Self {
        Error::VersionConflict(err)
    }
}

impl From<QueryTranslationError> for Error {
    fn from(err: QueryTranslationError) -> Self {
        Error::QueryTranslation(err)
    }
}

impl From<TypeMismatchError> for Error {
    fn from(err: TypeMismatchError) -> Self {
        Error::TypeMismatch(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ModelError> for Error {
    fn from(err: ModelError) -> Self {
        Error::Model(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for Tessera operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_helpers() {
        let query = QueryError::constraint(ConstraintKind::Unique, "Person", "duplicate email")
            .with_statement_index(2);

        assert!(query.is_unique_violation());
        assert_eq!(query.statement_index, Some(2));
        assert_eq!(query.table.as_deref(), Some("Person"));

        let err = Error::Query(query);
        assert_eq!(err.sqlstate(), Some("23505"));
        assert!(err.to_string().contains("SQLSTATE 23505"));
    }

    #[test]
    fn wrapped_constraint_keeps_source() {
        let storage = Error::Query(QueryError::constraint(
            ConstraintKind::ForeignKey,
            "Book",
            "missing Author",
        ));
        let err = Error::ConstraintViolation(ConstraintViolationError {
            kind: ConstraintKind::ForeignKey,
            table: Some("Book".to_string()),
            message: "missing Author".to_string(),
            source: Box::new(storage),
        });

        assert_eq!(err.sqlstate(), Some("23503"));
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("missing Author"));
    }

    #[test]
    fn validation_error_display() {
        let mut v = ValidationError::for_entity("Person");
        assert!(v.is_empty());
        v.add_min("Age", 0, -1);
        assert_eq!(
            v.to_string(),
            "validation error on 'Age': must be at least 0, got -1"
        );
        v.add_required("Name");
        assert!(v.to_string().starts_with("validation errors:"));
        assert!(v.into_result().is_err());
    }

    #[test]
    fn referential_integrity_display() {
        let err = Error::ReferentialIntegrity(ReferentialIntegrityError {
            entity_type: "Link".to_string(),
            key: "(1)".to_string(),
            association: "Node.Link".to_string(),
            referencing_type: "Node".to_string(),
            referencing_key: "(7)".to_string(),
        });
        let text = err.to_string();
        assert!(text.contains("Node.Link"));
        assert!(text.contains("cannot remove Link (1)"));
    }
}
