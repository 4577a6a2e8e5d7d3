//! Entity validation hooks.
//!
//! Validators are declared per entity type on the model and run against an
//! [`EntityView`], a read-only look at an entity's current field values.
//! The session runs them before every flush for pending, non-removed
//! entities, and on demand through `Session::validate`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use regex::Regex;

use crate::error::ValidationError;
use crate::value::Value;

/// Thread-safe regex cache for compiled patterns.
///
/// Patterns are compiled lazily on first use and cached for the lifetime
/// of the program.
struct RegexCache {
    cache: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compile(&self, pattern: &str) -> Result<Regex, regex::Error> {
        {
            // A poisoned lock still holds a usable map
            let cache = self.cache.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }

        let regex = Regex::new(pattern)?;
        {
            let mut cache = self
                .cache
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            cache.insert(pattern.to_string(), regex.clone());
        }
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Check if a string matches a regex pattern.
///
/// Returns `false` if the pattern is invalid (logs a warning).
///
/// # Example
///
/// ```ignore
/// use tessera_core::validate::matches_pattern;
///
/// assert!(matches_pattern("test@example.com", r"^[^@\s]+@[^@\s]+\.[a-z]{2,}$"));
/// ```
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    match regex_cache().get_or_compile(pattern) {
        Ok(regex) => regex.is_match(value),
        Err(e) => {
            tracing::warn!(
                pattern = pattern,
                error = %e,
                "Invalid regex pattern in validation, treating as non-match"
            );
            false
        }
    }
}

/// Returns an error message if the pattern is invalid, `None` if valid.
pub fn validate_pattern(pattern: &str) -> Option<String> {
    match Regex::new(pattern) {
        Ok(_) => None,
        Err(e) => Some(format!("invalid regex pattern: {e}")),
    }
}

/// Read-only access to an entity's current field values.
pub trait EntityView {
    /// Name of the entity's runtime type.
    fn entity_type(&self) -> &str;

    /// Current value of a scalar field, `None` when unknown or not loaded.
    fn value(&self, field: &str) -> Option<Value>;
}

/// Closure signature of [`Validator::Custom`].
pub type CustomCheck = dyn Fn(&dyn EntityView, &mut ValidationError) + Send + Sync;

/// A declared validation rule.
#[derive(Clone)]
pub enum Validator {
    /// Field must be present and non-NULL.
    Required { field: String },
    /// Numeric field must lie within the inclusive bounds.
    Range {
        field: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    /// Text field length (in characters) must lie within the inclusive bounds.
    Length {
        field: String,
        min: Option<usize>,
        max: Option<usize>,
    },
    /// Text field must match a regular expression.
    Pattern { field: String, pattern: String },
    /// Arbitrary check that records failures into the error container.
    Custom { name: String, check: Arc<CustomCheck> },
}

impl Validator {
    pub fn required(field: impl Into<String>) -> Self {
        Validator::Required {
            field: field.into(),
        }
    }

    pub fn range(field: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        Validator::Range {
            field: field.into(),
            min,
            max,
        }
    }

    pub fn length(field: impl Into<String>, min: Option<usize>, max: Option<usize>) -> Self {
        Validator::Length {
            field: field.into(),
            min,
            max,
        }
    }

    pub fn pattern(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Validator::Pattern {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    pub fn custom<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&dyn EntityView, &mut ValidationError) + Send + Sync + 'static,
    {
        Validator::Custom {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Field the rule applies to; `None` for custom rules.
    pub fn field(&self) -> Option<&str> {
        match self {
            Validator::Required { field }
            | Validator::Range { field, .. }
            | Validator::Length { field, .. }
            | Validator::Pattern { field, .. } => Some(field),
            Validator::Custom { .. } => None,
        }
    }

    /// Run the rule, appending failures to `errors`.
    pub fn check(&self, view: &dyn EntityView, errors: &mut ValidationError) {
        match self {
            Validator::Required { field } => {
                if view.value(field).is_none_or(|v| v.is_null()) {
                    errors.add_required(field.clone());
                }
            }
            Validator::Range { field, min, max } => {
                let Some(actual) = view.value(field).and_then(|v| v.as_f64()) else {
                    return;
                };
                if let Some(min) = min {
                    if actual < *min {
                        errors.add_min(field.clone(), min, actual);
                    }
                }
                if let Some(max) = max {
                    if actual > *max {
                        errors.add_max(field.clone(), max, actual);
                    }
                }
            }
            Validator::Length { field, min, max } => {
                let Some(Value::Text(text)) = view.value(field) else {
                    return;
                };
                let len = text.chars().count();
                if let Some(min) = min {
                    if len < *min {
                        errors.add_min_length(field.clone(), *min, len);
                    }
                }
                if let Some(max) = max {
                    if len > *max {
                        errors.add_max_length(field.clone(), *max, len);
                    }
                }
            }
            Validator::Pattern { field, pattern } => {
                if let Some(Value::Text(text)) = view.value(field) {
                    if !matches_pattern(&text, pattern) {
                        errors.add_pattern(field.clone(), pattern);
                    }
                }
            }
            Validator::Custom { check, .. } => check(view, errors),
        }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::Required { field } => f.debug_struct("Required").field("field", field).finish(),
            Validator::Range { field, min, max } => f
                .debug_struct("Range")
                .field("field", field)
                .field("min", min)
                .field("max", max)
                .finish(),
            Validator::Length { field, min, max } => f
                .debug_struct("Length")
                .field("field", field)
                .field("min", min)
                .field("max", max)
                .finish(),
            Validator::Pattern { field, pattern } => f
                .debug_struct("Pattern")
                .field("field", field)
                .field("pattern", pattern)
                .finish(),
            Validator::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

/// Run every validator and collect the failures.
pub fn validate_entity(
    validators: &[Validator],
    view: &dyn EntityView,
) -> std::result::Result<(), ValidationError> {
    let mut errors = ValidationError::for_entity(view.entity_type());
    for validator in validators {
        validator.check(view, &mut errors);
    }
    errors.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationErrorKind;

    struct MapView(HashMap<&'static str, Value>);

    impl EntityView for MapView {
        fn entity_type(&self) -> &str {
            "Person"
        }

        fn value(&self, field: &str) -> Option<Value> {
            self.0.get(field).cloned()
        }
    }

    fn view(pairs: &[(&'static str, Value)]) -> MapView {
        MapView(pairs.iter().cloned().collect())
    }

    #[test]
    fn test_matches_email_pattern() {
        let email = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";
        assert!(matches_pattern("test@example.com", email));
        assert!(!matches_pattern("invalid", email));
    }

    #[test]
    fn test_invalid_pattern_is_non_match() {
        assert!(!matches_pattern("anything", "(unclosed"));
        assert!(validate_pattern("(unclosed").is_some());
        assert!(validate_pattern("^ok$").is_none());
    }

    #[test]
    fn test_builtin_validators() {
        let validators = vec![
            Validator::required("Name"),
            Validator::range("Age", Some(0.0), Some(150.0)),
            Validator::length("Name", Some(2), Some(5)),
            Validator::pattern("Code", "^[A-Z]+$"),
        ];
        let ok = view(&[
            ("Name", Value::Text("Ann".into())),
            ("Age", Value::Int(30)),
            ("Code", Value::Text("AB".into())),
        ]);
        assert!(validate_entity(&validators, &ok).is_ok());

        let bad = view(&[
            ("Name", Value::Text("A".into())),
            ("Age", Value::Int(200)),
            ("Code", Value::Text("ab".into())),
        ]);
        let err = validate_entity(&validators, &bad).unwrap_err();
        let kinds: Vec<_> = err.errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ValidationErrorKind::Max,
                ValidationErrorKind::MinLength,
                ValidationErrorKind::Pattern
            ]
        );
        assert_eq!(err.entity_type.as_deref(), Some("Person"));
    }

    #[test]
    fn test_required_rejects_null() {
        let validators = vec![Validator::required("Name")];
        let err = validate_entity(&validators, &view(&[("Name", Value::Null)])).unwrap_err();
        assert_eq!(err.errors[0].kind, ValidationErrorKind::Required);
    }

    #[test]
    fn test_custom_validator() {
        let validators = vec![Validator::custom("adult", |view, errors| {
            if view.value("Age").and_then(|v| v.as_i64()).unwrap_or(0) < 18 {
                errors.add_custom("Age", "must be an adult");
            }
        })];
        assert!(validate_entity(&validators, &view(&[("Age", Value::Int(12))])).is_err());
        assert!(validate_entity(&validators, &view(&[("Age", Value::Int(40))])).is_ok());
    }
}
