// Schema registry: per-event payload validators used on the client receive path
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::{Result, TidewireError};

/// A single problem found while validating a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Location inside the payload; empty for the root
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

pub(crate) fn describe_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validates the `data` of one event name.
pub trait Validator: Send + Sync {
    fn validate(&self, data: &Value) -> std::result::Result<(), Vec<ValidationIssue>>;
}

impl<F> Validator for F
where
    F: Fn(&Value) -> std::result::Result<(), Vec<ValidationIssue>> + Send + Sync,
{
    fn validate(&self, data: &Value) -> std::result::Result<(), Vec<ValidationIssue>> {
        self(data)
    }
}

/// Accepts any payload that deserializes into `T`.
pub struct TypedValidator<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedValidator<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedValidator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Validator for TypedValidator<T> {
    fn validate(&self, data: &Value) -> std::result::Result<(), Vec<ValidationIssue>> {
        T::deserialize(data)
            .map(|_| ())
            .map_err(|e| vec![ValidationIssue::new("", e.to_string())])
    }
}

/// Event name -> validator map.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<V>(&mut self, event: impl Into<String>, validator: V) -> &mut Self
    where
        V: Validator + 'static,
    {
        self.validators.insert(event.into(), Arc::new(validator));
        self
    }

    pub fn register_type<T>(&mut self, event: impl Into<String>) -> &mut Self
    where
        T: DeserializeOwned + 'static,
    {
        self.register(event, TypedValidator::<T>::new())
    }

    pub fn contains(&self, event: &str) -> bool {
        self.validators.contains_key(event)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Validate `data` against the schema registered for `event`.
    ///
    /// Events without a registered schema pass unchecked.
    pub fn validate(&self, event: &str, data: &Value) -> Result<()> {
        match self.validators.get(event) {
            Some(validator) => validator
                .validate(data)
                .map_err(|issues| TidewireError::Validation {
                    event: event.to_string(),
                    issues,
                }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.validators.keys().collect();
        names.sort();
        f.debug_struct("SchemaRegistry")
            .field("events", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct Message {
        title: String,
        body: String,
    }

    #[test]
    fn unregistered_events_pass() {
        let registry = SchemaRegistry::new();
        assert!(registry.validate("anything", &json!(42)).is_ok());
    }

    #[test]
    fn typed_validator_reports_issue() {
        let mut registry = SchemaRegistry::new();
        registry.register_type::<Message>("message");

        assert!(registry
            .validate("message", &json!({"title": "Hello", "body": "World"}))
            .is_ok());

        match registry.validate("message", &json!({"title": "Hello"})) {
            Err(TidewireError::Validation { event, issues }) => {
                assert_eq!(event, "message");
                assert_eq!(issues.len(), 1);
                assert!(issues[0].message.contains("body"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn closure_validator_collects_issues() {
        let mut registry = SchemaRegistry::new();
        registry.register("count", |data: &Value| {
            let mut issues = Vec::new();
            if !data.is_object() {
                issues.push(ValidationIssue::new("", "expected object"));
            } else if !data["n"].is_u64() {
                issues.push(ValidationIssue::new("n", "expected unsigned integer"));
            }
            if issues.is_empty() {
                Ok(())
            } else {
                Err(issues)
            }
        });

        assert!(registry.validate("count", &json!({"n": 3})).is_ok());
        let err = registry.validate("count", &json!({"n": "x"})).unwrap_err();
        assert!(err.to_string().contains("n: expected unsigned integer"));
    }
}
