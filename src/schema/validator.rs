//! Compiled input validation.

use super::derive_schema;
use crate::error::SchemaError;
use schemars::JsonSchema;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

const ROOT_PATH: &str = "/";

/// A JSON Schema checker compiled from the schema of `T`.
///
/// Evaluation is read-only, so one validator may serve any number of
/// concurrent requests.
pub struct Validator<T> {
    schema: Arc<jsonschema::Validator>,
    _input: PhantomData<fn() -> T>,
}

impl<T> Clone for Validator<T> {
    fn clone(&self) -> Self {
        Self {
            schema: Arc::clone(&self.schema),
            _input: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Validator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("input", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: JsonSchema> Validator<T> {
    pub fn new() -> Result<Self, SchemaError> {
        let schema = derive_schema::<T>()?;
        let compiled =
            jsonschema::validator_for(&schema).map_err(|e| SchemaError::Compile(e.to_string()))?;

        Ok(Self {
            schema: Arc::new(compiled),
            _input: PhantomData,
        })
    }

    /// Same as [`Validator::new`], with the type inferred from a sample value.
    pub fn from_sample(_sample: &T) -> Result<Self, SchemaError> {
        Self::new()
    }
}

impl<T> Validator<T> {
    pub fn validate(&self, data: &[u8]) -> Evaluation {
        let mut evaluation = Evaluation::default();

        let instance: Value = match serde_json::from_slice(data) {
            Ok(instance) => instance,
            Err(e) => {
                evaluation.push(ROOT_PATH.to_string(), format!("invalid JSON: {e}"));
                return evaluation;
            }
        };

        for error in self.schema.iter_errors(&instance) {
            let path = error.instance_path.to_string();
            let path = if path.is_empty() {
                ROOT_PATH.to_string()
            } else {
                path
            };
            evaluation.push(path, error.to_string());
        }

        evaluation
    }
}

/// Outcome of [`Validator::validate`]: instance path to error message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    errors: BTreeMap<String, String>,
}

impl Evaluation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &BTreeMap<String, String> {
        &self.errors
    }

    fn push(&mut self, path: String, message: String) {
        self.errors
            .entry(path)
            .and_modify(|existing| {
                existing.push_str("; ");
                existing.push_str(&message);
            })
            .or_insert(message);
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (path, message) in &self.errors {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{path}: {message}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct In {
        #[schemars(length(min = 3))]
        name: String,
    }

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct Pair {
        #[schemars(length(min = 3))]
        left: String,
        #[schemars(range(max = 10))]
        right: u32,
    }

    #[test]
    fn test_valid_input_passes() {
        let validator = Validator::<In>::new().unwrap();
        let evaluation = validator.validate(br#"{"name": "world"}"#);

        assert!(evaluation.is_valid());
        assert_eq!(evaluation.to_string(), "");
    }

    #[test]
    fn test_short_string_is_reported_at_field_path() {
        let validator = Validator::<In>::new().unwrap();
        let evaluation = validator.validate(br#"{"name": ""}"#);

        assert!(!evaluation.is_valid());
        assert!(evaluation.errors().contains_key("/name"));
    }

    #[test]
    fn test_missing_required_field_is_reported_at_root() {
        let validator = Validator::<In>::new().unwrap();
        let evaluation = validator.validate(b"{}");

        assert!(!evaluation.is_valid());
        assert!(evaluation.errors()[ROOT_PATH].contains("name"));
    }

    #[test]
    fn test_malformed_json_is_a_root_error() {
        let validator = Validator::<In>::new().unwrap();
        let evaluation = validator.validate(b"{not json");

        assert!(evaluation.errors()[ROOT_PATH].starts_with("invalid JSON"));
    }

    #[test]
    fn test_all_field_errors_are_aggregated() {
        let validator = Validator::<Pair>::new().unwrap();
        let evaluation = validator.validate(br#"{"left": "a", "right": 99}"#);

        assert_eq!(evaluation.errors().len(), 2);
        let message = evaluation.to_string();
        assert!(message.starts_with("/left: "));
        assert!(message.contains(", /right: "));
    }

    #[test]
    fn test_from_sample_infers_type() {
        let sample = In {
            name: String::new(),
        };
        let validator = Validator::from_sample(&sample).unwrap();

        assert!(validator.validate(br#"{"name": "abc"}"#).is_valid());
    }
}
