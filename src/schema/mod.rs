//! Schema documents describing a function's input and output shape.
//!
//! Schemas are derived from Rust types with `schemars` (inlined, no `$ref`
//! definitions) and served by the plugin for introspection. The same
//! derivation feeds [`Validator`], which checks raw payloads before they are
//! decoded.

use crate::error::SchemaError;
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub mod validator;

pub use validator::{Evaluation, Validator};

/// Input and output JSON Schemas of one plugin function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    pub input: Value,
    pub output: Value,
}

/// Function name to schema document, as served on `/_schemas`.
pub type Schemas = HashMap<String, SchemaDocument>;

impl SchemaDocument {
    /// Derive both halves from the function's parameter and result types.
    ///
    /// Derivation failures do not abort: the failing half is logged and left
    /// as an empty object so the function stays callable.
    pub fn for_types<I: JsonSchema, O: JsonSchema>() -> Self {
        Self {
            input: derive_or_empty::<I>("input"),
            output: derive_or_empty::<O>("output"),
        }
    }
}

fn derive_or_empty<T: JsonSchema>(side: &str) -> Value {
    match derive_schema::<T>() {
        Ok(schema) => schema,
        Err(e) => {
            tracing::error!(side, type_name = %T::schema_name(), error = %e, "Failed to derive schema");
            Value::Object(Default::default())
        }
    }
}

/// Produce an inlined JSON Schema for `T` without the `$schema` marker.
pub fn derive_schema<T: JsonSchema>() -> Result<Value, SchemaError> {
    let generator = SchemaSettings::draft07()
        .with(|settings| settings.inline_subschemas = true)
        .into_generator();
    let root = generator.into_root_schema_for::<T>();

    let mut schema = serde_json::to_value(root).map_err(SchemaError::Derive)?;
    if let Some(object) = schema.as_object_mut() {
        object.remove("$schema");
    }

    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Greeting {
        #[schemars(length(min = 3))]
        name: String,
        times: Option<u32>,
    }

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Nested {
        inner: Greeting,
    }

    #[test]
    fn test_derive_schema_strips_schema_marker() {
        let schema = derive_schema::<Greeting>().unwrap();

        assert!(schema.get("$schema").is_none());
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["name"]["minLength"], 3);
        assert_eq!(schema["required"], serde_json::json!(["name"]));
    }

    #[test]
    fn test_derive_schema_inlines_nested_types() {
        let schema = derive_schema::<Nested>().unwrap();

        assert!(schema.get("definitions").is_none());
        assert_eq!(schema["properties"]["inner"]["type"], "object");
    }

    #[test]
    fn test_schema_document_serializes_both_halves() {
        let document = SchemaDocument::for_types::<Greeting, String>();
        let json = serde_json::to_value(&document).unwrap();

        assert_eq!(json["input"]["type"], "object");
        assert_eq!(json["output"]["type"], "string");
    }
}
