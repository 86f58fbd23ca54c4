use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LensError, Result};

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    /// Accepts any serializable value.
    Any,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

/// Declaration of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub ty: FieldType,
    pub required: bool,
}

/// Object schema used for endpoint inputs/outputs and resource fields.
///
/// Parsing is open-world: declared fields are type-checked, required fields
/// must be present, undeclared fields pass through untouched. An empty schema
/// (see [`Schema::any`]) accepts every value, including non-objects.
///
/// # Example
///
/// ```rust
/// use lens_rt::{FieldType, Schema};
///
/// let schema = Schema::object()
///     .required("id", FieldType::String)
///     .field("content", FieldType::String);
///
/// schema.parse(&serde_json::json!({"id": "msg-1"})).unwrap();
/// assert!(schema.parse(&serde_json::json!({"content": "x"})).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Schema {
    fields: BTreeMap<String, FieldSpec>,
}

impl Schema {
    /// An object schema with no fields declared yet.
    pub fn object() -> Self {
        Self::default()
    }

    /// Schema accepting any value; used where the shape is opaque to the core.
    pub fn any() -> Self {
        Self::default()
    }

    /// Declare an optional field.
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields
            .insert(name.into(), FieldSpec { ty, required: false });
        self
    }

    /// Declare a required field.
    pub fn required(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields
            .insert(name.into(), FieldSpec { ty, required: true });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    /// Validate `value` against this schema, returning it unchanged on
    /// success. Fails with a validation error naming the offending field.
    pub fn parse(&self, value: &Value) -> Result<Value> {
        if self.fields.is_empty() {
            return Ok(value.clone());
        }
        let Some(map) = value.as_object() else {
            return Err(LensError::Validation(format!(
                "expected an object, got {}",
                type_name(value)
            )));
        };
        for (name, spec) in &self.fields {
            match map.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(LensError::Validation(format!(
                            "missing required field `{name}`"
                        )));
                    }
                }
                Some(field_value) => {
                    if !spec.ty.matches(field_value) {
                        return Err(LensError::Validation(format!(
                            "field `{name}` must be a {}, got {}",
                            spec.ty.label(),
                            type_name(field_value)
                        )));
                    }
                }
            }
        }
        Ok(value.clone())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
