use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named property of a tool's parameter object.
///
/// `kind` is optional so schemas discovered from capability servers that use
/// keywords outside this subset still load; such properties skip type checks.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertySchema {
    pub kind: Option<PropertyType>,
    pub description: Option<String>,
    pub allowed_values: Vec<Value>,
    pub items: Option<Box<PropertySchema>>,
}

impl PropertySchema {
    pub fn of(kind: PropertyType, description: impl Into<String>) -> Self {
        Self { kind: Some(kind), description: Some(description.into()), allowed_values: Vec::new(), items: None }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::of(PropertyType::String, description)
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self::of(PropertyType::Number, description)
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self::of(PropertyType::Integer, description)
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::of(PropertyType::Boolean, description)
    }

    pub fn array(description: impl Into<String>, items: PropertySchema) -> Self {
        Self { items: Some(Box::new(items)), ..Self::of(PropertyType::Array, description) }
    }

    pub fn object(description: impl Into<String>) -> Self {
        Self::of(PropertyType::Object, description)
    }

    pub fn with_enum<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        if let Some(kind) = self.kind {
            out.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        }
        if let Some(description) = &self.description {
            out.insert("description".to_string(), Value::String(description.clone()));
        }
        if !self.allowed_values.is_empty() {
            out.insert("enum".to_string(), Value::Array(self.allowed_values.clone()));
        }
        if let Some(items) = &self.items {
            out.insert("items".to_string(), items.to_json());
        }
        Value::Object(out)
    }

    pub fn from_json(value: &Value) -> Self {
        let kind = value.get("type").and_then(Value::as_str).and_then(PropertyType::parse);
        let description = value.get("description").and_then(Value::as_str).map(str::to_owned);
        let allowed_values =
            value.get("enum").and_then(Value::as_array).cloned().unwrap_or_default();
        let items = value.get("items").filter(|items| items.is_object()).map(|items| {
            Box::new(PropertySchema::from_json(items))
        });
        Self { kind, description, allowed_values, items }
    }
}

/// JSON-Schema-like object description of a tool's parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterSchema {
    pub properties: BTreeMap<String, PropertySchema>,
    pub required: Vec<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required parameter `{field}`")]
    MissingField { field: String },
    #[error("parameter `{field}` must be of type {expected}, got {actual}")]
    TypeMismatch { field: String, expected: PropertyType, actual: &'static str },
    #[error("parameter `{field}` must be one of: {allowed}")]
    EnumViolation { field: String, allowed: String },
}

impl ValidationError {
    pub fn field(&self) -> &str {
        match self {
            Self::MissingField { field }
            | Self::TypeMismatch { field, .. }
            | Self::EnumViolation { field, .. } => field,
        }
    }
}

impl ParameterSchema {
    pub fn object() -> Self {
        Self::default()
    }

    pub fn property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    pub fn require(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.required.contains(&name) {
            self.required.push(name);
        }
        self
    }

    /// Renders the schema in the shape function-calling APIs expect. Every call
    /// returns a freshly built value, so callers may mutate it freely.
    pub fn to_json(&self) -> Value {
        let properties: Map<String, Value> =
            self.properties.iter().map(|(name, schema)| (name.clone(), schema.to_json())).collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": self.required,
        })
    }

    pub fn from_json(value: &Value) -> Self {
        let properties = value
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, schema)| (name.clone(), PropertySchema::from_json(schema)))
                    .collect()
            })
            .unwrap_or_default();
        let required = value
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| fields.iter().filter_map(Value::as_str).map(str::to_owned).collect())
            .unwrap_or_default();
        Self { properties, required }
    }

    /// Checks required fields first, then type and enum constraints of every
    /// supplied parameter that the schema knows about. Unknown parameters pass.
    pub fn validate(&self, parameters: &Map<String, Value>) -> Result<(), ValidationError> {
        for field in &self.required {
            let present = parameters.get(field).is_some_and(|value| !value.is_null());
            if !present {
                return Err(ValidationError::MissingField { field: field.clone() });
            }
        }

        for (field, value) in parameters {
            let Some(schema) = self.properties.get(field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }

            if let Some(expected) = schema.kind {
                if !expected.matches(value) {
                    return Err(ValidationError::TypeMismatch {
                        field: field.clone(),
                        expected,
                        actual: json_type_name(value),
                    });
                }
            }

            if !schema.allowed_values.is_empty() && !schema.allowed_values.contains(value) {
                let allowed = schema
                    .allowed_values
                    .iter()
                    .map(|allowed| match allowed {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(ValidationError::EnumViolation { field: field.clone(), allowed });
            }
        }

        Ok(())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(number) if number.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
