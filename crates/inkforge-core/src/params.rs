//! Workflow parameter schemas
//!
//! Each workflow declares an ordered list of parameter definitions. Input is
//! validated before any state is constructed; validation gathers every field
//! error rather than stopping at the first.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Declared parameter type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    /// Whether a JSON value matches this type
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }

    /// Parse a CLI-style string into a value of this type
    pub fn parse_str(&self, raw: &str) -> Result<Value, String> {
        match self {
            ParamType::String => Ok(Value::String(raw.to_string())),
            ParamType::Number => serde_json::from_str::<serde_json::Number>(raw)
                .map(Value::Number)
                .map_err(|_| format!("expected a number, got '{raw}'")),
            ParamType::Boolean => match raw {
                "true" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(format!("expected a boolean, got '{raw}'")),
            },
            ParamType::Array | ParamType::Object => {
                let parsed: Value = serde_json::from_str(raw)
                    .map_err(|e| format!("expected JSON, got '{raw}': {e}"))?;
                if self.matches(&parsed) {
                    Ok(parsed)
                } else {
                    Err(format!("expected {self:?}, got '{raw}'"))
                }
            }
        }
    }
}

/// Custom validation hook for a parameter
pub type ParamValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// One declared workflow parameter
///
/// Serializes to the metadata shape returned by the workflow endpoints; the
/// custom validator is process-local and never leaves the registry.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamDefinition {
    /// Parameter name (camelCase, as submitted over HTTP)
    pub name: String,

    /// Declared type
    #[serde(rename = "type")]
    pub param_type: ParamType,

    /// Whether the parameter must be supplied
    pub required: bool,

    /// Default applied when the parameter is absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Human-readable description (surfaced in CLI help)
    pub description: String,

    /// Example values
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Value>,

    /// Custom validation beyond the type check
    #[serde(skip)]
    pub validate: Option<ParamValidator>,
}

impl fmt::Debug for ParamDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamDefinition")
            .field("name", &self.name)
            .field("param_type", &self.param_type)
            .field("required", &self.required)
            .field("default", &self.default)
            .field("has_validator", &self.validate.is_some())
            .finish()
    }
}

impl ParamDefinition {
    /// Declare a required parameter
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default: None,
            description: String::new(),
            examples: vec![],
            validate: None,
        }
    }

    /// Declare an optional parameter
    pub fn optional(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type)
        }
    }

    /// Set the default value
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add an example value
    pub fn with_example(mut self, example: Value) -> Self {
        self.examples.push(example);
        self
    }

    /// Attach a custom validator
    pub fn with_validator(
        mut self,
        validate: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Arc::new(validate));
        self
    }
}

/// A single field-level validation failure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Parameter validation failure with the full field list
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid parameters: {}", .fields.iter().map(|f| format!("{}: {}", f.field, f.message)).collect::<Vec<_>>().join("; "))]
pub struct ParamError {
    pub fields: Vec<FieldError>,
}

/// An ordered parameter schema
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ParamSchema {
    params: Vec<ParamDefinition>,
}

impl ParamSchema {
    /// Build a schema from definitions
    pub fn new(params: Vec<ParamDefinition>) -> Self {
        Self { params }
    }

    /// The declared definitions, in order
    pub fn params(&self) -> &[ParamDefinition] {
        &self.params
    }

    /// Look up one definition by name
    pub fn get(&self, name: &str) -> Option<&ParamDefinition> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Validate input against the schema, gathering all field errors
    pub fn validate(&self, input: &Map<String, Value>) -> Result<(), ParamError> {
        let mut fields = vec![];

        for def in &self.params {
            match input.get(&def.name) {
                None | Some(Value::Null) => {
                    if def.required && def.default.is_none() {
                        fields.push(FieldError {
                            field: def.name.clone(),
                            message: "required parameter is missing".to_string(),
                        });
                    }
                }
                Some(value) => {
                    if !def.param_type.matches(value) {
                        fields.push(FieldError {
                            field: def.name.clone(),
                            message: format!("expected {:?}", def.param_type),
                        });
                        continue;
                    }
                    if let Some(validate) = &def.validate {
                        if let Err(message) = validate(value) {
                            fields.push(FieldError {
                                field: def.name.clone(),
                                message,
                            });
                        }
                    }
                }
            }
        }

        if fields.is_empty() {
            Ok(())
        } else {
            Err(ParamError { fields })
        }
    }

    /// Return a copy of the input with declared defaults filled in
    pub fn apply_defaults(&self, input: &Map<String, Value>) -> Map<String, Value> {
        let mut out = input.clone();
        for def in &self.params {
            if !out.contains_key(&def.name) || out.get(&def.name) == Some(&Value::Null) {
                if let Some(default) = &def.default {
                    out.insert(def.name.clone(), default.clone());
                }
            }
        }
        out
    }
}

/// Validator for non-empty strings (used by topic/requirements fields)
pub fn non_empty_string(value: &Value) -> Result<(), String> {
    match value.as_str() {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err("must be a non-empty string".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ParamSchema {
        ParamSchema::new(vec![
            ParamDefinition::required("topic", ParamType::String)
                .with_validator(non_empty_string),
            ParamDefinition::required("requirements", ParamType::String)
                .with_validator(non_empty_string),
            ParamDefinition::optional("imageCount", ParamType::Number).with_default(json!(0)),
            ParamDefinition::optional("hardConstraints", ParamType::Object),
        ])
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_valid_input() {
        let input = obj(json!({"topic": "AI", "requirements": "short"}));
        assert!(schema().validate(&input).is_ok());
    }

    #[test]
    fn test_missing_required_gathers_all_fields() {
        let err = schema().validate(&obj(json!({}))).unwrap_err();
        assert_eq!(err.fields.len(), 2);
        assert!(err.fields.iter().any(|f| f.field == "topic"));
        assert!(err.fields.iter().any(|f| f.field == "requirements"));
    }

    #[test]
    fn test_type_mismatch() {
        let input = obj(json!({"topic": 7, "requirements": "r"}));
        let err = schema().validate(&input).unwrap_err();
        assert_eq!(err.fields[0].field, "topic");
    }

    #[test]
    fn test_custom_validator() {
        let input = obj(json!({"topic": "  ", "requirements": "r"}));
        let err = schema().validate(&input).unwrap_err();
        assert_eq!(err.fields[0].field, "topic");
    }

    #[test]
    fn test_apply_defaults() {
        let input = obj(json!({"topic": "AI", "requirements": "r"}));
        let filled = schema().apply_defaults(&input);
        assert_eq!(filled.get("imageCount"), Some(&json!(0)));
        // No default declared, stays absent
        assert!(!filled.contains_key("hardConstraints"));
    }

    #[test]
    fn test_parse_str_scalars() {
        assert_eq!(
            ParamType::Number.parse_str("42").unwrap(),
            json!(42)
        );
        assert_eq!(
            ParamType::Number.parse_str("2.5").unwrap(),
            json!(2.5)
        );
        assert!(ParamType::Number.parse_str("abc").is_err());
        assert_eq!(ParamType::Boolean.parse_str("true").unwrap(), json!(true));
        assert_eq!(
            ParamType::Array.parse_str(r#"["a","b"]"#).unwrap(),
            json!(["a", "b"])
        );
        assert!(ParamType::Object.parse_str("[1]").is_err());
    }
}
