//! Minimal OpenAPI-v3-subset validator for template parameters.
//!
//! Template parameter schemas are the structural-schema subset Kubernetes
//! CRDs use: `type`, `properties`, `required`, `items`, `enum`, `pattern`.
//! Constructs outside that subset are accepted without validation
//! (fail-open), so templates written against a richer validator still load.

use std::collections::BTreeMap;

use serde_json::Value;

/// A compiled parameter schema node.
#[derive(Debug, Clone, Default)]
pub struct ParamSchema {
    /// Expected type: object, array, string, integer, number, boolean.
    pub type_name: Option<String>,
    pub properties: BTreeMap<String, ParamSchema>,
    pub required: Vec<String>,
    pub items: Option<Box<ParamSchema>>,
    pub enum_values: Vec<Value>,
    pub pattern: Option<regex::Regex>,
}

impl ParamSchema {
    /// Parse a schema node from its document form.
    pub fn parse(raw: &Value) -> Result<Self, String> {
        let mut schema = Self::default();

        if let Some(t) = raw.get("type") {
            let t = t
                .as_str()
                .ok_or_else(|| "'type' must be a string".to_string())?;
            schema.type_name = Some(t.to_string());
        }
        if let Some(props) = raw.get("properties") {
            let props = props
                .as_object()
                .ok_or_else(|| "'properties' must be a mapping".to_string())?;
            for (name, sub) in props {
                schema
                    .properties
                    .insert(name.clone(), Self::parse(sub).map_err(|e| format!("{name}: {e}"))?);
            }
        }
        if let Some(req) = raw.get("required").and_then(|v| v.as_array()) {
            schema.required = req
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }
        if let Some(items) = raw.get("items") {
            schema.items = Some(Box::new(Self::parse(items).map_err(|e| format!("items: {e}"))?));
        }
        if let Some(en) = raw.get("enum").and_then(|v| v.as_array()) {
            schema.enum_values = en.clone();
        }
        if let Some(pattern) = raw.get("pattern").and_then(|v| v.as_str()) {
            schema.pattern = Some(
                regex::Regex::new(pattern)
                    .map_err(|e| format!("invalid 'pattern' regex: {e}"))?,
            );
        }

        Ok(schema)
    }

    /// Validate a parameter value against this schema.
    ///
    /// Returns the first violation found, as a dotted-path message.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        self.validate_at(value, "parameters")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<(), String> {
        if let Some(expected) = &self.type_name {
            let ok = match expected.as_str() {
                "object" => value.is_object(),
                "array" => value.is_array(),
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                // Unknown type name: fail-open.
                _ => true,
            };
            if !ok && !value.is_null() {
                return Err(format!(
                    "{path}: expected {expected}, got {}",
                    type_of(value)
                ));
            }
        }

        if !self.enum_values.is_empty() && !value.is_null() {
            if !self.enum_values.contains(value) {
                return Err(format!("{path}: value is not one of the allowed values"));
            }
        }

        if let (Some(re), Some(s)) = (&self.pattern, value.as_str()) {
            if !re.is_match(s) {
                return Err(format!("{path}: '{s}' does not match pattern '{re}'"));
            }
        }

        if let Some(obj) = value.as_object() {
            for name in &self.required {
                if !obj.contains_key(name) {
                    return Err(format!("{path}: missing required field '{name}'"));
                }
            }
            for (name, sub) in &self.properties {
                if let Some(field) = obj.get(name) {
                    sub.validate_at(field, &format!("{path}.{name}"))?;
                }
            }
        } else if !self.required.is_empty() && value.is_null() {
            return Err(format!(
                "{path}: missing required field '{}'",
                self.required[0]
            ));
        }

        if let (Some(items), Some(arr)) = (&self.items, value.as_array()) {
            for (i, item) in arr.iter().enumerate() {
                items.validate_at(item, &format!("{path}[{i}]"))?;
            }
        }

        Ok(())
    }
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels_schema() -> ParamSchema {
        ParamSchema::parse(&json!({
            "type": "object",
            "required": ["labels"],
            "properties": {
                "labels": {"type": "array", "items": {"type": "string"}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_parameters() {
        let schema = labels_schema();
        assert!(schema.validate(&json!({"labels": ["team", "env"]})).is_ok());
    }

    #[test]
    fn test_type_mismatch() {
        let schema = labels_schema();
        let err = schema.validate(&json!({"labels": "team"})).unwrap_err();
        assert!(err.contains("labels"), "unexpected message: {err}");

        let err = schema
            .validate(&json!({"labels": ["team", 42]}))
            .unwrap_err();
        assert!(err.contains("labels[1]"), "unexpected message: {err}");
    }

    #[test]
    fn test_required_missing() {
        let schema = labels_schema();
        let err = schema.validate(&json!({})).unwrap_err();
        assert!(err.contains("labels"));

        // Null parameters also trip a required field.
        assert!(schema.validate(&Value::Null).is_err());
    }

    #[test]
    fn test_enum_and_pattern() {
        let schema = ParamSchema::parse(&json!({
            "type": "object",
            "properties": {
                "mode": {"type": "string", "enum": ["strict", "lenient"]},
                "name": {"type": "string", "pattern": "^[a-z][a-z0-9-]*$"}
            }
        }))
        .unwrap();

        assert!(schema.validate(&json!({"mode": "strict"})).is_ok());
        assert!(schema.validate(&json!({"mode": "other"})).is_err());
        assert!(schema.validate(&json!({"name": "svc-a"})).is_ok());
        assert!(schema.validate(&json!({"name": "Bad Name"})).is_err());
    }

    #[test]
    fn test_unknown_constructs_fail_open() {
        // anyOf is outside the subset; the schema still parses and the
        // unknown construct is not enforced.
        let schema = ParamSchema::parse(&json!({
            "type": "object",
            "properties": {
                "x": {"anyOf": [{"type": "string"}, {"type": "integer"}]}
            }
        }))
        .unwrap();
        assert!(schema.validate(&json!({"x": {"weird": true}})).is_ok());
    }

    #[test]
    fn test_invalid_pattern_rejected_at_parse() {
        assert!(ParamSchema::parse(&json!({"type": "string", "pattern": "("})).is_err());
    }
}
