//! The generic schema capability: validate a value against a JSON Schema
//! and surface the schema as tool parameters.
//!
//! Schemas are opaque `serde_json::Value`s throughout the runtime; the
//! schema-authoring library lives outside the core.

use serde_json::{json, Value};

/// Validate `value` against `schema`, joining all violations into one
/// message.
///
/// A schema that fails to compile is skipped rather than blocking
/// execution; the deck author sees compile problems at load time, not
/// per call.
pub fn validate(schema: &Value, value: &Value) -> Result<(), String> {
    let Ok(validator) = jsonschema::validator_for(schema) else {
        return Ok(());
    };

    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Whether the schema admits a bare string (used for root decks that take
/// raw string input or return plain text).
pub fn accepts_string(schema: &Value) -> bool {
    match schema.get("type") {
        Some(Value::String(t)) => t == "string",
        Some(Value::Array(types)) => types.iter().any(|t| t == "string"),
        _ => validate(schema, &Value::String(String::new())).is_ok(),
    }
}

/// The parameters object advertised for a tool whose deck declares no
/// context schema.
pub fn permissive_object() -> Value {
    json!({
        "type": "object",
        "additionalProperties": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_matching_object() {
        let schema = json!({
            "type": "object",
            "properties": {"count": {"type": "number"}},
            "required": ["count"],
        });
        assert!(validate(&schema, &json!({"count": 3})).is_ok());
    }

    #[test]
    fn rejects_type_mismatch_with_message() {
        let schema = json!({
            "type": "object",
            "properties": {"count": {"type": "number"}},
            "required": ["count"],
        });
        let err = validate(&schema, &json!({"count": "bad"})).unwrap_err();
        assert!(err.contains("number"), "unexpected message: {err}");
    }

    #[test]
    fn string_schema_accepts_string() {
        assert!(accepts_string(&json!({"type": "string"})));
        assert!(accepts_string(&json!({"type": ["string", "null"]})));
        assert!(!accepts_string(&json!({"type": "object"})));
    }

    #[test]
    fn uncompilable_schema_is_skipped() {
        let schema = json!({"type": 12});
        assert!(validate(&schema, &json!("anything")).is_ok());
    }
}
