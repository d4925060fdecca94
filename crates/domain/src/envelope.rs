//! The uniform tool-result envelope.
//!
//! Every tool result — built-in, action deck, external, internal — is
//! reported to the model as one JSON shape with an HTTP-style status,
//! optional code/message/payload/meta, and correlation ids linking the
//! result back to the invocation tree.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where an envelope came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeSource {
    pub deck_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
}

fn default_status() -> u16 {
    200
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEnvelope {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_action_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EnvelopeSource>,
}

impl ToolEnvelope {
    pub fn ok(payload: Value) -> Self {
        Self {
            status: 200,
            code: None,
            message: None,
            payload: Some(payload),
            meta: None,
            run_id: None,
            action_call_id: None,
            parent_action_call_id: None,
            source: None,
        }
    }

    pub fn error(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: Some(code.into()),
            message: Some(message.into()),
            ..Self::ok(Value::Null)
        }
        .without_payload()
    }

    fn without_payload(mut self) -> Self {
        self.payload = None;
        self
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::error(403, "permission_denied", message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::error(400, "invalid_input", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::error(404, "not_found", message)
    }

    /// Normalize an action deck's return value into an envelope.
    ///
    /// Objects with any of `status`/`payload`/`message`/`code`/`meta` are
    /// taken field-by-field; anything else becomes the payload of a 200.
    pub fn from_action_value(value: Value) -> Self {
        match &value {
            Value::Object(map)
                if ["status", "payload", "message", "code", "meta"]
                    .iter()
                    .any(|k| map.contains_key(*k)) =>
            {
                let status = map
                    .get("status")
                    .and_then(Value::as_u64)
                    .map_or(200, |s| s as u16);
                Self {
                    status,
                    code: map.get("code").and_then(Value::as_str).map(String::from),
                    message: map
                        .get("message")
                        .and_then(Value::as_str)
                        .map(String::from),
                    payload: map.get("payload").cloned(),
                    meta: map.get("meta").cloned(),
                    run_id: None,
                    action_call_id: None,
                    parent_action_call_id: None,
                    source: None,
                }
            }
            _ => Self::ok(value),
        }
    }

    /// Attach correlation ids and source metadata.
    pub fn correlate(
        mut self,
        run_id: &str,
        action_call_id: &str,
        parent_action_call_id: Option<&str>,
        source: EnvelopeSource,
    ) -> Self {
        self.run_id = Some(run_id.to_owned());
        self.action_call_id = Some(action_call_id.to_owned());
        self.parent_action_call_id = parent_action_call_id.map(String::from);
        self.source = Some(source);
        self
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    /// The JSON form appended to the conversation as a tool-role message.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_enveloped_action_value() {
        let env = ToolEnvelope::from_action_value(json!({
            "status": 503,
            "payload": "ok",
            "message": "nope",
            "code": "X",
        }));
        assert_eq!(env.status, 503);
        assert_eq!(env.payload, Some(json!("ok")));
        assert_eq!(env.message.as_deref(), Some("nope"));
        assert_eq!(env.code.as_deref(), Some("X"));
    }

    #[test]
    fn bare_value_becomes_ok_payload() {
        let env = ToolEnvelope::from_action_value(json!([1, 2, 3]));
        assert_eq!(env.status, 200);
        assert_eq!(env.payload, Some(json!([1, 2, 3])));
        assert!(!env.is_error());
    }

    #[test]
    fn object_without_envelope_keys_is_payload() {
        let env = ToolEnvelope::from_action_value(json!({"answer": 42}));
        assert_eq!(env.payload, Some(json!({"answer": 42})));
    }

    #[test]
    fn denial_shape() {
        let env = ToolEnvelope::permission_denied("no read grant for /etc");
        assert_eq!(env.status, 403);
        assert_eq!(env.code.as_deref(), Some("permission_denied"));
        assert!(env.is_error());
    }

    #[test]
    fn correlate_attaches_ids() {
        let env = ToolEnvelope::ok(json!(null)).correlate(
            "run-1",
            "action-2",
            Some("action-1"),
            EnvelopeSource {
                deck_path: "root.deck".into(),
                action_name: Some("compute".into()),
            },
        );
        let v = env.to_value();
        assert_eq!(v["run_id"], "run-1");
        assert_eq!(v["parent_action_call_id"], "action-1");
        assert_eq!(v["source"]["action_name"], "compute");
    }
}
