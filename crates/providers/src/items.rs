//! Projection of responses-API output items to the chat shape.
//!
//! The runtime speaks normalized chat messages internally; a responses
//! result is projected to a single assistant message plus tool calls by
//! concatenating assistant text parts and collecting `function_call`
//! items.

use serde_json::Value;

use gambit_domain::{Message, ToolCall};

use crate::types::{ResponseContentPart, ResponseItem};

/// Project a responses `output[]` to `(assistant message, tool calls)`.
pub fn project_output(items: &[ResponseItem]) -> (Message, Vec<ToolCall>) {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for item in items {
        match item {
            ResponseItem::Message { role, content } if role == "assistant" => {
                for part in content {
                    if let ResponseContentPart::OutputText { text } = part {
                        text_parts.push(text);
                    }
                }
            }
            ResponseItem::Message { .. } | ResponseItem::FunctionCallOutput { .. } => {}
            ResponseItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                tool_calls.push(ToolCall {
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: parse_arguments(arguments),
                });
            }
        }
    }

    let message = if tool_calls.is_empty() {
        Message::assistant(text_parts.concat())
    } else {
        Message::assistant_tool_calls(text_parts.concat(), tool_calls.clone())
    };
    (message, tool_calls)
}

/// Function-call arguments arrive as a JSON string; an empty or invalid
/// string becomes an empty object so dispatch can still proceed.
pub fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(arguments) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "function call arguments are not valid JSON; defaulting to empty object"
            );
            Value::Object(Default::default())
        }
    }
}
