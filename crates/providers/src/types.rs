//! Provider-agnostic request and response types.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use gambit_domain::{CancelToken, Message, ToolCall, ToolDefinition, Usage};

/// Receives assistant text chunks as they stream.
pub type TextSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives raw provider stream events.
pub type EventSink = Arc<dyn Fn(&Value) + Send + Sync>;

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Length => "length",
        }
    }
}

/// Sampling and reasoning knobs forwarded to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<String>,
}

/// One chat-mode model call.
#[derive(Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub stream: bool,
    /// Opaque provider conversation state threaded between calls.
    pub state: Option<Value>,
    pub deck_path: Option<String>,
    pub params: ProviderParams,
    pub cancel: CancelToken,
    pub on_stream_text: Option<TextSink>,
    pub on_stream_event: Option<EventSink>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            stream: false,
            state: None,
            deck_path: None,
            params: ProviderParams::default(),
            cancel: CancelToken::new(),
            on_stream_text: None,
            on_stream_event: None,
        }
    }
}

impl fmt::Debug for ChatRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatRequest")
            .field("model", &self.model)
            .field("messages", &self.messages.len())
            .field("tools", &self.tools.len())
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

/// A chat-mode model result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOutcome {
    pub message: Message,
    pub finish_reason: FinishReason,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub updated_state: Option<Value>,
}

impl ChatOutcome {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            message: Message::assistant(content),
            finish_reason: FinishReason::Stop,
            tool_calls: Vec::new(),
            usage: None,
            updated_state: None,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            message: Message::assistant_tool_calls("", calls.clone()),
            finish_reason: FinishReason::ToolCalls,
            tool_calls: calls,
            usage: None,
            updated_state: None,
        }
    }
}

/// One responses-mode model call.
#[derive(Clone)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: Vec<ResponseItem>,
    pub tools: Vec<ToolDefinition>,
    pub stream: bool,
    pub state: Option<Value>,
    pub deck_path: Option<String>,
    pub params: ProviderParams,
    pub cancel: CancelToken,
    pub on_stream_event: Option<EventSink>,
}

impl fmt::Debug for ResponsesRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponsesRequest")
            .field("model", &self.model)
            .field("input", &self.input.len())
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

/// A responses-mode model result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesOutcome {
    pub id: String,
    pub object: String,
    pub output: Vec<ResponseItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_state: Option<Value>,
}

/// The closed responses-API item set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseItem {
    Message {
        role: String,
        content: Vec<ResponseContentPart>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseContentPart {
    OutputText { text: String },
    InputText { text: String },
}

impl ResponseContentPart {
    pub fn text(&self) -> &str {
        match self {
            ResponseContentPart::OutputText { text } | ResponseContentPart::InputText { text } => {
                text
            }
        }
    }
}

/// Input to the provider's model-resolution hook.
#[derive(Debug, Clone)]
pub struct ResolveModelRequest {
    /// Candidate ids, in declaration order. A single-model deck passes one.
    pub candidates: Vec<String>,
    pub params: Option<Value>,
    pub deck_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub model: String,
    pub params: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(FinishReason::ToolCalls).unwrap(),
            serde_json::json!("tool_calls")
        );
    }

    #[test]
    fn response_item_wire_shape() {
        let item = ResponseItem::FunctionCall {
            call_id: "call-1".into(),
            name: "compute".into(),
            arguments: "{\"count\":1}".into(),
        };
        let v = serde_json::to_value(&item).unwrap();
        assert_eq!(v["type"], "function_call");
        assert_eq!(v["call_id"], "call-1");
    }

    #[test]
    fn content_part_text_access() {
        let part = ResponseContentPart::OutputText { text: "hi".into() };
        assert_eq!(part.text(), "hi");
    }
}
