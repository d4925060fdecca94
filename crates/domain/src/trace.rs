//! Structured trace events emitted across the runtime.
//!
//! The variant set is closed and part of the public contract: every event
//! carries `run_id` and, where applicable, `action_call_id` /
//! `parent_action_call_id`, so a consumer can reconstruct the invocation
//! tree from the stream alone.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::LogEntry;
use crate::grants::PermissionLayerTrace;
use crate::message::{Message, Usage};

/// Which provider API shape a model call used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelMode {
    Chat,
    Responses,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    #[serde(rename = "run.start")]
    RunStart {
        run_id: String,
        deck_path: String,
        permissions: Vec<PermissionLayerTrace>,
    },

    #[serde(rename = "run.end")]
    RunEnd {
        run_id: String,
        deck_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "deck.start")]
    DeckStart {
        run_id: String,
        action_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_action_call_id: Option<String>,
        deck_path: String,
        depth: u32,
    },

    #[serde(rename = "deck.end")]
    DeckEnd {
        run_id: String,
        action_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_action_call_id: Option<String>,
        deck_path: String,
    },

    #[serde(rename = "action.start")]
    ActionStart {
        run_id: String,
        /// Id of the child invocation this action opens.
        action_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_action_call_id: Option<String>,
        deck_path: String,
        action_name: String,
        args: Value,
        /// The child's freshly resolved permission layering.
        permissions: Vec<PermissionLayerTrace>,
    },

    #[serde(rename = "action.end")]
    ActionEnd {
        run_id: String,
        action_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_action_call_id: Option<String>,
        action_name: String,
        is_error: bool,
    },

    #[serde(rename = "tool.call")]
    ToolCall {
        run_id: String,
        action_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_action_call_id: Option<String>,
        call_id: String,
        tool_name: String,
        arguments: Value,
    },

    #[serde(rename = "tool.result")]
    ToolResult {
        run_id: String,
        action_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_action_call_id: Option<String>,
        call_id: String,
        tool_name: String,
        preview: String,
        is_error: bool,
    },

    #[serde(rename = "model.call")]
    ModelCall {
        run_id: String,
        action_call_id: String,
        deck_path: String,
        model: String,
        mode: ModelMode,
        pass: u32,
        messages: Vec<Message>,
        tools: Vec<String>,
    },

    #[serde(rename = "model.result")]
    ModelResult {
        run_id: String,
        action_call_id: String,
        deck_path: String,
        finish_reason: String,
        message_preview: String,
        tool_call_count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_state_bytes: Option<usize>,
    },

    #[serde(rename = "model.stream.event")]
    ModelStreamEvent {
        run_id: String,
        action_call_id: String,
        payload: Value,
    },

    /// Non-root assistant text that is internal reasoning, not the deck's
    /// return value.
    #[serde(rename = "monolog")]
    Monolog {
        run_id: String,
        action_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_action_call_id: Option<String>,
        deck_path: String,
        text: String,
    },

    #[serde(rename = "log")]
    Log {
        run_id: String,
        action_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_action_call_id: Option<String>,
        entry: LogEntry,
    },

    #[serde(rename = "message.user")]
    MessageUser {
        run_id: String,
        action_call_id: String,
        content: String,
    },

    /// A forwarded responses-API stream event. `payload` already carries
    /// the `_gambit` correlation envelope.
    #[serde(rename = "response.event")]
    ResponseEvent {
        run_id: String,
        kind: String,
        payload: Value,
    },
}

/// Consumer of trace events. Callbacks must be short and non-blocking;
/// they are invoked synchronously from the driving task.
pub trait TraceSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

impl<F> TraceSink for F
where
    F: Fn(TraceEvent) + Send + Sync,
{
    fn emit(&self, event: TraceEvent) {
        self(event);
    }
}

/// Default sink: serialize each event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn emit(&self, event: TraceEvent) {
        let json = serde_json::to_string(&event).unwrap_or_default();
        tracing::info!(trace_event = %json, "gambit_event");
    }
}

/// Test sink that records every event.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: parking_lot::Mutex<Vec<TraceEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// The serde `event` tags, in emission order.
    pub fn kinds(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| {
                serde_json::to_value(e)
                    .ok()
                    .and_then(|v| v["event"].as_str().map(String::from))
            })
            .collect()
    }
}

impl TraceSink for CollectingSink {
    fn emit(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

/// Truncate to at most `max` characters on a char boundary, appending an
/// ellipsis when anything was dropped.
pub fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tag_names() {
        let event = TraceEvent::RunStart {
            run_id: "run-1".into(),
            deck_path: "root.deck".into(),
            permissions: vec![],
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["event"], "run.start");
    }

    #[test]
    fn collecting_sink_preserves_order() {
        let sink = CollectingSink::new();
        sink.emit(TraceEvent::RunStart {
            run_id: "r".into(),
            deck_path: "d".into(),
            permissions: vec![],
        });
        sink.emit(TraceEvent::RunEnd {
            run_id: "r".into(),
            deck_path: "d".into(),
            error: None,
        });
        assert_eq!(sink.kinds(), vec!["run.start", "run.end"]);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_str("héllo", 10), "héllo");
        assert_eq!(truncate_str("héllo", 2), "hé…");
    }
}
