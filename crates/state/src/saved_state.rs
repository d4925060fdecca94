//! The resumable conversation envelope.
//!
//! Saved state is externally owned: the runtime reads it at entry,
//! mutates a local working copy, and publishes snapshots through the
//! state-update callback. It is the only on-disk artifact the core
//! defines.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use gambit_domain::{ids, Message, Role};
use gambit_providers::ResponseItem;

use crate::projection::items_to_messages;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateFormat {
    Chat,
    Responses,
}

impl Default for StateFormat {
    fn default() -> Self {
        StateFormat::Chat
    }
}

/// Stable per-message id, kept alongside the transcript so consumers can
/// address messages across turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedState {
    /// Stable across turns; minted at the first root invocation.
    pub run_id: String,
    #[serde(default)]
    pub format: StateFormat,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ResponseItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_refs: Vec<MessageRef>,
    /// Opaque per-key session metadata controlled by compute decks.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traces: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_score: Option<Value>,
}

impl SavedState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    /// Normalize a loaded state: when only `items[]` is present, the chat
    /// transcript is synthesized via the item projection.
    pub fn normalized(mut self) -> Self {
        if self.messages.is_empty() && !self.items.is_empty() {
            self.messages = items_to_messages(&self.items);
            self.format = StateFormat::Responses;
        }
        self.sync_refs();
        self
    }

    /// Append refs for messages that do not have one yet.
    pub fn sync_refs(&mut self) {
        while self.message_refs.len() < self.messages.len() {
            let role = self.messages[self.message_refs.len()].role;
            self.message_refs.push(MessageRef {
                id: ids::new_message_ref_id(),
                role,
            });
        }
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.sync_refs();
    }

    /// Recover the root input from the last `gambit_context` tool
    /// envelope, for resumed runs that arrive without an input value.
    pub fn recover_context_input(&self) -> Option<Value> {
        self.messages.iter().rev().find_map(|m| {
            if m.role != Role::Tool || m.name.as_deref() != Some("gambit_context") {
                return None;
            }
            let envelope: Value = serde_json::from_str(&m.content).ok()?;
            envelope.get("payload").cloned()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gambit_providers::ResponseContentPart;
    use serde_json::json;

    #[test]
    fn normalized_synthesizes_messages_from_items() {
        let state = SavedState {
            run_id: "run-1".into(),
            items: vec![ResponseItem::Message {
                role: "user".into(),
                content: vec![ResponseContentPart::InputText { text: "hi".into() }],
            }],
            ..SavedState::default()
        }
        .normalized();

        assert_eq!(state.format, StateFormat::Responses);
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].role, Role::User);
        assert_eq!(state.message_refs.len(), 1);
    }

    #[test]
    fn sync_refs_is_incremental() {
        let mut state = SavedState::new("run-1");
        state.push_message(Message::user("a"));
        let first_ref = state.message_refs[0].id.clone();
        state.push_message(Message::assistant("b"));
        assert_eq!(state.message_refs.len(), 2);
        assert_eq!(state.message_refs[0].id, first_ref);
        assert_eq!(state.message_refs[1].role, Role::Assistant);
    }

    #[test]
    fn recovers_input_from_context_envelope() {
        let mut state = SavedState::new("run-1");
        state.push_message(Message::tool_result(
            "call-ctx",
            "gambit_context",
            json!({"status": 200, "payload": {"count": 2}}).to_string(),
        ));
        state.push_message(Message::assistant("working"));
        assert_eq!(state.recover_context_input(), Some(json!({"count": 2})));
    }

    #[test]
    fn no_context_envelope_recovers_nothing() {
        let mut state = SavedState::new("run-1");
        state.push_message(Message::user("hi"));
        assert_eq!(state.recover_context_input(), None);
    }

    #[test]
    fn round_trips_through_json() {
        let mut state = SavedState::new("run-1");
        state.meta.insert("cursor".into(), json!(5));
        state.push_message(Message::user("hello"));
        let raw = serde_json::to_string(&state).unwrap();
        let back: SavedState = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.run_id, "run-1");
        assert_eq!(back.meta["cursor"], json!(5));
        assert_eq!(back.messages.len(), 1);
    }
}
