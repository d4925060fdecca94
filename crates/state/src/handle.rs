//! The working copy of saved state during a run.
//!
//! A [`StateHandle`] owns the single mutable copy for the invocation tree
//! and publishes immutable snapshots through the caller's update sink.
//! Callers threading state across turns treat each published payload as
//! the new canonical value.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use gambit_domain::{Message, Role};

use crate::saved_state::SavedState;

/// Receives saved-state snapshots. Invoked synchronously; keep it short.
pub type StateUpdateSink = Arc<dyn Fn(SavedState) + Send + Sync>;

#[derive(Clone)]
pub struct StateHandle {
    inner: Arc<Mutex<SavedState>>,
    on_update: Option<StateUpdateSink>,
}

impl StateHandle {
    pub fn new(initial: SavedState, on_update: Option<StateUpdateSink>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial.normalized())),
            on_update,
        }
    }

    pub fn run_id(&self) -> String {
        self.inner.lock().run_id.clone()
    }

    pub fn snapshot(&self) -> SavedState {
        self.inner.lock().clone()
    }

    /// Push the current snapshot through the update sink.
    pub fn publish(&self) {
        if let Some(sink) = self.on_update.as_ref() {
            sink(self.snapshot());
        }
    }

    /// Mutate the working copy without publishing; the loop publishes once
    /// per batch of changes.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut SavedState) -> R) -> R {
        let mut state = self.inner.lock();
        let result = f(&mut state);
        state.sync_refs();
        result
    }

    /// Mutate and publish in one step.
    pub fn update<R>(&self, f: impl FnOnce(&mut SavedState) -> R) -> R {
        let result = self.mutate(f);
        self.publish();
        result
    }

    /// Adopt a child run's published snapshot as the new working copy and
    /// republish it outward.
    pub fn replace(&self, state: SavedState) {
        *self.inner.lock() = state.normalized();
        self.publish();
    }

    pub fn get_meta(&self, key: &str) -> Option<Value> {
        self.inner.lock().meta.get(key).cloned()
    }

    /// Meta writes publish immediately — compute decks use this as their
    /// durable scratch space.
    pub fn set_meta(&self, key: &str, value: Value) {
        self.update(|state| {
            state.meta.insert(key.to_owned(), value);
        });
    }

    /// Append a user/assistant message with non-empty content; anything
    /// else is rejected.
    pub fn append_conversation_message(&self, role: Role, content: &str) -> Result<(), String> {
        if !matches!(role, Role::User | Role::Assistant) {
            return Err("only user and assistant messages can be appended".into());
        }
        if content.is_empty() {
            return Err("message content must be non-empty".into());
        }
        self.update(|state| {
            state.push_message(Message {
                role,
                content: content.to_owned(),
                tool_calls: Vec::new(),
                tool_call_id: None,
                name: None,
            });
        });
        Ok(())
    }
}

impl std::fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandle")
            .field("run_id", &self.run_id())
            .field("has_sink", &self.on_update.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_handle() -> (StateHandle, Arc<Mutex<Vec<SavedState>>>) {
        let published: Arc<Mutex<Vec<SavedState>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_target = published.clone();
        let handle = StateHandle::new(
            SavedState::new("run-1"),
            Some(Arc::new(move |snapshot: SavedState| {
                sink_target.lock().push(snapshot);
            })),
        );
        (handle, published)
    }

    #[test]
    fn set_meta_publishes_snapshot() {
        let (handle, published) = collecting_handle();
        handle.set_meta("cursor", serde_json::json!(3));
        let snapshots = published.lock();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].meta["cursor"], serde_json::json!(3));
    }

    #[test]
    fn snapshots_are_decoupled_from_working_copy() {
        let (handle, published) = collecting_handle();
        handle.set_meta("k", serde_json::json!(1));
        handle.set_meta("k", serde_json::json!(2));
        let snapshots = published.lock();
        assert_eq!(snapshots[0].meta["k"], serde_json::json!(1));
        assert_eq!(snapshots[1].meta["k"], serde_json::json!(2));
    }

    #[test]
    fn append_rejects_empty_and_non_conversation_roles() {
        let (handle, _) = collecting_handle();
        assert!(handle
            .append_conversation_message(Role::User, "hello")
            .is_ok());
        assert!(handle.append_conversation_message(Role::User, "").is_err());
        assert!(handle
            .append_conversation_message(Role::Tool, "x")
            .is_err());
        assert_eq!(handle.snapshot().messages.len(), 1);
    }

    #[test]
    fn mutate_defers_publication() {
        let (handle, published) = collecting_handle();
        handle.mutate(|state| state.push_message(Message::user("hi")));
        assert!(published.lock().is_empty());
        handle.publish();
        assert_eq!(published.lock().len(), 1);
    }
}
