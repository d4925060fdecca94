//! The compute-deck execution surface.
//!
//! Executors receive an [`ExecutionContext`]: their identity within the
//! invocation tree plus a narrow handle back into the runtime (logging,
//! session meta, transcript appends, and recursive child runs). The
//! runtime implements [`ExecutionHost`]; one host instance is bound per
//! executor invocation so the context methods need no id plumbing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RunError};
use crate::message::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// A user-emitted log entry, surfaced as a `log` trace event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl LogEntry {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Info,
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// A recursive child invocation requested by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnSpec {
    pub path: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_user_message: Option<String>,
}

/// The runtime-side half of the execution surface.
#[async_trait::async_trait]
pub trait ExecutionHost: Send + Sync {
    fn log(&self, entry: LogEntry);

    fn get_session_meta(&self, key: &str) -> Option<Value>;

    /// Writing publishes a saved-state snapshot through the state-update
    /// callback.
    fn set_session_meta(&self, key: &str, value: Value);

    /// Append a normalized message to saved state. Only non-empty
    /// `user`/`assistant` content is accepted.
    fn append_message(&self, role: Role, content: &str) -> Result<()>;

    /// Recursive call back into the orchestrator: same sandbox choice,
    /// narrowed permissions, depth + 1, inherited deadline and signal.
    async fn spawn_and_wait(&self, spec: SpawnSpec) -> Result<Value>;
}

/// Everything a compute executor sees.
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub action_call_id: String,
    pub parent_action_call_id: Option<String>,
    pub depth: u32,
    pub input: Value,
    pub initial_user_message: Option<String>,
    pub label: Option<String>,
    host: Arc<dyn ExecutionHost>,
}

impl ExecutionContext {
    pub fn new(
        run_id: String,
        action_call_id: String,
        parent_action_call_id: Option<String>,
        depth: u32,
        input: Value,
        initial_user_message: Option<String>,
        label: Option<String>,
        host: Arc<dyn ExecutionHost>,
    ) -> Self {
        Self {
            run_id,
            action_call_id,
            parent_action_call_id,
            depth,
            input,
            initial_user_message,
            label,
            host,
        }
    }

    pub fn log(&self, entry: LogEntry) {
        self.host.log(entry);
    }

    pub fn get_session_meta(&self, key: &str) -> Option<Value> {
        self.host.get_session_meta(key)
    }

    pub fn set_session_meta(&self, key: &str, value: Value) {
        self.host.set_session_meta(key, value);
    }

    pub fn append_message(&self, role: Role, content: &str) -> Result<()> {
        self.host.append_message(role, content)
    }

    pub async fn spawn_and_wait(&self, spec: SpawnSpec) -> Result<Value> {
        self.host.spawn_and_wait(spec).await
    }

    /// Terminal failure helper: `ctx.fail("reason")?` ends the executor.
    pub fn fail<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(RunError::Other(message.into()))
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("action_call_id", &self.action_call_id)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}
