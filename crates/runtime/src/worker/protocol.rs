//! The nonce-guarded worker message protocol.
//!
//! Every inbound worker message carries the `bridge_session` token minted
//! for that worker; `run.result`/`run.error` additionally carry the
//! `completion_nonce` from the `run.start` message. Mismatches are logged
//! and dropped so forged or replayed messages can never settle a run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use gambit_domain::deck::GuardrailOverrides;
use gambit_domain::execution::LogEntry;
use gambit_domain::{Deck, PermissionSpec, TraceEvent};
use gambit_providers::{ChatOutcome, ProviderParams, ResponseItem, ResponsesOutcome};
use gambit_state::SavedState;

/// Declarative deck facts reported by an inspection worker. Inspection
/// never executes deck code, so only the config surface crosses the
/// bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeckManifest {
    pub path: String,
    pub has_executor: bool,
    pub has_model: bool,
    pub respond: bool,
    pub allow_end: bool,
    pub permissions: Option<PermissionSpec>,
    pub guardrails: GuardrailOverrides,
    pub context_schema: Option<Value>,
    pub response_schema: Option<Value>,
}

impl From<&Deck> for DeckManifest {
    fn from(deck: &Deck) -> Self {
        Self {
            path: deck.path.clone(),
            has_executor: deck.executor.is_some(),
            has_model: deck.model_params.is_some(),
            respond: deck.respond,
            allow_end: deck.allow_end,
            permissions: deck.permissions.clone(),
            guardrails: deck.guardrails,
            context_schema: deck.context_schema.clone(),
            response_schema: deck.response_schema.clone(),
        }
    }
}

/// Host → worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    #[serde(rename = "run.start")]
    RunStart {
        bridge_session: String,
        completion_nonce: String,
        deck_path: String,
        input: Value,
        input_provided: bool,
        initial_user_message: Option<String>,
        saved_state: Option<SavedState>,
        /// The derived capability set, wire form.
        permissions: PermissionSpec,
        /// Remaining time until the run deadline.
        deadline_ms: u64,
        root: bool,
        responses_mode: bool,
        /// Correlation ids so worker-side traces align with the host's.
        run_id: String,
        action_call_id: String,
        parent_action_call_id: Option<String>,
        depth: u32,
    },

    #[serde(rename = "spawn.result")]
    SpawnResult { request_id: String, output: Value },

    #[serde(rename = "spawn.error")]
    SpawnError { request_id: String, message: String },

    #[serde(rename = "model.chat.result")]
    ModelChatResult {
        request_id: String,
        outcome: ChatOutcome,
    },

    #[serde(rename = "model.chat.error")]
    ModelChatError { request_id: String, message: String },

    #[serde(rename = "model.responses.result")]
    ModelResponsesResult {
        request_id: String,
        outcome: ResponsesOutcome,
    },

    #[serde(rename = "model.responses.error")]
    ModelResponsesError { request_id: String, message: String },

    #[serde(rename = "model.resolveModel.result")]
    ModelResolveResult { request_id: String, model: String },

    #[serde(rename = "model.resolveModel.error")]
    ModelResolveError { request_id: String, message: String },
}

/// Worker → host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    #[serde(rename = "log.entry")]
    Log {
        bridge_session: String,
        entry: LogEntry,
    },

    #[serde(rename = "spawn.request")]
    SpawnRequest {
        bridge_session: String,
        request_id: String,
        path: String,
        input: Value,
        initial_user_message: Option<String>,
    },

    #[serde(rename = "state.update")]
    StateUpdate {
        bridge_session: String,
        state: SavedState,
    },

    #[serde(rename = "trace.event")]
    Trace {
        bridge_session: String,
        event: TraceEvent,
    },

    #[serde(rename = "model.chat.request")]
    ModelChatRequest {
        bridge_session: String,
        request_id: String,
        model: String,
        messages: Vec<gambit_domain::Message>,
        tools: Vec<gambit_domain::ToolDefinition>,
        params: ProviderParams,
        stream: bool,
    },

    #[serde(rename = "model.responses.request")]
    ModelResponsesRequest {
        bridge_session: String,
        request_id: String,
        model: String,
        input: Vec<ResponseItem>,
        tools: Vec<gambit_domain::ToolDefinition>,
        params: ProviderParams,
        stream: bool,
    },

    #[serde(rename = "model.resolveModel.request")]
    ModelResolveRequest {
        bridge_session: String,
        request_id: String,
        candidates: Vec<String>,
    },

    #[serde(rename = "run.result")]
    RunResult {
        bridge_session: String,
        completion_nonce: String,
        output: Value,
    },

    #[serde(rename = "run.error")]
    RunFailed {
        bridge_session: String,
        completion_nonce: String,
        message: String,
        canceled: bool,
    },
}

impl WorkerMessage {
    pub fn bridge_session(&self) -> &str {
        match self {
            WorkerMessage::Log { bridge_session, .. }
            | WorkerMessage::SpawnRequest { bridge_session, .. }
            | WorkerMessage::StateUpdate { bridge_session, .. }
            | WorkerMessage::Trace { bridge_session, .. }
            | WorkerMessage::ModelChatRequest { bridge_session, .. }
            | WorkerMessage::ModelResponsesRequest { bridge_session, .. }
            | WorkerMessage::ModelResolveRequest { bridge_session, .. }
            | WorkerMessage::RunResult { bridge_session, .. }
            | WorkerMessage::RunFailed { bridge_session, .. } => bridge_session,
        }
    }
}
