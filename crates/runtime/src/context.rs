//! The resolved context one deck invocation runs under, shared by the
//! compute branch, the LLM loop, the tool dispatcher, and the handlers.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use gambit_domain::deck::Guardrails;
use gambit_domain::{CancelToken, Deck, EnvelopeSource, TraceEvent, TraceSink};
use gambit_permissions::EffectivePermissions;
use gambit_providers::{ModelProvider, TextSink};
use gambit_state::StateHandle;
use gambit_tools::ExecOptions;

use crate::deadline::Deadline;
use crate::options::{DeckLoader, ExternalToolHandler};
use crate::worker::WorkerHost;

/// Whether this subtree executes in a worker sandbox.
#[derive(Clone)]
pub(crate) enum SandboxChoice {
    Off,
    On(Arc<dyn WorkerHost>),
}

impl SandboxChoice {
    pub fn is_on(&self) -> bool {
        matches!(self, SandboxChoice::On(_))
    }

    pub fn host(&self) -> Option<Arc<dyn WorkerHost>> {
        match self {
            SandboxChoice::Off => None,
            SandboxChoice::On(host) => Some(host.clone()),
        }
    }
}

#[derive(Clone)]
pub(crate) struct RunCtx {
    pub deck: Arc<Deck>,
    pub provider: Arc<dyn ModelProvider>,
    pub loader: Arc<dyn DeckLoader>,
    pub perms: EffectivePermissions,
    pub guardrails: Guardrails,
    pub deadline: Deadline,
    pub cancel: CancelToken,
    pub trace: Arc<dyn TraceSink>,
    pub state: StateHandle,
    pub run_id: String,
    /// This deck invocation's node id.
    pub action_call_id: String,
    pub parent_action_call_id: Option<String>,
    pub depth: u32,
    pub input: Value,
    pub input_provided: bool,
    pub initial_user_message: Option<String>,
    pub on_stream_text: Option<TextSink>,
    pub on_tool: Option<Arc<dyn ExternalToolHandler>>,
    pub responses_mode: bool,
    pub sandbox: SandboxChoice,
    pub subprocess_supported: bool,
    pub base_dir: PathBuf,
    pub label: Option<String>,
}

impl RunCtx {
    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    pub fn emit(&self, event: TraceEvent) {
        self.trace.emit(event);
    }

    pub fn source(&self, action_name: Option<&str>) -> EnvelopeSource {
        EnvelopeSource {
            deck_path: self.deck.path.clone(),
            action_name: action_name.map(String::from),
        }
    }

    pub fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            remaining: self.deadline.remaining(),
            cancel: self.cancel.clone(),
            subprocess_supported: self.subprocess_supported,
        }
    }

    pub fn emit_deck_start(&self) {
        self.emit(TraceEvent::DeckStart {
            run_id: self.run_id.clone(),
            action_call_id: self.action_call_id.clone(),
            parent_action_call_id: self.parent_action_call_id.clone(),
            deck_path: self.deck.path.clone(),
            depth: self.depth,
        });
    }

    pub fn emit_deck_end(&self) {
        self.emit(TraceEvent::DeckEnd {
            run_id: self.run_id.clone(),
            action_call_id: self.action_call_id.clone(),
            parent_action_call_id: self.parent_action_call_id.clone(),
            deck_path: self.deck.path.clone(),
        });
    }
}
