//! Everything a `run_deck` invocation is configured with.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use gambit_domain::deck::GuardrailOverrides;
use gambit_domain::error::{Result, RunError};
use gambit_domain::{CancelToken, Deck, PermissionSpec, TraceSink, Usage};
use gambit_permissions::EffectivePermissions;
use gambit_providers::{ModelProvider, TextSink};
use gambit_state::{SavedState, StateUpdateSink};

use crate::deadline::Deadline;
use crate::worker::WorkerHost;

/// Environment variable that opts the process into the worker sandbox.
pub const WORKER_SANDBOX_ENV: &str = "GAMBIT_DECK_WORKER_SANDBOX";

/// Supplies already-parsed decks to the runtime. Deck source parsing is a
/// collaborator's job; the loader is also the seam the sandbox uses for
/// read-only inspection and the bootstrap import scan.
#[async_trait::async_trait]
pub trait DeckLoader: Send + Sync {
    async fn load(&self, path: &str) -> Result<Arc<Deck>>;

    /// Read-only inspection for sandboxed mode. Must not execute deck
    /// code; the default defers to `load` for loaders that are already
    /// side-effect free.
    async fn inspect(&self, path: &str) -> Result<Arc<Deck>> {
        self.load(path).await
    }

    /// The deck's import graph, discovered by syntactic scan only. Used
    /// to derive the worker bootstrap read allowlist.
    fn import_graph(&self, path: &str) -> Vec<PathBuf> {
        let _ = path;
        Vec::new()
    }
}

/// In-memory loader keyed by deck path.
#[derive(Default)]
pub struct StaticDeckSet {
    decks: HashMap<String, Arc<Deck>>,
    imports: HashMap<String, Vec<PathBuf>>,
}

impl StaticDeckSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, deck: Deck) -> &mut Self {
        self.decks.insert(deck.path.clone(), Arc::new(deck));
        self
    }

    pub fn with(mut self, deck: Deck) -> Self {
        self.insert(deck);
        self
    }

    pub fn with_imports(mut self, path: &str, imports: Vec<PathBuf>) -> Self {
        self.imports.insert(path.to_owned(), imports);
        self
    }
}

#[async_trait::async_trait]
impl DeckLoader for StaticDeckSet {
    async fn load(&self, path: &str) -> Result<Arc<Deck>> {
        self.decks
            .get(path)
            .cloned()
            .ok_or_else(|| RunError::NotFound(format!("deck '{path}'")))
    }

    fn import_graph(&self, path: &str) -> Vec<PathBuf> {
        self.imports.get(path).cloned().unwrap_or_default()
    }
}

/// One external-tool dispatch, forwarded to the host's hook.
#[derive(Debug, Clone)]
pub struct ToolHookRequest {
    pub name: String,
    pub args: Value,
    pub run_id: String,
    pub action_call_id: String,
    pub parent_action_call_id: Option<String>,
    pub deck_path: String,
}

/// Host hook for tools the runtime does not implement. An `Err` becomes a
/// `tool_handler_error` envelope; the error never escapes the loop.
#[async_trait::async_trait]
pub trait ExternalToolHandler: Send + Sync {
    async fn on_tool(&self, req: ToolHookRequest) -> std::result::Result<Value, String>;
}

/// Fired at most once per root run when cancellation is observed.
pub type CancelCallback = Arc<dyn Fn() + Send + Sync>;

/// Input to [`run_deck`](crate::run_deck).
#[derive(Clone)]
pub struct RunOptions {
    pub deck_path: String,
    pub input: Value,
    pub input_provided: bool,
    pub initial_user_message: Option<String>,
    pub provider: Arc<dyn ModelProvider>,
    pub loader: Arc<dyn DeckLoader>,

    /// The parent's effective set; `None` marks a root invocation.
    pub parent_permissions: Option<EffectivePermissions>,
    /// Process-wide policy overlay (applied at root only).
    pub workspace_permissions: Option<PermissionSpec>,
    /// Per-action-reference narrowing from the parent.
    pub reference_permissions: Option<PermissionSpec>,
    /// Ad-hoc user grants (applied at root only).
    pub session_permissions: Option<PermissionSpec>,
    /// Anchor for relative path grants and built-in tool paths.
    pub base_dir: PathBuf,

    pub depth: u32,
    pub parent_action_call_id: Option<String>,
    /// Run-id hint; falls back to saved state, then a fresh id.
    pub run_id: Option<String>,
    /// Node-id hint; the worker bridge uses it to keep host and worker
    /// traces aligned. Freshly minted when absent.
    pub action_call_id: Option<String>,
    pub guardrails: GuardrailOverrides,
    pub label: Option<String>,

    pub trace: Option<Arc<dyn TraceSink>>,
    pub on_stream_text: Option<TextSink>,
    pub saved_state: Option<SavedState>,
    pub on_state_update: Option<StateUpdateSink>,

    pub cancel: Option<CancelToken>,
    pub on_cancel: Option<CancelCallback>,

    /// `None` defers to the `GAMBIT_DECK_WORKER_SANDBOX` env var.
    pub worker_sandbox: Option<bool>,
    pub worker_host: Option<Arc<dyn WorkerHost>>,
    pub on_tool: Option<Arc<dyn ExternalToolHandler>>,

    pub responses_mode: bool,
    pub run_deadline: Option<Deadline>,
    /// Root decks may take a raw string input when this is set.
    pub accept_string_input: bool,
    /// False when the embedding host forbids subprocess launch.
    pub subprocess_supported: bool,
}

impl RunOptions {
    pub fn new(
        deck_path: impl Into<String>,
        provider: Arc<dyn ModelProvider>,
        loader: Arc<dyn DeckLoader>,
    ) -> Self {
        Self {
            deck_path: deck_path.into(),
            input: Value::Null,
            input_provided: false,
            initial_user_message: None,
            provider,
            loader,
            parent_permissions: None,
            workspace_permissions: None,
            reference_permissions: None,
            session_permissions: None,
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            depth: 0,
            parent_action_call_id: None,
            run_id: None,
            action_call_id: None,
            guardrails: GuardrailOverrides::default(),
            label: None,
            trace: None,
            on_stream_text: None,
            saved_state: None,
            on_state_update: None,
            cancel: None,
            on_cancel: None,
            worker_sandbox: None,
            worker_host: None,
            on_tool: None,
            responses_mode: false,
            run_deadline: None,
            accept_string_input: false,
            subprocess_supported: true,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self.input_provided = true;
        self
    }

    /// Whether this run opts into the worker sandbox: the explicit flag,
    /// else the env var (treated as unset when env is unreadable).
    pub fn sandbox_requested(&self) -> bool {
        match self.worker_sandbox {
            Some(explicit) => explicit,
            None => std::env::var(WORKER_SANDBOX_ENV)
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }
}

/// What a completed run returns.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    /// The validated response value, or the full respond/end envelope for
    /// decks that complete through an internal tool.
    pub output: Value,
    /// True when the deck finished via `gambit_end`.
    pub ended: bool,
    /// Token usage accumulated across every pass of the run.
    pub usage: Usage,
}
