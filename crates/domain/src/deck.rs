//! The deck model — the immutable, already-parsed unit of execution.
//!
//! Parsing of deck source files is a collaborator's job; the runtime
//! consumes a loaded [`Deck`] value and assumes reference acyclicity was
//! checked at load time.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::execution::ExecutionContext;
use crate::grants::PermissionSpec;

/// Default ceiling on model passes per deck invocation.
pub const DEFAULT_MAX_PASSES: u32 = 24;
/// Default per-invocation timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
/// Default recursion depth ceiling.
pub const DEFAULT_MAX_DEPTH: u32 = 8;
/// Default delay before the busy handler first fires.
pub const DEFAULT_BUSY_DELAY_MS: u64 = 10_000;

/// A pure-compute implementation of a deck. Invoked instead of the model
/// loop when the deck declares no model parameters.
#[async_trait::async_trait]
pub trait DeckExecutor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> Result<Value>;
}

/// An embedded prompt fragment. Cards contribute body text to the composed
/// system prompt and nothing else; they cannot declare handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub title: Option<String>,
    pub body: String,
}

/// A named child-deck reference surfaced to the model as a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDeckRef {
    pub name: String,
    pub path: String,
    /// Per-reference narrowing applied on top of the child's declaration.
    pub permissions: Option<PermissionSpec>,
}

/// A tool declared by the deck but dispatched through the host's hook.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalToolDef {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
}

/// Reference to a handler deck with its timing.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerRef {
    pub path: String,
    pub delay_ms: Option<u64>,
    pub repeat_ms: Option<u64>,
}

/// Timed sub-deck invocations for long waits and error recovery.
/// Only decks carry handlers; cards never do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeckHandlers {
    pub on_busy: Option<HandlerRef>,
    pub on_idle: Option<HandlerRef>,
    pub on_error: Option<HandlerRef>,
}

/// A model id, or an ordered candidate list resolved through the
/// provider's `resolve_model` hook (falling back to the first non-empty
/// entry).
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChoice {
    Single(String),
    Candidates(Vec<String>),
}

/// Model id plus sampling and reasoning knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub model: ModelChoice,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub reasoning_effort: Option<String>,
    pub verbosity: Option<String>,
}

/// Per-deck guardrail overrides, merged over [`Guardrails::default`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GuardrailOverrides {
    pub max_passes: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub max_depth: Option<u32>,
}

/// Effective guardrails for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guardrails {
    pub max_passes: u32,
    pub timeout_ms: u64,
    pub max_depth: u32,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_passes: DEFAULT_MAX_PASSES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl Guardrails {
    /// Apply overrides on top of these guardrails, later layers winning.
    pub fn merged(self, overrides: GuardrailOverrides) -> Self {
        Self {
            max_passes: overrides.max_passes.unwrap_or(self.max_passes),
            timeout_ms: overrides.timeout_ms.unwrap_or(self.timeout_ms),
            max_depth: overrides.max_depth.unwrap_or(self.max_depth),
        }
    }
}

/// The unit of execution: prompt, schemas, tool bindings, handlers,
/// permission declaration, and optionally a pure-compute executor.
#[derive(Clone)]
pub struct Deck {
    /// Identity. Also the anchor the loader resolves action paths against.
    pub path: String,
    pub system_prompt: Option<String>,
    pub cards: Vec<Card>,
    pub executor: Option<Arc<dyn DeckExecutor>>,
    pub model_params: Option<ModelParams>,
    pub action_decks: Vec<ActionDeckRef>,
    pub external_tools: Vec<ExternalToolDef>,
    pub handlers: DeckHandlers,
    /// Required for non-root decks; root may accept raw string input.
    pub context_schema: Option<Value>,
    /// Required for non-root decks; root may be string-typed.
    pub response_schema: Option<Value>,
    pub guardrails: GuardrailOverrides,
    pub permissions: Option<PermissionSpec>,
    /// The deck completes via the internal `gambit_respond` tool rather
    /// than raw assistant text.
    pub respond: bool,
    /// Enables the terminal `gambit_end` tool.
    pub allow_end: bool,
}

impl Deck {
    /// A minimal deck with nothing but a path. Useful as a literal base.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            system_prompt: None,
            cards: Vec::new(),
            executor: None,
            model_params: None,
            action_decks: Vec::new(),
            external_tools: Vec::new(),
            handlers: DeckHandlers::default(),
            context_schema: None,
            response_schema: None,
            guardrails: GuardrailOverrides::default(),
            permissions: None,
            respond: false,
            allow_end: false,
        }
    }

    /// True when the deck runs the compute branch instead of the model loop.
    pub fn is_compute(&self) -> bool {
        self.model_params.is_none()
    }

    /// Deck body plus embedded card bodies, in declaration order.
    pub fn composed_system_prompt(&self) -> Option<String> {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(body) = self.system_prompt.as_deref() {
            if !body.is_empty() {
                parts.push(body);
            }
        }
        for card in &self.cards {
            if !card.body.is_empty() {
                parts.push(&card.body);
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Look up an action reference by tool name.
    pub fn action(&self, name: &str) -> Option<&ActionDeckRef> {
        self.action_decks.iter().find(|a| a.name == name)
    }
}

impl fmt::Debug for Deck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deck")
            .field("path", &self.path)
            .field("executor", &self.executor.is_some())
            .field("model_params", &self.model_params)
            .field("action_decks", &self.action_decks)
            .field("external_tools", &self.external_tools)
            .field("respond", &self.respond)
            .field("allow_end", &self.allow_end)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guardrail_merge_prefers_overrides() {
        let merged = Guardrails::default().merged(GuardrailOverrides {
            max_passes: Some(3),
            timeout_ms: None,
            max_depth: Some(2),
        });
        assert_eq!(merged.max_passes, 3);
        assert_eq!(merged.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(merged.max_depth, 2);
    }

    #[test]
    fn composed_prompt_joins_deck_and_cards() {
        let mut deck = Deck::new("root.deck");
        deck.system_prompt = Some("You orchestrate.".into());
        deck.cards.push(Card {
            title: Some("style".into()),
            body: "Be terse.".into(),
        });
        assert_eq!(
            deck.composed_system_prompt().unwrap(),
            "You orchestrate.\n\nBe terse."
        );
    }

    #[test]
    fn composed_prompt_empty_when_no_bodies() {
        assert!(Deck::new("x.deck").composed_system_prompt().is_none());
    }

    #[test]
    fn compute_when_no_model_params() {
        let deck = Deck::new("calc.deck");
        assert!(deck.is_compute());
    }
}
