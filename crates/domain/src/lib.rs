//! Core domain types for the gambit deck orchestration runtime: the deck
//! model, normalized chat messages, tool envelopes, permission
//! declarations, trace events, identifiers, the schema capability, and
//! cooperative cancellation.

pub mod cancel;
pub mod deck;
pub mod envelope;
pub mod error;
pub mod execution;
pub mod grants;
pub mod ids;
pub mod message;
pub mod schema;
pub mod trace;

pub use cancel::CancelToken;
pub use deck::{Deck, DeckExecutor, Guardrails};
pub use envelope::{EnvelopeSource, ToolEnvelope};
pub use error::{is_run_canceled, Guardrail, HostUnsupported, Result, RunError};
pub use execution::{ExecutionContext, ExecutionHost, LogEntry, SpawnSpec};
pub use grants::{GrantSpec, PermissionLayer, PermissionLayerTrace, PermissionSpec, RunGrantSpec};
pub use message::{Message, Role, ToolCall, ToolDefinition, Usage};
pub use trace::{truncate_str, ModelMode, TraceEvent, TraceSink, TracingSink};
