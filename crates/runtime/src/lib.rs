//! The deck orchestration runtime: `run_deck` executes a hierarchical
//! graph of prompt-driven decks, mediates their tool calls, enforces a
//! monotonically narrowing capability sandbox, and drives model
//! providers through a bounded conversation loop with cancellation,
//! timeouts, and persistent session state.

pub mod catalog;
mod compute;
mod context;
pub mod deadline;
mod dispatch;
mod handlers;
mod llm_loop;
pub mod options;
pub mod policy;
pub mod run;
pub mod worker;

pub use catalog::{InternalTool, ToolBinding, ToolCatalog};
pub use deadline::Deadline;
pub use options::{
    CancelCallback, DeckLoader, ExternalToolHandler, RunOptions, RunOutcome, StaticDeckSet,
    ToolHookRequest, WORKER_SANDBOX_ENV,
};
pub use policy::{TRUSTED_SCHEMA_NAMESPACE, WORKSPACE_CONFIG_FILE};
pub use run::{run_deck, run_deck_value};
pub use worker::{LocalWorkerHost, WorkerChannel, WorkerHost, WorkerKind, WorkerLaunch};
