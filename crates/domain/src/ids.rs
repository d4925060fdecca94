//! Short prefixed identifiers for runs, action calls, tool calls, and
//! message refs.
//!
//! Tool-call ids are sent back to model providers, which bound them at
//! roughly 40 characters; a `call-` prefix plus a 32-hex UUID stays under
//! that bound.

fn short() -> String {
    uuid::Uuid::new_v4().as_simple().to_string()
}

/// Mint a run id (`run-…`). Minted once per root invocation and inherited
/// by every descendant.
pub fn new_run_id() -> String {
    format!("run-{}", short())
}

/// Mint an action-call id (`action-…`). One per deck invocation and per
/// tool call; an action tool call and the child deck invocation it opens
/// share the same id.
pub fn new_action_call_id() -> String {
    format!("action-{}", short())
}

/// Mint a provider-facing tool-call id (`call-…`).
pub fn new_tool_call_id() -> String {
    format!("call-{}", short())
}

/// Mint a stable per-message ref id (`msg-…`).
pub fn new_message_ref_id() -> String {
    format!("msg-{}", short())
}
