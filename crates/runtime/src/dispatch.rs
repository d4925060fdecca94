//! Tool-call dispatch: one model-emitted call in, one envelope out.
//!
//! Lookup goes through the pass catalog (built-ins, internal respond/end,
//! actions, externals); unknown names answer 404. Only cancellation
//! escapes as an error — everything else the model can see is an
//! envelope.

use serde_json::{json, Value};

use gambit_domain::error::{is_run_canceled, Result, RunError};
use gambit_domain::{ids, schema, ToolCall, ToolEnvelope, TraceEvent};
use gambit_permissions::{resolve, PermissionLayers};
use gambit_state::StateUpdateSink;

use crate::catalog::{InternalTool, ToolBinding, ToolCatalog};
use crate::context::RunCtx;
use crate::handlers;
use crate::options::{RunOptions, ToolHookRequest};
use crate::run::run_deck_boxed;

/// How one dispatched call terminates the pass (or doesn't).
pub(crate) enum CallKind {
    Normal,
    /// `gambit_respond` validated; the envelope is the deck's return value.
    Respond,
    /// `gambit_end`; the payload passes through to the caller.
    End(Value),
}

pub(crate) struct CallOutcome {
    pub envelope: ToolEnvelope,
    pub kind: CallKind,
    /// Busy-handler output queued while an action child ran.
    pub handler_texts: Vec<String>,
    /// True for action-deck dispatches; closes the `action.end` scope
    /// after `tool.result`.
    is_action: bool,
}

impl CallOutcome {
    fn normal(envelope: ToolEnvelope) -> Self {
        Self {
            envelope,
            kind: CallKind::Normal,
            handler_texts: Vec::new(),
            is_action: false,
        }
    }
}

/// Dispatch one tool call in model-emitted order.
pub(crate) async fn dispatch_call(
    ctx: &RunCtx,
    catalog: &ToolCatalog,
    call: &ToolCall,
) -> Result<CallOutcome> {
    ctx.cancel.check()?;
    ctx.deadline.check()?;

    let call_node_id = ids::new_action_call_id();
    ctx.emit(TraceEvent::ToolCall {
        run_id: ctx.run_id.clone(),
        action_call_id: call_node_id.clone(),
        parent_action_call_id: Some(ctx.action_call_id.clone()),
        call_id: call.call_id.clone(),
        tool_name: call.name.clone(),
        arguments: call.arguments.clone(),
    });

    let mut outcome = match catalog.lookup(&call.name) {
        Some(ToolBinding::Internal(InternalTool::Respond)) => dispatch_respond(ctx, call),
        Some(ToolBinding::Internal(InternalTool::End)) => dispatch_end(call),
        Some(ToolBinding::Internal(_)) => CallOutcome::normal(ToolEnvelope::not_found(format!(
            "'{}' is not directly callable",
            call.name
        ))),
        Some(ToolBinding::Action { reference, deck }) => {
            let reference = reference.clone();
            let child_deck = deck.clone();
            dispatch_action(ctx, call, &call_node_id, reference, child_deck).await?
        }
        Some(ToolBinding::External(external)) => {
            let external = external.clone();
            dispatch_external(ctx, call, &call_node_id, &external).await
        }
        Some(ToolBinding::Builtin(id)) => {
            let id = *id;
            let envelope =
                gambit_tools::dispatch_builtin(id, &call.arguments, &ctx.perms, &ctx.exec_options())
                    .await?;
            CallOutcome::normal(envelope)
        }
        None => CallOutcome::normal(ToolEnvelope::not_found(format!(
            "unknown tool '{}'",
            call.name
        ))),
    };

    outcome.envelope = outcome.envelope.correlate(
        &ctx.run_id,
        &call_node_id,
        Some(&ctx.action_call_id),
        ctx.source(Some(&call.name)),
    );

    ctx.emit(TraceEvent::ToolResult {
        run_id: ctx.run_id.clone(),
        action_call_id: call_node_id.clone(),
        parent_action_call_id: Some(ctx.action_call_id.clone()),
        call_id: call.call_id.clone(),
        tool_name: call.name.clone(),
        preview: gambit_domain::truncate_str(&outcome.envelope.to_value().to_string(), 200),
        is_error: outcome.envelope.is_error(),
    });

    if outcome.is_action {
        ctx.emit(TraceEvent::ActionEnd {
            run_id: ctx.run_id.clone(),
            action_call_id: call_node_id,
            parent_action_call_id: Some(ctx.action_call_id.clone()),
            action_name: call.name.clone(),
            is_error: outcome.envelope.is_error(),
        });
    }

    Ok(outcome)
}

// ── Internal tools ─────────────────────────────────────────────────

fn dispatch_respond(ctx: &RunCtx, call: &ToolCall) -> CallOutcome {
    let payload = call.arguments.get("payload").cloned().unwrap_or(Value::Null);

    if let Some(response_schema) = ctx.deck.response_schema.as_ref() {
        if let Err(e) = schema::validate(response_schema, &payload) {
            return CallOutcome::normal(ToolEnvelope::invalid_input(format!(
                "respond payload: {e}"
            )));
        }
    }

    let envelope = ToolEnvelope::from_action_value(call.arguments.clone());
    CallOutcome {
        envelope,
        kind: CallKind::Respond,
        handler_texts: Vec::new(),
        is_action: false,
    }
}

fn dispatch_end(call: &ToolCall) -> CallOutcome {
    let payload = call
        .arguments
        .get("payload")
        .cloned()
        .unwrap_or_else(|| call.arguments.clone());
    CallOutcome {
        envelope: ToolEnvelope::ok(payload.clone()),
        kind: CallKind::End(payload),
        handler_texts: Vec::new(),
        is_action: false,
    }
}

// ── Action decks ───────────────────────────────────────────────────

async fn dispatch_action(
    ctx: &RunCtx,
    call: &ToolCall,
    call_node_id: &str,
    reference: gambit_domain::deck::ActionDeckRef,
    child_deck: std::sync::Arc<gambit_domain::Deck>,
) -> Result<CallOutcome> {
    // Validate args against the child's context schema before anything
    // else; the model sees the 400 envelope and proceeds.
    if let Some(context_schema) = child_deck.context_schema.as_ref() {
        if let Err(e) = schema::validate(context_schema, &call.arguments) {
            return Ok(CallOutcome::normal(ToolEnvelope::invalid_input(format!(
                "arguments for '{}': {e}",
                call.name
            ))));
        }
    }

    // The child's layering, resolved fresh for the action.start trace.
    let (_, layer_traces) = resolve(
        PermissionLayers {
            parent: Some(&ctx.perms),
            declaration: child_deck.permissions.as_ref(),
            reference: reference.permissions.as_ref(),
            ..PermissionLayers::default()
        },
        ctx.perms.base_dir(),
    );
    ctx.emit(TraceEvent::ActionStart {
        run_id: ctx.run_id.clone(),
        action_call_id: call_node_id.to_owned(),
        parent_action_call_id: Some(ctx.action_call_id.clone()),
        deck_path: reference.path.clone(),
        action_name: call.name.clone(),
        args: call.arguments.clone(),
        permissions: layer_traces,
    });

    let busy_guard = handlers::start_busy_timer(ctx, &call.name, &call.arguments);

    let parent_state = ctx.state.clone();
    let on_state_update: StateUpdateSink =
        std::sync::Arc::new(move |snapshot| parent_state.replace(snapshot));

    let child_options = RunOptions {
        deck_path: reference.path.clone(),
        input: call.arguments.clone(),
        input_provided: true,
        initial_user_message: None,
        provider: ctx.provider.clone(),
        loader: ctx.loader.clone(),
        parent_permissions: Some(ctx.perms.clone()),
        workspace_permissions: None,
        reference_permissions: reference.permissions.clone(),
        session_permissions: None,
        base_dir: ctx.base_dir.clone(),
        depth: ctx.depth + 1,
        parent_action_call_id: Some(ctx.action_call_id.clone()),
        run_id: Some(ctx.run_id.clone()),
        action_call_id: Some(call_node_id.to_owned()),
        guardrails: Default::default(),
        label: Some(call.name.clone()),
        trace: Some(ctx.trace.clone()),
        on_stream_text: None,
        saved_state: Some(ctx.state.snapshot()),
        on_state_update: Some(on_state_update),
        cancel: Some(ctx.cancel.clone()),
        on_cancel: None,
        worker_sandbox: Some(ctx.sandbox.is_on()),
        worker_host: ctx.sandbox.host(),
        on_tool: ctx.on_tool.clone(),
        responses_mode: ctx.responses_mode,
        run_deadline: Some(ctx.deadline),
        accept_string_input: false,
        subprocess_supported: ctx.subprocess_supported,
    };

    let child_result = run_deck_boxed(child_options).await;
    let handler_texts = busy_guard.map(handlers::BusyGuard::finish).unwrap_or_default();

    let envelope = match child_result {
        Ok(outcome) => {
            let envelope = ToolEnvelope::from_action_value(outcome.output);
            let payload_ok = match (child_deck.response_schema.as_ref(), envelope.payload.as_ref())
            {
                (Some(response_schema), Some(payload)) if !envelope.is_error() => {
                    schema::validate(response_schema, payload)
                }
                _ => Ok(()),
            };
            match payload_ok {
                Ok(()) => envelope,
                Err(e) => {
                    recover_action_error(ctx, call, &format!("invalid response payload: {e}"))
                        .await?
                }
            }
        }
        Err(e) if is_run_canceled(&e) => return Err(e),
        Err(e) => recover_action_error(ctx, call, &e.to_string()).await?,
    };

    Ok(CallOutcome {
        envelope,
        kind: CallKind::Normal,
        handler_texts,
        is_action: true,
    })
}

/// Route a failed action through `on_error`, or re-raise when the deck
/// declares no handler.
async fn recover_action_error(
    ctx: &RunCtx,
    call: &ToolCall,
    message: &str,
) -> Result<ToolEnvelope> {
    match handlers::run_error_handler(ctx, &call.name, message, &call.arguments).await {
        Some(envelope) => Ok(envelope),
        None => Err(RunError::Other(format!(
            "action '{}' failed: {message}",
            call.name
        ))),
    }
}

// ── External tools ─────────────────────────────────────────────────

async fn dispatch_external(
    ctx: &RunCtx,
    call: &ToolCall,
    call_node_id: &str,
    external: &gambit_domain::deck::ExternalToolDef,
) -> CallOutcome {
    if let Some(input_schema) = external.input_schema.as_ref() {
        if let Err(e) = schema::validate(input_schema, &call.arguments) {
            return CallOutcome::normal(ToolEnvelope::invalid_input(format!(
                "arguments for '{}': {e}",
                call.name
            )));
        }
    }

    let Some(hook) = ctx.on_tool.as_ref() else {
        return CallOutcome::normal(ToolEnvelope::error(
            501,
            "missing_on_tool",
            format!("no external-tool hook registered for '{}'", call.name),
        ));
    };

    let request = ToolHookRequest {
        name: call.name.clone(),
        args: call.arguments.clone(),
        run_id: ctx.run_id.clone(),
        action_call_id: call_node_id.to_owned(),
        parent_action_call_id: Some(ctx.action_call_id.clone()),
        deck_path: ctx.deck.path.clone(),
    };

    match hook.on_tool(request).await {
        Ok(value) => CallOutcome::normal(ToolEnvelope::from_action_value(value)),
        Err(message) => CallOutcome::normal(ToolEnvelope::error(
            500,
            "tool_handler_error",
            message,
        )),
    }
}

/// The synthetic `gambit_complete` exchange appended after an action so
/// the envelope reaches the model through the tool-call channel as well.
pub(crate) fn complete_exchange(envelope: &ToolEnvelope) -> (gambit_domain::Message, gambit_domain::Message) {
    let call_id = ids::new_tool_call_id();
    let call = ToolCall {
        call_id: call_id.clone(),
        name: InternalTool::Complete.name().into(),
        arguments: json!({}),
    };
    (
        gambit_domain::Message::assistant_tool_calls("", vec![call]),
        gambit_domain::Message::tool_result(
            call_id,
            InternalTool::Complete.name(),
            envelope.to_value().to_string(),
        ),
    )
}
