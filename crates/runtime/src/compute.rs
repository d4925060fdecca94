//! The compute branch: decks with an executor and no model parameters.

use std::sync::Arc;

use serde_json::Value;

use gambit_domain::error::{Guardrail, Result, RunError};
use gambit_domain::execution::{ExecutionContext, ExecutionHost, LogEntry, SpawnSpec};
use gambit_domain::{schema, Role, TraceEvent, Usage};
use gambit_state::StateUpdateSink;

use crate::context::RunCtx;
use crate::options::{RunOptions, RunOutcome};
use crate::run::run_deck_boxed;

/// The runtime-side host bound to one executor invocation.
struct RuntimeHost {
    ctx: RunCtx,
}

#[async_trait::async_trait]
impl ExecutionHost for RuntimeHost {
    fn log(&self, entry: LogEntry) {
        self.ctx.emit(TraceEvent::Log {
            run_id: self.ctx.run_id.clone(),
            action_call_id: self.ctx.action_call_id.clone(),
            parent_action_call_id: self.ctx.parent_action_call_id.clone(),
            entry,
        });
    }

    fn get_session_meta(&self, key: &str) -> Option<Value> {
        self.ctx.state.get_meta(key)
    }

    fn set_session_meta(&self, key: &str, value: Value) {
        self.ctx.state.set_meta(key, value);
    }

    fn append_message(&self, role: Role, content: &str) -> Result<()> {
        self.ctx
            .state
            .append_conversation_message(role, content)
            .map_err(RunError::Validation)
    }

    async fn spawn_and_wait(&self, spec: SpawnSpec) -> Result<Value> {
        let ctx = &self.ctx;
        let parent_state = ctx.state.clone();
        let on_state_update: StateUpdateSink =
            Arc::new(move |snapshot| parent_state.replace(snapshot));

        let child_options = RunOptions {
            deck_path: spec.path,
            input: spec.input,
            input_provided: true,
            initial_user_message: spec.initial_user_message,
            provider: ctx.provider.clone(),
            loader: ctx.loader.clone(),
            parent_permissions: Some(ctx.perms.clone()),
            workspace_permissions: None,
            reference_permissions: None,
            session_permissions: None,
            base_dir: ctx.base_dir.clone(),
            depth: ctx.depth + 1,
            parent_action_call_id: Some(ctx.action_call_id.clone()),
            run_id: Some(ctx.run_id.clone()),
            action_call_id: None,
            guardrails: Default::default(),
            label: None,
            trace: Some(ctx.trace.clone()),
            on_stream_text: ctx.on_stream_text.clone(),
            saved_state: Some(ctx.state.snapshot()),
            on_state_update: Some(on_state_update),
            cancel: Some(ctx.cancel.clone()),
            on_cancel: None,
            // Children run under the same sandbox choice as the parent.
            worker_sandbox: Some(ctx.sandbox.is_on()),
            worker_host: ctx.sandbox.host(),
            on_tool: ctx.on_tool.clone(),
            responses_mode: ctx.responses_mode,
            run_deadline: Some(ctx.deadline),
            accept_string_input: false,
            subprocess_supported: ctx.subprocess_supported,
        };

        let outcome = run_deck_boxed(child_options).await?;
        Ok(outcome.output)
    }
}

/// Invoke the deck's executor under the run's deadline and signal, then
/// validate its return value against the response schema.
pub(crate) async fn run_compute(ctx: RunCtx) -> Result<RunOutcome> {
    let executor = ctx.deck.executor.clone().ok_or_else(|| {
        RunError::Validation(format!(
            "deck '{}' declares neither model parameters nor an executor",
            ctx.deck.path
        ))
    })?;

    ctx.emit_deck_start();

    let host: Arc<dyn ExecutionHost> = Arc::new(RuntimeHost { ctx: ctx.clone() });
    let execution = ExecutionContext::new(
        ctx.run_id.clone(),
        ctx.action_call_id.clone(),
        ctx.parent_action_call_id.clone(),
        ctx.depth,
        ctx.input.clone(),
        ctx.initial_user_message.clone(),
        ctx.label.clone(),
        host,
    );

    let deadline = tokio::time::Instant::from_std(ctx.deadline.instant());
    let result = tokio::select! {
        result = executor.execute(execution) => result,
        _ = ctx.cancel.cancelled() => Err(RunError::Canceled),
        _ = tokio::time::sleep_until(deadline) => Err(RunError::Guardrail(Guardrail::Timeout)),
    };

    let outcome = result.and_then(|value| {
        if let Some(response_schema) = ctx.deck.response_schema.as_ref() {
            schema::validate(response_schema, &value)
                .map_err(|e| RunError::Validation(format!("response payload: {e}")))?;
        }
        ctx.state.publish();
        Ok(RunOutcome {
            run_id: ctx.run_id.clone(),
            output: value,
            ended: false,
            usage: Usage::default(),
        })
    });

    ctx.emit_deck_end();
    outcome
}
