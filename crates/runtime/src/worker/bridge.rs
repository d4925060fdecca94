//! Host side of the worker bridge.
//!
//! One worker per opted-in `run_deck` call: spawned through the
//! host-supplied [`WorkerHost`], guarded by a fresh bridge session and
//! completion nonce, raced against the run deadline, and terminated on
//! every settle path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use gambit_domain::error::{Guardrail, Result, RunError};
use gambit_domain::{schema, CancelToken, TraceEvent, Usage};
use gambit_permissions::EffectivePermissions;
use gambit_providers::{ChatRequest, EventSink, TextSink};
use gambit_state::StateUpdateSink;

use crate::context::RunCtx;
use crate::deadline::Deadline;
use crate::options::{DeckLoader, RunOptions, RunOutcome};
use crate::run::run_deck_boxed;
use crate::worker::protocol::{DeckManifest, HostMessage, WorkerMessage};
use crate::worker::INSPECT_WORKER_TIMEOUT_MS;

/// What kind of work a spawned worker performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Read-only deck inspection, bounded by the inspect timeout.
    Inspect,
    /// Execute a compute deck's executor.
    Compute,
    /// Run the whole LLM loop inside the worker.
    Orchestration,
}

/// Everything a host needs to create one isolated execution context.
#[derive(Clone)]
pub struct WorkerLaunch {
    pub kind: WorkerKind,
    pub deck_path: String,
    pub loader: Arc<dyn DeckLoader>,
    /// The derived capability set the worker runs under.
    pub permissions: EffectivePermissions,
    pub base_dir: PathBuf,
}

/// Channel pair to one live worker. Cancelling `terminate` tears the
/// worker down.
pub struct WorkerChannel {
    pub to_worker: mpsc::UnboundedSender<HostMessage>,
    pub from_worker: mpsc::UnboundedReceiver<WorkerMessage>,
    pub terminate: CancelToken,
}

/// Creates isolated execution contexts. Absence of a host means the
/// runtime fails sandboxed runs with `worker_sandbox_unsupported_host`.
pub trait WorkerHost: Send + Sync {
    fn spawn_worker(&self, launch: WorkerLaunch) -> Result<WorkerChannel>;

    /// Directories the bootstrap allowlist may read beyond the effective
    /// scope (built-in schema/snippet content).
    fn trusted_read_dirs(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

// ── Bridge driver ──────────────────────────────────────────────────

struct Bridge {
    session: String,
    nonce: String,
    channel: WorkerChannel,
    handled_spawn_ids: HashSet<String>,
}

enum Handled {
    Continue,
    Settled(Value),
}

impl Bridge {
    fn start(host: &Arc<dyn WorkerHost>, launch: WorkerLaunch) -> Result<Self> {
        let channel = host.spawn_worker(launch)?;
        Ok(Self {
            session: uuid::Uuid::new_v4().as_simple().to_string(),
            nonce: uuid::Uuid::new_v4().as_simple().to_string(),
            channel,
            handled_spawn_ids: HashSet::new(),
        })
    }

    fn send(&self, msg: HostMessage) -> Result<()> {
        self.channel
            .to_worker
            .send(msg)
            .map_err(|_| RunError::Worker("worker channel closed".into()))
    }

    /// Drive until the outcome settles, the deadline fires, or the worker
    /// goes away. The worker is terminated on every exit path.
    async fn drive(mut self, ctx: Option<&RunCtx>, deadline: Deadline) -> Result<Value> {
        let result = self.drive_inner(ctx, deadline).await;
        self.channel.terminate.cancel();
        result
    }

    async fn drive_inner(&mut self, ctx: Option<&RunCtx>, deadline: Deadline) -> Result<Value> {
        let timeout = tokio::time::Instant::from_std(deadline.instant());
        loop {
            tokio::select! {
                message = self.channel.from_worker.recv() => {
                    let Some(message) = message else {
                        return Err(RunError::Worker(
                            "worker exited before settling the run".into(),
                        ));
                    };
                    match self.handle(ctx, message).await? {
                        Handled::Continue => {}
                        Handled::Settled(value) => return Ok(value),
                    }
                }
                _ = tokio::time::sleep_until(timeout) => {
                    return Err(RunError::Guardrail(Guardrail::Timeout));
                }
            }
        }
    }

    async fn handle(&mut self, ctx: Option<&RunCtx>, message: WorkerMessage) -> Result<Handled> {
        if message.bridge_session() != self.session {
            tracing::warn!(
                expected = %self.session,
                got = %message.bridge_session(),
                "dropping worker message with mismatched bridge session"
            );
            return Ok(Handled::Continue);
        }

        match message {
            WorkerMessage::RunResult {
                completion_nonce,
                output,
                ..
            } => {
                if completion_nonce != self.nonce {
                    tracing::warn!("dropping run.result with mismatched completion nonce");
                    return Ok(Handled::Continue);
                }
                Ok(Handled::Settled(output))
            }
            WorkerMessage::RunFailed {
                completion_nonce,
                message,
                canceled,
                ..
            } => {
                if completion_nonce != self.nonce {
                    tracing::warn!("dropping run.error with mismatched completion nonce");
                    return Ok(Handled::Continue);
                }
                if canceled {
                    Err(RunError::Canceled)
                } else {
                    Err(RunError::Worker(message))
                }
            }
            WorkerMessage::Log { entry, .. } => {
                if let Some(ctx) = ctx {
                    ctx.emit(TraceEvent::Log {
                        run_id: ctx.run_id.clone(),
                        action_call_id: ctx.action_call_id.clone(),
                        parent_action_call_id: ctx.parent_action_call_id.clone(),
                        entry,
                    });
                }
                Ok(Handled::Continue)
            }
            WorkerMessage::StateUpdate { state, .. } => {
                if let Some(ctx) = ctx {
                    ctx.state.replace(state);
                }
                Ok(Handled::Continue)
            }
            WorkerMessage::Trace { event, .. } => {
                if let Some(ctx) = ctx {
                    ctx.emit(event);
                }
                Ok(Handled::Continue)
            }
            WorkerMessage::SpawnRequest {
                request_id,
                path,
                input,
                initial_user_message,
                ..
            } => {
                self.handle_spawn(ctx, request_id, path, input, initial_user_message)
                    .await?;
                Ok(Handled::Continue)
            }
            WorkerMessage::ModelChatRequest {
                request_id,
                model,
                messages,
                tools,
                params,
                stream,
                ..
            } => {
                self.handle_chat(ctx, request_id, model, messages, tools, params, stream)
                    .await?;
                Ok(Handled::Continue)
            }
            WorkerMessage::ModelResponsesRequest {
                request_id,
                model,
                input,
                tools,
                params,
                stream,
                ..
            } => {
                self.handle_responses(ctx, request_id, model, input, tools, params, stream)
                    .await?;
                Ok(Handled::Continue)
            }
            WorkerMessage::ModelResolveRequest {
                request_id,
                candidates,
                ..
            } => {
                self.handle_resolve(ctx, request_id, candidates).await?;
                Ok(Handled::Continue)
            }
        }
    }

    async fn handle_spawn(
        &mut self,
        ctx: Option<&RunCtx>,
        request_id: String,
        path: String,
        input: Value,
        initial_user_message: Option<String>,
    ) -> Result<()> {
        if !self.handled_spawn_ids.insert(request_id.clone()) {
            return self
                .send(HostMessage::SpawnError {
                    request_id,
                    message: "duplicate spawn request id".into(),
                });
        }
        let Some(ctx) = ctx else {
            return self
                .send(HostMessage::SpawnError {
                    request_id,
                    message: "spawn is not available in this worker".into(),
                });
        };

        let parent_state = ctx.state.clone();
        let on_state_update: StateUpdateSink =
            Arc::new(move |snapshot| parent_state.replace(snapshot));

        // Monotonic intersection: the child's parent layer is the deck's
        // effective set, and a forged deadline cannot extend the parent's.
        let child_options = RunOptions {
            deck_path: path,
            input,
            input_provided: true,
            initial_user_message,
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
            on_stream_text: None,
            saved_state: Some(ctx.state.snapshot()),
            on_state_update: Some(on_state_update),
            cancel: Some(ctx.cancel.clone()),
            on_cancel: None,
            worker_sandbox: Some(ctx.sandbox.is_on()),
            worker_host: ctx.sandbox.host(),
            on_tool: None,
            responses_mode: ctx.responses_mode,
            run_deadline: Some(ctx.deadline),
            accept_string_input: false,
            subprocess_supported: ctx.subprocess_supported,
        };

        match run_deck_boxed(child_options).await {
            Ok(outcome) => {
                self.send(HostMessage::SpawnResult {
                    request_id,
                    output: outcome.output,
                })
            }
            Err(e) => {
                self.send(HostMessage::SpawnError {
                    request_id,
                    message: e.to_string(),
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_chat(
        &mut self,
        ctx: Option<&RunCtx>,
        request_id: String,
        model: String,
        messages: Vec<gambit_domain::Message>,
        tools: Vec<gambit_domain::ToolDefinition>,
        params: gambit_providers::ProviderParams,
        stream: bool,
    ) -> Result<()> {
        let Some(ctx) = ctx else {
            return self
                .send(HostMessage::ModelChatError {
                    request_id,
                    message: "model bridge is not available in this worker".into(),
                });
        };

        let text_sink: Option<TextSink> = ctx.on_stream_text.clone();
        let trace = ctx.trace.clone();
        let run_id = ctx.run_id.clone();
        let action_call_id = ctx.action_call_id.clone();
        let event_sink: EventSink = Arc::new(move |event: &Value| {
            trace.emit(TraceEvent::ModelStreamEvent {
                run_id: run_id.clone(),
                action_call_id: action_call_id.clone(),
                payload: event.clone(),
            });
        });

        let request = ChatRequest {
            model,
            messages,
            tools,
            stream,
            state: None,
            deck_path: Some(ctx.deck.path.clone()),
            params,
            cancel: ctx.cancel.clone(),
            on_stream_text: text_sink,
            on_stream_event: Some(event_sink),
        };

        match ctx.provider.chat(request).await {
            Ok(outcome) => {
                self.send(HostMessage::ModelChatResult {
                    request_id,
                    outcome,
                })
            }
            Err(e) => {
                self.send(HostMessage::ModelChatError {
                    request_id,
                    message: e.to_string(),
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_responses(
        &mut self,
        ctx: Option<&RunCtx>,
        request_id: String,
        model: String,
        input: Vec<gambit_providers::ResponseItem>,
        tools: Vec<gambit_domain::ToolDefinition>,
        params: gambit_providers::ProviderParams,
        stream: bool,
    ) -> Result<()> {
        let Some(ctx) = ctx else {
            return self
                .send(HostMessage::ModelResponsesError {
                    request_id,
                    message: "model bridge is not available in this worker".into(),
                });
        };

        let request = gambit_providers::ResponsesRequest {
            model,
            input,
            tools,
            stream,
            state: None,
            deck_path: Some(ctx.deck.path.clone()),
            params,
            cancel: ctx.cancel.clone(),
            on_stream_event: None,
        };

        match ctx.provider.responses(request).await {
            Ok(outcome) => {
                self.send(HostMessage::ModelResponsesResult {
                    request_id,
                    outcome,
                })
            }
            Err(e) => {
                self.send(HostMessage::ModelResponsesError {
                    request_id,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn handle_resolve(
        &mut self,
        ctx: Option<&RunCtx>,
        request_id: String,
        candidates: Vec<String>,
    ) -> Result<()> {
        let Some(ctx) = ctx else {
            return self
                .send(HostMessage::ModelResolveError {
                    request_id,
                    message: "model bridge is not available in this worker".into(),
                });
        };

        let request = gambit_providers::ResolveModelRequest {
            candidates,
            params: None,
            deck_path: Some(ctx.deck.path.clone()),
        };
        match ctx.provider.resolve_model(request).await {
            Ok(resolved) => {
                self.send(HostMessage::ModelResolveResult {
                    request_id,
                    model: resolved.model,
                })
            }
            Err(e) => {
                self.send(HostMessage::ModelResolveError {
                    request_id,
                    message: e.to_string(),
                })
            }
        }
    }
}

// ── Entry points ───────────────────────────────────────────────────

/// Inspect a deck in a minimal read-only worker, bounded by the inspect
/// timeout and the run deadline.
pub(crate) async fn inspect_deck(
    host: &Arc<dyn WorkerHost>,
    loader: &Arc<dyn DeckLoader>,
    deck_path: &str,
    base_dir: &Path,
    run_deadline: Deadline,
) -> Result<DeckManifest> {
    let permissions = super::bootstrap::inspection_permissions(deck_path, loader, base_dir);
    let bridge = Bridge::start(
        host,
        WorkerLaunch {
            kind: WorkerKind::Inspect,
            deck_path: deck_path.to_owned(),
            loader: loader.clone(),
            permissions,
            base_dir: base_dir.to_path_buf(),
        },
    )?;

    bridge
        .send(HostMessage::RunStart {
            bridge_session: bridge.session.clone(),
            completion_nonce: bridge.nonce.clone(),
            deck_path: deck_path.to_owned(),
            input: Value::Null,
            input_provided: false,
            initial_user_message: None,
            saved_state: None,
            permissions: super::bootstrap::inspection_permissions(deck_path, loader, base_dir)
                .to_spec(),
            deadline_ms: INSPECT_WORKER_TIMEOUT_MS,
            root: false,
            responses_mode: false,
            run_id: String::new(),
            action_call_id: String::new(),
            parent_action_call_id: None,
            depth: 0,
        })?;

    let deadline = run_deadline
        .min_with(Deadline::in_ms(INSPECT_WORKER_TIMEOUT_MS));
    let output = bridge.drive(None, deadline).await?;
    serde_json::from_value(output)
        .map_err(|e| RunError::Worker(format!("malformed inspection result: {e}")))
}

/// Execute a compute deck in a worker under the derived capability set.
pub(crate) async fn run_in_worker(ctx: &RunCtx, kind: WorkerKind) -> Result<RunOutcome> {
    let host = ctx
        .sandbox
        .host()
        .ok_or_else(|| RunError::Worker("no worker host for sandboxed run".into()))?;

    let derived = super::bootstrap::derive_worker_permissions(
        &ctx.perms,
        &ctx.deck.path,
        &ctx.loader,
        &host.trusted_read_dirs(),
    )?;

    let bridge = Bridge::start(
        &host,
        WorkerLaunch {
            kind,
            deck_path: ctx.deck.path.clone(),
            loader: ctx.loader.clone(),
            permissions: derived.clone(),
            base_dir: ctx.base_dir.clone(),
        },
    )?;

    bridge
        .send(HostMessage::RunStart {
            bridge_session: bridge.session.clone(),
            completion_nonce: bridge.nonce.clone(),
            deck_path: ctx.deck.path.clone(),
            input: ctx.input.clone(),
            input_provided: ctx.input_provided,
            initial_user_message: ctx.initial_user_message.clone(),
            saved_state: Some(ctx.state.snapshot()),
            permissions: derived.to_spec(),
            deadline_ms: ctx.deadline.remaining().as_millis() as u64,
            root: ctx.is_root(),
            responses_mode: ctx.responses_mode,
            run_id: ctx.run_id.clone(),
            action_call_id: ctx.action_call_id.clone(),
            parent_action_call_id: ctx.parent_action_call_id.clone(),
            depth: ctx.depth,
        })?;

    // Compute workers emit no deck traces of their own; orchestration
    // workers forward theirs, so the host stays quiet to avoid doubles.
    let emit_deck_traces = kind == WorkerKind::Compute;
    if emit_deck_traces {
        ctx.emit_deck_start();
    }
    let settled = bridge.drive(Some(ctx), ctx.deadline).await;
    if emit_deck_traces {
        ctx.emit_deck_end();
    }
    let output = settled?;

    // Worker results are wrapped {output, ended, usage}.
    let ended = output
        .get("ended")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let usage = output
        .get("usage")
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
        .unwrap_or_default();
    let value = output.get("output").cloned().unwrap_or(output);

    if kind == WorkerKind::Compute {
        if let Some(response_schema) = ctx.deck.response_schema.as_ref() {
            schema::validate(response_schema, &value)
                .map_err(|e| RunError::Validation(format!("response payload: {e}")))?;
        }
    }

    Ok(RunOutcome {
        run_id: ctx.run_id.clone(),
        output: value,
        ended,
        usage,
    })
}

/// Wrap a worker outcome for the wire.
pub(crate) fn wrap_worker_outcome(outcome: &RunOutcome) -> Value {
    json!({
        "output": outcome.output,
        "ended": outcome.ended,
        "usage": outcome.usage,
    })
}
