//! An in-process [`WorkerHost`]: each worker is a detached tokio task
//! speaking the bridge protocol over channels.
//!
//! The isolation boundary is the protocol itself — the worker only
//! reaches the host through session-guarded messages, runs under the
//! derived capability set the host computed, and is torn down through its
//! terminate token on every settle path.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use gambit_domain::error::{is_run_canceled, Result, RunError};
use gambit_domain::execution::{ExecutionContext, ExecutionHost, LogEntry, SpawnSpec};
use gambit_domain::{ids, schema, CancelToken, Role, TraceEvent, Usage};
use gambit_permissions::EffectivePermissions;
use gambit_providers::{
    ChatOutcome, ChatRequest, ModelProvider, ResolveModelRequest, ResolvedModel, ResponsesOutcome,
    ResponsesRequest,
};
use gambit_state::{SavedState, StateHandle, StateUpdateSink};

use crate::deadline::Deadline;
use crate::options::{RunOptions, RunOutcome};
use crate::run::run_deck_boxed;
use crate::worker::bridge::{WorkerChannel, WorkerHost, WorkerKind, WorkerLaunch};
use crate::worker::protocol::{DeckManifest, HostMessage, WorkerMessage};

/// Spawns workers as tokio tasks in this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalWorkerHost;

impl WorkerHost for LocalWorkerHost {
    fn spawn_worker(&self, launch: WorkerLaunch) -> Result<WorkerChannel> {
        let (to_worker, from_host) = mpsc::unbounded_channel::<HostMessage>();
        let (to_host, from_worker) = mpsc::unbounded_channel::<WorkerMessage>();
        let terminate = CancelToken::new();

        tokio::spawn(worker_main(launch, from_host, to_host, terminate.clone()));

        Ok(WorkerChannel {
            to_worker,
            from_worker,
            terminate,
        })
    }
}

// ── Reply routing ──────────────────────────────────────────────────

enum HostReply {
    Spawn(std::result::Result<Value, String>),
    Chat(std::result::Result<ChatOutcome, String>),
    Responses(std::result::Result<ResponsesOutcome, String>),
    Resolve(std::result::Result<String, String>),
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<HostReply>>>>;

fn route_reply(pending: &Pending, request_id: &str, reply: HostReply) {
    if let Some(tx) = pending.lock().remove(request_id) {
        let _ = tx.send(reply);
    }
}

fn spawn_reply_router(mut from_host: mpsc::UnboundedReceiver<HostMessage>, pending: Pending) {
    tokio::spawn(async move {
        while let Some(message) = from_host.recv().await {
            match message {
                HostMessage::SpawnResult { request_id, output } => {
                    route_reply(&pending, &request_id, HostReply::Spawn(Ok(output)));
                }
                HostMessage::SpawnError {
                    request_id,
                    message,
                } => {
                    route_reply(&pending, &request_id, HostReply::Spawn(Err(message)));
                }
                HostMessage::ModelChatResult {
                    request_id,
                    outcome,
                } => {
                    route_reply(&pending, &request_id, HostReply::Chat(Ok(outcome)));
                }
                HostMessage::ModelChatError {
                    request_id,
                    message,
                } => {
                    route_reply(&pending, &request_id, HostReply::Chat(Err(message)));
                }
                HostMessage::ModelResponsesResult {
                    request_id,
                    outcome,
                } => {
                    route_reply(&pending, &request_id, HostReply::Responses(Ok(outcome)));
                }
                HostMessage::ModelResponsesError {
                    request_id,
                    message,
                } => {
                    route_reply(&pending, &request_id, HostReply::Responses(Err(message)));
                }
                HostMessage::ModelResolveResult { request_id, model } => {
                    route_reply(&pending, &request_id, HostReply::Resolve(Ok(model)));
                }
                HostMessage::ModelResolveError {
                    request_id,
                    message,
                } => {
                    route_reply(&pending, &request_id, HostReply::Resolve(Err(message)));
                }
                HostMessage::RunStart { .. } => {
                    tracing::warn!("worker received a second run.start; ignoring");
                }
            }
        }
    });
}

// ── Worker main ────────────────────────────────────────────────────

struct WorkerEnv {
    launch: WorkerLaunch,
    to_host: mpsc::UnboundedSender<WorkerMessage>,
    pending: Pending,
    bridge_session: String,
}

async fn worker_main(
    launch: WorkerLaunch,
    mut from_host: mpsc::UnboundedReceiver<HostMessage>,
    to_host: mpsc::UnboundedSender<WorkerMessage>,
    terminate: CancelToken,
) {
    let start = tokio::select! {
        message = from_host.recv() => message,
        _ = terminate.cancelled() => None,
    };
    let Some(HostMessage::RunStart {
        bridge_session,
        completion_nonce,
        deck_path,
        input,
        input_provided,
        initial_user_message,
        saved_state,
        permissions,
        deadline_ms,
        root,
        responses_mode,
        run_id,
        action_call_id,
        parent_action_call_id,
        depth,
    }) = start
    else {
        return;
    };

    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    spawn_reply_router(from_host, pending.clone());

    let env = WorkerEnv {
        launch,
        to_host: to_host.clone(),
        pending,
        bridge_session: bridge_session.clone(),
    };
    let job = WorkerJob {
        deck_path,
        input,
        input_provided,
        initial_user_message,
        saved_state,
        permissions,
        deadline: Deadline::in_ms(deadline_ms),
        root,
        responses_mode,
        run_id,
        action_call_id,
        parent_action_call_id,
        depth,
    };

    let result = tokio::select! {
        result = run_worker_job(&env, job) => result,
        // Torn down by the host; nothing left to report.
        _ = terminate.cancelled() => return,
    };

    let settle = match result {
        Ok(output) => WorkerMessage::RunResult {
            bridge_session,
            completion_nonce,
            output,
        },
        Err(e) => WorkerMessage::RunFailed {
            bridge_session,
            completion_nonce,
            canceled: is_run_canceled(&e),
            message: e.to_string(),
        },
    };
    let _ = to_host.send(settle);
}

struct WorkerJob {
    deck_path: String,
    input: Value,
    input_provided: bool,
    initial_user_message: Option<String>,
    saved_state: Option<SavedState>,
    permissions: gambit_domain::PermissionSpec,
    deadline: Deadline,
    root: bool,
    responses_mode: bool,
    run_id: String,
    action_call_id: String,
    parent_action_call_id: Option<String>,
    depth: u32,
}

async fn run_worker_job(env: &WorkerEnv, job: WorkerJob) -> Result<Value> {
    tracing::debug!(kind = ?env.launch.kind, root = job.root, deck = %job.deck_path, "worker job started");
    match env.launch.kind {
        WorkerKind::Inspect => {
            let deck = env.launch.loader.inspect(&job.deck_path).await?;
            Ok(serde_json::to_value(DeckManifest::from(deck.as_ref()))?)
        }
        WorkerKind::Compute => run_compute_job(env, job).await,
        WorkerKind::Orchestration => run_orchestration_job(env, job).await,
    }
}

// ── Compute worker ─────────────────────────────────────────────────

struct WorkerExecHost {
    to_host: mpsc::UnboundedSender<WorkerMessage>,
    pending: Pending,
    bridge_session: String,
    state: StateHandle,
}

#[async_trait::async_trait]
impl ExecutionHost for WorkerExecHost {
    fn log(&self, entry: LogEntry) {
        let _ = self.to_host.send(WorkerMessage::Log {
            bridge_session: self.bridge_session.clone(),
            entry,
        });
    }

    fn get_session_meta(&self, key: &str) -> Option<Value> {
        self.state.get_meta(key)
    }

    fn set_session_meta(&self, key: &str, value: Value) {
        self.state.set_meta(key, value);
    }

    fn append_message(&self, role: Role, content: &str) -> Result<()> {
        self.state
            .append_conversation_message(role, content)
            .map_err(RunError::Validation)
    }

    async fn spawn_and_wait(&self, spec: SpawnSpec) -> Result<Value> {
        let request_id = ids::new_action_call_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        self.to_host
            .send(WorkerMessage::SpawnRequest {
                bridge_session: self.bridge_session.clone(),
                request_id,
                path: spec.path,
                input: spec.input,
                initial_user_message: spec.initial_user_message,
            })
            .map_err(|_| RunError::Worker("host channel closed".into()))?;

        match rx.await {
            Ok(HostReply::Spawn(Ok(output))) => Ok(output),
            Ok(HostReply::Spawn(Err(message))) => Err(RunError::Other(message)),
            Ok(_) => Err(RunError::Worker("mismatched spawn reply".into())),
            Err(_) => Err(RunError::Worker("host dropped the spawn reply".into())),
        }
    }
}

async fn run_compute_job(env: &WorkerEnv, job: WorkerJob) -> Result<Value> {
    let deck = env.launch.loader.load(&job.deck_path).await?;
    let executor = deck.executor.clone().ok_or_else(|| {
        RunError::Validation(format!("deck '{}' has no executor", job.deck_path))
    })?;

    let state_sink: StateUpdateSink = {
        let to_host = env.to_host.clone();
        let bridge_session = env.bridge_session.clone();
        Arc::new(move |snapshot: SavedState| {
            let _ = to_host.send(WorkerMessage::StateUpdate {
                bridge_session: bridge_session.clone(),
                state: snapshot,
            });
        })
    };
    let state = StateHandle::new(
        job.saved_state
            .unwrap_or_else(|| SavedState::new(job.run_id.clone())),
        Some(state_sink),
    );

    let host: Arc<dyn ExecutionHost> = Arc::new(WorkerExecHost {
        to_host: env.to_host.clone(),
        pending: env.pending.clone(),
        bridge_session: env.bridge_session.clone(),
        state,
    });

    let execution = ExecutionContext::new(
        job.run_id,
        job.action_call_id,
        job.parent_action_call_id,
        job.depth,
        job.input,
        job.initial_user_message,
        None,
        host,
    );

    let deadline = tokio::time::Instant::from_std(job.deadline.instant());
    let value = tokio::select! {
        result = executor.execute(execution) => result?,
        _ = tokio::time::sleep_until(deadline) => {
            return Err(RunError::Guardrail(gambit_domain::Guardrail::Timeout));
        }
    };

    if let Some(response_schema) = deck.response_schema.as_ref() {
        schema::validate(response_schema, &value)
            .map_err(|e| RunError::Validation(format!("response payload: {e}")))?;
    }

    Ok(super::bridge::wrap_worker_outcome(&RunOutcome {
        run_id: String::new(),
        output: value,
        ended: false,
        usage: Usage::default(),
    }))
}

// ── Orchestration worker ───────────────────────────────────────────

/// Worker-side provider: every model operation becomes an RPC to the
/// host, matched back by request id.
struct BridgeProvider {
    to_host: mpsc::UnboundedSender<WorkerMessage>,
    pending: Pending,
    bridge_session: String,
}

impl BridgeProvider {
    fn request(&self, message: WorkerMessage, request_id: &str) -> Result<oneshot::Receiver<HostReply>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.to_owned(), tx);
        self.to_host
            .send(message)
            .map_err(|_| RunError::Worker("host channel closed".into()))?;
        Ok(rx)
    }
}

#[async_trait::async_trait]
impl ModelProvider for BridgeProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatOutcome> {
        let request_id = ids::new_tool_call_id();
        let rx = self.request(
            WorkerMessage::ModelChatRequest {
                bridge_session: self.bridge_session.clone(),
                request_id: request_id.clone(),
                model: req.model,
                messages: req.messages,
                tools: req.tools,
                params: req.params,
                stream: req.stream,
            },
            &request_id,
        )?;

        match rx.await {
            Ok(HostReply::Chat(Ok(outcome))) => Ok(outcome),
            Ok(HostReply::Chat(Err(message))) => Err(RunError::Other(message)),
            Ok(_) => Err(RunError::Worker("mismatched model.chat reply".into())),
            Err(_) => Err(RunError::Worker("host dropped the model.chat reply".into())),
        }
    }

    async fn responses(&self, req: ResponsesRequest) -> Result<ResponsesOutcome> {
        let request_id = ids::new_tool_call_id();
        let rx = self.request(
            WorkerMessage::ModelResponsesRequest {
                bridge_session: self.bridge_session.clone(),
                request_id: request_id.clone(),
                model: req.model,
                input: req.input,
                tools: req.tools,
                params: req.params,
                stream: req.stream,
            },
            &request_id,
        )?;

        match rx.await {
            Ok(HostReply::Responses(Ok(outcome))) => Ok(outcome),
            Ok(HostReply::Responses(Err(message))) => Err(RunError::Other(message)),
            Ok(_) => Err(RunError::Worker("mismatched model.responses reply".into())),
            Err(_) => Err(RunError::Worker(
                "host dropped the model.responses reply".into(),
            )),
        }
    }

    async fn resolve_model(&self, req: ResolveModelRequest) -> Result<ResolvedModel> {
        let request_id = ids::new_tool_call_id();
        let rx = self.request(
            WorkerMessage::ModelResolveRequest {
                bridge_session: self.bridge_session.clone(),
                request_id: request_id.clone(),
                candidates: req.candidates,
            },
            &request_id,
        )?;

        match rx.await {
            Ok(HostReply::Resolve(Ok(model))) => Ok(ResolvedModel {
                model,
                params: None,
            }),
            Ok(HostReply::Resolve(Err(message))) => Err(RunError::Other(message)),
            Ok(_) => Err(RunError::Worker("mismatched resolveModel reply".into())),
            Err(_) => Err(RunError::Worker(
                "host dropped the resolveModel reply".into(),
            )),
        }
    }
}

/// Trace sink forwarding worker events to the host, dropping the
/// run-scope pair the host already owns.
struct ForwardingTraceSink {
    to_host: mpsc::UnboundedSender<WorkerMessage>,
    bridge_session: String,
}

impl gambit_domain::TraceSink for ForwardingTraceSink {
    fn emit(&self, event: TraceEvent) {
        if matches!(event, TraceEvent::RunStart { .. } | TraceEvent::RunEnd { .. }) {
            return;
        }
        let _ = self.to_host.send(WorkerMessage::Trace {
            bridge_session: self.bridge_session.clone(),
            event,
        });
    }
}

async fn run_orchestration_job(env: &WorkerEnv, job: WorkerJob) -> Result<Value> {
    let provider: Arc<dyn ModelProvider> = Arc::new(BridgeProvider {
        to_host: env.to_host.clone(),
        pending: env.pending.clone(),
        bridge_session: env.bridge_session.clone(),
    });

    let trace: Arc<dyn gambit_domain::TraceSink> = Arc::new(ForwardingTraceSink {
        to_host: env.to_host.clone(),
        bridge_session: env.bridge_session.clone(),
    });

    let state_sink: StateUpdateSink = {
        let to_host = env.to_host.clone();
        let bridge_session = env.bridge_session.clone();
        Arc::new(move |snapshot: SavedState| {
            let _ = to_host.send(WorkerMessage::StateUpdate {
                bridge_session: bridge_session.clone(),
                state: snapshot,
            });
        })
    };

    let effective = EffectivePermissions::from_spec(&job.permissions, &env.launch.base_dir);

    let options = RunOptions {
        deck_path: job.deck_path,
        input: job.input,
        input_provided: job.input_provided,
        initial_user_message: job.initial_user_message,
        provider,
        loader: env.launch.loader.clone(),
        parent_permissions: Some(effective),
        workspace_permissions: None,
        reference_permissions: None,
        session_permissions: None,
        base_dir: env.launch.base_dir.clone(),
        depth: job.depth,
        parent_action_call_id: job.parent_action_call_id,
        run_id: Some(job.run_id),
        action_call_id: Some(job.action_call_id),
        guardrails: Default::default(),
        label: None,
        trace: Some(trace),
        on_stream_text: None,
        saved_state: job.saved_state,
        on_state_update: Some(state_sink),
        cancel: None,
        on_cancel: None,
        worker_sandbox: Some(false),
        worker_host: None,
        on_tool: None,
        responses_mode: job.responses_mode,
        run_deadline: Some(job.deadline),
        // Input was already validated host-side before delegation.
        accept_string_input: true,
        subprocess_supported: true,
    };

    let outcome = run_deck_boxed(options).await?;
    Ok(super::bridge::wrap_worker_outcome(&outcome))
}
