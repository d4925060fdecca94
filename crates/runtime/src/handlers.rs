//! Busy, idle, and error handlers — timed sub-deck invocations during
//! long waits, and error-recovery envelopes for failed actions.
//!
//! Busy and idle handlers are best-effort: their failures are swallowed.
//! An error handler's envelope replaces the failed tool's envelope; if the
//! handler itself fails, a `HANDLER_FALLBACK` envelope is synthesized so
//! the model always sees a tool result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use gambit_domain::deck::{HandlerRef, DEFAULT_BUSY_DELAY_MS};
use gambit_domain::error::is_run_canceled;
use gambit_domain::ToolEnvelope;

use crate::context::RunCtx;
use crate::options::RunOptions;
use crate::run::run_deck_boxed;

/// Build the child options a handler sub-run uses: narrowed permissions,
/// clamped deadline, inherited signal, fresh state.
fn handler_options(ctx: &RunCtx, handler: &HandlerRef, input: Value) -> RunOptions {
    RunOptions {
        deck_path: handler.path.clone(),
        input,
        input_provided: true,
        initial_user_message: None,
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
        saved_state: None,
        on_state_update: None,
        cancel: Some(ctx.cancel.clone()),
        on_cancel: None,
        worker_sandbox: Some(ctx.sandbox.is_on()),
        worker_host: ctx.sandbox.host(),
        on_tool: ctx.on_tool.clone(),
        responses_mode: ctx.responses_mode,
        run_deadline: Some(ctx.deadline),
        accept_string_input: false,
        subprocess_supported: ctx.subprocess_supported,
    }
}

/// A handler deck returns either a bare string or `{message: ...}`.
fn handler_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from),
        _ => None,
    }
}

/// Fire one busy/idle handler sub-run; stream its text to the user and
/// queue it for the parent conversation. Failures are logged and dropped.
async fn fire_notify_handler(
    ctx: &RunCtx,
    handler: &HandlerRef,
    input: Value,
    queue: &mpsc::UnboundedSender<String>,
) {
    match run_deck_boxed(handler_options(ctx, handler, input)).await {
        Ok(outcome) => {
            if let Some(text) = handler_text(&outcome.output) {
                if let Some(sink) = ctx.on_stream_text.as_ref() {
                    sink(&text);
                }
                let _ = queue.send(text);
            }
        }
        Err(e) if is_run_canceled(&e) => {}
        Err(e) => {
            tracing::debug!(handler = %handler.path, error = %e, "notify handler failed");
        }
    }
}

// ── Busy handler ───────────────────────────────────────────────────

/// Armed around one action-deck child call; aborted when the child
/// completes. Messages accumulate in the guard's queue for the loop to
/// append afterwards.
pub(crate) struct BusyGuard {
    task: Option<JoinHandle<()>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl BusyGuard {
    /// Stop the timer and drain any handler output.
    pub fn finish(mut self) -> Vec<String> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let mut texts = Vec::new();
        while let Ok(text) = self.rx.try_recv() {
            texts.push(text);
        }
        texts
    }
}

pub(crate) fn start_busy_timer(
    ctx: &RunCtx,
    action_name: &str,
    child_input: &Value,
) -> Option<BusyGuard> {
    let handler = ctx.deck.handlers.on_busy.clone()?;
    let (tx, rx) = mpsc::unbounded_channel();
    let ctx = ctx.clone();
    let action_name = action_name.to_owned();
    let child_input = child_input.clone();

    let task = tokio::spawn(async move {
        let started = Instant::now();
        let delay = Duration::from_millis(handler.delay_ms.unwrap_or(DEFAULT_BUSY_DELAY_MS));
        tokio::time::sleep(delay).await;

        loop {
            let input = json!({
                "kind": "busy",
                "source": {
                    "deck_path": ctx.deck.path,
                    "action_name": action_name,
                },
                "trigger": {
                    "reason": "timeout",
                    "elapsed_ms": started.elapsed().as_millis() as u64,
                },
                "child_input": child_input,
            });
            fire_notify_handler(&ctx, &handler, input, &tx).await;

            match handler.repeat_ms {
                Some(repeat) => tokio::time::sleep(Duration::from_millis(repeat)).await,
                None => break,
            }
        }
    });

    Some(BusyGuard {
        task: Some(task),
        rx,
    })
}

// ── Idle handler ───────────────────────────────────────────────────

struct IdleShared {
    last_activity: Mutex<Instant>,
    paused: AtomicBool,
}

/// Cloneable activity probe handed to stream sinks. A no-op when the deck
/// has no idle handler.
#[derive(Clone, Default)]
pub(crate) struct IdleTouch(Option<Arc<IdleShared>>);

impl IdleTouch {
    pub fn touch(&self) {
        if let Some(shared) = &self.0 {
            *shared.last_activity.lock() = Instant::now();
        }
    }
}

/// One timer tracking time since last activity (stream chunk, tool
/// result, or other touch). Paused for the duration of in-flight action
/// calls.
pub(crate) struct IdleMonitor {
    shared: Arc<IdleShared>,
    task: Option<JoinHandle<()>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl IdleMonitor {
    pub fn start(ctx: &RunCtx) -> Option<Self> {
        let handler = ctx.deck.handlers.on_idle.clone()?;
        let delay = Duration::from_millis(handler.delay_ms.unwrap_or(DEFAULT_BUSY_DELAY_MS));
        let shared = Arc::new(IdleShared {
            last_activity: Mutex::new(Instant::now()),
            paused: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let task_shared = shared.clone();
        let ctx = ctx.clone();
        let task = tokio::spawn(async move {
            let mut wait = delay;
            loop {
                if task_shared.paused.load(Ordering::Acquire) {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                let target = *task_shared.last_activity.lock() + wait;
                let now = Instant::now();
                if now < target {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(target)).await;
                    continue;
                }

                let elapsed = now
                    .duration_since(*task_shared.last_activity.lock())
                    .as_millis() as u64;
                let input = json!({
                    "kind": "idle",
                    "trigger": {
                        "reason": "idle_timeout",
                        "elapsed_ms": elapsed,
                    },
                });
                fire_notify_handler(&ctx, &handler, input, &tx).await;

                match handler.repeat_ms {
                    Some(repeat) => {
                        *task_shared.last_activity.lock() = Instant::now();
                        wait = Duration::from_millis(repeat);
                    }
                    None => break,
                }
            }
        });

        Some(Self {
            shared,
            task: Some(task),
            rx,
        })
    }

    pub fn touch(&self) {
        *self.shared.last_activity.lock() = Instant::now();
    }

    pub fn touch_handle(&self) -> IdleTouch {
        IdleTouch(Some(self.shared.clone()))
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.touch();
        self.shared.paused.store(false, Ordering::Release);
    }

    /// Drain queued handler output for the parent conversation.
    pub fn drain(&mut self) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(text) = self.rx.try_recv() {
            texts.push(text);
        }
        texts
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Error handler ──────────────────────────────────────────────────

/// Invoke the `on_error` deck for a failed action child. The returned
/// envelope replaces the failed tool's envelope; handler failure yields
/// the `HANDLER_FALLBACK` envelope.
pub(crate) async fn run_error_handler(
    ctx: &RunCtx,
    action_name: &str,
    error_message: &str,
    child_input: &Value,
) -> Option<ToolEnvelope> {
    let handler = ctx.deck.handlers.on_error.clone()?;
    let input = json!({
        "kind": "error",
        "source": {
            "deck_path": ctx.deck.path,
            "action_name": action_name,
        },
        "error": { "message": error_message },
        "child_input": child_input,
    });

    match run_deck_boxed(handler_options(ctx, &handler, input)).await {
        Ok(outcome) => Some(ToolEnvelope::from_action_value(outcome.output)),
        Err(e) => {
            tracing::warn!(handler = %handler.path, error = %e, "error handler failed");
            Some(ToolEnvelope::error(
                500,
                "HANDLER_FALLBACK",
                error_message.to_owned(),
            ))
        }
    }
}
