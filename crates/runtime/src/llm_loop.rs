//! The multi-pass conversation driver.
//!
//! Each pass calls the model provider, dispatches any tool calls in the
//! model-emitted order, and appends the results to the conversation until
//! a terminal condition: a validated text response, a `gambit_respond`
//! envelope, a `gambit_end` signal, or guardrail exhaustion.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use gambit_domain::error::{Guardrail, Result, RunError};
use gambit_domain::{
    ids, schema, Message, ModelMode, ToolCall, ToolEnvelope, TraceEvent, Usage,
};
use gambit_providers::{
    project_output, ChatRequest, EventSink, FinishReason, ProviderParams, ResolveModelRequest,
    ResponsesRequest, TextSink,
};
use gambit_state::messages_to_items;

use crate::catalog::{build_catalog, InternalTool, ToolBinding, ToolCatalog};
use crate::context::RunCtx;
use crate::dispatch::{complete_exchange, dispatch_call, CallKind};
use crate::handlers::{IdleMonitor, IdleTouch};
use crate::options::RunOutcome;

pub(crate) async fn run_llm_loop(ctx: RunCtx) -> Result<RunOutcome> {
    ctx.emit_deck_start();
    let result = loop_inner(&ctx).await;
    ctx.emit_deck_end();
    result
}

/// One pass's model output, normalized across chat and responses modes.
struct PassOutcome {
    message: Message,
    finish_reason: FinishReason,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    updated_state: Option<Value>,
}

async fn loop_inner(ctx: &RunCtx) -> Result<RunOutcome> {
    // Only the root conversation is the saved transcript. Children run a
    // fresh ephemeral conversation; the shared state handle still carries
    // meta and explicit appends for them.
    let mut messages = if ctx.is_root() {
        ctx.state.snapshot().messages
    } else {
        Vec::new()
    };
    let resumed = !messages.is_empty();
    if !resumed {
        seed_conversation(ctx, &mut messages);
        if ctx.is_root() {
            ctx.state.publish();
        }
    } else {
        if ctx.deck.respond {
            // Idempotent respond: a transcript that already carries the
            // respond envelope resumes to the same return value without a
            // second respond call.
            if let Some(envelope) = recorded_respond(&messages) {
                return Ok(RunOutcome {
                    run_id: ctx.run_id.clone(),
                    output: envelope,
                    ended: false,
                    usage: Usage::default(),
                });
            }
        }
        // A resumed turn may carry a fresh user message.
        if let Some(user) = ctx.initial_user_message.as_ref() {
            ctx.emit(TraceEvent::MessageUser {
                run_id: ctx.run_id.clone(),
                action_call_id: ctx.action_call_id.clone(),
                content: user.clone(),
            });
            push_message(ctx, &mut messages, Message::user(user.clone()));
            ctx.state.publish();
        }
    }

    let mut total_usage = Usage::default();
    let mut provider_state: Option<Value> = None;
    // Responses-mode stream dedup, per run: (kind, actionCallId).
    let stream_dedup: Arc<Mutex<HashSet<(String, String)>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut idle = IdleMonitor::start(ctx);
    let touch = idle
        .as_ref()
        .map(IdleMonitor::touch_handle)
        .unwrap_or_default();

    for pass in 0..ctx.guardrails.max_passes {
        ctx.cancel.check()?;
        ctx.deadline.check()?;

        if let Some(idle) = idle.as_mut() {
            for text in idle.drain() {
                push_message(ctx, &mut messages, Message::assistant(text));
            }
        }

        let model = resolve_model(ctx).await?;
        let catalog = build_catalog(&ctx.deck, &ctx.perms, &ctx.loader).await?;

        ctx.emit(TraceEvent::ModelCall {
            run_id: ctx.run_id.clone(),
            action_call_id: ctx.action_call_id.clone(),
            deck_path: ctx.deck.path.clone(),
            model: model.clone(),
            mode: if ctx.responses_mode {
                ModelMode::Responses
            } else {
                ModelMode::Chat
            },
            pass,
            messages: messages.clone(),
            tools: catalog.tool_names(),
        });

        let stream_buf: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let outcome = if ctx.responses_mode {
            call_responses(ctx, &model, &messages, &catalog, &provider_state, &stream_dedup).await?
        } else {
            call_chat(ctx, &model, &messages, &catalog, &provider_state, &stream_buf, &touch)
                .await?
        };

        ctx.emit(TraceEvent::ModelResult {
            run_id: ctx.run_id.clone(),
            action_call_id: ctx.action_call_id.clone(),
            deck_path: ctx.deck.path.clone(),
            finish_reason: outcome.finish_reason.as_str().into(),
            message_preview: gambit_domain::truncate_str(&outcome.message.content, 200),
            tool_call_count: outcome.tool_calls.len(),
            usage: outcome.usage,
            updated_state_bytes: outcome
                .updated_state
                .as_ref()
                .map(|s| s.to_string().len()),
        });

        if let Some(usage) = outcome.usage.as_ref() {
            total_usage.accumulate(usage);
        }
        if outcome.updated_state.is_some() {
            provider_state = outcome.updated_state.clone();
        }
        touch.touch();

        if !outcome.tool_calls.is_empty() {
            // Commit accumulated streaming text (or the message content)
            // exactly once per pass, together with the calls.
            let streamed = std::mem::take(&mut *stream_buf.lock());
            let content = if streamed.is_empty() {
                outcome.message.content.clone()
            } else {
                streamed
            };
            push_message(
                ctx,
                &mut messages,
                Message::assistant_tool_calls(content, outcome.tool_calls.clone()),
            );

            let mut respond_envelope: Option<ToolEnvelope> = None;
            let mut end_payload: Option<Value> = None;

            for call in &outcome.tool_calls {
                let is_action =
                    matches!(catalog.lookup(&call.name), Some(ToolBinding::Action { .. }));
                if is_action {
                    if let Some(idle) = idle.as_ref() {
                        idle.pause();
                    }
                }

                let call_outcome = dispatch_call(ctx, &catalog, call).await;

                if is_action {
                    if let Some(idle) = idle.as_ref() {
                        idle.resume();
                    }
                }
                let call_outcome = call_outcome?;

                push_message(
                    ctx,
                    &mut messages,
                    Message::tool_result(
                        &call.call_id,
                        &call.name,
                        call_outcome.envelope.to_value().to_string(),
                    ),
                );
                if is_action {
                    let (assistant, tool) = complete_exchange(&call_outcome.envelope);
                    push_message(ctx, &mut messages, assistant);
                    push_message(ctx, &mut messages, tool);
                }
                for text in call_outcome.handler_texts {
                    push_message(ctx, &mut messages, Message::assistant(text));
                }

                match call_outcome.kind {
                    CallKind::Respond => respond_envelope = Some(call_outcome.envelope),
                    CallKind::End(payload) => end_payload = Some(payload),
                    CallKind::Normal => {}
                }
                touch.touch();
            }

            ctx.state.publish();

            if let Some(envelope) = respond_envelope {
                return Ok(RunOutcome {
                    run_id: ctx.run_id.clone(),
                    output: envelope.to_value(),
                    ended: false,
                    usage: total_usage,
                });
            }
            if let Some(payload) = end_payload {
                return Ok(RunOutcome {
                    run_id: ctx.run_id.clone(),
                    output: payload,
                    ended: true,
                    usage: total_usage,
                });
            }
            continue;
        }

        // No tool calls: validate per finish reason.
        if outcome.finish_reason == FinishReason::ToolCalls {
            return Err(RunError::Protocol(
                "model requested tool_calls but provided none".into(),
            ));
        }

        let streamed = std::mem::take(&mut *stream_buf.lock());
        let content = if streamed.is_empty() {
            outcome.message.content.clone()
        } else {
            streamed
        };

        if outcome.finish_reason == FinishReason::Length && content.is_empty() {
            return Err(RunError::Protocol(
                "model stopped early (length) with no content".into(),
            ));
        }

        if ctx.deck.respond {
            // The model is expected to produce a respond call in a
            // subsequent pass.
            continue;
        }

        if !ctx.is_root() && !content.is_empty() {
            ctx.emit(TraceEvent::Monolog {
                run_id: ctx.run_id.clone(),
                action_call_id: ctx.action_call_id.clone(),
                parent_action_call_id: ctx.parent_action_call_id.clone(),
                deck_path: ctx.deck.path.clone(),
                text: content.clone(),
            });
        }

        let value = coerce_response(ctx, &content)?;
        if !content.is_empty() {
            push_message(ctx, &mut messages, Message::assistant(content));
        }
        ctx.state.publish();

        return Ok(RunOutcome {
            run_id: ctx.run_id.clone(),
            output: value,
            ended: false,
            usage: total_usage,
        });
    }

    Err(RunError::Guardrail(Guardrail::MaxPasses))
}

// ── Seeding ────────────────────────────────────────────────────────

/// Seed a fresh conversation: the composed system prompt, the synthetic
/// `gambit_context` exchange carrying the input, and any initial user
/// message — keeping assistant-first flow by delivering the input through
/// the tool-call channel.
fn seed_conversation(ctx: &RunCtx, messages: &mut Vec<Message>) {
    if let Some(prompt) = ctx.deck.composed_system_prompt() {
        push_message(ctx, messages, Message::system(prompt));
    }

    if ctx.input_provided {
        let call_id = ids::new_tool_call_id();
        let envelope = ToolEnvelope::ok(ctx.input.clone()).correlate(
            &ctx.run_id,
            &ctx.action_call_id,
            ctx.parent_action_call_id.as_deref(),
            ctx.source(None),
        );
        push_message(
            ctx,
            messages,
            Message::assistant_tool_calls(
                "",
                vec![ToolCall {
                    call_id: call_id.clone(),
                    name: InternalTool::Context.name().into(),
                    arguments: json!({}),
                }],
            ),
        );
        push_message(
            ctx,
            messages,
            Message::tool_result(
                call_id,
                InternalTool::Context.name(),
                envelope.to_value().to_string(),
            ),
        );
    }

    if let Some(user) = ctx.initial_user_message.as_ref() {
        ctx.emit(TraceEvent::MessageUser {
            run_id: ctx.run_id.clone(),
            action_call_id: ctx.action_call_id.clone(),
            content: user.clone(),
        });
        push_message(ctx, messages, Message::user(user.clone()));
    }
}

/// The envelope of the last `gambit_respond` exchange in a transcript.
fn recorded_respond(messages: &[Message]) -> Option<Value> {
    messages.iter().rev().find_map(|m| {
        if m.role != gambit_domain::Role::Tool
            || m.name.as_deref() != Some(InternalTool::Respond.name())
        {
            return None;
        }
        serde_json::from_str(&m.content).ok()
    })
}

fn push_message(ctx: &RunCtx, messages: &mut Vec<Message>, message: Message) {
    if ctx.is_root() {
        ctx.state.mutate(|state| state.push_message(message.clone()));
    }
    messages.push(message);
}

// ── Model invocation ───────────────────────────────────────────────

async fn resolve_model(ctx: &RunCtx) -> Result<String> {
    let params = ctx.deck.model_params.as_ref().ok_or_else(|| {
        RunError::Validation(format!("deck '{}' has no model parameters", ctx.deck.path))
    })?;

    match &params.model {
        gambit_domain::deck::ModelChoice::Single(model) => Ok(model.clone()),
        gambit_domain::deck::ModelChoice::Candidates(candidates) => {
            let request = ResolveModelRequest {
                candidates: candidates.clone(),
                params: None,
                deck_path: Some(ctx.deck.path.clone()),
            };
            match ctx.provider.resolve_model(request).await {
                Ok(resolved) => Ok(resolved.model),
                Err(_) => candidates
                    .iter()
                    .find(|c| !c.is_empty())
                    .cloned()
                    .ok_or_else(|| {
                        RunError::Validation("no model candidates declared".into())
                    }),
            }
        }
    }
}

fn provider_params(ctx: &RunCtx) -> ProviderParams {
    let params = ctx.deck.model_params.as_ref();
    ProviderParams {
        temperature: params.and_then(|p| p.temperature),
        max_tokens: params.and_then(|p| p.max_tokens),
        reasoning_effort: params.and_then(|p| p.reasoning_effort.clone()),
        verbosity: params.and_then(|p| p.verbosity.clone()),
    }
}

async fn call_chat(
    ctx: &RunCtx,
    model: &str,
    messages: &[Message],
    catalog: &ToolCatalog,
    provider_state: &Option<Value>,
    stream_buf: &Arc<Mutex<String>>,
    touch: &IdleTouch,
) -> Result<PassOutcome> {
    let buf = stream_buf.clone();
    let outer = ctx.on_stream_text.clone();
    let cancel = ctx.cancel.clone();
    let sink_touch = touch.clone();
    let text_sink: TextSink = Arc::new(move |chunk: &str| {
        // Chunks received after cancellation is observed are dropped.
        if cancel.is_cancelled() {
            return;
        }
        buf.lock().push_str(chunk);
        if let Some(outer) = outer.as_ref() {
            outer(chunk);
        }
        sink_touch.touch();
    });

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
        model: model.to_owned(),
        messages: messages.to_vec(),
        tools: catalog.definitions.clone(),
        stream: ctx.on_stream_text.is_some(),
        state: provider_state.clone(),
        deck_path: Some(ctx.deck.path.clone()),
        params: provider_params(ctx),
        cancel: ctx.cancel.clone(),
        on_stream_text: Some(text_sink),
        on_stream_event: Some(event_sink),
    };

    let deadline = tokio::time::Instant::from_std(ctx.deadline.instant());
    let outcome = tokio::select! {
        outcome = ctx.provider.chat(request) => outcome?,
        _ = ctx.cancel.cancelled() => return Err(RunError::Canceled),
        _ = tokio::time::sleep_until(deadline) => {
            return Err(RunError::Guardrail(Guardrail::Timeout))
        }
    };

    Ok(PassOutcome {
        message: outcome.message,
        finish_reason: outcome.finish_reason,
        tool_calls: outcome.tool_calls,
        usage: outcome.usage,
        updated_state: outcome.updated_state,
    })
}

async fn call_responses(
    ctx: &RunCtx,
    model: &str,
    messages: &[Message],
    catalog: &ToolCatalog,
    provider_state: &Option<Value>,
    stream_dedup: &Arc<Mutex<HashSet<(String, String)>>>,
) -> Result<PassOutcome> {
    let request = ResponsesRequest {
        model: model.to_owned(),
        input: messages_to_items(messages),
        tools: catalog.definitions.clone(),
        stream: true,
        state: provider_state.clone(),
        deck_path: Some(ctx.deck.path.clone()),
        params: provider_params(ctx),
        cancel: ctx.cancel.clone(),
        on_stream_event: Some(responses_event_sink(ctx, model, stream_dedup.clone())),
    };

    let deadline = tokio::time::Instant::from_std(ctx.deadline.instant());
    let outcome = tokio::select! {
        outcome = ctx.provider.responses(request) => outcome?,
        _ = ctx.cancel.cancelled() => return Err(RunError::Canceled),
        _ = tokio::time::sleep_until(deadline) => {
            return Err(RunError::Guardrail(Guardrail::Timeout))
        }
    };

    let (message, tool_calls) = project_output(&outcome.output);
    let finish_reason = if tool_calls.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolCalls
    };

    Ok(PassOutcome {
        message,
        finish_reason,
        tool_calls,
        usage: outcome.usage,
        updated_state: outcome.updated_state,
    })
}

/// Forward responses-API stream events to the trace with the `_gambit`
/// correlation envelope; `tool.call`/`tool.result` events are deduplicated
/// by `actionCallId` and re-emitted as first-class trace events.
fn responses_event_sink(
    ctx: &RunCtx,
    model: &str,
    dedup: Arc<Mutex<HashSet<(String, String)>>>,
) -> EventSink {
    let trace = ctx.trace.clone();
    let run_id = ctx.run_id.clone();
    let action_call_id = ctx.action_call_id.clone();
    let parent_action_call_id = ctx.parent_action_call_id.clone();
    let deck_path = ctx.deck.path.clone();
    let model = model.to_owned();

    Arc::new(move |event: &Value| {
        let kind = event
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("response.event")
            .to_owned();

        if kind == "tool.call" || kind == "tool.result" {
            if let Some(stream_call_id) = event.get("actionCallId").and_then(Value::as_str) {
                if !dedup.lock().insert((kind.clone(), stream_call_id.to_owned())) {
                    return;
                }
                let tool_name = event
                    .get("toolName")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned();
                let call_id = event
                    .get("callId")
                    .and_then(Value::as_str)
                    .unwrap_or(stream_call_id)
                    .to_owned();
                if kind == "tool.call" {
                    trace.emit(TraceEvent::ToolCall {
                        run_id: run_id.clone(),
                        action_call_id: stream_call_id.to_owned(),
                        parent_action_call_id: Some(action_call_id.clone()),
                        call_id,
                        tool_name,
                        arguments: event.get("arguments").cloned().unwrap_or(Value::Null),
                    });
                } else {
                    trace.emit(TraceEvent::ToolResult {
                        run_id: run_id.clone(),
                        action_call_id: stream_call_id.to_owned(),
                        parent_action_call_id: Some(action_call_id.clone()),
                        call_id,
                        tool_name,
                        preview: gambit_domain::truncate_str(&event.to_string(), 200),
                        is_error: event
                            .get("isError")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    });
                }
                return;
            }
        }

        let mut payload = event.clone();
        if let Value::Object(map) = &mut payload {
            map.insert(
                "_gambit".into(),
                json!({
                    "run_id": run_id,
                    "action_call_id": action_call_id,
                    "parent_action_call_id": parent_action_call_id,
                    "deck_path": deck_path,
                    "model": model,
                }),
            );
        }
        trace.emit(TraceEvent::ResponseEvent {
            run_id: run_id.clone(),
            kind,
            payload,
        });
    })
}

// ── Terminal text responses ────────────────────────────────────────

/// Shape final assistant text into the deck's response value: a plain
/// string when the schema admits one, otherwise parsed JSON, validated
/// either way.
fn coerce_response(ctx: &RunCtx, content: &str) -> Result<Value> {
    let Some(response_schema) = ctx.deck.response_schema.as_ref() else {
        return Ok(Value::String(content.to_owned()));
    };

    let value = if schema::accepts_string(response_schema) {
        Value::String(content.to_owned())
    } else {
        serde_json::from_str(content).unwrap_or_else(|_| Value::String(content.to_owned()))
    };

    schema::validate(response_schema, &value)
        .map_err(|e| RunError::Validation(format!("response: {e}")))?;
    Ok(value)
}
