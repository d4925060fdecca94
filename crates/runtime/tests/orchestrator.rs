//! End-to-end runs through `run_deck` with a scripted provider.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use gambit_domain::deck::{ActionDeckRef, HandlerRef, ModelChoice, ModelParams};
use gambit_domain::error::{is_run_canceled, Guardrail, RunError};
use gambit_domain::execution::ExecutionContext;
use gambit_domain::trace::CollectingSink;
use gambit_domain::{CancelToken, Deck, DeckExecutor, Role, ToolCall};
use gambit_providers::testing::{ScriptedPass, ScriptedProvider};
use gambit_runtime::{run_deck, RunOptions, StaticDeckSet};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn llm_deck(path: &str) -> Deck {
    let mut deck = Deck::new(path);
    deck.model_params = Some(ModelParams {
        model: ModelChoice::Single("scripted-1".into()),
        temperature: Some(0.2),
        max_tokens: None,
        reasoning_effort: None,
        verbosity: None,
    });
    deck
}

fn call(name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        call_id: format!("call-{name}"),
        name: name.into(),
        arguments,
    }
}

fn options_for(
    deck_path: &str,
    provider: Arc<ScriptedProvider>,
    loader: StaticDeckSet,
) -> RunOptions {
    RunOptions::new(deck_path, provider, Arc::new(loader))
}

struct SleepThenReturn {
    sleep_ms: u64,
    value: Value,
}

#[async_trait::async_trait]
impl DeckExecutor for SleepThenReturn {
    async fn execute(&self, _ctx: ExecutionContext) -> gambit_domain::Result<Value> {
        tokio::time::sleep(std::time::Duration::from_millis(self.sleep_ms)).await;
        Ok(self.value.clone())
    }
}

struct SpawnChild {
    child_path: String,
}

#[async_trait::async_trait]
impl DeckExecutor for SpawnChild {
    async fn execute(&self, ctx: ExecutionContext) -> gambit_domain::Result<Value> {
        let output = ctx
            .spawn_and_wait(gambit_domain::SpawnSpec {
                path: self.child_path.clone(),
                input: json!({}),
                initial_user_message: None,
            })
            .await?;
        Ok(output)
    }
}

// ── Scenario: plain text response ──────────────────────────────────

#[tokio::test]
async fn text_response_completes_the_run() {
    init_tracing();
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedPass::text("all done")]));
    let loader = StaticDeckSet::new().with(llm_deck("root.deck"));

    let outcome = run_deck(options_for("root.deck", provider.clone(), loader))
        .await
        .unwrap();
    assert_eq!(outcome.output, json!("all done"));
    assert!(!outcome.ended);
    assert!(outcome.run_id.starts_with("run-"));
    assert_eq!(provider.seen().len(), 1);
}

// ── Scenario 1: timeout clamps the child deadline ──────────────────

#[tokio::test]
async fn child_timeout_clamps_and_root_rejects() {
    let mut child = Deck::new("slow.deck");
    child.executor = Some(Arc::new(SleepThenReturn {
        sleep_ms: 60,
        value: json!("never"),
    }));
    child.guardrails.timeout_ms = Some(5);
    child.context_schema = Some(json!({"type": "object"}));
    child.response_schema = Some(json!({"type": "string"}));

    let mut root = Deck::new("root.deck");
    root.executor = Some(Arc::new(SpawnChild {
        child_path: "slow.deck".into(),
    }));
    root.guardrails.timeout_ms = Some(1_000);

    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let loader = StaticDeckSet::new().with(root).with(child);

    let err = run_deck(options_for("root.deck", provider, loader))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Timeout exceeded");
    assert!(matches!(err, RunError::Guardrail(Guardrail::Timeout)));
}

// ── Scenario 3: respond tool completes the run ─────────────────────

#[tokio::test]
async fn respond_tool_completes_with_envelope() {
    let mut deck = llm_deck("root.deck");
    deck.respond = true;
    deck.response_schema = Some(json!({"type": "string"}));

    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedPass::tool_calls(vec![
        call(
            "gambit_respond",
            json!({"payload": "ok", "status": 503, "message": "nope", "code": "X"}),
        ),
    ])]));
    let loader = StaticDeckSet::new().with(deck);

    let sink = Arc::new(CollectingSink::new());
    let mut options = options_for("root.deck", provider, loader);
    options.trace = Some(sink.clone());

    let outcome = run_deck(options).await.unwrap();
    assert_eq!(outcome.output["status"], 503);
    assert_eq!(outcome.output["payload"], "ok");
    assert_eq!(outcome.output["message"], "nope");
    assert_eq!(outcome.output["code"], "X");

    let kinds = sink.kinds();
    assert!(kinds.contains(&"deck.end".to_string()));
}

// ── Scenario 4: action dispatch validates args ─────────────────────

#[tokio::test]
async fn action_args_failing_schema_become_400_envelope() {
    let mut child = llm_deck("compute.deck");
    child.context_schema = Some(json!({
        "type": "object",
        "properties": {"count": {"type": "number"}},
        "required": ["count"],
    }));
    child.response_schema = Some(json!({"type": "string"}));

    let mut root = llm_deck("root.deck");
    root.action_decks.push(ActionDeckRef {
        name: "compute".into(),
        path: "compute.deck".into(),
        permissions: None,
    });

    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedPass::tool_calls(vec![call("compute", json!({"count": "bad"}))]),
        ScriptedPass::text("recovered"),
    ]));
    let loader = StaticDeckSet::new().with(root).with(child);

    let outcome = run_deck(options_for("root.deck", provider.clone(), loader))
        .await
        .unwrap();
    assert_eq!(outcome.output, json!("recovered"));

    // The model saw the envelope as a tool-role message on the second pass.
    let seen = provider.seen();
    let second_pass = &seen[1].messages;
    let tool_msg = second_pass
        .iter()
        .find(|m| m.role == Role::Tool && m.name.as_deref() == Some("compute"))
        .expect("tool result message");
    let envelope: Value = serde_json::from_str(&tool_msg.content).unwrap();
    assert_eq!(envelope["status"], 400);
    assert_eq!(envelope["code"], "invalid_input");
}

// ── Scenario 5: workspace import-map shadow is rejected ────────────

#[tokio::test]
async fn trusted_namespace_shadow_fails_before_execution() {
    let tmp = tempfile::TempDir::new().unwrap();
    std::fs::write(
        tmp.path().join("gambit.json"),
        r#"{"imports": {"@gambit/schema": "./local-schema/"}}"#,
    )
    .unwrap();
    let deck_path = tmp.path().join("root.deck").to_string_lossy().into_owned();

    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedPass::text("unreached")]));
    let loader = StaticDeckSet::new().with(llm_deck(&deck_path));

    let err = run_deck(options_for(&deck_path, provider.clone(), loader))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Policy(_)));
    assert!(err.to_string().contains("@gambit/schema"));
    // No model call was made.
    assert!(provider.seen().is_empty());
}

// ── Scenario 6: write outside the grant is blocked ─────────────────

#[tokio::test]
async fn denied_write_leaves_no_file_behind() {
    let allowed = tempfile::TempDir::new().unwrap();
    let forbidden = tempfile::TempDir::new().unwrap();
    let target = forbidden.path().join("escape.txt");

    let mut deck = llm_deck("root.deck");
    deck.permissions = Some(gambit_domain::PermissionSpec {
        read: Some(gambit_domain::GrantSpec::Entries(vec![allowed
            .path()
            .to_string_lossy()
            .into_owned()])),
        write: Some(gambit_domain::GrantSpec::Entries(vec![allowed
            .path()
            .to_string_lossy()
            .into_owned()])),
        ..gambit_domain::PermissionSpec::default()
    });

    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedPass::tool_calls(vec![call(
            "apply_patch",
            json!({
                "path": target.to_string_lossy(),
                "edits": [{"old_text": "", "new_text": "leaked"}],
                "create_if_missing": true,
            }),
        )]),
        ScriptedPass::text("done"),
    ]));
    let loader = StaticDeckSet::new().with(deck);

    let mut options = options_for("root.deck", provider.clone(), loader);
    options.base_dir = allowed.path().to_path_buf();

    run_deck(options).await.unwrap();

    assert!(!target.exists());
    let seen = provider.seen();
    let tool_msg = seen[1]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool && m.name.as_deref() == Some("apply_patch"))
        .unwrap();
    let envelope: Value = serde_json::from_str(&tool_msg.content).unwrap();
    assert_eq!(envelope["status"], 403);
    assert_eq!(envelope["code"], "permission_denied");
}

// ── Guardrails ─────────────────────────────────────────────────────

#[tokio::test]
async fn respond_deck_without_respond_call_exhausts_passes() {
    let mut deck = llm_deck("root.deck");
    deck.respond = true;
    deck.response_schema = Some(json!({"type": "string"}));
    deck.guardrails.max_passes = Some(2);

    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedPass::text("thinking..."),
        ScriptedPass::text("still thinking..."),
    ]));
    let loader = StaticDeckSet::new().with(deck);

    let err = run_deck(options_for("root.deck", provider, loader))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Guardrail(Guardrail::MaxPasses)));
}

#[tokio::test]
async fn max_depth_is_enforced() {
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let loader = StaticDeckSet::new().with(llm_deck("root.deck"));

    let mut options = options_for("root.deck", provider, loader);
    options.depth = 99;
    let err = run_deck(options).await.unwrap_err();
    assert!(matches!(
        err,
        RunError::Guardrail(Guardrail::MaxDepth(_))
    ));
}

// ── Protocol violations ────────────────────────────────────────────

#[tokio::test]
async fn tool_calls_finish_without_calls_is_fatal() {
    let mut outcome = gambit_providers::ChatOutcome::text("");
    outcome.finish_reason = gambit_providers::FinishReason::ToolCalls;

    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedPass::outcome(outcome)]));
    let loader = StaticDeckSet::new().with(llm_deck("root.deck"));

    let err = run_deck(options_for("root.deck", provider, loader))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Protocol(_)));
    assert!(err.to_string().contains("tool_calls"));
}

#[tokio::test]
async fn length_with_no_content_is_fatal() {
    let mut outcome = gambit_providers::ChatOutcome::text("");
    outcome.finish_reason = gambit_providers::FinishReason::Length;

    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedPass::outcome(outcome)]));
    let loader = StaticDeckSet::new().with(llm_deck("root.deck"));

    let err = run_deck(options_for("root.deck", provider, loader))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("length"));
}

// ── Cancellation ───────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_is_distinct_and_callback_fires_once() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedPass::text("slow").with_delay(5_000)
    ]));
    let loader = StaticDeckSet::new().with(llm_deck("root.deck"));

    let cancel = CancelToken::new();
    let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let fired_in_cb = fired.clone();

    let mut options = options_for("root.deck", provider, loader);
    options.cancel = Some(cancel.clone());
    options.on_cancel = Some(Arc::new(move || {
        fired_in_cb.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }));

    let handle = tokio::spawn(run_deck(options));
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(is_run_canceled(&err));
    assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
}

// ── Action recursion, traces, and monotonic permissions ────────────

#[tokio::test]
async fn action_dispatch_runs_child_and_orders_traces() {
    let mut child = llm_deck("lookup.deck");
    child.context_schema = Some(json!({"type": "object"}));
    child.response_schema = Some(json!({"type": "string"}));

    let mut root = llm_deck("root.deck");
    root.action_decks.push(ActionDeckRef {
        name: "lookup".into(),
        path: "lookup.deck".into(),
        permissions: None,
    });

    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedPass::tool_calls(vec![call("lookup", json!({}))]),
        // Child pass: its own text response (monolog).
        ScriptedPass::text("the child answer"),
        // Root continues after the tool result.
        ScriptedPass::text("root done"),
    ]));
    let loader = StaticDeckSet::new().with(root).with(child);

    let sink = Arc::new(CollectingSink::new());
    let mut options = options_for("root.deck", provider, loader);
    options.trace = Some(sink.clone());

    let outcome = run_deck(options).await.unwrap();
    assert_eq!(outcome.output, json!("root done"));

    let kinds = sink.kinds();
    let pos = |k: &str| kinds.iter().position(|x| x == k).unwrap();
    assert_eq!(pos("run.start"), 0);
    assert!(pos("deck.start") < pos("action.start"));
    // action.start precedes the child deck.start; the child deck.end
    // precedes tool.result, which precedes action.end.
    let child_deck_start = kinds
        .iter()
        .enumerate()
        .filter(|(_, k)| *k == "deck.start")
        .nth(1)
        .unwrap()
        .0;
    assert!(pos("action.start") < child_deck_start);
    assert!(pos("tool.result") < pos("action.end"));
    assert!(kinds.contains(&"monolog".to_string()));
    assert_eq!(kinds.last().unwrap(), "run.end");
}

// ── Compute execution surface ──────────────────────────────────────

struct MetaAndMessages;

#[async_trait::async_trait]
impl DeckExecutor for MetaAndMessages {
    async fn execute(&self, ctx: ExecutionContext) -> gambit_domain::Result<Value> {
        assert_eq!(ctx.get_session_meta("cursor"), None);
        ctx.set_session_meta("cursor", json!(41));
        ctx.set_session_meta("cursor", json!(42));
        assert_eq!(ctx.get_session_meta("cursor"), Some(json!(42)));

        ctx.append_message(Role::User, "what changed?")?;
        ctx.append_message(Role::Assistant, "the cursor advanced")?;
        assert!(ctx.append_message(Role::Tool, "nope").is_err());

        ctx.log(gambit_domain::LogEntry::info("cursor advanced"));
        Ok(json!({"cursor": 42}))
    }
}

#[tokio::test]
async fn compute_context_threads_meta_and_messages_through_state() {
    let mut deck = Deck::new("meta.deck");
    deck.executor = Some(Arc::new(MetaAndMessages));

    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let loader = StaticDeckSet::new().with(deck);

    let snapshots: Arc<parking_lot::Mutex<Vec<gambit_state::SavedState>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink_target = snapshots.clone();
    let sink = Arc::new(CollectingSink::new());

    let mut options = options_for("meta.deck", provider, loader);
    options.on_state_update = Some(Arc::new(move |s| sink_target.lock().push(s)));
    options.trace = Some(sink.clone());

    let outcome = run_deck(options).await.unwrap();
    assert_eq!(outcome.output, json!({"cursor": 42}));

    let snapshots = snapshots.lock();
    let last = snapshots.last().unwrap();
    assert_eq!(last.meta["cursor"], json!(42));
    assert_eq!(last.messages.len(), 2);
    assert_eq!(last.messages[0].role, Role::User);
    assert_eq!(last.message_refs.len(), 2);

    assert!(sink.kinds().contains(&"log".to_string()));
}

// ── Error handler replaces the failed envelope ─────────────────────

struct AlwaysFail;

#[async_trait::async_trait]
impl DeckExecutor for AlwaysFail {
    async fn execute(&self, ctx: ExecutionContext) -> gambit_domain::Result<Value> {
        ctx.fail("downstream exploded")
    }
}

struct EchoRecovery;

#[async_trait::async_trait]
impl DeckExecutor for EchoRecovery {
    async fn execute(&self, ctx: ExecutionContext) -> gambit_domain::Result<Value> {
        let kind = ctx.input.get("kind").cloned().unwrap_or_default();
        assert_eq!(kind, json!("error"));
        Ok(json!({"status": 200, "payload": "recovered from failure"}))
    }
}

#[tokio::test]
async fn on_error_handler_envelope_replaces_failure() {
    let mut failing = Deck::new("failing.deck");
    failing.executor = Some(Arc::new(AlwaysFail));
    failing.context_schema = Some(json!({"type": "object"}));
    failing.response_schema = Some(json!({"type": "string"}));

    let mut recovery = Deck::new("recovery.deck");
    recovery.executor = Some(Arc::new(EchoRecovery));
    recovery.context_schema = Some(json!({"type": "object"}));
    recovery.response_schema = Some(json!({"type": "object"}));

    let mut root = llm_deck("root.deck");
    root.action_decks.push(ActionDeckRef {
        name: "risky".into(),
        path: "failing.deck".into(),
        permissions: None,
    });
    root.handlers.on_error = Some(HandlerRef {
        path: "recovery.deck".into(),
        delay_ms: None,
        repeat_ms: None,
    });

    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedPass::tool_calls(vec![call("risky", json!({}))]),
        ScriptedPass::text("continued"),
    ]));
    let loader = StaticDeckSet::new().with(root).with(failing).with(recovery);

    let outcome = run_deck(options_for("root.deck", provider.clone(), loader))
        .await
        .unwrap();
    assert_eq!(outcome.output, json!("continued"));

    let seen = provider.seen();
    let tool_msg = seen[1]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool && m.name.as_deref() == Some("risky"))
        .unwrap();
    let envelope: Value = serde_json::from_str(&tool_msg.content).unwrap();
    assert_eq!(envelope["payload"], "recovered from failure");
    assert_eq!(envelope["status"], 200);
}

// ── Monotonic permissions across descent ───────────────────────────

#[tokio::test]
async fn child_permissions_narrow_under_reference_layer() {
    let base = tempfile::TempDir::new().unwrap();
    let spec_for = |paths: &[&str]| gambit_domain::PermissionSpec {
        read: Some(gambit_domain::GrantSpec::Entries(
            paths.iter().map(|p| p.to_string()).collect(),
        )),
        ..gambit_domain::PermissionSpec::default()
    };

    let mut child = llm_deck("narrow.deck");
    child.context_schema = Some(json!({"type": "object"}));
    child.response_schema = Some(json!({"type": "string"}));
    child.permissions = Some(gambit_domain::PermissionSpec::allow_all());

    let mut root = llm_deck("root.deck");
    root.permissions = Some(spec_for(&["/data", "/logs"]));
    root.action_decks.push(ActionDeckRef {
        name: "narrow".into(),
        path: "narrow.deck".into(),
        permissions: Some(spec_for(&["/data"])),
    });

    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedPass::tool_calls(vec![call("narrow", json!({}))]),
        ScriptedPass::text("child ok"),
        ScriptedPass::text("root ok"),
    ]));
    let loader = StaticDeckSet::new().with(root).with(child);

    let sink = Arc::new(CollectingSink::new());
    let mut options = options_for("root.deck", provider, loader);
    options.base_dir = base.path().to_path_buf();
    options.trace = Some(sink.clone());

    run_deck(options).await.unwrap();

    // The action.start permission trace shows the reference layer
    // narrowing read down to /data.
    let events = sink.events();
    let action_start = events
        .iter()
        .find_map(|e| match e {
            gambit_domain::TraceEvent::ActionStart { permissions, .. } => Some(permissions.clone()),
            _ => None,
        })
        .expect("action.start event");
    let last = action_start.last().unwrap();
    assert_eq!(
        last.effective.read,
        Some(gambit_domain::GrantSpec::Entries(vec!["/data".into()]))
    );
}

// ── Saved state and resumption ─────────────────────────────────────

#[tokio::test]
async fn state_snapshots_flow_through_the_update_callback() {
    let mut deck = llm_deck("root.deck");
    deck.system_prompt = Some("You are terse.".into());

    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedPass::text("fin")]));
    let loader = StaticDeckSet::new().with(deck);

    let snapshots: Arc<parking_lot::Mutex<Vec<gambit_state::SavedState>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink_target = snapshots.clone();

    let mut options = options_for("root.deck", provider, loader)
        .with_input(json!({"topic": "geese"}));
    options.initial_user_message = Some("hello".into());
    options.on_state_update = Some(Arc::new(move |s| sink_target.lock().push(s)));

    let outcome = run_deck(options).await.unwrap();

    let snapshots = snapshots.lock();
    let last = snapshots.last().expect("published snapshots");
    assert_eq!(last.run_id, outcome.run_id);
    // system + context call/result + user + final assistant
    assert_eq!(last.messages.len(), 5);
    assert_eq!(last.messages[0].role, Role::System);
    assert_eq!(
        last.messages[1].tool_calls[0].name,
        "gambit_context".to_string()
    );
    assert_eq!(last.message_refs.len(), last.messages.len());
}

#[tokio::test]
async fn resumed_root_recovers_input_from_context_envelope() {
    let mut deck = llm_deck("root.deck");
    deck.context_schema = Some(json!({"type": "object"}));

    // First turn: seed state.
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedPass::text("turn one")]));
    let loader = StaticDeckSet::new().with(deck.clone());
    let snapshots: Arc<parking_lot::Mutex<Vec<gambit_state::SavedState>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink_target = snapshots.clone();
    let mut options =
        options_for("root.deck", provider, loader).with_input(json!({"q": "geese?"}));
    options.on_state_update = Some(Arc::new(move |s| sink_target.lock().push(s)));
    let first = run_deck(options).await.unwrap();

    let saved = snapshots.lock().last().cloned().unwrap();

    // Second turn: no input supplied; recovered from the envelope.
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedPass::text("turn two")]));
    let loader = StaticDeckSet::new().with(deck);
    let mut options = options_for("root.deck", provider, loader);
    options.saved_state = Some(saved);

    let second = run_deck(options).await.unwrap();
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.output, json!("turn two"));
}

#[tokio::test]
async fn respond_is_idempotent_across_resumption() {
    let mut deck = llm_deck("root.deck");
    deck.respond = true;
    deck.response_schema = Some(json!({"type": "string"}));

    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedPass::tool_calls(vec![
        call("gambit_respond", json!({"payload": "final answer"})),
    ])]));
    let loader = StaticDeckSet::new().with(deck.clone());

    let snapshots: Arc<parking_lot::Mutex<Vec<gambit_state::SavedState>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink_target = snapshots.clone();
    let mut options = options_for("root.deck", provider, loader);
    options.on_state_update = Some(Arc::new(move |s| sink_target.lock().push(s)));

    let first = run_deck(options).await.unwrap();
    assert_eq!(first.output["payload"], "final answer");
    let saved = snapshots.lock().last().cloned().unwrap();

    // Re-run with the same state and an exhausted provider: the recorded
    // envelope is returned without another respond call.
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let loader = StaticDeckSet::new().with(deck);
    let mut options = options_for("root.deck", provider.clone(), loader);
    options.saved_state = Some(saved);

    let second = run_deck(options).await.unwrap();
    assert_eq!(second.output["payload"], "final answer");
    assert_eq!(second.run_id, first.run_id);
    assert!(provider.seen().is_empty());
}

// ── gambit_end ─────────────────────────────────────────────────────

#[tokio::test]
async fn end_tool_terminates_with_payload_passthrough() {
    let mut deck = llm_deck("root.deck");
    deck.allow_end = true;

    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedPass::tool_calls(vec![
        call("gambit_end", json!({"payload": {"reason": "done"}})),
    ])]));
    let loader = StaticDeckSet::new().with(deck);

    let outcome = run_deck(options_for("root.deck", provider, loader))
        .await
        .unwrap();
    assert!(outcome.ended);
    assert_eq!(outcome.output, json!({"reason": "done"}));
}

// ── External tools ─────────────────────────────────────────────────

struct UppercaseHook;

#[async_trait::async_trait]
impl gambit_runtime::ExternalToolHandler for UppercaseHook {
    async fn on_tool(
        &self,
        req: gambit_runtime::ToolHookRequest,
    ) -> std::result::Result<Value, String> {
        if req.name == "shout" {
            let text = req.args["text"].as_str().unwrap_or_default();
            Ok(json!({"payload": text.to_uppercase()}))
        } else {
            Err("unsupported".into())
        }
    }
}

#[tokio::test]
async fn external_tool_round_trips_through_the_hook() {
    let mut deck = llm_deck("root.deck");
    deck.external_tools.push(gambit_domain::deck::ExternalToolDef {
        name: "shout".into(),
        description: None,
        input_schema: Some(json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"],
        })),
    });

    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedPass::tool_calls(vec![call("shout", json!({"text": "quiet"}))]),
        ScriptedPass::text("done"),
    ]));
    let loader = StaticDeckSet::new().with(deck);

    let mut options = options_for("root.deck", provider.clone(), loader);
    options.on_tool = Some(Arc::new(UppercaseHook));

    run_deck(options).await.unwrap();

    let seen = provider.seen();
    let tool_msg = seen[1]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool && m.name.as_deref() == Some("shout"))
        .unwrap();
    let envelope: Value = serde_json::from_str(&tool_msg.content).unwrap();
    assert_eq!(envelope["payload"], "QUIET");
}

#[tokio::test]
async fn external_tool_without_hook_reports_missing_on_tool() {
    let mut deck = llm_deck("root.deck");
    deck.external_tools.push(gambit_domain::deck::ExternalToolDef {
        name: "shout".into(),
        description: None,
        input_schema: None,
    });

    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedPass::tool_calls(vec![call("shout", json!({}))]),
        ScriptedPass::text("done"),
    ]));
    let loader = StaticDeckSet::new().with(deck);

    run_deck(options_for("root.deck", provider.clone(), loader))
        .await
        .unwrap();

    let seen = provider.seen();
    let tool_msg = seen[1]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool && m.name.as_deref() == Some("shout"))
        .unwrap();
    let envelope: Value = serde_json::from_str(&tool_msg.content).unwrap();
    assert_eq!(envelope["code"], "missing_on_tool");
}

// ── Built-in catalog gating ────────────────────────────────────────

#[tokio::test]
async fn builtins_present_iff_scope_granted() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut deck = llm_deck("root.deck");
    deck.permissions = Some(gambit_domain::PermissionSpec {
        read: Some(gambit_domain::GrantSpec::Entries(vec![tmp
            .path()
            .to_string_lossy()
            .into_owned()])),
        ..gambit_domain::PermissionSpec::default()
    });

    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedPass::text("ok")]));
    let loader = StaticDeckSet::new().with(deck);
    let mut options = options_for("root.deck", provider.clone(), loader);
    options.base_dir = tmp.path().to_path_buf();

    run_deck(options).await.unwrap();

    let tool_names = &provider.seen()[0].tool_names;
    assert!(tool_names.contains(&"read_file".to_string()));
    assert!(tool_names.contains(&"grep_files".to_string()));
    assert!(!tool_names.contains(&"apply_patch".to_string()));
    assert!(!tool_names.contains(&"exec".to_string()));
}

// ── Unknown tools ──────────────────────────────────────────────────

#[tokio::test]
async fn unknown_tool_name_answers_404() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedPass::tool_calls(vec![call("figment", json!({}))]),
        ScriptedPass::text("done"),
    ]));
    let loader = StaticDeckSet::new().with(llm_deck("root.deck"));

    run_deck(options_for("root.deck", provider.clone(), loader))
        .await
        .unwrap();

    let seen = provider.seen();
    let tool_msg = seen[1]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool && m.name.as_deref() == Some("figment"))
        .unwrap();
    let envelope: Value = serde_json::from_str(&tool_msg.content).unwrap();
    assert_eq!(envelope["status"], 404);
}

// ── Streaming ──────────────────────────────────────────────────────

#[tokio::test]
async fn streamed_text_reaches_the_sink() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedPass::text("hello world").with_chunks(["hello ", "world"])
    ]));
    let loader = StaticDeckSet::new().with(llm_deck("root.deck"));

    let streamed = Arc::new(parking_lot::Mutex::new(String::new()));
    let sink_target = streamed.clone();
    let mut options = options_for("root.deck", provider, loader);
    options.on_stream_text = Some(Arc::new(move |chunk: &str| {
        sink_target.lock().push_str(chunk);
    }));

    let outcome = run_deck(options).await.unwrap();
    assert_eq!(&*streamed.lock(), "hello world");
    assert_eq!(outcome.output, json!("hello world"));
}

// ── Model candidate resolution ─────────────────────────────────────

#[tokio::test]
async fn candidate_models_resolve_to_first_non_empty() {
    let mut deck = llm_deck("root.deck");
    deck.model_params = Some(ModelParams {
        model: ModelChoice::Candidates(vec![String::new(), "fallback-model".into()]),
        temperature: None,
        max_tokens: None,
        reasoning_effort: None,
        verbosity: None,
    });

    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedPass::text("ok")]));
    let loader = StaticDeckSet::new().with(deck);

    run_deck(options_for("root.deck", provider.clone(), loader))
        .await
        .unwrap();
    assert_eq!(provider.seen()[0].model, "fallback-model");
}

// ── Non-root schema invariant ──────────────────────────────────────

#[tokio::test]
async fn non_root_deck_without_schemas_is_rejected() {
    let mut root = llm_deck("root.deck");
    root.action_decks.push(ActionDeckRef {
        name: "bare".into(),
        path: "bare.deck".into(),
        permissions: None,
    });
    let bare = llm_deck("bare.deck");

    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedPass::tool_calls(vec![
        call("bare", json!({})),
    ])]));
    let loader = StaticDeckSet::new().with(root).with(bare);

    // No on_error handler: the child's validation failure re-raises.
    let err = run_deck(options_for("root.deck", provider, loader))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("context and response schemas"));
}

// ── base_dir anchoring of relative paths ───────────────────────────

#[tokio::test]
async fn relative_tool_paths_resolve_against_base_dir() {
    let tmp = tempfile::TempDir::new().unwrap();
    std::fs::write(tmp.path().join("notes.txt"), "alpha\nbeta\n").unwrap();

    let mut deck = llm_deck("root.deck");
    deck.permissions = Some(gambit_domain::PermissionSpec {
        read: Some(gambit_domain::GrantSpec::Entries(vec![".".into()])),
        ..gambit_domain::PermissionSpec::default()
    });

    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedPass::tool_calls(vec![call("read_file", json!({"path": "notes.txt"}))]),
        ScriptedPass::text("done"),
    ]));
    let loader = StaticDeckSet::new().with(deck);
    let mut options = options_for("root.deck", provider.clone(), loader);
    options.base_dir = tmp.path().to_path_buf();

    run_deck(options).await.unwrap();

    let seen = provider.seen();
    let tool_msg = seen[1]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool && m.name.as_deref() == Some("read_file"))
        .unwrap();
    let envelope: Value = serde_json::from_str(&tool_msg.content).unwrap();
    assert_eq!(envelope["status"], 200);
    assert_eq!(envelope["payload"]["content"], "alpha\nbeta");
}

// A loader path that exercises `Path`-based deck identities.
#[tokio::test]
async fn deck_paths_may_be_filesystem_paths() {
    let tmp = tempfile::TempDir::new().unwrap();
    let deck_path = tmp.path().join("decks/root.deck");
    std::fs::create_dir_all(deck_path.parent().unwrap()).unwrap();
    let deck_path = deck_path.to_string_lossy().into_owned();

    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedPass::text("ok")]));
    let loader = StaticDeckSet::new().with(llm_deck(&deck_path));

    let outcome = run_deck(options_for(&deck_path, provider, loader))
        .await
        .unwrap();
    assert_eq!(outcome.output, json!("ok"));
    assert!(Path::new(&deck_path).parent().unwrap().exists());
}
