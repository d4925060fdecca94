//! `run_deck` — the orchestration entry point.
//!
//! Resolves guardrails, identity, trust policy, sandbox mode, effective
//! permissions, and the run deadline, then dispatches to the compute
//! branch, the LLM loop, or a sandboxed worker. Cancellation is
//! translated into the distinct `RunCanceled` terminal error and the
//! cancel callback fires at most once; `run.start`/`run.end` bracket
//! every root invocation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use gambit_domain::deck::{Deck, Guardrails, ModelChoice, ModelParams};
use gambit_domain::error::{Guardrail, HostUnsupported, Result, RunError};
use gambit_domain::{ids, is_run_canceled, schema, TraceEvent, TraceSink, TracingSink};
use gambit_permissions::{resolve, PermissionLayers};
use gambit_state::{SavedState, StateHandle};

use crate::catalog::check_action_names;
use crate::compute;
use crate::context::{RunCtx, SandboxChoice};
use crate::deadline::Deadline;
use crate::llm_loop;
use crate::options::{RunOptions, RunOutcome};
use crate::policy;
use crate::worker::{self, bridge, WorkerKind};

/// Execute a deck to completion.
pub async fn run_deck(options: RunOptions) -> Result<RunOutcome> {
    run_deck_boxed(options).await
}

/// Boxed entry point used at every recursion site (actions,
/// `spawn_and_wait`, handlers, worker spawns).
pub(crate) fn run_deck_boxed(
    options: RunOptions,
) -> Pin<Box<dyn Future<Output = Result<RunOutcome>> + Send>> {
    Box::pin(run_deck_inner(options))
}

enum Mode {
    Compute,
    Llm,
    ComputeWorker,
    OrchestrationWorker,
}

/// A declarative stand-in for a deck the host never loads in-process
/// (sandboxed mode works off the inspection manifest).
fn deck_from_manifest(manifest: worker::DeckManifest) -> Arc<Deck> {
    let mut deck = Deck::new(manifest.path);
    deck.context_schema = manifest.context_schema;
    deck.response_schema = manifest.response_schema;
    deck.permissions = manifest.permissions;
    deck.guardrails = manifest.guardrails;
    deck.respond = manifest.respond;
    deck.allow_end = manifest.allow_end;
    if manifest.has_model {
        deck.model_params = Some(ModelParams {
            model: ModelChoice::Single(String::new()),
            temperature: None,
            max_tokens: None,
            reasoning_effort: None,
            verbosity: None,
        });
    }
    Arc::new(deck)
}

async fn run_deck_inner(options: RunOptions) -> Result<RunOutcome> {
    // 1–2. Guardrails and depth.
    let base_guardrails = Guardrails::default().merged(options.guardrails);
    if options.depth >= base_guardrails.max_depth {
        return Err(RunError::Guardrail(Guardrail::MaxDepth(
            base_guardrails.max_depth,
        )));
    }
    let root = options.depth == 0;

    // 3. Identity: provided, then saved state, then fresh.
    let run_id = options
        .run_id
        .clone()
        .or_else(|| {
            options
                .saved_state
                .as_ref()
                .map(|s| s.run_id.clone())
                .filter(|id| !id.is_empty())
        })
        .unwrap_or_else(ids::new_run_id);

    // 4. Trust boundary: a workspace import map must not shadow the
    // reserved schema namespace. No deck code runs past a violation.
    policy::enforce_trusted_schema_namespace(&options.deck_path)?;

    // 5. Sandbox feasibility.
    let sandbox = if options.sandbox_requested() {
        let Some(host) = options.worker_host.clone() else {
            return Err(RunError::HostUnsupported(HostUnsupported::WorkerSandbox));
        };
        // The bridge protocol predates signal support; an externally
        // supplied signal at the root is refused outright.
        if root && options.cancel.is_some() {
            return Err(RunError::HostUnsupported(
                HostUnsupported::WorkerSandboxSignal,
            ));
        }
        SandboxChoice::On(host)
    } else {
        SandboxChoice::Off
    };

    let cancel = options.cancel.clone().unwrap_or_default();
    cancel.check()?;
    let trace: Arc<dyn TraceSink> = options
        .trace
        .clone()
        .unwrap_or_else(|| Arc::new(TracingSink));

    // 6. Load (or inspect, in sandboxed mode) and pick the branch.
    let (deck, mode) = match &sandbox {
        SandboxChoice::On(host) => {
            let inspect_deadline = options
                .run_deadline
                .unwrap_or_else(|| Deadline::in_ms(base_guardrails.timeout_ms));
            let manifest = bridge::inspect_deck(
                host,
                &options.loader,
                &options.deck_path,
                &options.base_dir,
                inspect_deadline,
            )
            .await?;

            if !manifest.has_model {
                (deck_from_manifest(manifest), Mode::ComputeWorker)
            } else if root && options.on_tool.is_none() {
                (deck_from_manifest(manifest), Mode::OrchestrationWorker)
            } else {
                // Orchestration delegation is only for root runs without
                // an external-tool hook; everything else runs the loop
                // in-process with the sandbox kept for compute children.
                let deck = options.loader.load(&options.deck_path).await?;
                (deck, Mode::Llm)
            }
        }
        SandboxChoice::Off => {
            let deck = options.loader.load(&options.deck_path).await?;
            let mode = if deck.is_compute() {
                Mode::Compute
            } else {
                Mode::Llm
            };
            (deck, mode)
        }
    };

    // Deck-level invariants.
    check_action_names(&deck)?;
    if !root && (deck.context_schema.is_none() || deck.response_schema.is_none()) {
        return Err(RunError::Validation(format!(
            "non-root deck '{}' must declare context and response schemas",
            deck.path
        )));
    }

    let guardrails = Guardrails::default()
        .merged(deck.guardrails)
        .merged(options.guardrails);
    if options.depth >= guardrails.max_depth {
        return Err(RunError::Guardrail(Guardrail::MaxDepth(
            guardrails.max_depth,
        )));
    }

    // Effective permissions: intersection-only layering.
    let layers = PermissionLayers {
        parent: options.parent_permissions.as_ref(),
        workspace: if root {
            options.workspace_permissions.as_ref()
        } else {
            None
        },
        declaration: deck.permissions.as_ref(),
        reference: options.reference_permissions.as_ref(),
        session: if root {
            options.session_permissions.as_ref()
        } else {
            None
        },
    };
    let (perms, perm_traces) = resolve(layers, &options.base_dir);

    // Monotonic deadline clamp.
    let deadline = options
        .run_deadline
        .map(|d| d.clamped_to(guardrails.timeout_ms))
        .unwrap_or_else(|| Deadline::in_ms(guardrails.timeout_ms));

    // Saved state: a local working copy publishing snapshots outward.
    let state = StateHandle::new(
        options
            .saved_state
            .clone()
            .unwrap_or_else(|| SavedState::new(run_id.clone())),
        options.on_state_update.clone(),
    );
    if state.run_id().is_empty() {
        let run_id = run_id.clone();
        state.mutate(move |s| s.run_id = run_id);
    }

    // 7. Input: recover from the last context envelope for resumed roots,
    // then validate against the context schema.
    let mut input = options.input.clone();
    let mut input_provided = options.input_provided;
    if root && !input_provided {
        if let Some(recovered) = state.snapshot().recover_context_input() {
            input = recovered;
            input_provided = true;
        }
    }
    if input_provided {
        if let Some(context_schema) = deck.context_schema.as_ref() {
            let raw_string_root = root && options.accept_string_input && input.is_string();
            if !raw_string_root {
                schema::validate(context_schema, &input)
                    .map_err(|e| RunError::Validation(format!("input: {e}")))?;
            }
        }
    }

    let action_call_id = options
        .action_call_id
        .clone()
        .unwrap_or_else(ids::new_action_call_id);

    let ctx = RunCtx {
        deck,
        provider: options.provider.clone(),
        loader: options.loader.clone(),
        perms,
        guardrails,
        deadline,
        cancel: cancel.clone(),
        trace: trace.clone(),
        state,
        run_id: run_id.clone(),
        action_call_id,
        parent_action_call_id: options.parent_action_call_id.clone(),
        depth: options.depth,
        input,
        input_provided,
        initial_user_message: options.initial_user_message.clone(),
        on_stream_text: options.on_stream_text.clone(),
        on_tool: options.on_tool.clone(),
        responses_mode: options.responses_mode,
        sandbox,
        subprocess_supported: options.subprocess_supported,
        base_dir: options.base_dir.clone(),
        label: options.label.clone(),
    };

    // 8. run.start with the permission trace, root only.
    if root {
        trace.emit(TraceEvent::RunStart {
            run_id: run_id.clone(),
            deck_path: ctx.deck.path.clone(),
            permissions: perm_traces,
        });
    }

    // 9. Branch; cancellation becomes the distinct terminal error and the
    // cancel callback fires at most once.
    let result = match mode {
        Mode::Compute => compute::run_compute(ctx.clone()).await,
        Mode::Llm => llm_loop::run_llm_loop(ctx.clone()).await,
        Mode::ComputeWorker => bridge::run_in_worker(&ctx, WorkerKind::Compute).await,
        Mode::OrchestrationWorker => bridge::run_in_worker(&ctx, WorkerKind::Orchestration).await,
    };

    if let Err(err) = result.as_ref() {
        if is_run_canceled(err) {
            if let Some(on_cancel) = options.on_cancel.as_ref() {
                on_cancel();
            }
        }
    }

    // 10. run.end always closes the root scope.
    if root {
        trace.emit(TraceEvent::RunEnd {
            run_id,
            deck_path: ctx.deck.path.clone(),
            error: result.as_ref().err().map(ToString::to_string),
        });
    }

    result
}

/// Convenience for hosts that only need the output value.
pub async fn run_deck_value(options: RunOptions) -> Result<Value> {
    Ok(run_deck(options).await?.output)
}
