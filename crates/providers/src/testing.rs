//! Scripted provider for tests: plays back a queue of pre-authored
//! passes, streaming text chunks through the request's sink and recording
//! every request it sees.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use gambit_domain::error::{Result, RunError};
use gambit_domain::{Message, ToolCall};

use crate::traits::ModelProvider;
use crate::types::{ChatOutcome, ChatRequest, ResponsesOutcome, ResponsesRequest};

/// One scripted chat pass.
pub struct ScriptedPass {
    /// Chunks forwarded to `on_stream_text` before the outcome returns.
    pub text_chunks: Vec<String>,
    /// Delay before returning, to exercise deadlines and cancellation.
    pub delay_ms: u64,
    pub outcome: ChatOutcome,
}

impl ScriptedPass {
    pub fn outcome(outcome: ChatOutcome) -> Self {
        Self {
            text_chunks: Vec::new(),
            delay_ms: 0,
            outcome,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::outcome(ChatOutcome::text(content))
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self::outcome(ChatOutcome::tool_calls(calls))
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_chunks<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.text_chunks = chunks.into_iter().map(Into::into).collect();
        self
    }
}

/// What the provider saw on one call, for assertions.
#[derive(Debug, Clone)]
pub struct SeenCall {
    pub model: String,
    pub messages: Vec<Message>,
    pub tool_names: Vec<String>,
}

#[derive(Default)]
pub struct ScriptedProvider {
    chat_passes: Mutex<VecDeque<ScriptedPass>>,
    responses_passes: Mutex<VecDeque<ResponsesOutcome>>,
    seen: Mutex<Vec<SeenCall>>,
}

impl ScriptedProvider {
    pub fn new(passes: Vec<ScriptedPass>) -> Self {
        Self {
            chat_passes: Mutex::new(passes.into()),
            responses_passes: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responses(outcomes: Vec<ResponsesOutcome>) -> Self {
        Self {
            chat_passes: Mutex::new(VecDeque::new()),
            responses_passes: Mutex::new(outcomes.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<SeenCall> {
        self.seen.lock().clone()
    }

    pub fn remaining_passes(&self) -> usize {
        self.chat_passes.lock().len()
    }
}

#[async_trait::async_trait]
impl ModelProvider for ScriptedProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatOutcome> {
        self.seen.lock().push(SeenCall {
            model: req.model.clone(),
            messages: req.messages.clone(),
            tool_names: req.tools.iter().map(|t| t.name.clone()).collect(),
        });

        let pass = self
            .chat_passes
            .lock()
            .pop_front()
            .ok_or_else(|| RunError::Other("scripted provider exhausted".into()))?;

        if pass.delay_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(pass.delay_ms)) => {}
                _ = req.cancel.cancelled() => return Err(RunError::Canceled),
            }
        }

        if let Some(sink) = req.on_stream_text.as_ref() {
            for chunk in &pass.text_chunks {
                if req.cancel.is_cancelled() {
                    break;
                }
                sink(chunk);
            }
        }

        req.cancel.check()?;
        Ok(pass.outcome)
    }

    async fn responses(&self, req: ResponsesRequest) -> Result<ResponsesOutcome> {
        self.seen.lock().push(SeenCall {
            model: req.model.clone(),
            messages: Vec::new(),
            tool_names: req.tools.iter().map(|t| t.name.clone()).collect(),
        });

        self.responses_passes
            .lock()
            .pop_front()
            .ok_or_else(|| RunError::Other("scripted provider exhausted".into()))
    }
}
