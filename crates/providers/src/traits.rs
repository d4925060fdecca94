//! The model-provider contract.
//!
//! Concrete adapters (chat-completions HTTP APIs, responses APIs, local
//! models) live outside the runtime core; the orchestration loop only
//! depends on this trait.

use gambit_domain::error::{Result, RunError};

use crate::types::{
    ChatOutcome, ChatRequest, ResolveModelRequest, ResolvedModel, ResponsesOutcome,
    ResponsesRequest,
};

#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    /// One chat-mode pass. Implementations must observe `req.cancel` and
    /// forward streamed text/events to the request's sinks when `stream`
    /// is set.
    async fn chat(&self, req: ChatRequest) -> Result<ChatOutcome>;

    /// One responses-mode pass. Providers without a responses API keep
    /// the default.
    async fn responses(&self, req: ResponsesRequest) -> Result<ResponsesOutcome> {
        let _ = req;
        Err(RunError::Other(
            "provider does not support the responses API".into(),
        ))
    }

    /// Resolve a candidate list to one model id. The default takes the
    /// first non-empty candidate.
    async fn resolve_model(&self, req: ResolveModelRequest) -> Result<ResolvedModel> {
        let model = req
            .candidates
            .iter()
            .find(|c| !c.is_empty())
            .cloned()
            .ok_or_else(|| RunError::Validation("no model candidates declared".into()))?;
        Ok(ResolvedModel {
            model,
            params: req.params,
        })
    }
}
