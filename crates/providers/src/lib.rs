//! The model-provider contract: chat and responses request/response
//! shapes, the [`ModelProvider`] trait, responses-item projection, and a
//! scripted provider for tests.

pub mod items;
pub mod testing;
pub mod traits;
pub mod types;

pub use items::{parse_arguments, project_output};
pub use traits::ModelProvider;
pub use types::{
    ChatOutcome, ChatRequest, EventSink, FinishReason, ProviderParams, ResolveModelRequest,
    ResolvedModel, ResponseContentPart, ResponseItem, ResponsesOutcome, ResponsesRequest, TextSink,
};
