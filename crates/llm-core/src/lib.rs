//! Normalized LLM provider layer for Meridian.
//!
//! Adapters translate between the shared [`types`] and each upstream API,
//! and report failures as [`error::ProviderError`].

pub mod error;
pub mod provider;
pub mod providers;
pub mod sse;
pub mod types;

pub use error::{ErrorKind, ProviderError, Result};
pub use provider::{
    CompletionEvent, CompletionRequest, CompletionResponse, CompletionStream, LlmProvider,
};
pub use types::{
    Block, BlockPayload, BlockType, Delta, Message, RequestParams, Role, StopReason, StreamDelta,
    ToolDefinition, Usage,
};
