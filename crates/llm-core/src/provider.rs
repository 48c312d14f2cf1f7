//! LLM provider abstraction.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;

use super::error::{ProviderError, Result};
use super::types::{Block, BlockType, Message, RequestParams, StopReason, StreamDelta, Usage};

/// A generation request in normalized form.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model identifier, without any provider prefix.
    pub model: String,
    /// Ordered conversation history.
    pub messages: Vec<Message>,
    /// Generation parameters.
    pub params: RequestParams,
}

/// A streaming event from an adapter.
///
/// Block indices are local to one provider call and start at zero.
#[derive(Debug, Clone)]
pub enum CompletionEvent {
    /// A new block has started.
    BlockStart { index: u32, block_type: BlockType },
    /// Incremental change to an open block.
    Delta(StreamDelta),
    /// A block is complete; carries the assembled block.
    BlockStop { index: u32, block: Block },
    /// The call has finished.
    Done {
        model: Option<String>,
        stop_reason: StopReason,
        usage: Usage,
        metadata: Option<Value>,
    },
}

/// Stream of completion events.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<CompletionEvent>> + Send>>;

/// A complete, non-streamed response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub blocks: Vec<Block>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    pub model: Option<String>,
    pub metadata: Option<Value>,
}

/// Trait for LLM providers.
///
/// Implement this trait to add support for a new LLM provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Stream a completion request.
    ///
    /// Returns a stream of completion events.
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream>;

    /// Generate a complete response by draining [`Self::stream`].
    async fn generate(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let mut stream = self.stream(request).await?;
        let mut blocks = Vec::new();

        while let Some(event) = stream.next().await {
            match event? {
                CompletionEvent::BlockStop { block, .. } => blocks.push(block),
                CompletionEvent::Done {
                    model,
                    stop_reason,
                    usage,
                    metadata,
                } => {
                    return Ok(CompletionResponse {
                        blocks,
                        stop_reason,
                        usage,
                        model,
                        metadata,
                    });
                }
                CompletionEvent::BlockStart { .. } | CompletionEvent::Delta(_) => {}
            }
        }

        Err(ProviderError::Network(
            "stream ended before completion".to_string(),
        ))
    }
}
