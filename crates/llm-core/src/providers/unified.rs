//! Unified LLM provider using the `llm` crate.
//!
//! Covers the backends without a dedicated adapter (Google, Groq, Mistral)
//! behind the same normalized interface.

use async_trait::async_trait;
use futures::StreamExt;
use llm::builder::{LLMBackend, LLMBuilder};
use llm::chat::{ChatMessage, FunctionTool, StreamChunk, Tool as LlmTool};
use llm::{FunctionCall, LLMProvider, ToolCall as LlmToolCall};

use super::{parse_tool_input, reference_text, value_to_text};
use crate::error::{ProviderError, Result};
use crate::provider::{CompletionEvent, CompletionRequest, CompletionStream, LlmProvider};
use crate::types::{
    Block, BlockPayload, BlockType, Delta, Message, Role, StopReason, StreamDelta, ToolDefinition,
    Usage,
};

/// Backend served through the `llm` crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifiedBackend {
    Google,
    Groq,
    Mistral,
}

impl UnifiedBackend {
    const fn name(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Groq => "groq",
            Self::Mistral => "mistral",
        }
    }

    const fn backend(self) -> LLMBackend {
        match self {
            Self::Google => LLMBackend::Google,
            Self::Groq => LLMBackend::Groq,
            Self::Mistral => LLMBackend::Mistral,
        }
    }
}

/// Unified LLM provider supporting multiple backends.
///
/// The `llm` crate binds the model at build time, so a client is built
/// per request.
#[derive(Debug, Clone)]
pub struct UnifiedProvider {
    backend: UnifiedBackend,
    api_key: String,
}

impl UnifiedProvider {
    /// Create a provider for `backend`.
    ///
    /// # Errors
    ///
    /// Returns error if API key is empty.
    pub fn new(backend: UnifiedBackend, api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(ProviderError::missing_api_key(backend.name()));
        }
        Ok(Self { backend, api_key })
    }

    fn client(&self, request: &CompletionRequest) -> Result<Box<dyn LLMProvider>> {
        let params = &request.params;
        let mut builder = LLMBuilder::new()
            .backend(self.backend.backend())
            .api_key(self.api_key.clone())
            .model(request.model.clone())
            .max_tokens(params.max_tokens);

        if let Some(temperature) = params.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(system) = &params.system {
            builder = builder.system(system.clone());
        }

        builder
            .build()
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))
    }
}

/// Convert our messages to the llm crate format.
fn convert_messages(messages: &[Message], provider: &str) -> Vec<ChatMessage> {
    let mut result = Vec::new();

    for msg in messages {
        let mut text_parts = Vec::new();
        let mut tool_uses = Vec::new();
        let mut tool_results = Vec::new();

        for block in msg.blocks.iter().map(|b| b.for_replay(provider)) {
            match block.payload {
                BlockPayload::Text { text } => text_parts.push(text),
                BlockPayload::Reference { content } | BlockPayload::PartialReference { content } => {
                    text_parts.push(reference_text(&content));
                }
                BlockPayload::ToolUse {
                    tool_use_id,
                    tool_name,
                    input,
                } => tool_uses.push(LlmToolCall {
                    id: tool_use_id,
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: tool_name,
                        arguments: input.to_string(),
                    },
                }),
                BlockPayload::ToolResult {
                    tool_use_id,
                    tool_name,
                    is_error,
                    content,
                } => tool_results.push(LlmToolCall {
                    id: tool_use_id,
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: tool_name.unwrap_or_else(|| {
                            if is_error { "error" } else { "result" }.to_string()
                        }),
                        arguments: value_to_text(&content),
                    },
                }),
                BlockPayload::Thinking { .. }
                | BlockPayload::Image { .. }
                | BlockPayload::WebSearchUse { .. }
                | BlockPayload::WebSearchResult { .. } => {}
            }
        }

        if !tool_uses.is_empty() {
            result.push(
                ChatMessage::assistant()
                    .content(text_parts.join(""))
                    .tool_use(tool_uses)
                    .build(),
            );
        } else if !text_parts.is_empty() {
            let text = text_parts.join("");
            let chat_msg = match msg.role {
                Role::User => ChatMessage::user().content(text).build(),
                Role::Assistant => ChatMessage::assistant().content(text).build(),
            };
            result.push(chat_msg);
        }

        if !tool_results.is_empty() {
            result.push(ChatMessage::user().tool_result(tool_results).build());
        }
    }

    result
}

/// Normalized index of the `index`th tool call.
fn block_index(offset: u32, index: usize) -> u32 {
    offset.saturating_add(u32::try_from(index).unwrap_or(u32::MAX))
}

/// Convert custom tools to llm crate format.
fn convert_tools(tools: &[ToolDefinition]) -> Vec<LlmTool> {
    tools
        .iter()
        .filter(|t| !t.is_builtin())
        .map(|t| LlmTool {
            tool_type: "function".to_string(),
            function: FunctionTool {
                name: t.name.clone(),
                description: t.description.clone().unwrap_or_default(),
                parameters: t
                    .input_schema
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            },
            cache_control: None,
        })
        .collect()
}

#[async_trait]
impl LlmProvider for UnifiedProvider {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let provider = self.backend.name();
        let client = self.client(&request)?;
        let messages = convert_messages(&request.messages, provider);
        let tools = convert_tools(&request.params.tools);
        let tools = if tools.is_empty() { None } else { Some(tools) };
        let model = request.model.clone();

        let stream = async_stream::stream! {
            let upstream = match client.chat_stream_with_tools(&messages, tools.as_deref()).await {
                Ok(upstream) => upstream,
                Err(e) => {
                    yield Err(ProviderError::Server { status: None, message: e.to_string() });
                    return;
                }
            };

            // Text is block 0 when present; tool calls follow it.
            let mut text: Option<String> = None;
            let mut tool_offset = 0_u32;
            let mut started_tools = std::collections::BTreeSet::new();

            futures::pin_mut!(upstream);

            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(StreamChunk::Text(delta)) => {
                        if let Some(buf) = &mut text {
                            buf.push_str(&delta);
                        } else {
                            yield Ok(CompletionEvent::BlockStart { index: 0, block_type: BlockType::Text });
                            text = Some(delta.clone());
                            tool_offset = 1;
                        }
                        yield Ok(CompletionEvent::Delta(StreamDelta::new(0, Delta::TextDelta { text: delta })));
                    }
                    Ok(StreamChunk::ToolUseStart { index, id, name }) => {
                        let index = block_index(tool_offset, index);
                        started_tools.insert(index);
                        yield Ok(CompletionEvent::BlockStart { index, block_type: BlockType::ToolUse });
                        yield Ok(CompletionEvent::Delta(StreamDelta::new(index, Delta::ToolCallStart {
                            tool_use_id: id,
                            tool_name: name,
                        })));
                    }
                    Ok(StreamChunk::ToolUseInputDelta { index, partial_json }) => {
                        let index = block_index(tool_offset, index);
                        yield Ok(CompletionEvent::Delta(StreamDelta::new(index, Delta::JsonDelta { json: partial_json })));
                    }
                    Ok(StreamChunk::ToolUseComplete { index, tool_call }) => {
                        let index = block_index(tool_offset, index);
                        if let Some(text) = text.take() {
                            yield Ok(CompletionEvent::BlockStop {
                                index: 0,
                                block: Block::text(text).with_provider(provider, None),
                            });
                        }
                        if started_tools.insert(index) {
                            yield Ok(CompletionEvent::BlockStart { index, block_type: BlockType::ToolUse });
                        }
                        let input = parse_tool_input(&tool_call.function.arguments);
                        yield Ok(CompletionEvent::BlockStop {
                            index,
                            block: Block::tool_use(tool_call.id, tool_call.function.name, input)
                                .with_provider(provider, None),
                        });
                    }
                    Ok(StreamChunk::Done { stop_reason }) => {
                        if let Some(text) = text.take() {
                            yield Ok(CompletionEvent::BlockStop {
                                index: 0,
                                block: Block::text(text).with_provider(provider, None),
                            });
                        }
                        yield Ok(CompletionEvent::Done {
                            model: Some(model.clone()),
                            stop_reason: StopReason::from_upstream(&stop_reason).unwrap_or(StopReason::EndTurn),
                            usage: Usage::default(),
                            metadata: None,
                        });
                        return;
                    }
                    Err(e) => {
                        yield Err(ProviderError::Server { status: None, message: e.to_string() });
                        return;
                    }
                }
            }

            yield Err(ProviderError::Network("stream ended unexpectedly".to_string()));
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn google_requires_api_key() {
        let result = UnifiedProvider::new(UnifiedBackend::Google, "");
        assert!(result.is_err());
    }

    #[test]
    fn backend_names() {
        let groq = UnifiedProvider::new(UnifiedBackend::Groq, "key").unwrap();
        assert_eq!(groq.name(), "groq");
        let mistral = UnifiedProvider::new(UnifiedBackend::Mistral, "key").unwrap();
        assert_eq!(mistral.name(), "mistral");
    }

    #[test]
    fn builtin_tools_are_not_forwarded() {
        let tools = convert_tools(&[
            ToolDefinition::builtin("web_search"),
            ToolDefinition::custom("doc_search", "Search", json!({"type": "object"})),
        ]);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function.name, "doc_search");
    }
}
