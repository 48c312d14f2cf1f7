//! Anthropic (Claude) provider implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{parse_tool_input, reference_text, value_to_text};
use crate::error::{ProviderError, Result, parse_retry_after};
use crate::provider::{CompletionEvent, CompletionRequest, CompletionStream, LlmProvider};
use crate::sse::parse_sse_frame;
use crate::types::{
    Block, BlockPayload, BlockType, Delta, Message, StopReason, StreamDelta, ToolDefinition, Usage,
};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const NAME: &str = "anthropic";
const WEB_SEARCH_TOOL_TYPE: &str = "web_search_20250305";
const WEB_SEARCH_MAX_USES: u32 = 5;
const DEFAULT_THINKING_BUDGET: u32 = 2048;

/// Anthropic (Claude) LLM provider.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    http: reqwest::Client,
    api_key: String,
    url: String,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    ///
    /// # Errors
    ///
    /// Returns error if API key is empty.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(ProviderError::missing_api_key(NAME));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            api_key,
            url: API_URL.to_string(),
        })
    }

    /// Point the provider at a different Messages endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.url = format!("{}/messages", base_url.trim_end_matches('/'));
        self
    }
}

/// Build the Messages API request body.
fn build_body(request: &CompletionRequest) -> Value {
    let params = &request.params;
    let mut body = json!({
        "model": request.model,
        "max_tokens": params.max_tokens,
        "messages": convert_messages(&request.messages),
        "stream": true,
    });

    if let Some(system) = &params.system {
        body["system"] = json!(system);
    }

    let tools = convert_tools(&params.tools);
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools);
    }

    if params.thinking {
        let budget = params.thinking_budget.unwrap_or(DEFAULT_THINKING_BUDGET);
        body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
    } else if let Some(temperature) = params.temperature {
        // Extended thinking rejects a custom temperature
        body["temperature"] = json!(temperature);
    }

    body
}

fn convert_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .filter_map(|msg| {
            let content: Vec<Value> = msg
                .blocks
                .iter()
                .map(|b| b.for_replay(NAME))
                .filter_map(|b| convert_block(&b))
                .collect();
            if content.is_empty() {
                None
            } else {
                Some(json!({"role": msg.role.as_str(), "content": content}))
            }
        })
        .collect()
}

fn convert_block(block: &Block) -> Option<Value> {
    let value = match &block.payload {
        BlockPayload::Text { text } => {
            if text.is_empty() {
                return None;
            }
            json!({"type": "text", "text": text})
        }
        BlockPayload::Thinking { text } => {
            let data = block.provider_data.as_ref()?;
            if let Some(redacted) = data.get("redacted_data") {
                json!({"type": "redacted_thinking", "data": redacted})
            } else {
                json!({"type": "thinking", "thinking": text, "signature": data.get("signature")})
            }
        }
        BlockPayload::ToolUse {
            tool_use_id,
            tool_name,
            input,
        } => json!({"type": "tool_use", "id": tool_use_id, "name": tool_name, "input": input}),
        BlockPayload::ToolResult {
            tool_use_id,
            is_error,
            content,
            ..
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": value_to_text(content),
            "is_error": is_error,
        }),
        BlockPayload::Image { content } => json!({
            "type": "image",
            "source": content.get("source").unwrap_or(content),
        }),
        BlockPayload::Reference { content } | BlockPayload::PartialReference { content } => {
            json!({"type": "text", "text": reference_text(content)})
        }
        BlockPayload::WebSearchUse { tool_use_id, input } => json!({
            "type": "server_tool_use",
            "id": tool_use_id,
            "name": "web_search",
            "input": input,
        }),
        BlockPayload::WebSearchResult {
            tool_use_id,
            results,
        } => json!({
            "type": "web_search_tool_result",
            "tool_use_id": tool_use_id,
            "content": results,
        }),
    };
    Some(value)
}

/// Map tool definitions, expanding built-ins to server tools.
fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .filter_map(|tool| {
            if !tool.is_builtin() {
                return Some(json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                }));
            }
            match tool.name.as_str() {
                "web_search" => Some(json!({
                    "type": WEB_SEARCH_TOOL_TYPE,
                    "name": "web_search",
                    "max_uses": WEB_SEARCH_MAX_USES,
                })),
                other => {
                    tracing::debug!(tool = %other, "unsupported built-in tool dropped");
                    None
                }
            }
        })
        .collect()
}

// Anthropic stream wire types

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    MessageStart {
        message: WireMessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: Value,
    },
    ContentBlockDelta {
        index: u32,
        delta: WireDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: WireMessageDelta,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: WireError,
    },
}

#[derive(Debug, Deserialize)]
struct WireMessageStart {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

/// A block being assembled from stream deltas.
#[derive(Debug)]
struct OpenBlock {
    block_type: BlockType,
    text: String,
    signature: String,
    json: String,
    id: String,
    start: Value,
}

impl OpenBlock {
    /// Classify a `content_block_start` payload.
    fn from_start(start: Value) -> Option<Self> {
        let block_type = match start.get("type").and_then(Value::as_str)? {
            "text" => BlockType::Text,
            "thinking" | "redacted_thinking" => BlockType::Thinking,
            "tool_use" => BlockType::ToolUse,
            "server_tool_use" => BlockType::WebSearchUse,
            "web_search_tool_result" => BlockType::WebSearchResult,
            other => {
                tracing::debug!(block_type = %other, "ignoring unsupported content block");
                return None;
            }
        };
        let id = start
            .get("id")
            .or_else(|| start.get("tool_use_id"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let text = start
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Some(Self {
            block_type,
            text,
            signature: String::new(),
            json: String::new(),
            id,
            start,
        })
    }

    fn name(&self) -> String {
        self.start
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn finish(self) -> Block {
        match self.block_type {
            BlockType::Thinking => {
                let data = if let Some(redacted) = self.start.get("data") {
                    Some(json!({"redacted_data": redacted}))
                } else if self.signature.is_empty() {
                    None
                } else {
                    Some(json!({"signature": self.signature}))
                };
                Block::new(BlockPayload::Thinking { text: self.text }).with_provider(NAME, data)
            }
            BlockType::ToolUse => {
                let name = self.name();
                Block::tool_use(self.id, name, parse_tool_input(&self.json))
                    .with_provider(NAME, None)
            }
            BlockType::WebSearchUse => Block::new(BlockPayload::WebSearchUse {
                tool_use_id: self.id,
                input: parse_tool_input(&self.json),
            })
            .with_provider(NAME, None),
            BlockType::WebSearchResult => Block::new(BlockPayload::WebSearchResult {
                tool_use_id: self.id,
                results: self.start.get("content").cloned().unwrap_or(Value::Null),
            })
            .with_provider(NAME, None),
            _ => Block::text(self.text).with_provider(NAME, None),
        }
    }
}

fn map_stream_error(error: WireError) -> ProviderError {
    match error.kind.as_str() {
        "rate_limit_error" => ProviderError::RateLimit {
            message: error.message,
            retry_after: None,
        },
        "overloaded_error" => ProviderError::Overloaded(error.message),
        "invalid_request_error" | "not_found_error" | "request_too_large" => {
            ProviderError::InvalidRequest(error.message)
        }
        "authentication_error" | "permission_error" => ProviderError::Authentication(error.message),
        "timeout_error" => ProviderError::Timeout,
        _ => ProviderError::Server {
            status: None,
            message: error.message,
        },
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|_| ProviderError::Authentication("invalid API key".to_string()))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));

        let body = build_body(&request);
        tracing::debug!(model = %request.model, messages = request.messages.len(), "anthropic request");

        let response = self
            .http
            .post(&self.url)
            .headers(headers)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                status.as_u16(),
                &message,
                retry_after,
            ));
        }

        let byte_stream = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer = String::new();
            let mut open: HashMap<u32, OpenBlock> = HashMap::new();
            let mut usage = Usage::default();
            let mut model = None;
            let mut stop_reason = StopReason::EndTurn;

            futures::pin_mut!(byte_stream);

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(ProviderError::from(e));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some((frame, remainder)) = parse_sse_frame(&buffer) {
                    buffer = remainder;

                    let Some(frame) = frame else {
                        continue;
                    };

                    let event = match serde_json::from_str::<WireEvent>(&frame.data) {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::debug!(data = %frame.data, error = %e, "failed to parse event");
                            continue;
                        }
                    };

                    match event {
                        WireEvent::MessageStart { message } => {
                            model = message.model;
                            usage.input_tokens = message.usage.input_tokens;
                        }

                        WireEvent::ContentBlockStart { index, content_block } => {
                            let Some(block) = OpenBlock::from_start(content_block) else {
                                continue;
                            };
                            yield Ok(CompletionEvent::BlockStart { index, block_type: block.block_type });

                            if matches!(block.block_type, BlockType::ToolUse | BlockType::WebSearchUse) {
                                yield Ok(CompletionEvent::Delta(StreamDelta::new(index, Delta::ToolCallStart {
                                    tool_use_id: block.id.clone(),
                                    tool_name: block.name(),
                                })));
                            }
                            open.insert(index, block);
                        }

                        WireEvent::ContentBlockDelta { index, delta } => {
                            let Some(block) = open.get_mut(&index) else {
                                continue;
                            };
                            let delta = match delta {
                                WireDelta::TextDelta { text } => {
                                    block.text.push_str(&text);
                                    Delta::TextDelta { text }
                                }
                                WireDelta::ThinkingDelta { thinking } => {
                                    block.text.push_str(&thinking);
                                    Delta::ThinkingDelta { text: thinking }
                                }
                                WireDelta::SignatureDelta { signature } => {
                                    block.signature.push_str(&signature);
                                    Delta::SignatureDelta { signature }
                                }
                                WireDelta::InputJsonDelta { partial_json } => {
                                    block.json.push_str(&partial_json);
                                    Delta::JsonDelta { json: partial_json }
                                }
                                WireDelta::Other => continue,
                            };
                            yield Ok(CompletionEvent::Delta(StreamDelta::new(index, delta)));
                        }

                        WireEvent::ContentBlockStop { index } => {
                            if let Some(block) = open.remove(&index) {
                                yield Ok(CompletionEvent::BlockStop { index, block: block.finish() });
                            }
                        }

                        WireEvent::MessageDelta { delta, usage: delta_usage } => {
                            if let Some(reason) = delta.stop_reason.as_deref().and_then(StopReason::from_upstream) {
                                stop_reason = reason;
                            }
                            // Every block has stopped by now; usage is reported with `Done`.
                            if let Some(delta_usage) = delta_usage {
                                usage.output_tokens = delta_usage.output_tokens;
                                if delta_usage.input_tokens > 0 {
                                    usage.input_tokens = delta_usage.input_tokens;
                                }
                            }
                        }

                        WireEvent::MessageStop => {
                            yield Ok(CompletionEvent::Done {
                                model: model.take(),
                                stop_reason,
                                usage,
                                metadata: None,
                            });
                            return;
                        }

                        WireEvent::Ping => {}

                        WireEvent::Error { error } => {
                            yield Err(map_stream_error(error));
                            return;
                        }
                    }
                }
            }

            yield Err(ProviderError::Network("stream ended before message_stop".to_string()));
        };

        Ok(Box::pin(stream))
    }
}
